use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// One timesliced segment emitted by the capture device.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Chunk {
    data: Vec<u8>,
    #[zeroize(skip)]
    received_at_ms: u64,
}

impl Chunk {
    pub fn new(data: Vec<u8>, received_at_ms: u64) -> Self {
        Self {
            data,
            received_at_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn received_at_ms(&self) -> u64 {
        self.received_at_ms
    }
}

/// Accumulated recording. Only grows until explicitly cleared.
#[derive(Default)]
pub struct ChunkBuffer {
    chunks: Vec<Chunk>,
    total_bytes: usize,
}

impl ChunkBuffer {
    pub fn push(&mut self, chunk: Chunk) {
        self.total_bytes += chunk.len();
        self.chunks.push(chunk);
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Concatenates every chunk into one blob without consuming the buffer.
    pub fn assemble(&self) -> Zeroizing<Vec<u8>> {
        let mut blob = Zeroizing::new(Vec::with_capacity(self.total_bytes));
        for chunk in &self.chunks {
            blob.extend_from_slice(&chunk.data);
        }
        blob
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assemble_preserves_order_and_buffer() {
        let mut buffer = ChunkBuffer::default();
        buffer.push(Chunk::new(b"ab".to_vec(), 1));
        buffer.push(Chunk::new(b"cde".to_vec(), 2));
        assert_eq!(&buffer.assemble()[..], b"abcde");
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.total_bytes(), 5);
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.total_bytes(), 0);
    }
}
