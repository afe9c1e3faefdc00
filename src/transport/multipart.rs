use rand::distributions::Alphanumeric;
use rand::Rng;
use zeroize::Zeroizing;

const BOUNDARY_LEN: usize = 32;

/// Minimal `multipart/form-data` encoder.
///
/// The encoded body holds recording bytes, so it is zeroized when dropped.
pub struct MultipartForm {
    boundary: String,
    body: Zeroizing<Vec<u8>>,
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartForm {
    pub fn new() -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(BOUNDARY_LEN)
            .map(char::from)
            .collect();
        Self::with_boundary(format!("----proctor{}", suffix))
    }

    pub fn with_boundary(boundary: String) -> Self {
        Self {
            boundary,
            body: Zeroizing::new(Vec::new()),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.open_part(&format!("Content-Disposition: form-data; name=\"{}\"", name));
        self.body.extend_from_slice(value.as_bytes());
        self.body.extend_from_slice(b"\r\n");
        self
    }

    pub fn file(mut self, name: &str, filename: &str, content_type: &str, data: &[u8]) -> Self {
        self.open_part(&format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}",
            name, filename, content_type
        ));
        self.body.extend_from_slice(data);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    /// Closes the form and returns the encoded body.
    pub fn finish(mut self) -> Zeroizing<Vec<u8>> {
        let closing = format!("--{}--\r\n", self.boundary);
        self.body.extend_from_slice(closing.as_bytes());
        std::mem::take(&mut self.body)
    }

    fn open_part(&mut self, headers: &str) {
        let head = format!("--{}\r\n{}\r\n\r\n", self.boundary, headers);
        self.body.extend_from_slice(head.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_fields_and_file() {
        let body = MultipartForm::with_boundary("XYZ".to_string())
            .file("chunk", "chunk.webm", "video/webm", b"abc")
            .text("chunk_index", "2")
            .text("is_final", "true")
            .finish();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.starts_with(
            "--XYZ\r\nContent-Disposition: form-data; name=\"chunk\"; filename=\"chunk.webm\"\r\n\
             Content-Type: video/webm\r\n\r\nabc\r\n"
        ));
        assert!(text.contains("name=\"chunk_index\"\r\n\r\n2\r\n"));
        assert!(text.contains("name=\"is_final\"\r\n\r\ntrue\r\n"));
        assert!(text.ends_with("--XYZ--\r\n"));
    }

    #[test]
    fn random_boundaries_differ() {
        let a = MultipartForm::new();
        let b = MultipartForm::new();
        assert_ne!(a.boundary(), b.boundary());
        assert!(a.content_type().starts_with("multipart/form-data; boundary=----proctor"));
    }
}
