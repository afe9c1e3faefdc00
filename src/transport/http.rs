use anyhow::{anyhow, Context, Result};
use std::io::{self, Read};
use std::time::Duration;
use url::Url;

use super::multipart::MultipartForm;
use super::{ChunkUpload, ProctoringApi, ProgressFn, UploadReceipt, UploadStatus};
use crate::schedule::CancelToken;
use crate::violation::ViolationRecord;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_BODY_LIMIT: usize = 256;

/// Blocking HTTP client for the proctoring backend.
pub struct HttpApi {
    agent: ureq::Agent,
    base: Url,
    token: Option<String>,
    request_timeout: Duration,
    upload_timeout: Duration,
}

impl HttpApi {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        request_timeout: Duration,
        upload_timeout: Duration,
    ) -> Result<Self> {
        let base = Url::parse(base_url).with_context(|| format!("parse api url {}", base_url))?;
        if base.cannot_be_a_base() {
            return Err(anyhow!("api url {} cannot carry a path", base_url));
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .build();
        Ok(Self {
            agent,
            base,
            token,
            request_timeout,
            upload_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    /// Appends path segments to the base URL, percent-encoding each one.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("api url cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: ureq::Request) -> ureq::Request {
        match &self.token {
            Some(token) => request.set("Authorization", &format!("Bearer {}", token)),
            None => request,
        }
    }
}

impl ProctoringApi for HttpApi {
    fn log_violation(&self, record: &ViolationRecord) -> Result<()> {
        let url = self.endpoint(&["proctoring", "log-violation"])?;
        let body = serde_json::to_value(record).context("encode violation record")?;
        self.authorized(self.agent.post(url.as_str()))
            .timeout(self.request_timeout)
            .send_json(body)
            .map_err(|err| describe("violation log", err))?;
        Ok(())
    }

    fn upload_chunk(
        &self,
        session_id: &str,
        chunk: &ChunkUpload<'_>,
        cancel: &CancelToken,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<UploadReceipt> {
        let url = self.endpoint(&["upload", "screen-chunk", session_id])?;
        let form = MultipartForm::new();
        let content_type = form.content_type();
        let body = form
            .file("chunk", "chunk.webm", "video/webm", chunk.data)
            .text("chunk_index", &chunk.chunk_index.to_string())
            .text("is_final", if chunk.is_final { "true" } else { "false" })
            .finish();

        let reader = ProgressReader {
            data: &body,
            pos: 0,
            cancel,
            progress,
        };
        let response = self
            .authorized(self.agent.post(url.as_str()))
            .timeout(self.upload_timeout)
            .set("Content-Type", &content_type)
            .set("Content-Length", &body.len().to_string())
            .send(reader)
            .map_err(|err| describe("chunk upload", err))?;
        let text = response.into_string().context("read upload response")?;
        let body = serde_json::from_str(&text).unwrap_or(serde_json::Value::Null);
        Ok(UploadReceipt { body })
    }

    fn upload_status(&self, session_id: &str) -> Result<UploadStatus> {
        let url = self.endpoint(&["upload", "status", session_id])?;
        let response = self
            .authorized(self.agent.get(url.as_str()))
            .timeout(self.request_timeout)
            .call()
            .map_err(|err| describe("upload status", err))?;
        response
            .into_json::<UploadStatus>()
            .context("decode upload status")
    }
}

fn describe(what: &str, err: ureq::Error) -> anyhow::Error {
    match err {
        ureq::Error::Status(code, response) => {
            let mut body = response.into_string().unwrap_or_default();
            if body.len() > ERROR_BODY_LIMIT {
                let mut cut = ERROR_BODY_LIMIT;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            anyhow!("{} rejected with HTTP {}: {}", what, code, body)
        }
        ureq::Error::Transport(transport) => anyhow!("{} failed: {}", what, transport),
    }
}

/// Request body that reports progress and aborts once cancelled.
struct ProgressReader<'a, 'p> {
    data: &'a [u8],
    pos: usize,
    cancel: &'a CancelToken,
    progress: Option<&'p mut dyn FnMut(u64, u64)>,
}

impl Read for ProgressReader<'_, '_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Other, "upload cancelled"));
        }
        let remaining = &self.data[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        if let Some(progress) = self.progress.as_mut() {
            progress(self.pos as u64, self.data.len() as u64);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(base: &str) -> HttpApi {
        HttpApi::new(
            base,
            Some("t0k".to_string()),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn endpoints_join_under_base_path() {
        let api = api("https://exam.example.org/api/");
        assert_eq!(
            api.endpoint(&["upload", "screen-chunk", "sess 1"])
                .unwrap()
                .as_str(),
            "https://exam.example.org/api/upload/screen-chunk/sess%201"
        );
        let api = self::api("http://127.0.0.1:8000");
        assert_eq!(
            api.endpoint(&["proctoring", "log-violation"])
                .unwrap()
                .as_str(),
            "http://127.0.0.1:8000/proctoring/log-violation"
        );
    }

    #[test]
    fn rejects_unparseable_url() {
        assert!(HttpApi::new("not a url", None, Duration::ZERO, Duration::ZERO).is_err());
    }

    #[test]
    fn progress_reader_reports_and_cancels() {
        let data = vec![7u8; 10];
        let cancel = CancelToken::new();
        let mut seen = Vec::new();
        let mut record = |sent: u64, total: u64| seen.push((sent, total));
        {
            let mut reader = ProgressReader {
                data: &data,
                pos: 0,
                cancel: &cancel,
                progress: Some(&mut record),
            };
            let mut buf = [0u8; 4];
            assert_eq!(reader.read(&mut buf).unwrap(), 4);
            assert_eq!(reader.read(&mut buf).unwrap(), 4);
            cancel.cancel();
            assert!(reader.read(&mut buf).is_err());
        }
        assert_eq!(seen, vec![(4, 10), (8, 10)]);
    }
}
