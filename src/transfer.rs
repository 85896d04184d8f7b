use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;

use crate::error::MyrigetError;
use crate::events::{self, ProgressSink, Throttle};
use crate::fs_util::{ArchiveKind, validate_archive};
use crate::sanitize::url_basename;

pub const CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// An opened response body.
pub struct RemoteBody {
    /// Declared `Content-Length`, 0 when the server did not send one.
    pub content_length: u64,
    pub reader: Box<dyn Read + Send>,
}

/// Where bytes come from. The HTTP implementation is [`HttpClient`]; tests
/// substitute in-memory sources.
pub trait HttpSource: Send + Sync {
    fn open(&self, url: &str) -> Result<RemoteBody, MyrigetError>;

    /// Remote size without downloading, if the server reports one.
    fn content_length(&self, url: &str) -> Result<Option<u64>, MyrigetError>;

    fn get_json(&self, url: &str) -> Result<Value, MyrigetError> {
        let body = self.open(url)?;
        serde_json::from_reader(body.reader)
            .map_err(|err| MyrigetError::ManifestParse(err.to_string()))
    }
}

impl<T: HttpSource + ?Sized> HttpSource for &T {
    fn open(&self, url: &str) -> Result<RemoteBody, MyrigetError> {
        (**self).open(url)
    }

    fn content_length(&self, url: &str) -> Result<Option<u64>, MyrigetError> {
        (**self).content_length(url)
    }
}

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Result<Self, MyrigetError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("myriget/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| MyrigetError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|err| MyrigetError::Http(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpSource for HttpClient {
    fn open(&self, url: &str) -> Result<RemoteBody, MyrigetError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| MyrigetError::Http(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "request failed".to_string());
            return Err(MyrigetError::HttpStatus { status, message });
        }
        let content_length = response.content_length().unwrap_or(0);
        Ok(RemoteBody {
            content_length,
            reader: Box::new(response),
        })
    }

    fn content_length(&self, url: &str) -> Result<Option<u64>, MyrigetError> {
        let response = self
            .client
            .head(url)
            .send()
            .map_err(|err| MyrigetError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(MyrigetError::HttpStatus {
                status: response.status().as_u16(),
                message: format!("HEAD {url}"),
            });
        }
        Ok(response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .filter(|size: &u64| *size > 0))
    }
}

/// Download stage: streams a URL into a directory and checks the result.
pub struct Transfer<S> {
    source: S,
    progress_interval: Duration,
}

impl<S: HttpSource> Transfer<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            progress_interval: events::DEFAULT_THROTTLE,
        }
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Returns the downloaded file, or `None` when the entry should be retried
    /// on a later run. Failures are reported through `sink`, never raised.
    pub fn download(&self, url: &str, dest_dir: &Path, sink: &dyn ProgressSink) -> Option<PathBuf> {
        let path = match self.fetch(url, dest_dir, sink) {
            Ok(path) => path,
            Err(err) => {
                events::warn(sink, format!("Error downloading {url}: {err}"));
                return None;
            }
        };
        if let Err(err) = validate_download(url, &path) {
            events::warn(
                sink,
                format!("Validation failed for {}: {err}; will retry later", display(&path)),
            );
            return None;
        }
        events::status(sink, format!("Downloaded {}", display(&path)));
        Some(path)
    }

    fn fetch(&self, url: &str, dest_dir: &Path, sink: &dyn ProgressSink) -> Result<PathBuf, MyrigetError> {
        fs::create_dir_all(dest_dir).map_err(MyrigetError::fs)?;
        let filename = match url_basename(url) {
            "" => "downloaded_file",
            name => name,
        };
        let path = dest_dir.join(filename);

        tracing::debug!(url, path = %path.display(), "starting download");
        let mut body = self.source.open(url)?;
        let total = body.content_length;
        let mut file = File::create(&path).map_err(MyrigetError::fs)?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut received = 0u64;
        let mut throttle = Throttle::new(self.progress_interval);

        loop {
            let read = body
                .reader
                .read(&mut buffer)
                .map_err(|err| MyrigetError::Http(err.to_string()))?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read]).map_err(MyrigetError::fs)?;
            received += read as u64;
            if total > 0 && throttle.ready() {
                events::progress(sink, received as f32 / total as f32 * 100.0);
            }
        }
        file.flush().map_err(MyrigetError::fs)?;

        if total > 0 {
            events::progress(sink, 100.0);
            if received != total {
                return Err(MyrigetError::Validation(format!(
                    "received {received} of {total} bytes"
                )));
            }
        }
        Ok(path)
    }

    /// Remote size in bytes, if the server reports it.
    pub fn probe_size(&self, url: &str) -> Option<u64> {
        match self.source.content_length(url) {
            Ok(size) => size,
            Err(err) => {
                tracing::debug!(url, "size probe failed: {err}");
                None
            }
        }
    }
}

/// Name matches the URL, file is non-empty and archives pass an integrity read.
pub fn validate_download(url: &str, path: &Path) -> Result<(), MyrigetError> {
    let expected = url_basename(url);
    let actual = path.file_name().and_then(|name| name.to_str()).unwrap_or("");
    if !expected.is_empty() && actual != expected {
        return Err(MyrigetError::Validation(format!(
            "file name {actual} does not match {expected}"
        )));
    }
    let size = fs::metadata(path).map_err(MyrigetError::fs)?.len();
    if size == 0 {
        return Err(MyrigetError::Validation("file is empty".to_string()));
    }
    if let Some(kind) = ArchiveKind::from_name(actual) {
        validate_archive(path, kind).map_err(|err| MyrigetError::Validation(err.to_string()))?;
    }
    Ok(())
}

fn display(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::events::{ProgressEvent, RecordingSink};

    struct StaticSource {
        body: Vec<u8>,
        declared: u64,
    }

    impl HttpSource for StaticSource {
        fn open(&self, _url: &str) -> Result<RemoteBody, MyrigetError> {
            Ok(RemoteBody {
                content_length: self.declared,
                reader: Box::new(Cursor::new(self.body.clone())),
            })
        }

        fn content_length(&self, _url: &str) -> Result<Option<u64>, MyrigetError> {
            Ok(Some(self.declared))
        }
    }

    #[test]
    fn plain_file_download_succeeds() {
        let temp = tempfile::tempdir().unwrap();
        let transfer = Transfer::new(StaticSource {
            body: b"hello".to_vec(),
            declared: 5,
        })
        .with_progress_interval(Duration::ZERO);
        let sink = RecordingSink::default();
        let path = transfer
            .download("http://host/files/readme.txt", temp.path(), &sink)
            .unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
        assert!(sink.events().contains(&ProgressEvent::Progress(100.0)));
    }

    #[test]
    fn truncated_body_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let transfer = Transfer::new(StaticSource {
            body: b"hel".to_vec(),
            declared: 5,
        });
        let sink = RecordingSink::default();
        assert!(transfer
            .download("http://host/readme.txt", temp.path(), &sink)
            .is_none());
        assert!(sink.statuses().iter().any(|s| s.contains("received 3 of 5")));
    }

    #[test]
    fn corrupt_archive_is_kept_for_retry() {
        let temp = tempfile::tempdir().unwrap();
        let transfer = Transfer::new(StaticSource {
            body: b"not a zip at all".to_vec(),
            declared: 0,
        });
        let sink = RecordingSink::default();
        assert!(transfer
            .download("http://host/game.zip", temp.path(), &sink)
            .is_none());
        assert!(temp.path().join("game.zip").exists());
        assert!(sink.statuses().iter().any(|s| s.contains("Validation failed")));
    }

    #[test]
    fn empty_body_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let transfer = Transfer::new(StaticSource {
            body: Vec::new(),
            declared: 0,
        });
        assert!(transfer
            .download("http://host/readme.txt", temp.path(), &crate::events::NullSink)
            .is_none());
    }
}
