//! Uploads artifact files to blob storage using a worker pool of real OS
//! threads, not cooperative tasks: uploads are blocking network I/O bound
//! work, and a thread pool lets the pool size track CPU/network capacity
//! independently of the rest of the agent's tokio runtime.
//!
//! Each upload is a two-step PUT: an initial PUT against the coordinator's
//! upload endpoint, which responds with a redirect to a presigned blob
//! storage URL, followed by a second PUT of the file body to that URL.
//! The redirect is followed manually rather than through reqwest's
//! built-in redirect policy so the second request never carries the
//! coordinator's own authorization header.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::LOCATION;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("upload of `{path}` failed transiently: {message}")]
    Transient { path: PathBuf, message: String },
    #[error("upload of `{path}` failed permanently: {message}")]
    Fatal { path: PathBuf, message: String },
    #[error("`{path}` changed on disk while it was being uploaded")]
    FileChanging { path: PathBuf },
}

/// One file queued for upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub local_path: PathBuf,
    pub upload_url: String,
    /// Size recorded when the file was enqueued; compared against the size
    /// at upload time to detect a file that changed mid-run.
    pub expected_size: u64,
}

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub local_path: PathBuf,
    pub duration: Duration,
}

/// Number of worker threads used when the caller doesn't specify one:
/// network-bound work benefits from some oversubscription relative to CPU
/// count.
pub fn default_worker_count() -> usize {
    (num_cpus::get() * 2).max(4)
}

/// Uploads every request in `requests` across a pool of `worker_count`
/// threads, in chunks, and returns outcomes in the order the requests were
/// given (not completion order). The first fatal error encountered stops
/// the whole batch; a request that fails transiently still stops the
/// batch, since retrying individual uploads is the caller's job, not this
/// pool's.
pub fn upload_all(
    client: &Client,
    requests: &[UploadRequest],
    worker_count: usize,
) -> Result<Vec<UploadOutcome>, UploadError> {
    let worker_count = worker_count.max(1).min(requests.len().max(1));
    let mut outcomes = Vec::with_capacity(requests.len());

    for chunk in requests.chunks(worker_count) {
        let mut handles = Vec::with_capacity(chunk.len());
        for request in chunk {
            let client = client.clone();
            let request = request.clone();
            handles.push(thread::spawn(move || upload_one(&client, &request)));
        }
        for handle in handles {
            outcomes.push(handle.join().expect("upload worker thread panicked")?);
        }
    }

    Ok(outcomes)
}

fn upload_one(client: &Client, request: &UploadRequest) -> Result<UploadOutcome, UploadError> {
    let start = Instant::now();

    let metadata = std::fs::metadata(&request.local_path).map_err(|e| UploadError::Fatal {
        path: request.local_path.clone(),
        message: e.to_string(),
    })?;
    if metadata.len() != request.expected_size {
        return Err(UploadError::FileChanging {
            path: request.local_path.clone(),
        });
    }

    let body = std::fs::read(&request.local_path).map_err(|e| UploadError::Transient {
        path: request.local_path.clone(),
        message: e.to_string(),
    })?;

    let first = client
        .put(&request.upload_url)
        .body(body.clone())
        .send()
        .map_err(|e| UploadError::Transient {
            path: request.local_path.clone(),
            message: e.to_string(),
        })?;

    let response = if first.status().is_redirection() {
        let location = first
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| UploadError::Fatal {
                path: request.local_path.clone(),
                message: "redirect response had no Location header".to_string(),
            })?
            .to_string();

        client
            .put(&location)
            .body(body)
            .send()
            .map_err(|e| UploadError::Transient {
                path: request.local_path.clone(),
                message: e.to_string(),
            })?
    } else {
        first
    };

    if response.status().is_server_error() {
        return Err(UploadError::Transient {
            path: request.local_path.clone(),
            message: format!("server returned {}", response.status()),
        });
    }
    if !response.status().is_success() {
        return Err(UploadError::Fatal {
            path: request.local_path.clone(),
            message: format!("server returned {}", response.status()),
        });
    }

    Ok(UploadOutcome {
        local_path: request.local_path.clone(),
        duration: start.elapsed(),
    })
}

/// Thread-safe accumulator for progress reporting across worker threads,
/// since the upload pool itself reports only final outcomes.
#[derive(Debug, Default)]
pub struct UploadProgress {
    completed: Mutex<usize>,
}

impl UploadProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mark_one_done(&self) -> usize {
        let mut completed = self.completed.lock().expect("progress mutex poisoned");
        *completed += 1;
        *completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn start_server() -> (tiny_http::Server, String) {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let addr = server.server_addr().to_string();
        (server, format!("http://{addr}"))
    }

    #[test]
    fn upload_one_succeeds_on_direct_200() {
        let (server, url) = start_server();
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("artifact.bin");
        std::fs::write(&file_path, b"payload").unwrap();

        let handle = thread::spawn(move || {
            if let Ok(Some(mut req)) = server.recv_timeout(Duration::from_secs(5)) {
                let mut body = Vec::new();
                req.as_reader().read_to_end(&mut body).unwrap();
                req.respond(tiny_http::Response::empty(200)).unwrap();
                body
            } else {
                Vec::new()
            }
        });

        let client = Client::new();
        let request = UploadRequest {
            local_path: file_path,
            upload_url: url,
            expected_size: 7,
        };
        let outcome = upload_one(&client, &request).unwrap();
        assert_eq!(outcome.local_path, request.local_path);

        let received_body = handle.join().unwrap();
        assert_eq!(received_body, b"payload");
    }

    #[test]
    fn upload_one_detects_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("artifact.bin");
        std::fs::write(&file_path, b"payload").unwrap();

        let client = Client::new();
        let request = UploadRequest {
            local_path: file_path,
            upload_url: "http://127.0.0.1:0".to_string(),
            expected_size: 999,
        };
        let err = upload_one(&client, &request).unwrap_err();
        assert!(matches!(err, UploadError::FileChanging { .. }));
    }

    #[test]
    fn default_worker_count_has_a_floor() {
        assert!(default_worker_count() >= 4);
    }
}
