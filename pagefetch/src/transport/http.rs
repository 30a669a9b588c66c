//! HTTP transport adapter over reqwest's blocking client.
//!
//! Each started request runs on its own worker thread and streams the
//! response body as sequential `Data` events into an mpsc channel; the
//! caller drains the receiver into the pipeline. 401/407 become
//! `AuthRequired` with the server's challenge text. Redirect following and
//! cookies are deliberately not enabled here.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, PROXY_AUTHENTICATE, WWW_AUTHENTICATE};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use tracing::{debug, warn};

use super::{NetworkError, Transport, TransportEvent, TransportRequest};
use crate::pipeline::TaskId;

/// Default timeout for HTTP requests.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Read buffer size while streaming a body (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// HTTP transport configuration.
#[derive(Clone, Debug)]
pub struct HttpTransportConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: format!("pagefetch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Blocking-reqwest transport; one worker thread per in-flight request.
pub struct HttpTransport {
    client: Client,
    events: mpsc::Sender<(TaskId, TransportEvent)>,
    cancels: HashMap<TaskId, Arc<AtomicBool>>,
}

impl HttpTransport {
    /// Creates the transport and the event receiver the driver drains.
    pub fn new(config: HttpTransportConfig) -> (Self, mpsc::Receiver<(TaskId, TransportEvent)>) {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .redirect(Policy::none())
            .build()
            .expect("Failed to create HTTP client");
        let (tx, rx) = mpsc::channel();
        (
            Self {
                client,
                events: tx,
                cancels: HashMap::new(),
            },
            rx,
        )
    }
}

impl Transport for HttpTransport {
    fn start(&mut self, task: TaskId, request: TransportRequest) -> Result<(), NetworkError> {
        // Flags for finished workers linger until the next start; drop them.
        self.cancels.retain(|_, flag| Arc::strong_count(flag) > 1);

        let cancelled = Arc::new(AtomicBool::new(false));
        self.cancels.insert(task, Arc::clone(&cancelled));

        let client = self.client.clone();
        let events = self.events.clone();
        debug!(task = ?task, uri = %request.uri, "starting http request");
        thread::spawn(move || run_request(client, task, request, events, cancelled));
        Ok(())
    }

    fn cancel(&mut self, task: TaskId) {
        if let Some(flag) = self.cancels.remove(&task) {
            flag.store(true, Ordering::Relaxed);
        }
    }
}

fn run_request(
    client: Client,
    task: TaskId,
    request: TransportRequest,
    events: mpsc::Sender<(TaskId, TransportEvent)>,
    cancelled: Arc<AtomicBool>,
) {
    let mut builder = client.get(request.uri.as_str());
    if let Some(header) = &request.auth_header {
        builder = builder.header(AUTHORIZATION, header);
    }

    let mut response = match builder.send() {
        Ok(response) => response,
        Err(e) => {
            let _ = events.send((task, TransportEvent::Failed { error: map_error(&request, e) }));
            return;
        }
    };

    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        let name = if status == StatusCode::UNAUTHORIZED {
            WWW_AUTHENTICATE
        } else {
            PROXY_AUTHENTICATE
        };
        let challenge = response
            .headers()
            .get(name)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .unwrap_or_default();
        let _ = events.send((task, TransportEvent::AuthRequired { challenge }));
        return;
    }
    if !status.is_success() {
        let _ = events.send((
            task,
            TransportEvent::Failed {
                error: NetworkError::Http {
                    status: status.as_u16(),
                },
            },
        ));
        return;
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let _ = events.send((
        task,
        TransportEvent::Headers {
            head: render_head(&response),
            content_type,
        },
    ));

    let mut offset = 0u64;
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        if cancelled.load(Ordering::Relaxed) {
            debug!(task = ?task, "http request cancelled mid-transfer");
            return;
        }
        match response.read(&mut buf) {
            Ok(0) => {
                let _ = events.send((task, TransportEvent::Complete));
                return;
            }
            Ok(n) => {
                let _ = events.send((
                    task,
                    TransportEvent::Data {
                        offset,
                        bytes: bytes::Bytes::copy_from_slice(&buf[..n]),
                    },
                ));
                offset += n as u64;
            }
            Err(e) => {
                warn!(task = ?task, error = %e, "body read failed");
                let _ = events.send((
                    task,
                    TransportEvent::Failed {
                        error: NetworkError::Io(e.to_string()),
                    },
                ));
                return;
            }
        }
    }
}

/// Renders the raw response-header text stored in `CacheEntry::head`.
fn render_head(response: &reqwest::blocking::Response) -> String {
    let mut head = format!("{:?} {}\r\n", response.version(), response.status());
    for (name, value) in response.headers() {
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(&String::from_utf8_lossy(value.as_bytes()));
        head.push_str("\r\n");
    }
    head
}

fn map_error(request: &TransportRequest, e: reqwest::Error) -> NetworkError {
    if e.is_timeout() {
        NetworkError::Timeout
    } else if e.is_connect() {
        NetworkError::ConnectionRefused {
            host: request.uri.host().to_string(),
        }
    } else {
        NetworkError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = HttpTransportConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert!(config.user_agent.starts_with("pagefetch/"));
    }

    #[test]
    fn test_cancel_unknown_task_is_noop() {
        let (mut transport, _rx) = HttpTransport::new(HttpTransportConfig::default());
        transport.cancel(TaskId::from_raw(42));
    }
}
