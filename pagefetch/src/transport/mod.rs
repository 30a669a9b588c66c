//! The seam between the download pipeline and whatever moves bytes.
//!
//! The pipeline does not implement sockets or TLS; it assumes a transport
//! that delivers byte ranges and completion/error signals for a started
//! request. Events are tagged with the [`TaskId`] they belong to and ferried
//! into [`crate::pipeline::Pipeline::handle_event`] by whoever drives the
//! scheduler. [`HttpTransport`] is the built-in reqwest-backed adapter.

mod http;

pub use http::{HttpTransport, HttpTransportConfig};

use bytes::Bytes;
use thiserror::Error;

use crate::pipeline::TaskId;
use crate::uri::ResourceId;

/// Transport-reported failures. Retry policy is a caller-level concern.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("connection refused by {host}")]
    ConnectionRefused { host: String },

    #[error("connection reset")]
    Reset,

    #[error("request timed out")]
    Timeout,

    #[error("server returned status {status}")]
    Http { status: u16 },

    #[error("i/o error: {0}")]
    Io(String),
}

/// What the pipeline hands a transport to start a request.
#[derive(Clone, Debug)]
pub struct TransportRequest {
    pub uri: ResourceId,
    /// Authorization header value for an auth retry, if any.
    pub auth_header: Option<String>,
}

/// One transport signal for a running task.
#[derive(Debug)]
pub enum TransportEvent {
    /// Response metadata arrived; transfer is underway.
    Headers {
        /// Raw response-header text.
        head: String,
        content_type: Option<String>,
    },
    /// A byte range arrived. Ranges may arrive in any order and size.
    Data { offset: u64, bytes: Bytes },
    /// The server demands authentication (401/407-equivalent); `challenge`
    /// is the raw `WWW-Authenticate` text.
    AuthRequired { challenge: String },
    /// All data delivered.
    Complete,
    /// The request failed; terminal for the transport side.
    Failed { error: NetworkError },
}

/// A transport that can start and cancel per-task requests.
///
/// Implementations deliver `(TaskId, TransportEvent)` pairs out of band
/// (typically over a channel); `cancel` is advisory and takes effect at the
/// transport's next opportunity.
pub trait Transport {
    fn start(&mut self, task: TaskId, request: TransportRequest) -> Result<(), NetworkError>;

    fn cancel(&mut self, task: TaskId);
}
