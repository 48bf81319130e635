//! Error taxonomy shared by the queue, the forwarder and the node monitors.
//!
//! Batch level errors are cloned into every task of the failing batch, which is why every
//! variant here is `Clone`.
use thiserror::Error;

/// Coarse kind of a failure that happened before any HTTP response was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The peer certificate does not cover the host name we connected to.
    TlsNameMismatch,
    /// Any other TLS handshake or certificate failure.
    Tls,
    /// Connection refused, reset, DNS failure, timeout and the like.
    Connection,
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?} failure talking to {url}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub url: String,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, url: impl Into<String>, message: impl Into<String>) -> Self {
        TransportError {
            kind,
            url: url.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RpcQueueError {
    /// The queue was over its high watermark and refused the call.
    #[error("no more room left in the queue")]
    Capacity,

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// 5xx answer without a usable batch body.
    #[error("HTTP server error; code {status}")]
    HttpServer { status: u16, body: String },

    /// 4xx answer without a usable batch body.
    #[error("HTTP client error; code {status}")]
    HttpClient { status: u16, body: String },

    /// The body was not JSON, or not a JSON array.
    #[error("batch error from {url}: {message}")]
    Protocol {
        url: String,
        status: u16,
        message: String,
    },

    /// A well formed per-command error object returned by the node.
    #[error("JSON-RPC error; code {code}: {message}")]
    Command {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A per-command response that could not be interpreted, or that never came.
    #[error("{message}")]
    CommandResponse {
        message: String,
        entry: Option<serde_json::Value>,
    },

    /// The owner of the task went away before resolving it.
    #[error("task abandoned before a response was received")]
    Abandoned,
}

impl RpcQueueError {
    /// Client side errors are unlikely to go away by themselves. Everything else is
    /// worth retrying sooner.
    pub fn is_permanent(&self) -> bool {
        matches!(self, RpcQueueError::HttpClient { .. })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_client_errors_are_permanent() {
        let client = RpcQueueError::HttpClient {
            status: 401,
            body: String::new(),
        };
        let server = RpcQueueError::HttpServer {
            status: 502,
            body: String::new(),
        };
        let tls = RpcQueueError::from(TransportError::new(
            TransportErrorKind::TlsNameMismatch,
            "https://node.example",
            "bad name",
        ));

        assert!(client.is_permanent());
        assert!(!server.is_permanent());
        assert!(!tls.is_permanent());
        assert!(!RpcQueueError::Capacity.is_permanent());
    }

    #[test]
    fn command_error_renders_code_and_message() {
        let err = RpcQueueError::Command {
            code: -32601,
            message: "method not found".into(),
            data: None,
        };
        assert_eq!(err.to_string(), "JSON-RPC error; code -32601: method not found");
    }
}
