use thiserror::Error;

/// Errors surfaced across the public API.
///
/// Workers keep local recovery (retry, backoff, credential refresh) to
/// themselves; what reaches the caller is either a terminal condition or a
/// synchronous rejection.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The endpoint already holds server-assigned credentials. Activating
    /// twice is a programming error, not a transient condition.
    #[error("the device is already activated")]
    AlreadyActivated,

    /// An operation that needs an endpoint ID was called before activation.
    #[error("the device has not been activated")]
    NotActivated,

    /// The outbound queue cannot reserve room for the whole batch.
    #[error("the outbound queue cannot hold {requested} more messages ({available} slots left)")]
    QueueFull { requested: usize, available: usize },

    /// A message failed validation before it entered the queue.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The server answered with a non-success status code.
    #[error("request failed with status code {status}: {title}")]
    Status { status: u16, title: String },

    /// The request never produced a server response.
    #[error("network error: {0}")]
    Network(String),

    /// A request/reply exchange did not complete within its deadline.
    #[error("the request timed out")]
    Timeout,

    /// The method is not part of the device-side REST surface.
    #[error("{0} is not supported by the device connection")]
    Unsupported(&'static str),

    /// Key material or signature processing failed. Never retried.
    #[error("security failure: {0}")]
    Security(String),

    /// A configuration value was rejected.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    /// Status code of the server answer, if this error carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn status_error(status: u16, title: impl Into<String>) -> Self {
        ClientError::Status {
            status,
            title: title.into(),
        }
    }

    /// True for failures that a later attempt may clear: connection trouble,
    /// timeouts and server-side 5xx answers.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Network(_) | ClientError::Timeout => true,
            ClientError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
