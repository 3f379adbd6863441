use thiserror::Error;

/// Failure taxonomy for one [`crate::connection::Connection`].
///
/// `WouldBlock` never appears here: it's matched on `io::ErrorKind` at the
/// call site and handled as control flow, not surfaced as an error value.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The peer closed its end of the socket (EOF on read). Non-fatal in the
    /// sense that it isn't a bug, but it still tears the connection down.
    #[error("closed by peer")]
    PeerClosed,
    /// Any I/O error other than would-block or peer-close.
    #[error("socket failure: {0}")]
    SocketFailure(#[from] std::io::Error),
    /// A user-supplied read/write callback panicked or otherwise failed.
    #[error("callback failure: {0}")]
    CallbackFailure(String),
    /// Encoding or decoding a frame failed.
    #[error("framing failure: {0}")]
    FramingFailure(String),
    /// A `read`/`write` was attempted on an already-closed connection.
    #[error("connection already closed")]
    AlreadyClosed,
}

impl ConnectionError {
    /// `true` for failures that are loggable-but-ordinary (peer close),
    /// `false` for failures that should log at `error` level.
    pub fn is_quiet(&self) -> bool {
        matches!(self, Self::PeerClosed)
    }
}

/// Carried in a response payload as a remote failure: a plain value that
/// round-trips through the codec like any other result.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: kind.into(), message: message.into() }
    }

    pub fn no_such_method(name: &str) -> Self {
        Self::new("AttributeError", format!("no method '{name}'"))
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Outcome of invoking a dispatched method, as a tagged variant rather than
/// an exception hierarchy: `Ordinary` is reported back to the caller as a
/// [`RemoteError`], `Critical` propagates out of the request handler and
/// tears the server down.
///
/// `Ordinary` carries its own `kind` rather than always reporting `"Error"`,
/// so a handler raising e.g. a `ValueError`-shaped failure has the caller
/// see that kind rather than a single generic one (original `rpc.py`
/// encodes the raised exception's type alongside its message the same way).
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{kind}: {message}")]
    Ordinary { kind: String, message: String },
    #[error("{0}")]
    Critical(String),
}

impl HandlerError {
    /// Kind defaults to `"Error"`, matching a handler that didn't care to
    /// name one.
    pub fn ordinary(msg: impl Into<String>) -> Self {
        Self::ordinary_with_kind("Error", msg)
    }

    pub fn ordinary_with_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Ordinary { kind: kind.into(), message: msg.into() }
    }

    pub fn critical(msg: impl Into<String>) -> Self {
        Self::Critical(msg.into())
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Critical(_))
    }

    pub fn into_remote(self) -> RemoteError {
        match self {
            Self::Ordinary { kind, message } => RemoteError::new(kind, message),
            Self::Critical(m) => RemoteError::new("CriticalError", m),
        }
    }
}

/// A designated error kind: returning this from a `#[public]` method tears
/// the server down instead of being reported to the caller.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CriticalError(pub String);

impl CriticalError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<CriticalError> for HandlerError {
    fn from(value: CriticalError) -> Self {
        HandlerError::Critical(value.0)
    }
}

/// Surfaced to the client caller when a call fails for a reason other than
/// a remote error value: connection closed mid-call, or the response could
/// not be parsed.
#[derive(Debug, Error, Default)]
#[error("request failed: {0}")]
pub struct RequestError(pub String);

impl RequestError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// What a client call can fail with.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Request(#[from] RequestError),
}
