use thiserror::Error;

/// Failures of the byte-stream collaborator.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open {port}: {reason}")]
    Open { port: String, reason: String },
    #[error("transport is not connected")]
    NotConnected,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<serialport::Error> for TransportError {
    fn from(value: serialport::Error) -> Self {
        match value.kind() {
            serialport::ErrorKind::Io(kind) => {
                TransportError::Io(std::io::Error::new(kind, value.description))
            }
            _ => TransportError::ConnectionLost(value.description),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MalformedKind {
    #[error("bad sync byte 0x{0:02x}")]
    BadSync(u8),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unexpected frame length of {0} sample pairs")]
    BadLength(usize),
    #[error("checksum mismatch: expected 0x{expected:02x}, got 0x{actual:02x}")]
    Checksum { expected: u8, actual: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(MalformedKind),
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
}

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("requested depth {requested} exceeds the {max}-sample ceiling")]
    Capacity { requested: usize, max: usize },
    #[error("no device connected; connect a device first")]
    NotConnected,
    #[error("stream desynchronized: {malformed} malformed frames in the last {window}")]
    Desynchronized { malformed: usize, window: usize },
    #[error("invalid view: {0}")]
    InvalidView(String),
    #[error("acquisition worker is not running")]
    WorkerGone,
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Json(#[from] serde_json::Error),
}
