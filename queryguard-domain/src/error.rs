use thiserror::Error;

// ---

#[derive(Debug, Error)]
pub enum GuardError {
    // ---
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed framing on the wire (bad length prefix, short message,
    /// missing terminator). Fatal for the connection that produced it.
    #[error("framing error: {0}")]
    Framing(String),

    /// A socket deadline elapsed mid-operation.
    #[error("operation deadline elapsed")]
    Timeout,

    #[error("couldn't connect to {endpoint}")]
    Dial { endpoint: String },

    #[error("document decode error: {0}")]
    Decode(#[from] bson::de::Error),

    #[error("document encode error: {0}")]
    Encode(#[from] bson::ser::Error),

    /// Failure on the control channel. Callers log these and carry on;
    /// they never take a client connection down.
    #[error("control channel error: {0}")]
    Control(String),
}

// ---

pub type Result<T> = std::result::Result<T, GuardError>;

// ---

impl GuardError {
    /// True when this error came from an elapsed deadline rather than a
    /// peer failure. Decides the synthetic error code sent to the client.
    pub fn is_timeout(&self) -> bool {
        // ---
        match self {
            GuardError::Timeout => true,
            GuardError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}
