/**
 * Error taxonomy shared by the STUN and TURN layers.
 *
 * Errors are plain data: they are returned from synchronous calls and
 * delivered inside completion events, never raised across the event loop.
 */
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The transport failed to send or the connection went away.
    #[error("transport error: {0}")]
    Transport(String),

    /// A transaction exhausted its retransmissions without a final response.
    #[error("transaction timed out")]
    Timeout,

    /// The server answered with an error response.
    #[error("error response {code}: {reason}")]
    ErrorResponse { code: u16, reason: String },

    /// Credentials were rejected after a challenge, or responses failed integrity.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// An inbound packet could not be parsed.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// The API was used in a state that does not allow the call.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// The server name could not be resolved.
    #[error("resolution failed: {0}")]
    Resolve(String),
}

impl Error {
    /// STUN error code carried by an error response, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::ErrorResponse { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Error::Malformed(reason.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
