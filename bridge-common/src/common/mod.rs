use std::fmt;

/// Bridge Error
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// A peer violated the wire protocol (truncated packet, unknown variant, ...).
    Protocol(String),
    /// Loading or running the connection script failed.
    Script(String),
    General(String),
}

/// Bridge Result type
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::Script(msg) => write!(f, "script error: {}", msg),
            Error::General(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<std::fmt::Error> for Error {
    fn from(e: std::fmt::Error) -> Self {
        Error::General(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::General(e.to_string())
    }
}
