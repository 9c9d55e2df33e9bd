use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("HTTP error: {message}")]
    Request { status: u16, message: String },

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid modelfile: {0}")]
    Modelfile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Discriminant of [`Error`], for callers that branch on the failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Request,
    ModelNotFound,
    Decode,
    Unexpected,
    InvalidInput,
    Modelfile,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection(_) => ErrorKind::Connection,
            Error::Request { .. } => ErrorKind::Request,
            Error::ModelNotFound(_) => ErrorKind::ModelNotFound,
            Error::Decode(_) => ErrorKind::Decode,
            Error::Unexpected(_) => ErrorKind::Unexpected,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::Modelfile(_) => ErrorKind::Modelfile,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// HTTP status carried by the error, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Request { status, .. } => Some(*status),
            Error::ModelNotFound(_) => Some(404),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Error::Decode(err.to_string())
        } else if err.is_connect() || err.is_timeout() || err.is_request() || err.is_body() {
            Error::Connection(err.to_string())
        } else if let Some(status) = err.status() {
            Error::Request {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            Error::Unexpected(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
