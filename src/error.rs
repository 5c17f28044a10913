//! Error types for the static cache server

use thiserror::Error;

/// Result type alias for server operations
pub type Result<T> = std::result::Result<T, ServeError>;

/// Error types that can occur while serving a request or running the server
#[derive(Error, Debug, Clone)]
pub enum ServeError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to bind listener on {address}: {message}")]
    BindError { address: String, message: String },

    #[error("Malformed request: {0}")]
    ParseError(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for ServeError {
    fn from(err: std::io::Error) -> Self {
        ServeError::IoError(err.to_string())
    }
}

impl ServeError {
    /// Convert error to the HTTP status code sent to the client
    ///
    /// - Malformed requests: 400
    /// - Path traversal: 403
    /// - Missing resources: 404
    /// - Anything other than GET/HEAD: 405
    /// - Everything else: 500
    pub fn to_http_status(&self) -> u16 {
        match self {
            ServeError::ParseError(_) => 400,
            ServeError::Forbidden(_) => 403,
            ServeError::NotFound(_) => 404,
            ServeError::MethodNotAllowed(_) => 405,

            ServeError::ConfigError(_) => 500,
            ServeError::BindError { .. } => 500,
            ServeError::IoError(_) => 500,
            ServeError::InternalError(_) => 500,
        }
    }

    /// Whether the connection must be closed after reporting this error
    ///
    /// Resolution and method errors leave the connection usable. Protocol
    /// errors and server-side failures leave the response state undefined,
    /// so the connection is dropped.
    pub fn closes_connection(&self) -> bool {
        match self {
            ServeError::Forbidden(_) => false,
            ServeError::NotFound(_) => false,
            ServeError::MethodNotAllowed(_) => false,
            _ => true,
        }
    }

    /// Create a ParseError from any displayable message
    pub fn parse(message: impl Into<String>) -> Self {
        ServeError::ParseError(message.into())
    }
}
