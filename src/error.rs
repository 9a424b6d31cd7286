//! Error types for the DHT node
//!
//! This module defines the error taxonomy shared by every DHT component:
//! transient network failures, protocol violations, security rejections,
//! resource exhaustion, and fatal start-up errors.

use std::fmt;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, DhtError>;

/// Comprehensive error type for DHT operations
#[derive(Debug, Clone, PartialEq)]
pub enum DhtError {
    /// Malformed or unexpected wire messages
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// A request did not receive a response before its deadline
    Timeout {
        message: String,
        address: Option<String>,
    },

    /// Socket and transport errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Security Token mismatches and other rejected credentials
    SecurityError {
        message: String,
        address: Option<String>,
    },

    /// Bounded resources (pending table, lookup slots, database) are exhausted
    CapacityExceeded {
        message: String,
        resource: String,
    },

    /// The operation was cancelled before it completed
    Cancelled,

    /// The node has not joined the network yet
    NotBootstrapped,

    /// The node is shutting down
    Shutdown,

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Validation errors
    ValidationError {
        message: String,
        field: Option<String>,
    },
}

impl DhtError {
    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        DhtError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        DhtError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new Timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        DhtError::Timeout {
            message: message.into(),
            address: None,
        }
    }

    /// Create a new Timeout error for a remote address
    pub fn timeout_with_address(message: impl Into<String>, address: impl Into<String>) -> Self {
        DhtError::Timeout {
            message: message.into(),
            address: Some(address.into()),
        }
    }

    /// Create a new NetworkError
    pub fn network_error(message: impl Into<String>) -> Self {
        DhtError::NetworkError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new NetworkError with address
    pub fn network_error_with_address(message: impl Into<String>, address: impl Into<String>) -> Self {
        DhtError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: None,
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        DhtError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new SecurityError
    pub fn security_error(message: impl Into<String>) -> Self {
        DhtError::SecurityError {
            message: message.into(),
            address: None,
        }
    }

    /// Create a new SecurityError for a remote address
    pub fn security_error_with_address(message: impl Into<String>, address: impl Into<String>) -> Self {
        DhtError::SecurityError {
            message: message.into(),
            address: Some(address.into()),
        }
    }

    /// Create a new CapacityExceeded error
    pub fn capacity_exceeded(message: impl Into<String>, resource: impl Into<String>) -> Self {
        DhtError::CapacityExceeded {
            message: message.into(),
            resource: resource.into(),
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        DhtError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        DhtError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new ValidationError
    pub fn validation_error(message: impl Into<String>) -> Self {
        DhtError::ValidationError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ValidationError with field
    pub fn validation_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        DhtError::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// True for timeouts, the expected outcome of talking to a dead peer
    pub fn is_timeout(&self) -> bool {
        matches!(self, DhtError::Timeout { .. })
    }

    /// True for errors that only affect one path of a lookup
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DhtError::Timeout { .. } | DhtError::NetworkError { .. } | DhtError::ProtocolError { .. }
        )
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            DhtError::ProtocolError { source, .. } | DhtError::NetworkError { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            DhtError::Timeout { message, .. }
            | DhtError::SecurityError { message, .. }
            | DhtError::CapacityExceeded { message, .. }
            | DhtError::ConfigError { message, .. }
            | DhtError::ValidationError { message, .. } => {
                *message = format!("{} ({})", message, ctx);
            }
            _ => {}
        }
        self
    }
}

impl fmt::Display for DhtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DhtError::ProtocolError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Protocol error: {} (source: {})", message, src)
                } else {
                    write!(f, "Protocol error: {}", message)
                }
            }
            DhtError::Timeout { message, address } => {
                if let Some(addr) = address {
                    write!(f, "Timeout: {} (address: {})", message, addr)
                } else {
                    write!(f, "Timeout: {}", message)
                }
            }
            DhtError::NetworkError { message, address, source } => {
                match (address, source) {
                    (Some(a), Some(s)) => write!(f, "Network error: {} (address: {}, source: {})", message, a, s),
                    (Some(a), None) => write!(f, "Network error: {} (address: {})", message, a),
                    (None, Some(s)) => write!(f, "Network error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Network error: {}", message),
                }
            }
            DhtError::SecurityError { message, address } => {
                if let Some(addr) = address {
                    write!(f, "Security error: {} (address: {})", message, addr)
                } else {
                    write!(f, "Security error: {}", message)
                }
            }
            DhtError::CapacityExceeded { message, resource } => {
                write!(f, "Capacity exceeded: {} [{}]", message, resource)
            }
            DhtError::Cancelled => write!(f, "Operation cancelled"),
            DhtError::NotBootstrapped => write!(f, "Node is not bootstrapped"),
            DhtError::Shutdown => write!(f, "Node is shutting down"),
            DhtError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
            DhtError::ValidationError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Validation error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Validation error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for DhtError {}

// Implement From traits for common error types

impl From<std::io::Error> for DhtError {
    fn from(err: std::io::Error) -> Self {
        DhtError::NetworkError {
            message: err.to_string(),
            address: None,
            source: Some(err.kind().to_string()),
        }
    }
}

impl From<serde_json::Error> for DhtError {
    fn from(err: serde_json::Error) -> Self {
        DhtError::config_error(format!("Failed to parse JSON settings: {}", err))
    }
}

impl From<std::net::AddrParseError> for DhtError {
    fn from(err: std::net::AddrParseError) -> Self {
        DhtError::network_error_full("Failed to parse address", "unknown".to_string(), err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for DhtError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        DhtError::timeout("Operation timed out")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error() {
        let err = DhtError::protocol_error("Unknown opcode");
        assert_eq!(err.to_string(), "Protocol error: Unknown opcode");
    }

    #[test]
    fn test_protocol_error_with_source() {
        let err = DhtError::protocol_error_with_source("Truncated message", "needed 20 bytes");
        assert!(err.to_string().contains("Protocol error"));
        assert!(err.to_string().contains("Truncated message"));
        assert!(err.to_string().contains("needed 20 bytes"));
    }

    #[test]
    fn test_timeout_with_address() {
        let err = DhtError::timeout_with_address("No response", "127.0.0.1:4000");
        assert!(err.is_timeout());
        assert!(err.is_transient());
        assert!(err.to_string().contains("127.0.0.1:4000"));
    }

    #[test]
    fn test_security_error_is_not_transient() {
        let err = DhtError::security_error_with_address("Invalid token", "10.0.0.1:5000");
        assert!(!err.is_transient());
        assert!(err.to_string().contains("Security error"));
        assert!(err.to_string().contains("10.0.0.1:5000"));
    }

    #[test]
    fn test_capacity_exceeded() {
        let err = DhtError::capacity_exceeded("Too many pending requests", "pending-requests");
        assert_eq!(
            err.to_string(),
            "Capacity exceeded: Too many pending requests [pending-requests]"
        );
    }

    #[test]
    fn test_with_context() {
        let err = DhtError::protocol_error("Invalid data").with_context("while decoding header");
        assert!(err.to_string().contains("while decoding header"));

        let err = DhtError::config_error_with_field("Must be positive", "k").with_context("settings.json");
        assert!(err.to_string().contains("settings.json"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "Address in use");
        let err: DhtError = io_err.into();
        assert!(matches!(err, DhtError::NetworkError { .. }));
    }

    #[test]
    fn test_from_addr_parse_error() {
        let addr_err = "invalid:address".parse::<std::net::SocketAddr>().unwrap_err();
        let err: DhtError = addr_err.into();
        assert!(matches!(err, DhtError::NetworkError { .. }));
    }

    #[test]
    fn test_unit_variants_display() {
        assert_eq!(DhtError::Cancelled.to_string(), "Operation cancelled");
        assert_eq!(DhtError::NotBootstrapped.to_string(), "Node is not bootstrapped");
        assert_eq!(DhtError::Shutdown.to_string(), "Node is shutting down");
    }
}
