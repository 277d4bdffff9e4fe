//! Error types for the delivery engine

pub type Result<T> = std::result::Result<T, DeliveryError>;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// IO error with context
    #[error("IO error while {operation}: {message}")]
    IoOperation {
        operation: String,
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid configuration with details
    #[error("Invalid configuration for {component}: {message}")]
    InvalidConfiguration { component: String, message: String },

    /// A destination entry that could not be parsed or resolved
    #[error("Invalid destination '{entry}': {message}")]
    InvalidDestination { entry: String, message: String },

    /// TLS setup failure
    #[error("TLS error: {0}")]
    TlsError(String),

    /// The encoder could not turn an event into bytes
    #[error("Encoder error ({encoder}): {message}")]
    EncoderError { encoder: String, message: String },

    /// The appender was started twice
    #[error("Appender '{0}' already started")]
    AlreadyStarted(String),
}

impl DeliveryError {
    /// Create an IO operation error with context
    pub fn io_operation(
        operation: impl Into<String>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        DeliveryError::IoOperation {
            operation: operation.into(),
            message: message.into(),
            source,
        }
    }

    /// Create an invalid configuration error
    pub fn config(component: impl Into<String>, message: impl Into<String>) -> Self {
        DeliveryError::InvalidConfiguration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create an invalid destination error
    pub fn destination(entry: impl Into<String>, message: impl Into<String>) -> Self {
        DeliveryError::InvalidDestination {
            entry: entry.into(),
            message: message.into(),
        }
    }

    pub fn tls<S: Into<String>>(msg: S) -> Self {
        DeliveryError::TlsError(msg.into())
    }

    /// Create an encoder error
    pub fn encoder(encoder: impl Into<String>, message: impl Into<String>) -> Self {
        DeliveryError::EncoderError {
            encoder: encoder.into(),
            message: message.into(),
        }
    }

    /// Whether this error came from the transport rather than from the event itself
    ///
    /// Transport errors trigger a reconnect; everything else only affects the
    /// event being processed.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DeliveryError::IoError(_) | DeliveryError::IoOperation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = DeliveryError::config("TcpAppender", "ring buffer size must be a power of two");
        assert!(matches!(err, DeliveryError::InvalidConfiguration { .. }));

        let err = DeliveryError::destination("host:abc", "invalid port");
        assert!(matches!(err, DeliveryError::InvalidDestination { .. }));

        let err = DeliveryError::encoder("json", "unsupported value");
        assert!(matches!(err, DeliveryError::EncoderError { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = DeliveryError::destination("logs.example.com:0", "port must be positive");
        assert_eq!(
            err.to_string(),
            "Invalid destination 'logs.example.com:0': port must be positive"
        );

        let err = DeliveryError::config("TcpAppender", "no destinations configured");
        assert_eq!(
            err.to_string(),
            "Invalid configuration for TcpAppender: no destinations configured"
        );

        let err = DeliveryError::AlreadyStarted("tcp".to_string());
        assert_eq!(err.to_string(), "Appender 'tcp' already started");
    }

    #[test]
    fn test_io_operation_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = DeliveryError::io_operation("writing event", "connection lost", io_err);

        assert!(matches!(err, DeliveryError::IoOperation { .. }));
        assert!(err.to_string().contains("writing event"));
        assert!(err.is_transport());
        assert!(!DeliveryError::encoder("line", "bad").is_transport());
    }
}
