// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("AMQP protocol error: {0}")]
    ProtocolError(String),

    #[error("No channel is currently open")]
    NotConnected,

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("Broker rejected publish: {0}")]
    ConfirmRejected(String),

    #[error("Publish confirmation lost: {0}")]
    ConfirmLost(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Connection timeout: {0}")]
    TimeoutError(String),

    #[error("Gave up after {attempts} consecutive connection attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// Whether this is a connectivity failure rather than a configuration one.
    ///
    /// The supervisor retries both kinds; only the configured attempt ceiling
    /// turns repeated failures into a fatal condition.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            RabbitMQError::RetriesExhausted { .. }
                | RabbitMQError::InvalidEndpoint(_)
                | RabbitMQError::Config(_)
        )
    }
}

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        let error_text = error.to_string();

        match error {
            LapinError::IOError(_) | LapinError::InvalidConnectionState(_) => {
                RabbitMQError::ConnectionError(error_text)
            }
            LapinError::InvalidChannel(_)
            | LapinError::InvalidChannelState(_)
            | LapinError::ChannelsLimitReached => RabbitMQError::ChannelError(error_text),
            LapinError::ProtocolError(_) | LapinError::InvalidProtocolVersion(_) => {
                RabbitMQError::ProtocolError(error_text)
            }
            _ => RabbitMQError::Unknown(error_text),
        }
    }
}

impl From<String> for RabbitMQError {
    fn from(message: String) -> Self {
        RabbitMQError::Unknown(message)
    }
}

impl From<&str> for RabbitMQError {
    fn from(message: &str) -> Self {
        RabbitMQError::Unknown(message.to_string())
    }
}
