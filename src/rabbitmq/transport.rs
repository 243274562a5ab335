// src/rabbitmq/transport.rs
// The seam between the reconnect/dispatch policy and a concrete AMQP client.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use lapin::types::FieldTable;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::endpoint::Endpoint;
use super::errors::{RabbitMQError, Result};

/// One message delivered from a queue to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub headers: Option<FieldTable>,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            headers: delivery.properties.headers().clone(),
            body: delivery.data,
            redelivered: delivery.redelivered,
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<ExchangeType> for lapin::ExchangeKind {
    fn from(kind: ExchangeType) -> Self {
        match kind {
            ExchangeType::Direct => lapin::ExchangeKind::Direct,
            ExchangeType::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeType::Topic => lapin::ExchangeKind::Topic,
            ExchangeType::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeType,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn new(name: &str, kind: ExchangeType, durable: bool) -> Self {
        Self {
            name: name.to_string(),
            kind,
            durable,
        }
    }

    /// The nameless default exchange always exists and cannot be declared.
    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub arguments: FieldTable,
}

impl QueueSpec {
    pub fn durable(name: &str) -> Self {
        Self {
            name: name.to_string(),
            durable: true,
            arguments: FieldTable::default(),
        }
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }
}

/// A single outbound message.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: Option<FieldTable>,
    pub mandatory: bool,
    pub immediate: bool,
    pub content_type: Option<String>,
    pub persistent: bool,
}

impl PublishRequest {
    pub fn new(exchange: &str, routing_key: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.into(),
            headers: None,
            mandatory: false,
            immediate: false,
            content_type: None,
            persistent: true,
        }
    }

    /// JSON-encodes `message` as the body.
    pub fn json<T: Serialize>(exchange: &str, routing_key: &str, message: &T) -> Result<Self> {
        let body = serde_json::to_vec(message)
            .map_err(|e| RabbitMQError::PublishError(format!("Failed to serialize message: {}", e)))?;
        Ok(Self::new(exchange, routing_key, body).with_content_type("application/json"))
    }

    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Same message, different exchange.
    pub fn to_exchange(&self, exchange: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            ..self.clone()
        }
    }
}

/// The broker's verdict on one publish made in confirm mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmStatus {
    Acked,
    Nacked,
    /// Acked, but the broker returned the message as unroutable (mandatory publish).
    Returned,
    /// The channel is not in confirm mode.
    NotRequested,
}

impl ConfirmStatus {
    /// Not a negative answer. Publishes tracked in confirm mode accept only `Acked`.
    pub fn is_success(&self) -> bool {
        matches!(self, ConfirmStatus::Acked | ConfirmStatus::NotRequested)
    }
}

impl From<lapin::publisher_confirm::Confirmation> for ConfirmStatus {
    fn from(confirmation: lapin::publisher_confirm::Confirmation) -> Self {
        use lapin::publisher_confirm::Confirmation;
        match confirmation {
            Confirmation::Ack(None) => ConfirmStatus::Acked,
            Confirmation::Ack(Some(_)) => ConfirmStatus::Returned,
            Confirmation::Nack(_) => ConfirmStatus::Nacked,
            Confirmation::NotRequested => ConfirmStatus::NotRequested,
        }
    }
}

/// Why a link stopped being usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by this process.
    Requested(String),
    ConnectionLost(String),
    ChannelClosed(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Requested(text) => write!(f, "closed on request: {text}"),
            CloseReason::ConnectionLost(text) => write!(f, "connection lost: {text}"),
            CloseReason::ChannelClosed(text) => write!(f, "channel closed: {text}"),
        }
    }
}

/// Per-channel settings applied when a connection is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    pub confirm_delivery: bool,
    pub heartbeat: Option<u16>,
    pub connect_timeout_ms: Option<u64>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            confirm_delivery: true,
            heartbeat: Some(30),
            connect_timeout_ms: Some(5000),
        }
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;
pub type ConfirmFuture = BoxFuture<'static, Result<ConfirmStatus>>;

/// One open connection with its channel.
///
/// A link is valid for exactly one connection lifetime; once closed it never
/// reopens and every operation on it fails.
#[async_trait]
pub trait Link: Send + Sync {
    fn is_open(&self) -> bool;

    /// Resolves once the connection or channel has closed, for any reason.
    async fn closed(&self) -> CloseReason;

    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()>;

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// Sends the message; the returned future resolves with the broker's confirmation.
    async fn publish(&self, request: &PublishRequest) -> Result<ConfirmFuture>;

    async fn close(&self, reason: &str) -> Result<()>;
}

/// Opens links to broker endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint, options: &ChannelOptions) -> Result<Arc<dyn Link>>;
}
