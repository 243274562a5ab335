// src/rabbitmq/mod.rs
// Resilient consumer/publisher layer over a supervised RabbitMQ connection

pub mod errors;
pub mod backoff;
pub mod endpoint;
pub mod transport;
pub mod event_loop;
pub mod amqp_client;
pub mod connection;
pub mod confirm;
pub mod consumer;
pub mod publisher;

// Re-export the common entry points
pub use amqp_client::{LapinConnector, LapinLink};
pub use backoff::{BackoffPolicy, BackoffState, Growth, JitterPolicy};
pub use confirm::{Confirmation, ConfirmTracker};
pub use connection::{
    ChannelListener, ConnectionState, ConnectionSupervisor, SupervisorConfig, SupervisorHandle,
};
pub use consumer::{handler_fn, Consumer, ConsumerConfig, MessageHandler, Outcome, QuarantineRecord};
pub use endpoint::{Endpoint, EndpointSelector};
pub use errors::{RabbitMQError, Result};
pub use event_loop::{AsyncStdEventLoop, EventLoop, TaskHandle, TokioEventLoop};
pub use publisher::{FanoutPublisher, Publish, Publisher, PublisherConfig};
pub use transport::{
    ChannelOptions, CloseReason, ConfirmStatus, Connector, Delivery, ExchangeSpec, ExchangeType,
    Link, PublishRequest, QueueSpec,
};
