// src/rabbitmq/amqp_client.rs

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::endpoint::Endpoint;
use super::errors::{RabbitMQError, Result};
use super::event_loop::EventLoop;
use super::transport::{
    ChannelOptions, CloseReason, ConfirmFuture, ConfirmStatus, Connector, Delivery, DeliveryStream,
    ExchangeSpec, Link, PublishRequest, QueueSpec,
};

const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections, one channel each.
pub struct LapinConnector {
    event_loop: Arc<dyn EventLoop>,
    status_poll: Duration,
}

impl LapinConnector {
    pub fn new(event_loop: Arc<dyn EventLoop>) -> Self {
        Self {
            event_loop,
            status_poll: Duration::from_millis(500),
        }
    }

    /// How often an idle link re-checks channel and connection status.
    pub fn with_status_poll(mut self, interval: Duration) -> Self {
        self.status_poll = interval;
        self
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, endpoint: &Endpoint, options: &ChannelOptions) -> Result<Arc<dyn Link>> {
        let connect_timeout = options.connect_timeout_ms.map(Duration::from_millis);
        let uri = endpoint.to_amqp_uri(options.heartbeat, connect_timeout);

        debug!(host = %endpoint.display_name(), "Opening AMQP connection");
        let connecting = Connection::connect_uri(uri, ConnectionProperties::default());
        let connection = match connect_timeout {
            Some(limit) => {
                tokio::select! {
                    result = connecting => result?,
                    _ = self.event_loop.sleep(limit) => {
                        return Err(RabbitMQError::TimeoutError(format!(
                            "no connection to {} within {:?}",
                            endpoint.display_name(),
                            limit
                        )));
                    }
                }
            }
            None => connecting.await?,
        };

        let opened = open_channel(&connection, options.confirm_delivery).await;
        let connection_ref = &connection;
        let channel = close_on_error(opened, move || {
            connection_ref.close(REPLY_SUCCESS, "channel setup failed")
        })
        .await?;

        let (closed_tx, closed_rx) = watch::channel(None);
        let closed_tx = Arc::new(closed_tx);
        {
            let closed_tx = closed_tx.clone();
            connection.on_error(move |err| {
                record_close(&closed_tx, CloseReason::ConnectionLost(err.to_string()));
            });
        }

        info!(host = %endpoint.display_name(), channel_id = channel.id(), "Channel opened");
        Ok(Arc::new(LapinLink {
            connection,
            channel,
            closed_tx,
            closed_rx,
            event_loop: self.event_loop.clone(),
            status_poll: self.status_poll,
        }))
    }
}

async fn open_channel(connection: &Connection, confirm_delivery: bool) -> Result<Channel> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| RabbitMQError::ChannelError(format!("Failed to create channel: {}", e)))?;

    if confirm_delivery {
        debug!("Enabling confirm mode for channel {}", channel.id());
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                RabbitMQError::ChannelError(format!("Failed to enable confirm mode: {}", e))
            })?;
    }
    Ok(channel)
}

/// Runs `close` when `result` is an error, so a half-set-up connection is not left open.
async fn close_on_error<T, C, F>(result: Result<T>, close: C) -> Result<T>
where
    C: FnOnce() -> F,
    F: Future<Output = lapin::Result<()>>,
{
    if let Err(e) = &result {
        warn!(error = %e, "Channel setup failed, closing connection");
        if let Err(close_err) = close().await {
            debug!(error = %close_err, "Connection close after failed setup also failed");
        }
    }
    result
}

fn record_close(closed_tx: &watch::Sender<Option<CloseReason>>, reason: CloseReason) {
    closed_tx.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(reason);
            true
        } else {
            false
        }
    });
}

pub struct LapinLink {
    connection: Connection,
    channel: Channel,
    closed_tx: Arc<watch::Sender<Option<CloseReason>>>,
    closed_rx: watch::Receiver<Option<CloseReason>>,
    event_loop: Arc<dyn EventLoop>,
    status_poll: Duration,
}

impl LapinLink {
    fn close_reason(&self) -> Option<CloseReason> {
        let recorded = self.closed_rx.borrow().clone();
        if recorded.is_some() {
            return recorded;
        }
        if !self.connection.status().connected() {
            record_close(
                &self.closed_tx,
                CloseReason::ConnectionLost(format!("{:?}", self.connection.status().state())),
            );
        } else if !self.channel.status().connected() {
            record_close(
                &self.closed_tx,
                CloseReason::ChannelClosed(format!("{:?}", self.channel.status().state())),
            );
        }
        self.closed_rx.borrow().clone()
    }
}

#[async_trait]
impl Link for LapinLink {
    fn is_open(&self) -> bool {
        self.close_reason().is_none()
    }

    async fn closed(&self) -> CloseReason {
        let mut closed_rx = self.closed_rx.clone();
        loop {
            if let Some(reason) = self.close_reason() {
                return reason;
            }
            tokio::select! {
                _ = closed_rx.changed() => {}
                _ = self.event_loop.sleep(self.status_poll) => {}
            }
        }
    }

    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        if exchange.is_default() {
            return Ok(());
        }
        debug!(exchange = %exchange.name, kind = ?exchange.kind, "Declaring exchange");
        self.channel
            .exchange_declare(
                &exchange.name,
                exchange.kind.into(),
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RabbitMQError::ChannelError(format!("Failed to declare exchange {}: {}", exchange.name, e))
            })
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        debug!(queue = %queue.name, durable = queue.durable, "Declaring queue");
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    ..QueueDeclareOptions::default()
                },
                queue.arguments.clone(),
            )
            .await
            .map(|_| ())
            .map_err(|e| {
                RabbitMQError::ChannelError(format!("Failed to declare queue {}: {}", queue.name, e))
            })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        debug!(queue, exchange, routing_key, "Binding queue");
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to bind queue {}: {}", queue, e)))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream> {
        if prefetch > 0 {
            self.channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| RabbitMQError::ChannelError(format!("Failed to set QoS: {}", e)))?;
        }

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(RabbitMQError::from))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| RabbitMQError::ConsumeError(format!("Failed to cancel {}: {}", consumer_tag, e)))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn publish(&self, request: &PublishRequest) -> Result<ConfirmFuture> {
        let mut properties =
            BasicProperties::default().with_delivery_mode(if request.persistent { 2 } else { 1 });
        if let Some(headers) = &request.headers {
            properties = properties.with_headers(headers.clone());
        }
        if let Some(content_type) = &request.content_type {
            properties = properties.with_content_type(content_type.as_str().into());
        }

        let confirm = self
            .channel
            .basic_publish(
                &request.exchange,
                &request.routing_key,
                BasicPublishOptions {
                    mandatory: request.mandatory,
                    immediate: request.immediate,
                },
                &request.body,
                properties,
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        Ok(async move {
            confirm
                .await
                .map(ConfirmStatus::from)
                .map_err(|e| RabbitMQError::ConfirmLost(e.to_string()))
        }
        .boxed())
    }

    async fn close(&self, reason: &str) -> Result<()> {
        record_close(&self.closed_tx, CloseReason::Requested(reason.to_string()));

        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(REPLY_SUCCESS, reason).await {
                debug!(error = %e, "Channel close failed");
            }
        }
        if self.connection.status().connected() {
            info!("Closing RabbitMQ connection gracefully");
            if let Err(e) = self.connection.close(REPLY_SUCCESS, reason).await {
                warn!(error = %e, "Connection close failed");
                return Err(e.into());
            }
        }
        Ok(())
    }
}
