use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use lapin::types::{AMQPValue, FieldTable};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use super::connection::{ChannelListener, ConnectionSupervisor, SupervisorHandle};
use super::errors::{RabbitMQError, Result};
use super::event_loop::{EventLoop, TaskHandle};
use super::transport::{
    CloseReason, Delivery, DeliveryStream, ExchangeSpec, Link, PublishRequest, QueueSpec,
};

pub const QUARANTINE_REASON_HEADER: &str = "x-quarantine-reason";
pub const QUARANTINE_SOURCE_HEADER: &str = "x-quarantine-source";
pub const QUARANTINED_AT_HEADER: &str = "x-quarantined-at";

/// What the application wants done with a message it has processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    /// Return the message to the queue for another attempt.
    Retry,
    Quarantine,
}

/// Application callback invoked once per delivery, in delivery order.
///
/// An `Err` or a panic is treated like `Outcome::Quarantine`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, body: &[u8], headers: Option<&FieldTable>) -> anyhow::Result<Outcome>;
}

pub struct FnHandler<F>(F);

/// Adapts a plain closure into a [`MessageHandler`].
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&[u8], Option<&FieldTable>) -> anyhow::Result<Outcome> + Send + Sync,
{
    FnHandler(f)
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&[u8], Option<&FieldTable>) -> anyhow::Result<Outcome> + Send + Sync,
{
    async fn handle(&self, body: &[u8], headers: Option<&FieldTable>) -> anyhow::Result<Outcome> {
        (self.0)(body, headers)
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub queue: QueueSpec,
    /// Exchange the queue is bound to. `None` consumes the queue as declared.
    pub exchange: Option<ExchangeSpec>,
    pub routing_key: String,
    pub prefetch: u16,
    pub consumer_tag_prefix: String,
    /// Header every message must carry as a string; others are quarantined unprocessed.
    pub id_header: Option<String>,
    pub quarantine: QueueSpec,
    /// How long `stop` waits for the in-flight delivery to settle.
    pub drain_timeout: Duration,
}

impl ConsumerConfig {
    pub fn new(queue: &str) -> Self {
        Self {
            queue: QueueSpec::durable(queue),
            exchange: None,
            routing_key: queue.to_string(),
            prefetch: 1,
            consumer_tag_prefix: "resilient-rabbit".to_string(),
            id_header: None,
            quarantine: QueueSpec::durable(&format!("{queue}.quarantine")),
            drain_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_exchange(mut self, exchange: ExchangeSpec, routing_key: &str) -> Self {
        self.exchange = Some(exchange);
        self.routing_key = routing_key.to_string();
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_id_header(mut self, header: &str) -> Self {
        self.id_header = Some(header.to_string());
        self
    }

    pub fn with_quarantine_queue(mut self, queue: QueueSpec) -> Self {
        self.quarantine = queue;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

/// A message moved aside instead of being processed, with why and where from.
#[derive(Debug, Clone)]
pub struct QuarantineRecord {
    pub body: Vec<u8>,
    pub headers: Option<FieldTable>,
    pub reason: String,
    pub source_queue: String,
}

impl QuarantineRecord {
    pub fn new(delivery: &Delivery, reason: &str, source_queue: &str) -> Self {
        Self {
            body: delivery.body.clone(),
            headers: delivery.headers.clone(),
            reason: reason.to_string(),
            source_queue: source_queue.to_string(),
        }
    }

    /// Original headers plus the quarantine annotations.
    pub fn annotated_headers(&self) -> FieldTable {
        let mut headers = self.headers.clone().unwrap_or_default();
        headers.insert(
            QUARANTINE_REASON_HEADER.into(),
            AMQPValue::LongString(self.reason.clone().into()),
        );
        headers.insert(
            QUARANTINE_SOURCE_HEADER.into(),
            AMQPValue::LongString(self.source_queue.clone().into()),
        );
        let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
        headers.insert(QUARANTINED_AT_HEADER.into(), AMQPValue::Timestamp(now));
        headers
    }

    /// Persistent, mandatory publish to `queue` through the default exchange.
    pub fn into_request(self, queue: &str) -> PublishRequest {
        let headers = self.annotated_headers();
        PublishRequest::new("", queue, self.body)
            .with_headers(headers)
            .mandatory(true)
            .persistent(true)
    }
}

pub fn header_value<'a>(headers: &'a FieldTable, key: &str) -> Option<&'a AMQPValue> {
    headers
        .inner()
        .iter()
        .find(|(name, _)| name.as_str() == key)
        .map(|(_, value)| value)
}

/// The string value of `key`, or why the headers fail the check.
pub fn string_header(headers: Option<&FieldTable>, key: &str) -> std::result::Result<String, String> {
    let headers = headers.ok_or_else(|| "message has no headers".to_string())?;
    match header_value(headers, key) {
        Some(AMQPValue::LongString(value)) => Ok(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        Some(AMQPValue::ShortString(value)) => Ok(value.as_str().to_string()),
        Some(other) => Err(format!("header {key} is not a string: {other:?}")),
        None => Err(format!("missing header {key}")),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Ack,
    Requeue,
    Quarantine(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Requeue,
}

struct Subscription {
    link: Arc<dyn Link>,
    consumer_tag: String,
    dispatch: TaskHandle,
}

struct ConsumerInner {
    config: ConsumerConfig,
    handler: Arc<dyn MessageHandler>,
    event_loop: Arc<dyn EventLoop>,
    subscription: Mutex<Option<Subscription>>,
    supervisor: Mutex<Option<SupervisorHandle>>,
    stopping: AtomicBool,
    span: Span,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Subscribes to a queue on every channel the supervisor opens and settles each
/// delivery exactly once.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Consumer {
    pub fn new(
        config: ConsumerConfig,
        handler: impl MessageHandler + 'static,
        event_loop: Arc<dyn EventLoop>,
    ) -> Self {
        let span = info_span!("consumer", queue = %config.queue.name);
        Self {
            inner: Arc::new(ConsumerInner {
                config,
                handler: Arc::new(handler),
                event_loop,
                subscription: Mutex::new(None),
                supervisor: Mutex::new(None),
                stopping: AtomicBool::new(false),
                span,
            }),
        }
    }

    /// Replaces the span consumer work is recorded under.
    ///
    /// Only takes effect on a consumer that has not been cloned or started yet.
    /// Once the consumer is shared every clone keeps the span it was created with,
    /// and a warning is logged instead.
    pub fn with_span(self, span: Span) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.span = span;
                Self { inner: Arc::new(inner) }
            }
            Err(inner) => {
                warn!(parent: &inner.span, "Consumer already shared, keeping its span");
                Self { inner }
            }
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.inner.config
    }

    /// Attaches to `supervisor`; the subscription is (re)established on every channel open.
    pub async fn start(&self, supervisor: &ConnectionSupervisor) -> Result<()> {
        *lock(&self.inner.supervisor) = Some(supervisor.handle());
        supervisor.register(Arc::new(self.clone())).await
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.inner.subscription).is_some()
    }

    /// Cancels the subscription, lets the in-flight delivery settle for at most
    /// `drain_timeout`, then stops the supervisor. Idempotent.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.stopping.swap(true, Ordering::SeqCst) {
            debug!(parent: &inner.span, "Consumer already stopping");
            return;
        }
        info!(parent: &inner.span, "Stopping consumer");

        let subscription = lock(&inner.subscription).take();
        if let Some(mut subscription) = subscription {
            if let Err(e) = subscription.link.cancel(&subscription.consumer_tag).await {
                warn!(parent: &inner.span, error = %e, "Failed to cancel subscription");
            }
            let drained = tokio::select! {
                _ = subscription.dispatch.join() => true,
                _ = inner.event_loop.sleep(inner.config.drain_timeout) => false,
            };
            if !drained {
                warn!(
                    parent: &inner.span,
                    timeout_ms = inner.config.drain_timeout.as_millis() as u64,
                    "In-flight delivery did not settle in time, abandoning it to redelivery"
                );
                subscription.dispatch.abort();
            }
        }

        let supervisor = lock(&inner.supervisor).clone();
        if let Some(supervisor) = supervisor {
            supervisor.stop();
        }
    }
}

#[async_trait]
impl ChannelListener for Consumer {
    async fn on_channel_open(&self, link: Arc<dyn Link>) -> Result<()> {
        let inner = &self.inner;
        if inner.stopping.load(Ordering::SeqCst) {
            debug!(parent: &inner.span, "Consumer stopping, not subscribing");
            return Ok(());
        }
        let config = &inner.config;

        if let Some(exchange) = &config.exchange {
            link.declare_exchange(exchange).await?;
        }
        link.declare_queue(&config.queue).await?;
        if let Some(exchange) = config.exchange.as_ref().filter(|exchange| !exchange.is_default()) {
            link.bind_queue(&config.queue.name, &exchange.name, &config.routing_key)
                .await?;
        }
        link.declare_queue(&config.quarantine).await?;

        let consumer_tag = format!("{}-{}", config.consumer_tag_prefix, Uuid::new_v4());
        let deliveries = link
            .consume(&config.queue.name, &consumer_tag, config.prefetch)
            .await?;

        let task = dispatch(inner.clone(), link.clone(), deliveries)
            .instrument(inner.span.clone())
            .boxed();
        let handle = inner.event_loop.spawn(task);

        let previous = lock(&inner.subscription).replace(Subscription {
            link,
            consumer_tag: consumer_tag.clone(),
            dispatch: handle,
        });
        if let Some(previous) = previous {
            previous.dispatch.abort();
        }

        info!(
            parent: &inner.span,
            consumer_tag = %consumer_tag,
            prefetch = config.prefetch,
            "Started consuming"
        );
        Ok(())
    }

    async fn on_channel_closed(&self, reason: &CloseReason) {
        let subscription = lock(&self.inner.subscription).take();
        if let Some(subscription) = subscription {
            subscription.dispatch.abort();
            info!(
                parent: &self.inner.span,
                consumer_tag = %subscription.consumer_tag,
                %reason,
                "Subscription ended with channel"
            );
        }
    }
}

/// Processes deliveries one at a time until the stream ends or the task is aborted.
async fn dispatch(inner: Arc<ConsumerInner>, link: Arc<dyn Link>, mut deliveries: DeliveryStream) {
    while let Some(next) = deliveries.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(e) => {
                error!(error = %e, "Error receiving message");
                break;
            }
        };

        if !link.is_open() {
            debug!(
                delivery_tag = delivery.delivery_tag,
                "Channel closed, leaving delivery to broker redelivery"
            );
            continue;
        }

        inner.process(&link, delivery).await;
    }

    if inner.stopping.load(Ordering::SeqCst) {
        debug!("Delivery stream finished after stop");
    } else if link.is_open() {
        warn!("Consumer cancelled by broker, closing channel to resubscribe");
        if let Err(e) = link.close("consumer cancelled").await {
            warn!(error = %e, "Failed to close channel after cancel");
        }
    }
}

impl ConsumerInner {
    async fn process(&self, link: &Arc<dyn Link>, delivery: Delivery) {
        let delivery_tag = delivery.delivery_tag;
        debug!(delivery_tag, redelivered = delivery.redelivered, "Received message");

        let verdict = match self.check_headers(&delivery) {
            Err(reason) => Verdict::Quarantine(reason),
            Ok(()) => self.invoke_handler(&delivery).await,
        };

        let settlement = match verdict {
            Verdict::Ack => Settlement::Ack,
            Verdict::Requeue => Settlement::Requeue,
            Verdict::Quarantine(reason) => self.quarantine(link, &delivery, &reason).await,
        };

        let result = match settlement {
            Settlement::Ack => link.ack(delivery_tag).await,
            Settlement::Requeue => link.nack(delivery_tag, true).await,
        };
        match result {
            Ok(()) => debug!(delivery_tag, ?settlement, "Delivery settled"),
            Err(e) => warn!(delivery_tag, ?settlement, error = %e, "Failed to settle delivery"),
        }
    }

    fn check_headers(&self, delivery: &Delivery) -> std::result::Result<(), String> {
        match &self.config.id_header {
            Some(key) => string_header(delivery.headers.as_ref(), key).map(|_| ()),
            None => Ok(()),
        }
    }

    async fn invoke_handler(&self, delivery: &Delivery) -> Verdict {
        let handled = AssertUnwindSafe(self.handler.handle(&delivery.body, delivery.headers.as_ref()))
            .catch_unwind()
            .await;

        match handled {
            Ok(Ok(Outcome::Ack)) => Verdict::Ack,
            Ok(Ok(Outcome::Retry)) => Verdict::Requeue,
            Ok(Ok(Outcome::Quarantine)) => Verdict::Quarantine("rejected by handler".to_string()),
            Ok(Err(e)) => Verdict::Quarantine(format!("handler error: {e:#}")),
            Err(panic) => Verdict::Quarantine(format!("handler panicked: {}", panic_message(panic.as_ref()))),
        }
    }

    /// Moves the message to the quarantine queue. The original is only acked once the
    /// broker has confirmed the copy; otherwise it goes back to its queue.
    async fn quarantine(&self, link: &Arc<dyn Link>, delivery: &Delivery, reason: &str) -> Settlement {
        let delivery_tag = delivery.delivery_tag;
        warn!(delivery_tag, reason, "Quarantining message");

        let request = QuarantineRecord::new(delivery, reason, &self.config.queue.name)
            .into_request(&self.config.quarantine.name);

        match publish_confirmed(link, &request).await {
            Ok(()) => Settlement::Ack,
            Err(e) => {
                error!(delivery_tag, error = %e, "Quarantine publish failed, requeueing original");
                Settlement::Requeue
            }
        }
    }
}

async fn publish_confirmed(link: &Arc<dyn Link>, request: &PublishRequest) -> Result<()> {
    let status = link.publish(request).await?.await?;
    if status.is_success() {
        Ok(())
    } else {
        Err(RabbitMQError::ConfirmRejected(format!(
            "{:?} for {}/{}",
            status, request.exchange, request.routing_key
        )))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
