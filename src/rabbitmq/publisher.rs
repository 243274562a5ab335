use async_trait::async_trait;
use futures::FutureExt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, info_span, warn, Instrument, Span};

use super::confirm::{Confirmation, ConfirmTracker};
use super::connection::{ChannelListener, ConnectionSupervisor};
use super::errors::{RabbitMQError, Result};
use super::event_loop::EventLoop;
use super::transport::{CloseReason, ExchangeSpec, ExchangeType, Link, PublishRequest, QueueSpec};

#[async_trait]
pub trait Publish: Send + Sync {
    /// Sends one message. The returned [`Confirmation`] resolves with the broker's answer.
    async fn publish(&self, request: PublishRequest) -> Result<Confirmation>;

    /// Sends and waits until the broker has confirmed.
    async fn publish_confirmed(&self, request: PublishRequest) -> Result<()> {
        self.publish(request).await?.wait().await
    }
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub confirm_delivery: bool,
    /// Declared on every channel open.
    pub exchanges: Vec<ExchangeSpec>,
    pub queue: Option<QueueSpec>,
    pub mandatory: bool,
    pub immediate: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            confirm_delivery: true,
            exchanges: Vec::new(),
            queue: None,
            mandatory: false,
            immediate: false,
        }
    }
}

impl PublisherConfig {
    /// Publishes straight to a durable queue through the default exchange;
    /// unroutable messages count as failures.
    pub fn for_queue(name: &str) -> Self {
        Self {
            queue: Some(QueueSpec::durable(name)),
            mandatory: true,
            ..Self::default()
        }
    }

    pub fn with_exchange(mut self, exchange: ExchangeSpec) -> Self {
        self.exchanges.push(exchange);
        self
    }

    pub fn with_confirm_delivery(mut self, confirm_delivery: bool) -> Self {
        self.confirm_delivery = confirm_delivery;
        self
    }
}

struct PublisherState {
    link: Option<Arc<dyn Link>>,
    tracker: ConfirmTracker,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Publisher {
    config: PublisherConfig,
    event_loop: Arc<dyn EventLoop>,
    state: Arc<Mutex<PublisherState>>,
    span: Span,
}

impl Publisher {
    pub fn new(config: PublisherConfig, event_loop: Arc<dyn EventLoop>) -> Self {
        Self {
            config,
            event_loop,
            state: Arc::new(Mutex::new(PublisherState {
                link: None,
                tracker: ConfirmTracker::new(),
            })),
            span: info_span!("publisher"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Registers with `supervisor` so every new channel is picked up.
    pub async fn start(self: &Arc<Self>, supervisor: &ConnectionSupervisor) -> Result<()> {
        supervisor.register(self.clone()).await
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).link.as_ref().is_some_and(|link| link.is_open())
    }

    pub fn pending_confirms(&self) -> usize {
        lock(&self.state).tracker.pending_len()
    }
}

#[async_trait]
impl Publish for Publisher {
    async fn publish(&self, request: PublishRequest) -> Result<Confirmation> {
        let mandatory = request.mandatory || self.config.mandatory;
        let immediate = request.immediate || self.config.immediate;
        let request = request.mandatory(mandatory).immediate(immediate);

        let (link, ticket) = {
            let mut state = lock(&self.state);
            let link = state.link.clone().ok_or(RabbitMQError::NotConnected)?;
            let ticket = self
                .config
                .confirm_delivery
                .then(|| state.tracker.register(&request.exchange, &request.routing_key));
            (link, ticket)
        };

        let confirm = match link.publish(&request).await {
            Ok(confirm) => confirm,
            Err(e) => {
                if let Some((ticket, _)) = ticket {
                    lock(&self.state).tracker.forget(ticket);
                }
                warn!(
                    parent: &self.span,
                    exchange = %request.exchange,
                    routing_key = %request.routing_key,
                    error = %e,
                    "Publish failed"
                );
                return Err(e);
            }
        };

        debug!(
            parent: &self.span,
            exchange = %request.exchange,
            routing_key = %request.routing_key,
            bytes = request.body.len(),
            "Published message"
        );

        match ticket {
            Some((ticket, receiver)) => {
                let state = self.state.clone();
                let watcher = async move {
                    let status = confirm.await;
                    lock(&state).tracker.resolve(ticket, status);
                }
                .instrument(self.span.clone())
                .boxed();
                // the watcher outlives its handle; a replaced connection makes it a no-op
                let _ = self.event_loop.spawn(watcher);
                Ok(Confirmation::pending(ticket, receiver))
            }
            None => Ok(Confirmation::not_requested()),
        }
    }
}

#[async_trait]
impl ChannelListener for Publisher {
    async fn on_channel_open(&self, link: Arc<dyn Link>) -> Result<()> {
        for exchange in &self.config.exchanges {
            link.declare_exchange(exchange).await?;
        }
        if let Some(queue) = &self.config.queue {
            link.declare_queue(queue).await?;
        }

        lock(&self.state).link = Some(link);
        info!(parent: &self.span, "Publisher ready");
        Ok(())
    }

    async fn on_channel_closed(&self, reason: &CloseReason) {
        let failed = {
            let mut state = lock(&self.state);
            state.link = None;
            state.tracker.reset(&reason.to_string())
        };
        info!(parent: &self.span, %reason, failed, "Publisher lost its channel");
    }
}

/// Publishes every message to its own exchange and to each fanout exchange.
pub struct FanoutPublisher {
    base: Arc<Publisher>,
    targets: Vec<ExchangeSpec>,
}

impl FanoutPublisher {
    pub fn durable(base: Arc<Publisher>, exchange: &str) -> Self {
        Self {
            base,
            targets: vec![ExchangeSpec::new(exchange, ExchangeType::Fanout, true)],
        }
    }

    pub fn transient(base: Arc<Publisher>, exchange: &str) -> Self {
        Self {
            base,
            targets: vec![ExchangeSpec::new(exchange, ExchangeType::Fanout, false)],
        }
    }

    /// Adds another fanout exchange.
    pub fn and_fanout(mut self, exchange: &str, durable: bool) -> Self {
        self.targets
            .push(ExchangeSpec::new(exchange, ExchangeType::Fanout, durable));
        self
    }

    pub fn targets(&self) -> &[ExchangeSpec] {
        &self.targets
    }

    pub fn base(&self) -> &Arc<Publisher> {
        &self.base
    }

    /// Registers in place of the wrapped publisher, which must not be registered itself.
    pub async fn start(self: &Arc<Self>, supervisor: &ConnectionSupervisor) -> Result<()> {
        supervisor.register(self.clone()).await
    }
}

#[async_trait]
impl ChannelListener for FanoutPublisher {
    async fn on_channel_open(&self, link: Arc<dyn Link>) -> Result<()> {
        for target in &self.targets {
            link.declare_exchange(target).await?;
        }
        self.base.on_channel_open(link).await
    }

    async fn on_channel_closed(&self, reason: &CloseReason) {
        self.base.on_channel_closed(reason).await;
    }
}

#[async_trait]
impl Publish for FanoutPublisher {
    /// Sends to the request's exchange, then to each fanout target.
    ///
    /// Fails with `NotConnected` before sending anything when no channel is open.
    /// A send can still fail part way; the error then says how many parts already
    /// went out, and retrying repeats those parts.
    async fn publish(&self, request: PublishRequest) -> Result<Confirmation> {
        if !self.base.is_connected() {
            return Err(RabbitMQError::NotConnected);
        }

        let total = self.targets.len() + 1;
        let mut requests = Vec::with_capacity(total);
        requests.push(request.clone());
        requests.extend(self.targets.iter().map(|target| request.to_exchange(&target.name)));

        let mut parts = Vec::with_capacity(total);
        for part in requests {
            let exchange = part.exchange.clone();
            match self.base.publish(part).await {
                Ok(confirmation) => parts.push(confirmation),
                Err(e) if parts.is_empty() => return Err(e),
                Err(e) => {
                    return Err(RabbitMQError::PublishError(format!(
                        "fanout to {} failed after {} of {} parts were sent: {}",
                        exchange,
                        parts.len(),
                        total,
                        e
                    )));
                }
            }
        }
        Ok(Confirmation::all(parts))
    }
}
