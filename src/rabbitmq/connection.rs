use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use super::backoff::{BackoffPolicy, BackoffState};
use super::endpoint::EndpointSelector;
use super::errors::{RabbitMQError, Result};
use super::event_loop::EventLoop;
use super::transport::{ChannelOptions, CloseReason, Connector, Link};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Receives the supervisor's channel lifecycle events.
///
/// The link handed to `on_channel_open` is valid until the matching
/// `on_channel_closed`; implementations must drop it there and never carry it
/// across a reconnect.
#[async_trait]
pub trait ChannelListener: Send + Sync {
    /// Sets up whatever this component needs on a freshly opened channel.
    /// An error aborts this connection and schedules a reconnect.
    async fn on_channel_open(&self, link: Arc<dyn Link>) -> Result<()>;

    async fn on_channel_closed(&self, reason: &CloseReason);
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub channel: ChannelOptions,
    /// Consecutive failed attempts after which `run` gives up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            channel: ChannelOptions::default(),
            max_attempts: None,
        }
    }
}

/// Cloneable view of a supervisor: observe its state or ask it to stop.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    state_rx: watch::Receiver<ConnectionState>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl SupervisorHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Completes once the supervisor reaches `state`.
    pub async fn wait_for(&self, state: ConnectionState) {
        let mut state_rx = self.state_rx.clone();
        while *state_rx.borrow_and_update() != state {
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Requests a graceful shutdown. Idempotent; suppresses every later reconnect.
    pub fn stop(&self) {
        let first = self.stop_tx.send_if_modified(|stopping| {
            if *stopping {
                false
            } else {
                *stopping = true;
                true
            }
        });
        if first {
            info!("Stop requested, no further reconnects");
        } else {
            debug!("Stop already requested");
        }
    }
}

/// Owns the one connection/channel of a consumer or publisher and keeps it alive.
pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    event_loop: Arc<dyn EventLoop>,
    config: SupervisorConfig,
    policy: BackoffPolicy,
    backoff: Mutex<BackoffState>,
    selector: Mutex<EndpointSelector>,
    listeners: Mutex<Vec<Arc<dyn ChannelListener>>>,
    link: Mutex<Option<Arc<dyn Link>>>,
    state_tx: watch::Sender<ConnectionState>,
    stop_tx: Arc<watch::Sender<bool>>,
    span: Span,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Completes once a stop has been requested.
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    while !*stop_rx.borrow_and_update() {
        if stop_rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

impl ConnectionSupervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        selector: EndpointSelector,
        policy: BackoffPolicy,
        event_loop: Arc<dyn EventLoop>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (stop_tx, _) = watch::channel(false);

        Self {
            connector,
            event_loop,
            config: SupervisorConfig::default(),
            policy,
            backoff: Mutex::new(BackoffState::default()),
            selector: Mutex::new(selector),
            listeners: Mutex::new(Vec::new()),
            link: Mutex::new(None),
            state_tx,
            stop_tx: Arc::new(stop_tx),
            span: info_span!("supervisor"),
        }
    }

    pub fn with_config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    /// Span every supervisor log line is recorded under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            state_rx: self.state_tx.subscribe(),
            stop_tx: self.stop_tx.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn backoff_state(&self) -> BackoffState {
        *lock(&self.backoff)
    }

    /// The open link, if any. Valid only until the next closure.
    pub fn current_link(&self) -> Option<Arc<dyn Link>> {
        lock(&self.link).clone()
    }

    pub fn stop(&self) {
        let _entered = self.span.enter();
        self.handle().stop();
    }

    /// Adds a listener. If a channel is already open the listener is activated on it now.
    pub async fn register(&self, listener: Arc<dyn ChannelListener>) -> Result<()> {
        let current = {
            let mut listeners = lock(&self.listeners);
            listeners.push(listener.clone());
            self.current_link()
        };

        match current {
            Some(link) => listener.on_channel_open(link).instrument(self.span.clone()).await,
            None => Ok(()),
        }
    }

    /// Connects and keeps reconnecting until stopped.
    ///
    /// Returns `Ok(())` once a requested stop has completed, or
    /// `RetriesExhausted` when the configured attempt ceiling is reached.
    pub async fn run(&self) -> Result<()> {
        self.run_loop().instrument(self.span.clone()).await
    }

    async fn run_loop(&self) -> Result<()> {
        let mut stop_rx = self.stop_tx.subscribe();

        loop {
            if *stop_rx.borrow() {
                break;
            }

            let endpoint = lock(&self.selector).begin_attempt();
            let attempt = lock(&self.backoff).attempt_count + 1;
            self.set_state(ConnectionState::Connecting);
            info!(
                attempt,
                host = %endpoint.display_name(),
                backup = endpoint.is_backup,
                "Connecting"
            );

            let connected = tokio::select! {
                result = self.connector.connect(&endpoint, &self.config.channel) => Some(result),
                _ = stop_requested(&mut stop_rx) => None,
            };

            let failure = match connected {
                None => break,
                Some(Ok(link)) => match self.activate(link.clone()).await {
                    Ok(()) => {
                        let reason = self.hold(&link, &mut stop_rx).await;
                        self.deactivate(&reason).await;
                        if *stop_rx.borrow() {
                            info!(%reason, "Connection closed after stop");
                            break;
                        }
                        warn!(%reason, "Connection closed, reconnect necessary");
                        None
                    }
                    Err(e) => {
                        error!(error = %e, "Channel setup failed, closing connection");
                        if let Err(close_err) = link.close("channel setup failed").await {
                            debug!(error = %close_err, "Close after failed setup also failed");
                        }
                        self.deactivate(&CloseReason::Requested(e.to_string())).await;
                        Some(e)
                    }
                },
                Some(Err(e)) => {
                    error!(attempt, host = %endpoint.display_name(), error = %e, "Connection attempt failed");
                    self.set_state(ConnectionState::Disconnected);
                    Some(e)
                }
            };

            // a dropped healthy connection was reset to attempt 0: minimal delay
            let (delay, failures) = {
                let mut backoff = lock(&self.backoff);
                let delay = self.policy.next_delay(&backoff);
                if failure.is_some() {
                    backoff.record_failure();
                }
                (delay, backoff.attempt_count)
            };

            if let Some(e) = failure {
                lock(&self.selector).record_failure();
                if !e.is_transient() {
                    warn!(
                        error = %e,
                        failures,
                        "Configuration or credential error, retrying until the attempt ceiling"
                    );
                }
                if let Some(max_attempts) = self.config.max_attempts {
                    if failures >= max_attempts {
                        error!(failures, max_attempts, "Max reconnection attempts reached. Giving up.");
                        return Err(RabbitMQError::RetriesExhausted { attempts: failures });
                    }
                }
            }

            info!(delay_ms = delay.as_millis() as u64, "Waiting before next reconnect attempt");

            tokio::select! {
                _ = self.event_loop.sleep(delay) => {}
                _ = stop_requested(&mut stop_rx) => {
                    info!("Stop requested during backoff, not reconnecting");
                    break;
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Supervisor stopped");
        Ok(())
    }

    /// Publishes the link to every listener; resets backoff once all accepted it.
    async fn activate(&self, link: Arc<dyn Link>) -> Result<()> {
        let listeners = {
            let listeners = lock(&self.listeners);
            *lock(&self.link) = Some(link.clone());
            listeners.clone()
        };
        self.set_state(ConnectionState::Connected);
        info!("Connection opened");

        for listener in listeners {
            listener.on_channel_open(link.clone()).await?;
        }

        self.policy.reset(&mut lock(&self.backoff));
        lock(&self.selector).mark_success();
        Ok(())
    }

    /// Waits for the link to close, closing it ourselves on a stop request.
    async fn hold(&self, link: &Arc<dyn Link>, stop_rx: &mut watch::Receiver<bool>) -> CloseReason {
        tokio::select! {
            reason = link.closed() => reason,
            _ = stop_requested(stop_rx) => {
                self.set_state(ConnectionState::Closing);
                info!("Closing connection");
                if let Err(e) = link.close("client shutdown").await {
                    warn!(error = %e, "Error while closing connection");
                }
                link.closed().await
            }
        }
    }

    async fn deactivate(&self, reason: &CloseReason) {
        lock(&self.link).take();
        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            listener.on_channel_closed(reason).await;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Connection state changed");
        }
    }
}
