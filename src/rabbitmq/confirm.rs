//! Publisher-confirm bookkeeping.
//!
//! Ticket numbers are client-local: they count this tracker's publishes per connection
//! generation, starting at 1, and are not the broker's confirm delivery tags (other
//! publishers on the same channel, such as quarantine copies, take tags too). When a
//! connection is replaced every entry still pending is failed and the generation
//! advances, so a late confirmation from the stale connection can never resolve a
//! publish made on the new one.

use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::errors::{RabbitMQError, Result};
use super::transport::ConfirmStatus;

/// Identifies one pending publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfirmTicket {
    pub generation: u64,
    pub sequence: u64,
}

#[derive(Debug)]
struct PendingConfirm {
    exchange: String,
    routing_key: String,
    responder: oneshot::Sender<Result<()>>,
}

#[derive(Debug, Default)]
pub struct ConfirmTracker {
    generation: u64,
    next_sequence: u64,
    pending: HashMap<u64, PendingConfirm>,
}

impl ConfirmTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, ticket: ConfirmTicket) -> bool {
        ticket.generation == self.generation && self.pending.contains_key(&ticket.sequence)
    }

    /// Registers a publish about to be sent and returns where its outcome will arrive.
    pub fn register(
        &mut self,
        exchange: &str,
        routing_key: &str,
    ) -> (ConfirmTicket, oneshot::Receiver<Result<()>>) {
        self.next_sequence += 1;
        let sequence = self.next_sequence;
        let (responder, receiver) = oneshot::channel();

        let previous = self.pending.insert(
            sequence,
            PendingConfirm {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                responder,
            },
        );
        debug_assert!(previous.is_none(), "sequence {sequence} registered twice");

        (
            ConfirmTicket {
                generation: self.generation,
                sequence,
            },
            receiver,
        )
    }

    /// Drops an entry whose publish never reached the channel.
    pub fn forget(&mut self, ticket: ConfirmTicket) {
        if ticket.generation == self.generation {
            self.pending.remove(&ticket.sequence);
        }
    }

    /// Applies the broker's answer. Returns `false` when the ticket is unknown
    /// (already resolved or belonging to a replaced connection).
    pub fn resolve(&mut self, ticket: ConfirmTicket, status: Result<ConfirmStatus>) -> bool {
        if ticket.generation != self.generation {
            debug!(
                sequence = ticket.sequence,
                generation = ticket.generation,
                "Ignoring confirmation from a replaced connection"
            );
            return false;
        }
        let Some(pending) = self.pending.remove(&ticket.sequence) else {
            return false;
        };

        let outcome = match status {
            Ok(ConfirmStatus::Acked) => Ok(()),
            Ok(ConfirmStatus::NotRequested) => {
                warn!(
                    sequence = ticket.sequence,
                    exchange = %pending.exchange,
                    "Tracked publish went out on a channel without confirm mode"
                );
                Err(RabbitMQError::ConfirmRejected(format!(
                    "no broker acknowledgement for {}/{}: channel is not in confirm mode",
                    pending.exchange, pending.routing_key
                )))
            }
            Ok(status) => {
                warn!(
                    sequence = ticket.sequence,
                    exchange = %pending.exchange,
                    routing_key = %pending.routing_key,
                    ?status,
                    "Broker did not accept publish"
                );
                Err(RabbitMQError::ConfirmRejected(format!(
                    "{:?} for {}/{}",
                    status, pending.exchange, pending.routing_key
                )))
            }
            Err(e) => Err(e),
        };
        let _ = pending.responder.send(outcome);
        true
    }

    /// Fails every pending publish and starts a new generation.
    pub fn reset(&mut self, reason: &str) -> usize {
        let failed = self.pending.len();
        for (sequence, pending) in self.pending.drain() {
            debug!(sequence, exchange = %pending.exchange, "Publish confirmation lost");
            let _ = pending
                .responder
                .send(Err(RabbitMQError::ConfirmLost(reason.to_string())));
        }
        if failed > 0 {
            warn!(failed, reason, "Failed publishes still awaiting confirmation");
        }
        self.generation += 1;
        self.next_sequence = 0;
        failed
    }
}

/// Outcome of a publish call. Resolves once the broker has answered for every
/// message the call sent.
#[derive(Debug, Default)]
#[must_use = "a publish is only known to be delivered once its confirmation succeeds"]
pub struct Confirmation {
    tickets: Vec<u64>,
    waiting: Vec<oneshot::Receiver<Result<()>>>,
}

impl Confirmation {
    /// A publish made without confirm mode: nothing to wait for.
    pub fn not_requested() -> Self {
        Self::default()
    }

    pub fn pending(ticket: ConfirmTicket, receiver: oneshot::Receiver<Result<()>>) -> Self {
        Self {
            tickets: vec![ticket.sequence],
            waiting: vec![receiver],
        }
    }

    /// Combines the confirmations of several publishes into one.
    pub fn all(parts: Vec<Confirmation>) -> Self {
        parts.into_iter().fold(Self::default(), |mut acc, part| {
            acc.tickets.extend(part.tickets);
            acc.waiting.extend(part.waiting);
            acc
        })
    }

    /// Client-local ticket numbers of the publishes this confirmation covers.
    pub fn tickets(&self) -> &[u64] {
        &self.tickets
    }

    pub fn is_tracked(&self) -> bool {
        !self.waiting.is_empty()
    }

    /// Waits for every broker confirmation; fails on the first negative or lost one.
    pub async fn wait(self) -> Result<()> {
        for receiver in self.waiting {
            receiver.await.map_err(|_| {
                RabbitMQError::ConfirmLost("confirmation tracker dropped".to_string())
            })??;
        }
        Ok(())
    }
}
