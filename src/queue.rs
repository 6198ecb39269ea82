//! The node's main processing queue.
//!
//! Events own their buffers; the consumer drops them when done, so a queued
//! frame is freed exactly once regardless of which path consumes it.

use crate::errors::QueueError;
use crate::session::NetHandle;
use crate::timer::TimerId;
use crate::wire::Envelope;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    /// A main-queue frame, copied out of the transport buffer.
    Message { handle: NetHandle, envelope: Envelope },
    /// A timer tick whose session had already been released.
    Timeout {
        timer_id: TimerId,
        interval_ms: u32,
        occurred_at: DateTime<Utc>,
    },
}

/// Consumer-side queue the dispatcher posts to.
pub trait EventQueue: Send + Sync {
    fn post_event(&self, event: OutboundEvent) -> Result<(), QueueError>;
}

/// [`EventQueue`] backed by an unbounded tokio channel.
#[derive(Clone)]
pub struct ChannelEventQueue {
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl ChannelEventQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventQueue for ChannelEventQueue {
    fn post_event(&self, event: OutboundEvent) -> Result<(), QueueError> {
        self.tx.send(event).map_err(|_| QueueError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::OpCode;

    #[test]
    fn test_post_fails_once_consumer_is_gone() {
        let (queue, rx) = ChannelEventQueue::new();
        drop(rx);

        let event = OutboundEvent::Message {
            handle: NetHandle(1),
            envelope: Envelope::build(OpCode::Query, 0, 1, b"{}"),
        };
        assert_eq!(queue.post_event(event), Err(QueueError::Closed));
    }
}
