//! Reorganization events and the sinks that receive them.

use std::sync::{Arc, Mutex};

use forkline_common::{messages::ChainReorganizedMessage, Block, Position};
use tokio::sync::mpsc;

/// One change of the canonical chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorganizationEvent {
    /// Last position shared by the old and new chains
    pub fork_point: Position,

    /// Newly canonical blocks, root to tip
    pub arrivals: Vec<Block>,

    /// Displaced blocks, oldest first; empty for a plain extension
    pub replaced: Vec<Block>,
}

impl ReorganizationEvent {
    pub fn is_extension(&self) -> bool {
        self.replaced.is_empty()
    }

    /// Position of the new tip.
    pub fn tip(&self) -> Position {
        self.fork_point + self.arrivals.len() as Position
    }
}

impl From<ReorganizationEvent> for ChainReorganizedMessage {
    fn from(event: ReorganizationEvent) -> Self {
        Self {
            fork_point: event.fork_point,
            arrivals: event.arrivals,
            replaced: event.replaced,
        }
    }
}

/// Receiver of reorganization events.
///
/// Called synchronously from the organizer, once per completed
/// reorganization, in the order they occur.
pub trait ReorganizationSink {
    fn reorganized(&self, event: &ReorganizationEvent);

    /// The organizer has stopped; no further events will follow.
    fn stopped(&self) {}
}

/// Shared event queue between the sink and whoever publishes the events.
pub type EventQueue = Arc<Mutex<Vec<ReorganizationEvent>>>;

/// Sink that queues events for later async publishing.
pub struct QueueSink {
    events: EventQueue,
}

impl QueueSink {
    pub fn new(events: EventQueue) -> Self {
        Self { events }
    }
}

impl ReorganizationSink for QueueSink {
    fn reorganized(&self, event: &ReorganizationEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Sink that forwards events over a tokio channel. The channel closes
/// when the organizer stops.
pub struct ChannelSink {
    sender: Mutex<Option<mpsc::UnboundedSender<ReorganizationEvent>>>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ReorganizationEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Mutex::new(Some(sender)),
            },
            receiver,
        )
    }
}

impl ReorganizationSink for ChannelSink {
    fn reorganized(&self, event: &ReorganizationEvent) {
        if let Some(sender) = self.sender.lock().unwrap().as_ref() {
            // A dropped receiver just means nobody is listening
            let _ = sender.send(event.clone());
        }
    }

    fn stopped(&self) {
        self.sender.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(fork_point: Position) -> ReorganizationEvent {
        ReorganizationEvent {
            fork_point,
            arrivals: vec![Block::genesis(1, 0x207fffff), Block::genesis(2, 0x207fffff)],
            replaced: vec![],
        }
    }

    #[test]
    fn tip_counts_arrivals_above_fork() {
        let event = event(4);
        assert_eq!(event.tip(), 6);
        assert!(event.is_extension());
    }

    #[test]
    fn queue_sink_keeps_order() {
        let events: EventQueue = Arc::new(Mutex::new(Vec::new()));
        let sink = QueueSink::new(events.clone());
        sink.reorganized(&event(1));
        sink.reorganized(&event(2));
        sink.stopped();

        let queued: Vec<Position> = events.lock().unwrap().iter().map(|e| e.fork_point).collect();
        assert_eq!(queued, vec![1, 2]);
    }

    #[test]
    fn channel_sink_closes_on_stop() {
        let (sink, mut receiver) = ChannelSink::channel();
        sink.reorganized(&event(3));
        sink.stopped();
        sink.reorganized(&event(4));

        assert_eq!(receiver.try_recv().unwrap().fork_point, 3);
        assert!(matches!(
            receiver.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn message_carries_event_fields() {
        let message = ChainReorganizedMessage::from(event(7));
        assert_eq!(message.fork_point, 7);
        assert_eq!(message.arrivals.len(), 2);
        assert!(message.replaced.is_empty());
    }
}
