use async_channel::{Receiver, Sender};

use crate::{SinkId, SinkInputId, SourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    New,
    Change,
    Remove,
}

/// One entry of the server-wide subscription firehose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreEvent {
    Sink { kind: EventKind, id: SinkId },
    Source { kind: EventKind, id: SourceId },
    SinkInput { kind: EventKind, id: SinkInputId },
}

#[derive(Debug)]
pub struct Subscribers<E> {
    senders: Vec<Sender<E>>,
}

impl<E: Clone> Subscribers<E> {
    pub fn new() -> Subscribers<E> {
        Subscribers {
            senders: Vec::new(),
        }
    }

    pub fn subscribe(&mut self) -> Receiver<E> {
        let (sender, receiver) = async_channel::unbounded();
        self.senders.push(sender);
        receiver
    }

    /// Delivers to every live subscriber, pruning the ones that hung up.
    pub fn notify(&mut self, event: E) {
        self.senders
            .retain(|sender| sender.try_send(event.clone()).is_ok());
    }

    pub fn cleanup(&mut self) {
        self.senders.retain(|sender| !sender.is_closed());
    }
}

impl<E: Clone> Default for Subscribers<E> {
    fn default() -> Subscribers<E> {
        Subscribers::new()
    }
}
