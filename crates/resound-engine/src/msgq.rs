use async_channel::{Receiver, Sender};

use crate::error::{Error, Result};
use crate::sink::SinkMessage;

/// Creates the asynchronous control→IO queue of a sink. The driver hands
/// the sender to the sink and serves the receiver on its IO thread.
pub fn message_queue() -> (MsgSender, MsgReceiver) {
    let (tx, rx) = async_channel::unbounded();
    (MsgSender { tx }, MsgReceiver { rx })
}

#[derive(Debug, Clone)]
pub struct MsgSender {
    tx: Sender<SinkMessage>,
}

impl MsgSender {
    /// Fire-and-forget post; ownership of the payload moves to the IO
    /// thread.
    pub(crate) fn post(&self, msg: SinkMessage) -> Result<()> {
        self.tx.try_send(msg).map_err(|_| Error::Disconnected)
    }
}

#[derive(Debug)]
pub struct MsgReceiver {
    rx: Receiver<SinkMessage>,
}

impl MsgReceiver {
    /// Blocks until the next message or queue shutdown.
    pub fn recv_blocking(&self) -> Result<SinkMessage> {
        self.rx.recv_blocking().map_err(|_| Error::Disconnected)
    }

    pub fn try_recv(&self) -> Option<SinkMessage> {
        self.rx.try_recv().ok()
    }
}
