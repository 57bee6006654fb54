use resound_core::memory::MemChunk;
use resound_core::queue::MemQueue;
use resound_core::time::MicroSeconds;
use resound_core::volume::CVolume;

use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventKind};
use crate::sink::{GhostInfo, SinkMessage, ThreadInput};
use crate::{Core, SinkId, SinkInputId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("stream has no data")]
    NoData,
}

/// The IO-side contract a client stream implements to feed a sink. All
/// methods run on the sink's IO thread.
pub trait Stream: Send {
    /// Returns up to `length` bytes of rendered PCM plus the gain to mix it
    /// at. An error means "nothing right now, skip me this cycle".
    fn peek(&mut self, length: usize) -> Result<(MemChunk, CVolume), StreamError>;

    /// Advances the read pointer past data the sink has consumed.
    fn drop_bytes(&mut self, length: usize);

    fn process_rewind(&mut self, length: usize) {
        let _ = length;
    }

    fn update_max_rewind(&mut self, length: usize) {
        let _ = length;
    }

    fn attach(&mut self) {}

    fn detach(&mut self) {}

    /// Surrenders PCM the stream has rendered but the sink hasn't consumed;
    /// harvested when the stream migrates to another sink.
    fn take_queued(&mut self) -> MemQueue {
        MemQueue::unbounded()
    }
}

/// A stream that replays a prerecorded queue at unity gain. Ghost inputs
/// use this to drain in-flight audio after the real stream has moved away.
#[derive(Debug)]
pub struct QueueStream {
    queue: MemQueue,
    channels: u8,
}

impl QueueStream {
    pub fn new(queue: MemQueue, channels: u8) -> QueueStream {
        QueueStream { queue, channels }
    }

    pub fn len_bytes(&self) -> usize {
        self.queue.len_bytes()
    }
}

impl Stream for QueueStream {
    fn peek(&mut self, length: usize) -> Result<(MemChunk, CVolume), StreamError> {
        let mut chunk = self.queue.peek().ok_or(StreamError::NoData)?;
        chunk.truncate(length);
        Ok((chunk, CVolume::norm(self.channels)))
    }

    fn drop_bytes(&mut self, length: usize) {
        self.queue.drop_bytes(length);
    }
}

pub(crate) struct SinkInput {
    pub(crate) sink: SinkId,
    pub(crate) corked: bool,
    pub(crate) sync_prev: Option<SinkInputId>,
    pub(crate) sync_next: Option<SinkInputId>,
    pub(crate) requested_sink_latency: Option<MicroSeconds>,
    pub(crate) on_suspend: Option<Box<dyn FnMut(bool) + Send>>,
    pub(crate) on_kill: Option<Box<dyn FnMut() + Send>>,
}

pub struct InputBuilder {
    pub stream: Box<dyn Stream>,
    pub corked: bool,
    pub requested_sink_latency: Option<MicroSeconds>,
    /// Joins the sync group of an input already attached to the same sink.
    pub sync_with: Option<SinkInputId>,
    pub on_suspend: Option<Box<dyn FnMut(bool) + Send>>,
    pub on_kill: Option<Box<dyn FnMut() + Send>>,
}

impl InputBuilder {
    pub fn new(stream: impl Stream + 'static) -> InputBuilder {
        InputBuilder {
            stream: Box::new(stream),
            corked: false,
            requested_sink_latency: None,
            sync_with: None,
            on_suspend: None,
            on_kill: None,
        }
    }
}

impl Core {
    pub fn add_sink_input(&mut self, sink_id: SinkId, builder: InputBuilder) -> Result<SinkInputId> {
        {
            let sink = self.sinks.get(sink_id).ok_or(Error::InvalidId)?;
            if !sink.state.is_linked() {
                return Err(Error::InvalidState);
            }
        }

        let InputBuilder {
            stream,
            corked,
            requested_sink_latency,
            sync_with,
            on_suspend,
            on_kill,
        } = builder;

        let mut sync_prev = None;
        if let Some(anchor) = sync_with {
            let anchor_input = self.sink_inputs.get(anchor).ok_or(Error::InvalidId)?;
            if anchor_input.sink != sink_id {
                return Err(Error::Synchronized);
            }
            let mut tail = anchor;
            while let Some(next) = self.sink_inputs[tail].sync_next {
                tail = next;
            }
            sync_prev = Some(tail);
        }

        let id = self.sink_inputs.insert(SinkInput {
            sink: sink_id,
            corked,
            sync_prev,
            sync_next: None,
            requested_sink_latency,
            on_suspend,
            on_kill,
        });
        if let Some(prev) = sync_prev {
            self.sink_inputs[prev].sync_next = Some(id);
        }

        self.sinks[sink_id].inputs.push(id);
        if corked {
            self.sinks[sink_id].n_corked += 1;
        }

        let input = ThreadInput::new(stream, requested_sink_latency, sync_prev, None);
        let (tx, rx) = oneshot::channel();
        let msg = SinkMessage::AddInput {
            id,
            input,
            reply: tx,
        };
        if let Err(err) = self.sink_send_sync(sink_id, rx, msg) {
            self.sinks[sink_id].inputs.retain(|&i| i != id);
            if corked {
                self.sinks[sink_id].n_corked -= 1;
            }
            if let Some(prev) = sync_prev {
                self.sink_inputs[prev].sync_next = None;
            }
            self.sink_inputs.remove(id);
            return Err(err);
        }

        self.events.notify(CoreEvent::SinkInput {
            kind: EventKind::New,
            id,
        });
        self.update_sink_status(sink_id)?;

        Ok(id)
    }

    pub fn remove_sink_input(&mut self, id: SinkInputId) -> Result<()> {
        let (sink_id, corked, prev, next) = {
            let input = self.sink_inputs.get(id).ok_or(Error::InvalidId)?;
            (input.sink, input.corked, input.sync_prev, input.sync_next)
        };

        // The stream leaves its sync group on both sides before the removal
        // itself lands on the IO thread.
        if prev.is_some() || next.is_some() {
            if let Some(prev) = prev {
                self.sink_inputs[prev].sync_next = next;
            }
            if let Some(next) = next {
                self.sink_inputs[next].sync_prev = prev;
            }
            {
                let input = &mut self.sink_inputs[id];
                input.sync_prev = None;
                input.sync_next = None;
            }
            self.sink_post(sink_id, SinkMessage::ClearInputSync { id })?;
        }

        let (tx, rx) = oneshot::channel();
        let stream = self.sink_send_sync(sink_id, rx, SinkMessage::RemoveInput { id, reply: tx })??;
        drop(stream);

        self.sinks[sink_id].inputs.retain(|&i| i != id);
        if corked {
            self.sinks[sink_id].n_corked -= 1;
        }
        self.sink_inputs.remove(id);

        self.events.notify(CoreEvent::SinkInput {
            kind: EventKind::Remove,
            id,
        });
        self.update_sink_status(sink_id)?;

        Ok(())
    }

    /// Terminates a stream from the server side, notifying its owner.
    pub fn kill_sink_input(&mut self, id: SinkInputId) -> Result<()> {
        let input = self.sink_inputs.get_mut(id).ok_or(Error::InvalidId)?;
        if let Some(mut on_kill) = input.on_kill.take() {
            on_kill();
        }
        self.remove_sink_input(id)
    }

    /// Pauses or resumes a stream without detaching it; only the RUNNING /
    /// IDLE accounting lives here, muting the actual data is the stream's
    /// business.
    pub fn cork_sink_input(&mut self, id: SinkInputId, corked: bool) -> Result<()> {
        let input = self.sink_inputs.get_mut(id).ok_or(Error::InvalidId)?;
        if input.corked == corked {
            return Ok(());
        }
        input.corked = corked;
        let sink_id = input.sink;

        if corked {
            self.sinks[sink_id].n_corked += 1;
        } else {
            self.sinks[sink_id].n_corked -= 1;
        }

        self.events.notify(CoreEvent::SinkInput {
            kind: EventKind::Change,
            id,
        });
        self.update_sink_status(sink_id)
    }

    /// Migrates a stream to another sink, leaving a ghost input behind that
    /// drains up to `buffer_bytes` of already-rendered audio on the origin.
    pub fn move_sink_input(
        &mut self,
        id: SinkInputId,
        dest: SinkId,
        buffer_bytes: usize,
    ) -> Result<()> {
        let (origin, corked, requested_sink_latency) = {
            let input = self.sink_inputs.get(id).ok_or(Error::InvalidId)?;
            if input.sync_prev.is_some() || input.sync_next.is_some() {
                return Err(Error::Synchronized);
            }
            (input.sink, input.corked, input.requested_sink_latency)
        };

        {
            let dest_sink = self.sinks.get(dest).ok_or(Error::InvalidId)?;
            if !dest_sink.state.is_linked() {
                return Err(Error::InvalidState);
            }
            if dest_sink.sample_spec != self.sinks[origin].sample_spec {
                return Err(Error::SpecMismatch);
            }
        }

        let mut ghost_id = None;
        let ghost = if buffer_bytes > 0 {
            let gid = self.sink_inputs.insert(SinkInput {
                sink: origin,
                corked: false,
                sync_prev: None,
                sync_next: None,
                requested_sink_latency: None,
                on_suspend: None,
                on_kill: None,
            });
            self.sinks[origin].inputs.push(gid);
            ghost_id = Some(gid);
            Some(GhostInfo {
                id: gid,
                buffer: MemQueue::new(buffer_bytes),
                buffer_bytes,
            })
        } else {
            None
        };

        let (tx, rx) = oneshot::channel();
        let msg = SinkMessage::RemoveInputAndBuffer {
            id,
            ghost,
            reply: tx,
        };
        let stream = match self.sink_send_sync(origin, rx, msg) {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) | Err(err) => {
                if let Some(gid) = ghost_id {
                    self.sinks[origin].inputs.retain(|&i| i != gid);
                    self.sink_inputs.remove(gid);
                }
                return Err(err);
            }
        };

        self.sinks[origin].inputs.retain(|&i| i != id);
        if corked {
            self.sinks[origin].n_corked -= 1;
        }

        self.sink_inputs[id].sink = dest;
        self.sinks[dest].inputs.push(id);
        if corked {
            self.sinks[dest].n_corked += 1;
        }

        let input = ThreadInput::new(stream, requested_sink_latency, None, None);
        let (tx, rx) = oneshot::channel();
        self.sink_send_sync(
            dest,
            rx,
            SinkMessage::AddInput {
                id,
                input,
                reply: tx,
            },
        )?;

        self.update_sink_status(origin)?;
        self.update_sink_status(dest)?;

        self.events.notify(CoreEvent::SinkInput {
            kind: EventKind::Change,
            id,
        });

        Ok(())
    }

    pub fn sink_input_sink(&self, id: SinkInputId) -> Result<SinkId> {
        Ok(self.sink_inputs.get(id).ok_or(Error::InvalidId)?.sink)
    }

    pub fn sink_input_is_corked(&self, id: SinkInputId) -> Result<bool> {
        Ok(self.sink_inputs.get(id).ok_or(Error::InvalidId)?.corked)
    }
}
