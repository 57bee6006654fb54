use std::sync::Arc;

use resound_core::channels::ChannelMap;
use resound_core::collections::HashMap;
use resound_core::memory::MemChunk;
use resound_core::sample::SampleSpec;

use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventKind};
use crate::msgq::MsgSender;
use crate::namereg::Namespace;
use crate::proplist::{Proplist, DEVICE_DESCRIPTION};
use crate::rtpoll::RtPoll;
use crate::sink::SinkMessage;
use crate::{Core, SinkId, SourceId, SourceOutputId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Init,
    Idle,
    Running,
    Suspended,
    Unlinked,
}

impl SourceState {
    pub fn is_opened(self) -> bool {
        matches!(self, SourceState::Idle | SourceState::Running)
    }

    pub fn is_linked(self) -> bool {
        matches!(
            self,
            SourceState::Idle | SourceState::Running | SourceState::Suspended
        )
    }
}

/// The IO-side contract a capture client implements to tap a source.
pub trait SourceOutput: Send {
    fn push(&mut self, chunk: &MemChunk);

    fn process_rewind(&mut self, length: usize) {
        let _ = length;
    }

    fn update_max_rewind(&mut self, length: usize) {
        let _ = length;
    }

    fn attach(&mut self) {}

    fn detach(&mut self) {}
}

pub enum SourceMessage {
    SetState {
        state: SourceState,
        reply: oneshot::Sender<()>,
    },
    AddOutput {
        id: SourceOutputId,
        output: Box<dyn SourceOutput>,
        reply: oneshot::Sender<()>,
    },
    RemoveOutput {
        id: SourceOutputId,
        reply: oneshot::Sender<()>,
    },
}

/// Control-side capture endpoint. The engine only grows these as sink
/// monitors; their lifecycle is nested inside the owning sink's.
pub struct Source {
    pub(crate) name: String,
    pub(crate) driver: Option<String>,
    pub(crate) proplist: Proplist,
    pub(crate) sample_spec: SampleSpec,
    pub(crate) channel_map: ChannelMap,
    pub(crate) state: SourceState,
    pub(crate) outputs: Vec<SourceOutputId>,
    pub(crate) n_corked: usize,
    pub(crate) monitor_of: Option<SinkId>,
    pub(crate) msgq: Option<MsgSender>,
    pub(crate) rtpoll: Option<Arc<RtPoll>>,
}

impl Source {
    pub(crate) fn new(
        name: String,
        driver: Option<String>,
        proplist: Proplist,
        sample_spec: SampleSpec,
        channel_map: ChannelMap,
    ) -> Source {
        Source {
            name,
            driver,
            proplist,
            sample_spec,
            channel_map,
            state: SourceState::Init,
            outputs: Vec::new(),
            n_corked: 0,
            monitor_of: None,
            msgq: None,
            rtpoll: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> Option<&str> {
        self.driver.as_deref()
    }

    pub fn proplist(&self) -> &Proplist {
        &self.proplist
    }

    pub fn sample_spec(&self) -> SampleSpec {
        self.sample_spec
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.channel_map
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn monitor_of(&self) -> Option<SinkId> {
        self.monitor_of
    }

    pub fn outputs(&self) -> &[SourceOutputId] {
        &self.outputs
    }
}

pub(crate) struct SourceOutputEntry {
    pub(crate) source: SourceId,
    pub(crate) corked: bool,
}

impl Core {
    pub fn source(&self, id: SourceId) -> Result<&Source> {
        self.sources.get(id).ok_or(Error::InvalidId)
    }

    pub(crate) fn put_source(&mut self, id: SourceId) -> Result<()> {
        {
            let source = self.sources.get(id).ok_or(Error::InvalidId)?;
            assert_eq!(source.state, SourceState::Init);
            assert!(source.msgq.is_some());
        }
        self.source_set_state(id, SourceState::Idle)?;
        self.events.notify(CoreEvent::Source {
            kind: EventKind::New,
            id,
        });
        Ok(())
    }

    pub(crate) fn unlink_source(&mut self, id: SourceId) -> Result<()> {
        let (linked, name) = {
            let source = self.sources.get(id).ok_or(Error::InvalidId)?;
            (source.state.is_linked(), source.name.clone())
        };

        if self.sources[id].state != SourceState::Unlinked {
            self.names.unregister(Namespace::Source, &name);
        }

        while let Some(&output_id) = self.sources[id].outputs.first() {
            self.remove_source_output(output_id)?;
        }

        if linked {
            let _ = self.source_set_state(id, SourceState::Unlinked);
        }
        self.sources[id].state = SourceState::Unlinked;

        if linked {
            self.events.notify(CoreEvent::Source {
                kind: EventKind::Remove,
                id,
            });
        }

        Ok(())
    }

    fn source_set_state(&mut self, id: SourceId, state: SourceState) -> Result<()> {
        if self.sources[id].state == state {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.source_send_sync(id, rx, SourceMessage::SetState { state, reply: tx })?;
        self.sources[id].state = state;
        Ok(())
    }

    fn update_source_status(&mut self, id: SourceId) -> Result<()> {
        let source = self.sources.get(id).ok_or(Error::InvalidId)?;
        assert!(source.state.is_linked());
        if source.state == SourceState::Suspended {
            return Ok(());
        }
        let state = if self.source_used_by(id)? > 0 {
            SourceState::Running
        } else {
            SourceState::Idle
        };
        self.source_set_state(id, state)
    }

    pub fn add_source_output(
        &mut self,
        source_id: SourceId,
        output: Box<dyn SourceOutput>,
        corked: bool,
    ) -> Result<SourceOutputId> {
        {
            let source = self.sources.get(source_id).ok_or(Error::InvalidId)?;
            if !source.state.is_linked() {
                return Err(Error::InvalidState);
            }
        }

        let id = self.source_outputs.insert(SourceOutputEntry {
            source: source_id,
            corked,
        });
        self.sources[source_id].outputs.push(id);
        if corked {
            self.sources[source_id].n_corked += 1;
        }

        let (tx, rx) = oneshot::channel();
        let msg = SourceMessage::AddOutput {
            id,
            output,
            reply: tx,
        };
        if let Err(err) = self.source_send_sync(source_id, rx, msg) {
            self.sources[source_id].outputs.retain(|&o| o != id);
            if corked {
                self.sources[source_id].n_corked -= 1;
            }
            self.source_outputs.remove(id);
            return Err(err);
        }

        self.update_source_status(source_id)?;
        Ok(id)
    }

    pub fn remove_source_output(&mut self, id: SourceOutputId) -> Result<()> {
        let (source_id, corked) = {
            let entry = self.source_outputs.get(id).ok_or(Error::InvalidId)?;
            (entry.source, entry.corked)
        };

        let (tx, rx) = oneshot::channel();
        self.source_send_sync(source_id, rx, SourceMessage::RemoveOutput { id, reply: tx })?;

        self.sources[source_id].outputs.retain(|&o| o != id);
        if corked {
            self.sources[source_id].n_corked -= 1;
        }
        self.source_outputs.remove(id);

        self.update_source_status(source_id)
    }

    pub fn source_linked_by(&self, id: SourceId) -> Result<usize> {
        let source = self.sources.get(id).ok_or(Error::InvalidId)?;
        Ok(source.outputs.len())
    }

    pub fn source_used_by(&self, id: SourceId) -> Result<usize> {
        let source = self.sources.get(id).ok_or(Error::InvalidId)?;
        assert!(source.outputs.len() >= source.n_corked);
        Ok(source.outputs.len() - source.n_corked)
    }

    pub fn set_source_description(&mut self, id: SourceId, description: Option<&str>) -> Result<()> {
        let source = self.sources.get_mut(id).ok_or(Error::InvalidId)?;

        if description.is_none() && !source.proplist.contains(DEVICE_DESCRIPTION) {
            return Ok(());
        }
        if let (Some(old), Some(new)) = (source.proplist.get(DEVICE_DESCRIPTION), description) {
            if old == new {
                return Ok(());
            }
        }

        match description {
            Some(description) => source.proplist.set(DEVICE_DESCRIPTION, description),
            None => {
                source.proplist.unset(DEVICE_DESCRIPTION);
            }
        }

        if source.state.is_linked() {
            self.events.notify(CoreEvent::Source {
                kind: EventKind::Change,
                id,
            });
        }

        Ok(())
    }

    fn source_send_sync<T>(
        &self,
        id: SourceId,
        rx: oneshot::Receiver<T>,
        msg: SourceMessage,
    ) -> Result<T> {
        let source = self.sources.get(id).ok_or(Error::InvalidId)?;
        let msgq = source.msgq.as_ref().ok_or(Error::Disconnected)?;
        msgq.post(SinkMessage::Monitor(msg))?;
        if let Some(rtpoll) = &source.rtpoll {
            rtpoll.wake();
        }
        rx.recv().map_err(|_| Error::Disconnected)
    }
}

/// IO-side twin of a source, owned by the sink worker so monitor taps run
/// on the same thread that renders.
pub struct SourceWorker {
    source: SourceId,
    state: SourceState,
    outputs: HashMap<SourceOutputId, Box<dyn SourceOutput>>,
    max_rewind: usize,
}

impl SourceWorker {
    pub(crate) fn new(source: SourceId) -> SourceWorker {
        SourceWorker {
            source,
            state: SourceState::Init,
            outputs: HashMap::default(),
            max_rewind: 0,
        }
    }

    pub fn id(&self) -> SourceId {
        self.source
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state.is_opened()
    }

    /// How many capture clients are wired up, as visible from the IO
    /// thread.
    pub fn used_by(&self) -> usize {
        self.outputs.len()
    }

    pub fn max_rewind(&self) -> usize {
        self.max_rewind
    }

    /// Fans a freshly mixed chunk out to every capture client.
    pub fn post(&mut self, chunk: &MemChunk) {
        for output in self.outputs.values_mut() {
            output.push(chunk);
        }
    }

    pub fn process_rewind(&mut self, nbytes: usize) {
        for output in self.outputs.values_mut() {
            output.process_rewind(nbytes);
        }
    }

    pub fn set_max_rewind(&mut self, max_rewind: usize) {
        if max_rewind == self.max_rewind {
            return;
        }
        self.max_rewind = max_rewind;
        for output in self.outputs.values_mut() {
            output.update_max_rewind(max_rewind);
        }
    }

    pub(crate) fn attach_all(&mut self) {
        for output in self.outputs.values_mut() {
            output.attach();
        }
    }

    pub(crate) fn detach_all(&mut self) {
        for output in self.outputs.values_mut() {
            output.detach();
        }
    }

    pub fn process_msg(&mut self, msg: SourceMessage) {
        match msg {
            SourceMessage::SetState { state, reply } => {
                self.state = state;
                let _ = reply.send(());
            }
            SourceMessage::AddOutput { id, mut output, reply } => {
                output.update_max_rewind(self.max_rewind);
                output.attach();
                self.outputs.insert(id, output);
                let _ = reply.send(());
            }
            SourceMessage::RemoveOutput { id, reply } => {
                if let Some(mut output) = self.outputs.remove(&id) {
                    output.detach();
                }
                let _ = reply.send(());
            }
        }
    }
}
