mod error;
mod events;
mod hook;
mod input;
mod msgq;
mod namereg;
mod proplist;
mod rtpoll;
mod sink;
mod source;

use resound_core::memory::{Mempool, SilenceCache};
use slotmap::SlotMap;

pub use self::error::{Error, Result};
pub use self::events::{CoreEvent, EventKind, Subscribers};
pub use self::hook::{Hook, HookResult};
pub use self::input::{InputBuilder, QueueStream, Stream, StreamError};
pub use self::msgq::{message_queue, MsgReceiver, MsgSender};
pub use self::namereg::{NameRegFail, NameRegistry, Namespace};
pub use self::proplist::{Proplist, DEVICE_CLASS, DEVICE_DESCRIPTION};
pub use self::rtpoll::RtPoll;
pub use self::sink::{
    GhostInfo, Sink, SinkBuilder, SinkCallbacks, SinkFlags, SinkMessage, SinkState, SinkWorker,
    ThreadInput, WorkerCallbacks, MAX_MIX_STREAMS,
};
pub use self::source::{
    Source, SourceMessage, SourceOutput, SourceState, SourceWorker,
};

use self::input::SinkInput;
use self::source::SourceOutputEntry;

slotmap::new_key_type! {
    pub struct SinkId;

    pub struct SourceId;

    pub struct SinkInputId;

    pub struct SourceOutputId;
}

/// Opaque handle of the module that owns a device object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleIndex(pub u32);

/// Per-core hook points. The `sink_new` and `sink_fixate` chains may veto
/// and mutate construction; the rest are notifications.
#[derive(Debug, Default)]
pub struct CoreHooks {
    pub sink_new: Hook<SinkBuilder>,
    pub sink_fixate: Hook<SinkBuilder>,
    pub sink_put: Hook<SinkId>,
    pub sink_unlink: Hook<SinkId>,
    pub sink_unlink_post: Hook<SinkId>,
    pub sink_state_changed: Hook<SinkId>,
    pub sink_proplist_changed: Hook<SinkId>,
}

/// The server hub: owns every sink, source and stream record, the name
/// registry, the hook chains and the subscription firehose. Control-thread
/// only; IO threads talk to it exclusively through messages.
pub struct Core {
    pub(crate) sinks: SlotMap<SinkId, Sink>,
    pub(crate) sources: SlotMap<SourceId, Source>,
    pub(crate) sink_inputs: SlotMap<SinkInputId, SinkInput>,
    pub(crate) source_outputs: SlotMap<SourceOutputId, SourceOutputEntry>,
    pub(crate) names: NameRegistry,
    pub hooks: CoreHooks,
    pub(crate) events: Subscribers<CoreEvent>,
    pub(crate) mempool: Mempool,
    pub(crate) silence_cache: SilenceCache,
}

impl Core {
    pub fn new() -> Core {
        Core {
            sinks: SlotMap::with_key(),
            sources: SlotMap::with_key(),
            sink_inputs: SlotMap::with_key(),
            source_outputs: SlotMap::with_key(),
            names: NameRegistry::new(),
            hooks: CoreHooks::default(),
            events: Subscribers::new(),
            mempool: Mempool::new(),
            silence_cache: SilenceCache::new(),
        }
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    /// Taps the NEW / CHANGE / REMOVE event firehose.
    pub fn subscribe(&mut self) -> async_channel::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn list_sinks(&self) -> Vec<SinkId> {
        self.sinks.keys().collect()
    }

    /// Suspends or resumes every linked sink; the first failure is
    /// reported, but all sinks are attempted.
    pub fn suspend_all(&mut self, suspend: bool) -> Result<()> {
        let ids: Vec<SinkId> = self
            .sinks
            .iter()
            .filter(|(_, sink)| sink.state().is_linked())
            .map(|(id, _)| id)
            .collect();

        let mut result = Ok(());
        for id in ids {
            if let Err(err) = self.suspend_sink(id, suspend) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}

impl Default for Core {
    fn default() -> Core {
        Core::new()
    }
}
