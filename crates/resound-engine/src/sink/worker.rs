use resound_core::collections::HashMap;
use resound_core::memory::{MemChunk, Memblock, Mempool, PAGE_SIZE};
use resound_core::mix::{self, MixInfo};
use resound_core::queue::MemQueue;
use resound_core::sample::SampleSpec;
use resound_core::time::MicroSeconds;
use resound_core::volume::CVolume;

use super::{SinkState, DEFAULT_MIN_LATENCY};
use crate::error::{Error, Result};
use crate::input::{QueueStream, Stream};
use crate::msgq::MsgReceiver;
use crate::source::{SourceMessage, SourceWorker};
use crate::{SinkId, SinkInputId, SourceId};

/// Streams mixed per render call; anything past this stays queued on its
/// own side until a later cycle.
pub const MAX_MIX_STREAMS: usize = 32;

/// The IO-thread twin of a stream: the client's [`Stream`] plus the state
/// the sink keeps about it.
pub struct ThreadInput {
    pub(crate) stream: Box<dyn Stream>,
    pub(crate) sync_prev: Option<SinkInputId>,
    pub(crate) sync_next: Option<SinkInputId>,
    pub(crate) attached: bool,
    pub(crate) ignore_rewind: bool,
    pub(crate) since_underrun: usize,
    pub(crate) requested_sink_latency: Option<MicroSeconds>,
}

impl ThreadInput {
    pub fn new(
        stream: Box<dyn Stream>,
        requested_sink_latency: Option<MicroSeconds>,
        sync_prev: Option<SinkInputId>,
        sync_next: Option<SinkInputId>,
    ) -> ThreadInput {
        ThreadInput {
            stream,
            sync_prev,
            sync_next,
            attached: false,
            ignore_rewind: false,
            since_underrun: 0,
            requested_sink_latency,
        }
    }

    fn process_rewind(&mut self, nbytes: usize) {
        if self.ignore_rewind {
            // A freshly attached stream sits out the remix its own arrival
            // triggered.
            self.ignore_rewind = false;
            return;
        }
        self.stream.process_rewind(nbytes);
    }
}

/// Payload of [`SinkMessage::RemoveInputAndBuffer`]: where the buffered
/// audio goes and how much of it to capture.
pub struct GhostInfo {
    pub id: SinkInputId,
    pub buffer: MemQueue,
    pub buffer_bytes: usize,
}

pub enum SinkMessage {
    AddInput {
        id: SinkInputId,
        input: ThreadInput,
        reply: oneshot::Sender<()>,
    },
    RemoveInput {
        id: SinkInputId,
        reply: oneshot::Sender<Result<Box<dyn Stream>>>,
    },
    RemoveInputAndBuffer {
        id: SinkInputId,
        ghost: Option<GhostInfo>,
        reply: oneshot::Sender<Result<Box<dyn Stream>>>,
    },
    /// Posted by the control-side unlinker so a stream's sync links are
    /// gone by the time its removal lands.
    ClearInputSync {
        id: SinkInputId,
    },
    SetState {
        state: SinkState,
        reply: oneshot::Sender<()>,
    },
    SetVolume {
        volume: CVolume,
    },
    SetMute {
        muted: bool,
    },
    GetVolume {
        reply: oneshot::Sender<CVolume>,
    },
    GetMute {
        reply: oneshot::Sender<bool>,
    },
    GetLatency {
        reply: oneshot::Sender<Option<MicroSeconds>>,
    },
    GetRequestedLatency {
        reply: oneshot::Sender<Option<MicroSeconds>>,
    },
    Detach {
        reply: oneshot::Sender<()>,
    },
    Attach {
        reply: oneshot::Sender<()>,
    },
    Monitor(SourceMessage),
}

/// IO-side driver hooks, installed on the worker before its loop starts.
#[derive(Default)]
pub struct WorkerCallbacks {
    /// Serves the control side's GET_LATENCY query.
    pub get_latency: Option<Box<dyn FnMut() -> MicroSeconds + Send>>,
    /// Notified when the pending rewind grows, with the new byte count.
    pub request_rewind: Option<Box<dyn FnMut(usize) + Send>>,
    /// Notified when the requested-latency cache is invalidated.
    pub update_requested_latency: Option<Box<dyn FnMut() + Send>>,
}

#[derive(Default)]
struct MixSet {
    /// Every input offered to the mixer this cycle, in iteration order.
    visited: Vec<SinkInputId>,
    /// The subset that contributed a chunk, parallel to `infos`.
    ids: Vec<SinkInputId>,
    infos: Vec<MixInfo>,
}

/// The IO-thread half of a sink: owns `thread_info`, runs the mixer, and
/// serves the message protocol. Exactly one thread may drive it.
pub struct SinkWorker {
    sink: SinkId,
    sample_spec: SampleSpec,
    state: SinkState,
    inputs: HashMap<SinkInputId, ThreadInput>,
    soft_volume: CVolume,
    soft_muted: bool,
    rewind_nbytes: usize,
    max_rewind: usize,
    requested_latency: Option<MicroSeconds>,
    requested_latency_valid: bool,
    min_latency: MicroSeconds,
    max_latency: MicroSeconds,
    silence: MemChunk,
    mempool: Mempool,
    monitor: SourceWorker,
    callbacks: WorkerCallbacks,
}

impl SinkWorker {
    pub(crate) fn new(
        sink: SinkId,
        monitor: SourceId,
        sample_spec: SampleSpec,
        soft_volume: CVolume,
        soft_muted: bool,
        silence: MemChunk,
        mempool: Mempool,
    ) -> SinkWorker {
        SinkWorker {
            sink,
            sample_spec,
            state: SinkState::Init,
            inputs: HashMap::default(),
            soft_volume,
            soft_muted,
            rewind_nbytes: 0,
            max_rewind: 0,
            requested_latency: None,
            requested_latency_valid: false,
            min_latency: DEFAULT_MIN_LATENCY,
            max_latency: DEFAULT_MIN_LATENCY,
            silence,
            mempool,
            monitor: SourceWorker::new(monitor),
            callbacks: WorkerCallbacks::default(),
        }
    }

    pub fn id(&self) -> SinkId {
        self.sink
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    pub fn sample_spec(&self) -> SampleSpec {
        self.sample_spec
    }

    pub fn soft_volume(&self) -> &CVolume {
        &self.soft_volume
    }

    pub fn is_soft_muted(&self) -> bool {
        self.soft_muted
    }

    /// The rewind the driver still has to perform, latched until it renders
    /// or rewinds.
    pub fn rewind_nbytes(&self) -> usize {
        self.rewind_nbytes
    }

    pub fn max_rewind(&self) -> usize {
        self.max_rewind
    }

    pub fn attached_inputs(&self) -> Vec<SinkInputId> {
        self.inputs.keys().copied().collect()
    }

    pub fn has_input(&self, id: SinkInputId) -> bool {
        self.inputs.contains_key(&id)
    }

    pub fn monitor(&self) -> &SourceWorker {
        &self.monitor
    }

    pub fn monitor_mut(&mut self) -> &mut SourceWorker {
        &mut self.monitor
    }

    pub fn set_callbacks(&mut self, callbacks: WorkerCallbacks) {
        self.callbacks = callbacks;
    }

    /// Declares the device's latency bounds; drivers call this before
    /// serving the queue.
    pub fn set_latency_range(&mut self, min: MicroSeconds, max: MicroSeconds) {
        assert!(min.is_zero() || max.is_zero() || min <= max);
        self.min_latency = min;
        self.max_latency = max;
        self.requested_latency_valid = false;
    }

    /// Serves the queue until it shuts down, then hands the worker back for
    /// driver teardown.
    pub fn run(mut self, rx: MsgReceiver) -> SinkWorker {
        while let Ok(msg) = rx.recv_blocking() {
            self.process_msg(msg);
        }
        self
    }

    pub fn process_msg(&mut self, msg: SinkMessage) {
        let msg = match msg {
            SinkMessage::Monitor(msg) => {
                self.monitor.process_msg(msg);
                return;
            }
            msg => msg,
        };

        debug_assert!(self.state != SinkState::Unlinked);

        match msg {
            SinkMessage::AddInput { id, input, reply } => {
                self.add_input(id, input);
                let _ = reply.send(());
            }
            SinkMessage::RemoveInput { id, reply } => {
                let _ = reply.send(self.remove_input(id));
            }
            SinkMessage::RemoveInputAndBuffer { id, ghost, reply } => {
                let _ = reply.send(self.remove_input_and_buffer(id, ghost));
            }
            SinkMessage::ClearInputSync { id } => {
                self.clear_input_sync(id);
            }
            SinkMessage::SetState { state, reply } => {
                self.state = state;
                let _ = reply.send(());
            }
            SinkMessage::SetVolume { volume } => {
                self.soft_volume = volume;
                // Re-mix prefilled data so the new gain is audible early.
                self.request_rewind(0);
            }
            SinkMessage::SetMute { muted } => {
                self.soft_muted = muted;
                self.request_rewind(0);
            }
            SinkMessage::GetVolume { reply } => {
                let _ = reply.send(self.soft_volume.clone());
            }
            SinkMessage::GetMute { reply } => {
                let _ = reply.send(self.soft_muted);
            }
            SinkMessage::GetLatency { reply } => {
                let latency = self.callbacks.get_latency.as_mut().map(|cb| cb());
                let _ = reply.send(latency);
            }
            SinkMessage::GetRequestedLatency { reply } => {
                let _ = reply.send(self.requested_latency());
            }
            SinkMessage::Detach { reply } => {
                self.detach_all();
                let _ = reply.send(());
            }
            SinkMessage::Attach { reply } => {
                self.attach_all();
                let _ = reply.send(());
            }
            SinkMessage::Monitor(_) => unreachable!(),
        }
    }

    fn add_input(&mut self, id: SinkInputId, mut input: ThreadInput) {
        // Patch the sync-group links into their IO-side twins.
        if let Some(prev) = input.sync_prev {
            if let Some(prev_input) = self.inputs.get_mut(&prev) {
                prev_input.sync_next = Some(id);
            }
        }
        if let Some(next) = input.sync_next {
            if let Some(next_input) = self.inputs.get_mut(&next) {
                next_input.sync_prev = Some(id);
            }
        }

        input.stream.update_max_rewind(self.max_rewind);

        debug_assert!(!input.attached);
        input.attached = true;
        input.stream.attach();

        // Keep the new stream out of the remix it causes, then ask for one
        // from the current position.
        input.ignore_rewind = true;
        input.since_underrun = 0;

        self.inputs.insert(id, input);

        self.invalidate_requested_latency();
        self.request_rewind(0);
    }

    fn remove_input(&mut self, id: SinkInputId) -> Result<Box<dyn Stream>> {
        let mut input = self.inputs.remove(&id).ok_or(Error::InvalidId)?;

        input.stream.detach();
        debug_assert!(input.attached);
        input.attached = false;

        // The control-side unlinker cleared these before the removal landed.
        assert!(input.sync_prev.is_none());
        assert!(input.sync_next.is_none());

        self.invalidate_requested_latency();
        self.request_rewind(0);

        Ok(input.stream)
    }

    fn remove_input_and_buffer(
        &mut self,
        id: SinkInputId,
        ghost: Option<GhostInfo>,
    ) -> Result<Box<dyn Stream>> {
        let mut input = self.inputs.remove(&id).ok_or(Error::InvalidId)?;

        // Moving synchronized streams is not supported.
        assert!(input.sync_prev.is_none());
        assert!(input.sync_next.is_none());

        input.stream.detach();
        debug_assert!(input.attached);
        input.attached = false;
        self.invalidate_requested_latency();

        if let Some(GhostInfo {
            id: ghost_id,
            mut buffer,
            mut buffer_bytes,
        }) = ghost
        {
            assert!(buffer_bytes > 0);
            tracing::debug!("Buffering {} bytes ...", buffer_bytes);

            while buffer_bytes > 0 {
                let (mut chunk, volume) = match input.stream.peek(buffer_bytes) {
                    Ok(peeked) => peeked,
                    Err(_) => break,
                };

                let n = chunk.length.min(buffer_bytes);
                input.stream.drop_bytes(n);
                chunk.length = n;

                if !volume.is_norm() {
                    chunk.make_writable();
                    mix::apply_volume(&mut chunk, &self.sample_spec, &volume);
                }

                if buffer.push(chunk).is_err() {
                    break;
                }
                buffer_bytes -= n;
            }

            // Splice on whatever the stream had already rendered.
            let mut tail = input.stream.take_queued();
            buffer.splice(&mut tail);
            tracing::debug!("Buffered {} bytes ...", buffer.len_bytes());

            let stream = QueueStream::new(buffer, self.sample_spec.channels);
            let mut ghost_input = ThreadInput::new(Box::new(stream), None, None, None);
            ghost_input.stream.update_max_rewind(self.max_rewind);
            debug_assert!(!ghost_input.attached);
            ghost_input.attached = true;
            ghost_input.stream.attach();
            self.inputs.insert(ghost_id, ghost_input);
        }

        self.invalidate_requested_latency();
        self.request_rewind(0);

        Ok(input.stream)
    }

    fn clear_input_sync(&mut self, id: SinkInputId) {
        let Some(input) = self.inputs.get_mut(&id) else {
            return;
        };
        let prev = input.sync_prev.take();
        let next = input.sync_next.take();

        if let Some(prev) = prev {
            if let Some(prev_input) = self.inputs.get_mut(&prev) {
                prev_input.sync_next = next;
            }
        }
        if let Some(next) = next {
            if let Some(next_input) = self.inputs.get_mut(&next) {
                next_input.sync_prev = prev;
            }
        }
    }

    fn fill_mix_info(&mut self, length: &mut usize) -> MixSet {
        let mut set = MixSet::default();
        let mut mixlength = *length;

        for (&id, input) in self.inputs.iter_mut() {
            if set.infos.len() >= MAX_MIX_STREAMS {
                break;
            }
            set.visited.push(id);

            let (chunk, volume) = match input.stream.peek(*length) {
                Ok(peeked) => peeked,
                Err(_) => continue,
            };

            debug_assert!(chunk.length > 0);
            if mixlength == 0 || chunk.length < mixlength {
                mixlength = chunk.length;
            }

            if chunk.block.is_silence() {
                continue;
            }

            set.ids.push(id);
            set.infos.push(MixInfo { chunk, volume });
        }

        if mixlength > 0 {
            *length = mixlength;
        }

        set
    }

    /// Advances every stream that took part in the cycle by the rendered
    /// length.
    fn inputs_drop(&mut self, set: &MixSet, length: usize) {
        if length == 0 {
            return;
        }
        for &id in &set.visited {
            if let Some(input) = self.inputs.get_mut(&id) {
                input.since_underrun += length;
                input.stream.drop_bytes(length);
            }
        }
    }

    /// Mixes up to `length` bytes into a fresh chunk. Zero inputs yield the
    /// cached silence chunk; a single unity-gain input passes through by
    /// reference.
    pub fn render(&mut self, mut length: usize) -> MemChunk {
        assert!(self.state.is_opened());
        assert!(self.sample_spec.is_frame_aligned(length));

        self.rewind_nbytes = 0;

        if length == 0 {
            length = self.sample_spec.frame_align(PAGE_SIZE);
        }

        let block_size_max = self.mempool.block_size_max();
        if length > block_size_max {
            length = self.sample_spec.frame_align(block_size_max);
        }

        assert!(length > 0);

        let set = if self.state == SinkState::Running {
            self.fill_mix_info(&mut length)
        } else {
            MixSet::default()
        };

        let result = match set.infos.len() {
            0 => {
                let mut chunk = self.silence.clone();
                chunk.truncate(length);
                chunk
            }
            1 => {
                let info = &set.infos[0];
                let mut chunk = info.chunk.clone();
                chunk.truncate(length);

                let volume = self.soft_volume.multiply(&info.volume);
                if self.soft_muted || !volume.is_norm() {
                    chunk.make_writable();
                    if self.soft_muted || volume.is_muted() {
                        mix::silence(&mut chunk, &self.sample_spec);
                    } else {
                        mix::apply_volume(&mut chunk, &self.sample_spec, &volume);
                    }
                }
                chunk
            }
            _ => {
                let mut chunk = MemChunk::new(self.mempool.allocate(length));
                let written = mix::mix(
                    &set.infos,
                    &self.sample_spec,
                    &self.soft_volume,
                    self.soft_muted,
                    chunk.as_mut_slice(),
                );
                chunk.length = written;
                chunk
            }
        };

        if self.state == SinkState::Running {
            self.inputs_drop(&set, result.length);
        }

        if self.monitor.is_open() {
            self.monitor.post(&result);
        }

        result
    }

    /// Like [`SinkWorker::render`] but into a caller-provided chunk, which
    /// is truncated to what one mix pass produced.
    pub fn render_into(&mut self, target: &mut MemChunk) {
        assert!(self.state.is_opened());
        assert!(target.length > 0);
        assert!(self.sample_spec.is_frame_aligned(target.length));

        self.rewind_nbytes = 0;

        let mut length = target.length;
        let block_size_max = self.mempool.block_size_max();
        if length > block_size_max {
            length = self.sample_spec.frame_align(block_size_max);
        }

        let set = if self.state == SinkState::Running {
            self.fill_mix_info(&mut length)
        } else {
            MixSet::default()
        };

        match set.infos.len() {
            0 => {
                target.truncate(length);
                mix::silence(target, &self.sample_spec);
            }
            1 => {
                let info = &set.infos[0];
                target.truncate(length);

                let volume = self.soft_volume.multiply(&info.volume);
                if self.soft_muted || volume.is_muted() {
                    mix::silence(target, &self.sample_spec);
                } else {
                    let mut vchunk = info.chunk.clone();
                    vchunk.truncate(target.length);

                    if !volume.is_norm() {
                        vchunk.make_writable();
                        mix::apply_volume(&mut vchunk, &self.sample_spec, &volume);
                    }

                    target.length = vchunk.length;
                    target.as_mut_slice().copy_from_slice(vchunk.as_slice());
                }
            }
            _ => {
                let length = length.min(target.length);
                let written = {
                    let out = target.as_mut_slice();
                    mix::mix(
                        &set.infos,
                        &self.sample_spec,
                        &self.soft_volume,
                        self.soft_muted,
                        &mut out[..length],
                    )
                };
                target.length = written;
            }
        }

        if self.state == SinkState::Running {
            self.inputs_drop(&set, target.length);
        }

        if self.monitor.is_open() {
            self.monitor.post(target);
        }
    }

    /// Fills the whole target by concatenating as many mix passes as it
    /// takes.
    pub fn render_into_full(&mut self, target: &mut MemChunk) {
        assert!(self.state.is_opened());
        assert!(target.length > 0);
        assert!(self.sample_spec.is_frame_aligned(target.length));

        self.rewind_nbytes = 0;

        let length = target.length;
        let mut filled = 0;

        while filled < length {
            // The window takes sole ownership of the block so the mix lands
            // in place rather than in a copy-on-write clone.
            let block = std::mem::replace(&mut target.block, Memblock::from_bytes(Vec::new()));
            let mut window = MemChunk {
                block,
                index: target.index + filled,
                length: length - filled,
            };

            self.render_into(&mut window);

            filled += window.length;
            target.block = window.block;
        }
    }

    /// Allocates a block of exactly `length` bytes and fills it completely.
    pub fn render_full(&mut self, length: usize) -> MemChunk {
        assert!(self.state.is_opened());
        assert!(length > 0);
        assert!(self.sample_spec.is_frame_aligned(length));

        self.rewind_nbytes = 0;

        let mut chunk = MemChunk::new(self.mempool.allocate(length));
        self.render_into_full(&mut chunk);
        chunk
    }

    /// Discards `length` bytes of audio. If the monitor has consumers the
    /// data is rendered for real so the tap stays bit-correct; otherwise
    /// the mixer is bypassed entirely.
    pub fn skip(&mut self, mut length: usize) {
        assert!(self.state.is_opened());
        assert!(length > 0);
        assert!(self.sample_spec.is_frame_aligned(length));

        self.rewind_nbytes = 0;

        if self.monitor.used_by() > 0 {
            while length > 0 {
                let chunk = self.render(length);
                debug_assert!(chunk.length <= length);
                length -= chunk.length;
            }
        } else {
            // Nobody cares about the rendered data, so don't render it.
            for input in self.inputs.values_mut() {
                input.stream.drop_bytes(length);
            }
        }
    }

    /// Invoked by the driver after the hardware buffer was rewound.
    pub fn process_rewind(&mut self, nbytes: usize) {
        assert!(self.state.is_linked());

        if nbytes == 0 {
            return;
        }

        tracing::debug!("Processing rewind...");

        for input in self.inputs.values_mut() {
            input.process_rewind(nbytes);
        }

        if self.monitor.is_open() {
            self.monitor.process_rewind(nbytes);
        }
    }

    /// Grows the pending rewind request; 0 means "as far as possible". The
    /// driver observes the latched value on its next cycle.
    pub fn request_rewind(&mut self, mut nbytes: usize) {
        assert!(self.state.is_linked());

        if nbytes == 0 {
            nbytes = self.max_rewind;
        }
        nbytes = nbytes.min(self.max_rewind);

        if nbytes <= self.rewind_nbytes {
            return;
        }

        self.rewind_nbytes = nbytes;

        if let Some(request_rewind) = self.callbacks.request_rewind.as_mut() {
            request_rewind(nbytes);
        }
    }

    /// Propagates the hardware buffer depth to every stream and the
    /// monitor.
    pub fn set_max_rewind(&mut self, max_rewind: usize) {
        if max_rewind == self.max_rewind {
            return;
        }

        self.max_rewind = max_rewind;

        for input in self.inputs.values_mut() {
            input.stream.update_max_rewind(max_rewind);
        }

        self.monitor.set_max_rewind(max_rewind);
    }

    /// The minimum of the attached streams' latency requests, clamped to
    /// the sink's bounds and cached until the input set changes.
    pub fn requested_latency(&mut self) -> Option<MicroSeconds> {
        if self.requested_latency_valid {
            return self.requested_latency;
        }

        let mut result: Option<MicroSeconds> = None;
        for input in self.inputs.values() {
            if let Some(requested) = input.requested_sink_latency {
                result = Some(match result {
                    Some(current) => current.min(requested),
                    None => requested,
                });
            }
        }

        let result = result.map(|mut requested| {
            if !self.max_latency.is_zero() && requested > self.max_latency {
                requested = self.max_latency;
            }
            if !self.min_latency.is_zero() && requested < self.min_latency {
                requested = self.min_latency;
            }
            requested
        });

        self.requested_latency = result;
        self.requested_latency_valid = true;
        result
    }

    pub fn invalidate_requested_latency(&mut self) {
        if !self.requested_latency_valid {
            return;
        }

        self.requested_latency_valid = false;

        if let Some(update) = self.callbacks.update_requested_latency.as_mut() {
            update();
        }
    }

    pub fn detach_all(&mut self) {
        assert!(self.state.is_linked());
        for input in self.inputs.values_mut() {
            input.stream.detach();
        }
        self.monitor.detach_all();
    }

    pub fn attach_all(&mut self) {
        assert!(self.state.is_linked());
        for input in self.inputs.values_mut() {
            input.stream.attach();
        }
        self.monitor.attach_all();
    }
}
