use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use resound_core::memory::{MemChunk, Memblock};
use resound_core::queue::MemQueue;
use resound_core::sample::{SampleFormat, SampleSpec};
use resound_core::time::MicroSeconds;
use resound_core::volume::{CVolume, Volume};
use slotmap::SlotMap;

use crate::error::Error;
use crate::events::{CoreEvent, EventKind};
use crate::hook::HookResult;
use crate::input::{InputBuilder, Stream, StreamError};
use crate::msgq::message_queue;
use crate::namereg::NameRegFail;
use crate::rtpoll::RtPoll;
use crate::sink::{
    GhostInfo, SinkBuilder, SinkCallbacks, SinkFlags, SinkMessage, SinkState, SinkWorker,
    ThreadInput, WorkerCallbacks, MAX_MIX_STREAMS,
};
use crate::source::{SourceMessage, SourceOutput, SourceState};
use crate::{Core, SinkId, SinkInputId};

fn spec() -> SampleSpec {
    SampleSpec::new(SampleFormat::S16, 44_100, 2)
}

fn s16_block(sample: i16, bytes: usize) -> Memblock {
    let data = (0..bytes / 2).flat_map(|_| sample.to_ne_bytes()).collect();
    Memblock::from_bytes(data)
}

fn s16_samples(chunk: &MemChunk) -> Vec<i16> {
    chunk
        .as_slice()
        .chunks_exact(2)
        .map(|b| i16::from_ne_bytes([b[0], b[1]]))
        .collect()
}

/// A stream over one fixed block; lets tests check zero-copy passthrough.
struct SliceStream {
    chunk: MemChunk,
    volume: CVolume,
    dropped: Arc<AtomicUsize>,
    attached: Arc<AtomicBool>,
}

impl SliceStream {
    fn new(sample: i16, bytes: usize, volume: CVolume) -> SliceStream {
        SliceStream {
            chunk: MemChunk::new(s16_block(sample, bytes)),
            volume,
            dropped: Arc::new(AtomicUsize::new(0)),
            attached: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Stream for SliceStream {
    fn peek(&mut self, length: usize) -> Result<(MemChunk, CVolume), StreamError> {
        if self.chunk.length == 0 {
            return Err(StreamError::NoData);
        }
        let mut chunk = self.chunk.clone();
        chunk.truncate(length);
        Ok((chunk, self.volume.clone()))
    }

    fn drop_bytes(&mut self, length: usize) {
        let length = length.min(self.chunk.length);
        self.chunk.advance(length);
        self.dropped.fetch_add(length, Ordering::SeqCst);
    }

    fn attach(&mut self) {
        self.attached.store(true, Ordering::SeqCst);
    }

    fn detach(&mut self) {
        self.attached.store(false, Ordering::SeqCst);
    }
}

/// An endless constant-sample stream with instrumented callbacks.
struct PatternStream {
    sample: i16,
    volume: CVolume,
    dropped: Arc<AtomicUsize>,
    rewound: Arc<AtomicUsize>,
    peeks: Arc<AtomicUsize>,
    max_rewind: Arc<AtomicUsize>,
}

impl PatternStream {
    fn new(sample: i16) -> PatternStream {
        PatternStream {
            sample,
            volume: CVolume::norm(2),
            dropped: Arc::new(AtomicUsize::new(0)),
            rewound: Arc::new(AtomicUsize::new(0)),
            peeks: Arc::new(AtomicUsize::new(0)),
            max_rewind: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Stream for PatternStream {
    fn peek(&mut self, length: usize) -> Result<(MemChunk, CVolume), StreamError> {
        self.peeks.fetch_add(1, Ordering::SeqCst);
        let length = length.min(4096);
        Ok((
            MemChunk::new(s16_block(self.sample, length)),
            self.volume.clone(),
        ))
    }

    fn drop_bytes(&mut self, length: usize) {
        self.dropped.fetch_add(length, Ordering::SeqCst);
    }

    fn process_rewind(&mut self, length: usize) {
        self.rewound.fetch_add(length, Ordering::SeqCst);
    }

    fn update_max_rewind(&mut self, length: usize) {
        self.max_rewind.store(length, Ordering::SeqCst);
    }
}

/// A stream holding a finite amount of data plus a render-side tail, for
/// move-with-buffering tests.
struct FiniteStream {
    queue: MemQueue,
    tail: MemQueue,
    volume: CVolume,
}

impl Stream for FiniteStream {
    fn peek(&mut self, length: usize) -> Result<(MemChunk, CVolume), StreamError> {
        let mut chunk = self.queue.peek().ok_or(StreamError::NoData)?;
        chunk.truncate(length);
        Ok((chunk, self.volume.clone()))
    }

    fn drop_bytes(&mut self, length: usize) {
        self.queue.drop_bytes(length);
    }

    fn take_queued(&mut self) -> MemQueue {
        std::mem::replace(&mut self.tail, MemQueue::unbounded())
    }
}

#[derive(Default)]
struct Collector {
    bytes: Arc<Mutex<Vec<u8>>>,
    rewound: Arc<AtomicUsize>,
}

impl SourceOutput for Collector {
    fn push(&mut self, chunk: &MemChunk) {
        self.bytes.lock().unwrap().extend_from_slice(chunk.as_slice());
    }

    fn process_rewind(&mut self, length: usize) {
        self.rewound.fetch_add(length, Ordering::SeqCst);
    }
}

fn new_worker(name: &str) -> (Core, SinkId, SinkWorker) {
    let mut core = Core::new();
    let mut builder = SinkBuilder::new(name);
    builder.sample_spec = Some(spec());
    let id = core.create_sink(builder, SinkFlags::default()).unwrap();
    let worker = core.take_sink_worker(id).unwrap();
    (core, id, worker)
}

fn set_state(worker: &mut SinkWorker, state: SinkState) {
    let (tx, rx) = oneshot::channel();
    worker.process_msg(SinkMessage::SetState { state, reply: tx });
    rx.recv().unwrap();
}

fn input_ids() -> SlotMap<SinkInputId, ()> {
    SlotMap::with_key()
}

fn add_input(
    worker: &mut SinkWorker,
    ids: &mut SlotMap<SinkInputId, ()>,
    stream: impl Stream + 'static,
) -> SinkInputId {
    let id = ids.insert(());
    let (tx, rx) = oneshot::channel();
    worker.process_msg(SinkMessage::AddInput {
        id,
        input: ThreadInput::new(Box::new(stream), None, None, None),
        reply: tx,
    });
    rx.recv().unwrap();
    id
}

// Scenario A: an empty running sink renders silence of the requested
// length.
#[test]
fn empty_sink_renders_silence() {
    let (_core, _id, mut worker) = new_worker("empty");
    set_state(&mut worker, SinkState::Running);

    let out = worker.render(2048);
    assert_eq!(out.length, 2048);
    assert!(out.block.is_silence());
    assert!(out.as_slice().iter().all(|&b| b == 0));
}

#[test]
fn render_length_zero_uses_the_default_target() {
    let (_core, _id, mut worker) = new_worker("default-target");
    set_state(&mut worker, SinkState::Running);

    let out = worker.render(0);
    assert_eq!(out.length, 4096);
}

#[test]
fn render_clamps_to_the_pool_block_size() {
    let (_core, _id, mut worker) = new_worker("clamp");
    set_state(&mut worker, SinkState::Running);

    let out = worker.render(128 * 1024);
    assert_eq!(out.length, 64 * 1024);
}

#[test]
fn idle_sink_mixes_nothing() {
    let (_core, _id, mut worker) = new_worker("idle");
    set_state(&mut worker, SinkState::Idle);

    let mut ids = input_ids();
    let stream = PatternStream::new(1000);
    let dropped = stream.dropped.clone();
    add_input(&mut worker, &mut ids, stream);

    let out = worker.render(1024);
    assert!(out.block.is_silence());
    assert_eq!(dropped.load(Ordering::SeqCst), 0);
}

// Scenario B: a single unity-gain stream passes through by reference and
// is advanced by exactly the rendered length.
#[test]
fn single_input_passthrough_is_zero_copy() {
    let (_core, _id, mut worker) = new_worker("passthrough");
    set_state(&mut worker, SinkState::Running);

    let mut ids = input_ids();
    let stream = SliceStream::new(1234, 8192, CVolume::norm(2));
    let source_block = stream.chunk.block.clone();
    let dropped = stream.dropped.clone();
    add_input(&mut worker, &mut ids, stream);

    let out = worker.render(4096);
    assert_eq!(out.length, 4096);
    assert!(out.block.ptr_eq(&source_block));
    assert_eq!(dropped.load(Ordering::SeqCst), 4096);
}

#[test]
fn single_input_with_volume_copies_and_scales() {
    let (_core, _id, mut worker) = new_worker("scaled");
    set_state(&mut worker, SinkState::Running);

    let mut ids = input_ids();
    let stream = SliceStream::new(10_000, 4096, CVolume::uniform(2, Volume::from_linear(0.5)));
    let source_block = stream.chunk.block.clone();
    add_input(&mut worker, &mut ids, stream);

    let out = worker.render(1024);
    assert!(!out.block.ptr_eq(&source_block));
    assert!(s16_samples(&out).iter().all(|&s| s == 5_000));
}

#[test]
fn muted_sink_renders_silence_without_touching_the_source() {
    let (_core, _id, mut worker) = new_worker("muted");
    set_state(&mut worker, SinkState::Running);

    worker.process_msg(SinkMessage::SetMute { muted: true });

    let mut ids = input_ids();
    let stream = SliceStream::new(1234, 4096, CVolume::norm(2));
    let source_block = stream.chunk.block.clone();
    add_input(&mut worker, &mut ids, stream);

    let out = worker.render(1024);
    assert!(!out.block.ptr_eq(&source_block));
    assert!(out.as_slice().iter().all(|&b| b == 0));
    assert_eq!(source_block.as_slice()[0..2], 1234i16.to_ne_bytes());
}

// Scenario C: two half-scale streams mixed at soft volume 0.5.
#[test]
fn two_input_mix_applies_the_soft_volume() {
    let (_core, _id, mut worker) = new_worker("mix");
    set_state(&mut worker, SinkState::Running);

    worker.process_msg(SinkMessage::SetVolume {
        volume: CVolume::uniform(2, Volume::from_linear(0.5)),
    });

    let mut ids = input_ids();
    add_input(&mut worker, &mut ids, PatternStream::new(16_384));
    add_input(&mut worker, &mut ids, PatternStream::new(16_384));

    let out = worker.render(1024);
    assert_eq!(out.length, 1024);
    assert!(s16_samples(&out).iter().all(|&s| s == 16_384));
}

// Invariant: a posted volume takes effect exactly at its point in the
// queue, never blending into earlier renders.
#[test]
fn soft_volume_switches_between_renders() {
    let (_core, _id, mut worker) = new_worker("volume-switch");
    set_state(&mut worker, SinkState::Running);

    let mut ids = input_ids();
    add_input(&mut worker, &mut ids, PatternStream::new(8_000));

    let before = worker.render(1024);
    assert!(s16_samples(&before).iter().all(|&s| s == 8_000));

    worker.process_msg(SinkMessage::SetVolume {
        volume: CVolume::uniform(2, Volume::from_linear(0.5)),
    });

    let after = worker.render(1024);
    assert!(s16_samples(&after).iter().all(|&s| s == 4_000));
}

#[test]
fn mix_is_capped_at_32_streams() {
    let (_core, _id, mut worker) = new_worker("cap");
    set_state(&mut worker, SinkState::Running);

    let mut ids = input_ids();
    let mut counters = Vec::new();
    for _ in 0..40 {
        let stream = PatternStream::new(10);
        counters.push(stream.dropped.clone());
        add_input(&mut worker, &mut ids, stream);
    }

    worker.render(1024);

    let advanced = counters
        .iter()
        .filter(|dropped| dropped.load(Ordering::SeqCst) > 0)
        .count();
    assert_eq!(advanced, MAX_MIX_STREAMS);
    // The excess streams stay attached for the next cycle.
    assert_eq!(worker.attached_inputs().len(), 40);
}

#[test]
fn render_narrows_to_the_shortest_stream() {
    let (_core, _id, mut worker) = new_worker("narrow");
    set_state(&mut worker, SinkState::Running);

    let mut ids = input_ids();
    let short = SliceStream::new(100, 512, CVolume::norm(2));
    let long = SliceStream::new(200, 8192, CVolume::norm(2));
    let short_dropped = short.dropped.clone();
    let long_dropped = long.dropped.clone();
    add_input(&mut worker, &mut ids, short);
    add_input(&mut worker, &mut ids, long);

    let out = worker.render(4096);
    assert_eq!(out.length, 512);
    assert_eq!(short_dropped.load(Ordering::SeqCst), 512);
    assert_eq!(long_dropped.load(Ordering::SeqCst), 512);
}

#[test]
fn render_into_full_fills_the_whole_target() {
    let (_core, _id, mut worker) = new_worker("into-full");
    set_state(&mut worker, SinkState::Running);

    let mut ids = input_ids();
    // The stream peeks at most 4096 bytes at a time, so a 10000-byte
    // target takes several passes.
    let stream = PatternStream::new(77);
    let dropped = stream.dropped.clone();
    add_input(&mut worker, &mut ids, stream);

    let mut target = MemChunk::new(Memblock::from_bytes(vec![0u8; 10_000]));
    worker.render_into_full(&mut target);

    assert_eq!(target.length, 10_000);
    assert_eq!(target.index, 0);
    assert!(s16_samples(&target).iter().all(|&s| s == 77));
    assert_eq!(dropped.load(Ordering::SeqCst), 10_000);
}

#[test]
fn render_full_returns_exactly_the_requested_bytes() {
    let (_core, _id, mut worker) = new_worker("full");
    set_state(&mut worker, SinkState::Running);

    let mut ids = input_ids();
    add_input(&mut worker, &mut ids, PatternStream::new(42));

    let out = worker.render_full(10_000);
    assert_eq!(out.length, 10_000);
    assert!(s16_samples(&out).iter().all(|&s| s == 42));
}

#[test]
fn skip_without_monitor_consumers_bypasses_the_mixer() {
    let (_core, _id, mut worker) = new_worker("skip");
    set_state(&mut worker, SinkState::Running);

    let mut ids = input_ids();
    let stream = PatternStream::new(1);
    let dropped = stream.dropped.clone();
    let peeks = stream.peeks.clone();
    add_input(&mut worker, &mut ids, stream);

    worker.skip(8192);
    assert_eq!(dropped.load(Ordering::SeqCst), 8192);
    assert_eq!(peeks.load(Ordering::SeqCst), 0);
}

#[test]
fn skip_with_monitor_consumers_renders_for_the_tap() {
    let (_core, _id, mut worker) = new_worker("skip-monitor");
    set_state(&mut worker, SinkState::Running);

    let collector = Collector::default();
    let bytes = collector.bytes.clone();
    let mut output_ids: SlotMap<crate::SourceOutputId, ()> = SlotMap::with_key();
    let (tx, rx) = oneshot::channel();
    worker.process_msg(SinkMessage::Monitor(SourceMessage::AddOutput {
        id: output_ids.insert(()),
        output: Box::new(collector),
        reply: tx,
    }));
    rx.recv().unwrap();
    let (tx, rx) = oneshot::channel();
    worker.process_msg(SinkMessage::Monitor(SourceMessage::SetState {
        state: SourceState::Running,
        reply: tx,
    }));
    rx.recv().unwrap();

    let mut ids = input_ids();
    let stream = PatternStream::new(3);
    let dropped = stream.dropped.clone();
    add_input(&mut worker, &mut ids, stream);

    worker.skip(8192);
    assert_eq!(dropped.load(Ordering::SeqCst), 8192);
    assert_eq!(bytes.lock().unwrap().len(), 8192);
}

#[test]
fn monitor_receives_rendered_chunks() {
    let (_core, _id, mut worker) = new_worker("monitor");
    set_state(&mut worker, SinkState::Running);

    let collector = Collector::default();
    let bytes = collector.bytes.clone();
    let mut output_ids: SlotMap<crate::SourceOutputId, ()> = SlotMap::with_key();
    let (tx, rx) = oneshot::channel();
    worker.process_msg(SinkMessage::Monitor(SourceMessage::AddOutput {
        id: output_ids.insert(()),
        output: Box::new(collector),
        reply: tx,
    }));
    rx.recv().unwrap();
    let (tx, rx) = oneshot::channel();
    worker.process_msg(SinkMessage::Monitor(SourceMessage::SetState {
        state: SourceState::Running,
        reply: tx,
    }));
    rx.recv().unwrap();

    let mut ids = input_ids();
    add_input(&mut worker, &mut ids, PatternStream::new(9));

    let out = worker.render(1024);
    assert_eq!(bytes.lock().unwrap().as_slice(), out.as_slice());
}

#[test]
fn rewind_requests_grow_monotonically_and_clamp() {
    let (_core, _id, mut worker) = new_worker("rewind");
    set_state(&mut worker, SinkState::Running);

    let requests = Arc::new(AtomicUsize::new(0));
    let seen = requests.clone();
    worker.set_callbacks(WorkerCallbacks {
        request_rewind: Some(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })),
        ..WorkerCallbacks::default()
    });

    worker.set_max_rewind(8192);

    worker.request_rewind(1000);
    assert_eq!(worker.rewind_nbytes(), 1000);

    // Requests only ever grow within a cycle.
    worker.request_rewind(500);
    assert_eq!(worker.rewind_nbytes(), 1000);

    worker.request_rewind(100_000);
    assert_eq!(worker.rewind_nbytes(), 8192);

    // 0 is the "as far as possible" sentinel.
    worker.process_rewind(worker.rewind_nbytes());
    worker.render(1024);
    assert_eq!(worker.rewind_nbytes(), 0);
    worker.request_rewind(0);
    assert_eq!(worker.rewind_nbytes(), 8192);

    assert!(requests.load(Ordering::SeqCst) >= 3);
}

#[test]
fn rewind_with_zero_max_rewind_stays_latched_at_zero() {
    let (_core, _id, mut worker) = new_worker("no-rewind");
    set_state(&mut worker, SinkState::Running);

    worker.request_rewind(4096);
    assert_eq!(worker.rewind_nbytes(), 0);
}

#[test]
fn process_rewind_reaches_streams_and_monitor() {
    let (_core, _id, mut worker) = new_worker("process-rewind");
    set_state(&mut worker, SinkState::Running);

    let collector = Collector::default();
    let monitor_rewound = collector.rewound.clone();
    let mut output_ids: SlotMap<crate::SourceOutputId, ()> = SlotMap::with_key();
    let (tx, rx) = oneshot::channel();
    worker.process_msg(SinkMessage::Monitor(SourceMessage::AddOutput {
        id: output_ids.insert(()),
        output: Box::new(collector),
        reply: tx,
    }));
    rx.recv().unwrap();
    let (tx, rx) = oneshot::channel();
    worker.process_msg(SinkMessage::Monitor(SourceMessage::SetState {
        state: SourceState::Running,
        reply: tx,
    }));
    rx.recv().unwrap();

    let mut ids = input_ids();
    let stream = PatternStream::new(5);
    let rewound = stream.rewound.clone();
    add_input(&mut worker, &mut ids, stream);

    // The first rewind after attach is the stream's own remix; it sits
    // that one out.
    worker.process_rewind(512);
    assert_eq!(rewound.load(Ordering::SeqCst), 0);

    worker.process_rewind(512);
    assert_eq!(rewound.load(Ordering::SeqCst), 512);
    assert_eq!(monitor_rewound.load(Ordering::SeqCst), 1024);
}

#[test]
fn max_rewind_propagates_to_streams() {
    let (_core, _id, mut worker) = new_worker("max-rewind");
    set_state(&mut worker, SinkState::Running);

    let mut ids = input_ids();
    let stream = PatternStream::new(5);
    let max_rewind = stream.max_rewind.clone();
    add_input(&mut worker, &mut ids, stream);

    worker.set_max_rewind(16_384);
    assert_eq!(max_rewind.load(Ordering::SeqCst), 16_384);
    assert_eq!(worker.monitor().max_rewind(), 16_384);

    // Late arrivals get the current limit pushed down at attach time.
    let late = PatternStream::new(6);
    let late_max = late.max_rewind.clone();
    add_input(&mut worker, &mut ids, late);
    assert_eq!(late_max.load(Ordering::SeqCst), 16_384);
}

#[test]
fn requested_latency_is_the_clamped_minimum() {
    let (_core, _id, mut worker) = new_worker("latency");
    set_state(&mut worker, SinkState::Running);
    worker.set_latency_range(MicroSeconds::from_millis(4), MicroSeconds::from_millis(200));

    assert_eq!(worker.requested_latency(), None);

    let mut ids = input_ids();
    let id_a = ids.insert(());
    let (tx, rx) = oneshot::channel();
    worker.process_msg(SinkMessage::AddInput {
        id: id_a,
        input: ThreadInput::new(
            Box::new(PatternStream::new(1)),
            Some(MicroSeconds::from_millis(50)),
            None,
            None,
        ),
        reply: tx,
    });
    rx.recv().unwrap();

    assert_eq!(worker.requested_latency(), Some(MicroSeconds::from_millis(50)));

    // A lower request wins, clamped to the sink's bounds.
    let id_b = ids.insert(());
    let (tx, rx) = oneshot::channel();
    worker.process_msg(SinkMessage::AddInput {
        id: id_b,
        input: ThreadInput::new(
            Box::new(PatternStream::new(2)),
            Some(MicroSeconds::from_millis(1)),
            None,
            None,
        ),
        reply: tx,
    });
    rx.recv().unwrap();

    assert_eq!(worker.requested_latency(), Some(MicroSeconds::from_millis(4)));

    // Removing the aggressive stream invalidates the cache.
    let (tx, rx) = oneshot::channel();
    worker.process_msg(SinkMessage::RemoveInput {
        id: id_b,
        reply: tx,
    });
    rx.recv().unwrap().unwrap();

    assert_eq!(worker.requested_latency(), Some(MicroSeconds::from_millis(50)));
}

// Scenario E, IO side: the departing stream's pending audio lands
// volume-applied in the ghost's queue, with the render-side tail spliced
// after it.
#[test]
fn move_buffers_into_a_ghost_input() {
    let (_core, _id, mut worker) = new_worker("move");
    set_state(&mut worker, SinkState::Running);

    let mut queue = MemQueue::unbounded();
    queue.push(MemChunk::new(s16_block(8_000, 4000))).unwrap();
    queue.push(MemChunk::new(s16_block(8_000, 4000))).unwrap();
    let mut tail = MemQueue::unbounded();
    tail.push(MemChunk::new(s16_block(1_234, 4))).unwrap();

    let stream = FiniteStream {
        queue,
        tail,
        volume: CVolume::uniform(2, Volume::from_linear(0.5)),
    };

    let mut ids = input_ids();
    let id = add_input(&mut worker, &mut ids, stream);
    let ghost_id = ids.insert(());

    let (tx, rx) = oneshot::channel();
    worker.process_msg(SinkMessage::RemoveInputAndBuffer {
        id,
        ghost: Some(GhostInfo {
            id: ghost_id,
            buffer: MemQueue::new(8000),
            buffer_bytes: 8000,
        }),
        reply: tx,
    });
    let stream = rx.recv().unwrap().unwrap();
    drop(stream);

    assert!(!worker.has_input(id));
    assert!(worker.has_input(ghost_id));

    // Drain the ghost: 8000 volume-applied bytes, then the raw tail.
    let mut drained = Vec::new();
    while drained.len() < 8004 {
        let out = worker.render(8192);
        assert!(out.length > 0);
        drained.extend_from_slice(out.as_slice());
    }

    let samples: Vec<i16> = drained
        .chunks_exact(2)
        .map(|b| i16::from_ne_bytes([b[0], b[1]]))
        .collect();
    assert!(samples[..4000].iter().all(|&s| s == 4_000));
    assert_eq!(samples[4000], 1_234);
    assert_eq!(samples[4001], 1_234);

    // Fully drained ghosts are skipped, so the sink is back to silence.
    let out = worker.render(1024);
    assert!(out.block.is_silence());
}

#[test]
fn move_without_buffer_returns_the_stream() {
    let (_core, _id, mut worker) = new_worker("move-dry");
    set_state(&mut worker, SinkState::Running);

    let mut ids = input_ids();
    let id = add_input(&mut worker, &mut ids, PatternStream::new(1));

    let (tx, rx) = oneshot::channel();
    worker.process_msg(SinkMessage::RemoveInputAndBuffer {
        id,
        ghost: None,
        reply: tx,
    });
    rx.recv().unwrap().unwrap();

    assert!(worker.attached_inputs().is_empty());
}

// ---------------------------------------------------------------------------
// Control-side tests: a full sink with its worker serving on an IO thread.

fn running_sink(name: &str) -> (Core, SinkId, JoinHandle<SinkWorker>) {
    let mut core = Core::new();
    let mut builder = SinkBuilder::new(name);
    builder.sample_spec = Some(spec());
    let id = core.create_sink(builder, SinkFlags::default()).unwrap();
    spawn_io_owned(core, id)
}

fn spawn_io_owned(mut core: Core, id: SinkId) -> (Core, SinkId, JoinHandle<SinkWorker>) {
    let (tx, rx) = message_queue();
    core.set_sink_msgq(id, tx).unwrap();
    core.set_sink_rtpoll(id, Arc::new(RtPoll::new(|| {}))).unwrap();
    let worker = core.take_sink_worker(id).unwrap();
    let handle = std::thread::spawn(move || worker.run(rx));
    core.put_sink(id).unwrap();
    (core, id, handle)
}

#[test]
fn create_validates_the_builder() {
    let mut core = Core::new();

    let builder = SinkBuilder::new("no-spec");
    assert_eq!(
        core.create_sink(builder, SinkFlags::default()),
        Err(Error::InvalidSampleSpec)
    );

    let mut builder = SinkBuilder::new("bad-map");
    builder.sample_spec = Some(spec());
    builder.channel_map = Some(resound_core::channels::ChannelMap::default_for(4));
    assert_eq!(
        core.create_sink(builder, SinkFlags::default()),
        Err(Error::ChannelMismatch)
    );

    let mut builder = SinkBuilder::new("bad-volume");
    builder.sample_spec = Some(spec());
    builder.volume = Some(CVolume::norm(6));
    assert_eq!(
        core.create_sink(builder, SinkFlags::default()),
        Err(Error::ChannelMismatch)
    );
}

#[test]
fn create_applies_defaults_and_makes_a_monitor() {
    let mut core = Core::new();
    let mut builder = SinkBuilder::new("speakers");
    builder.sample_spec = Some(spec());
    let id = core.create_sink(builder, SinkFlags::default()).unwrap();

    let sink = core.sink(id).unwrap();
    assert_eq!(sink.name(), "speakers");
    assert_eq!(sink.state(), SinkState::Init);
    assert_eq!(sink.channel_map().len(), 2);
    assert!(sink.volume().is_norm());
    assert!(!sink.is_muted());

    let monitor = core.source(sink.monitor()).unwrap();
    assert_eq!(monitor.name(), "speakers.monitor");
    assert_eq!(monitor.proplist().get(crate::DEVICE_CLASS), Some("monitor"));
    assert_eq!(
        monitor.proplist().get(crate::DEVICE_DESCRIPTION),
        Some("Monitor of speakers")
    );
    assert_eq!(monitor.monitor_of(), Some(id));
    assert_eq!(monitor.state(), SourceState::Init);
}

#[test]
fn name_collisions_follow_the_policy() {
    let mut core = Core::new();

    let mut builder = SinkBuilder::new("dup");
    builder.sample_spec = Some(spec());
    let first = core.create_sink(builder, SinkFlags::default()).unwrap();
    assert_eq!(core.sink(first).unwrap().name(), "dup");

    let mut builder = SinkBuilder::new("dup");
    builder.sample_spec = Some(spec());
    let second = core.create_sink(builder, SinkFlags::default()).unwrap();
    assert_eq!(core.sink(second).unwrap().name(), "dup.1");

    let mut builder = SinkBuilder::new("dup");
    builder.sample_spec = Some(spec());
    builder.namereg_fail = NameRegFail::Fail;
    assert!(matches!(
        core.create_sink(builder, SinkFlags::default()),
        Err(Error::NameTaken { .. })
    ));
}

#[test]
fn vetoed_construction_rolls_back_the_name() {
    let mut core = Core::new();
    core.hooks.sink_new.connect(|_| HookResult::Cancel);

    let mut builder = SinkBuilder::new("vetoed");
    builder.sample_spec = Some(spec());
    assert_eq!(
        core.create_sink(builder, SinkFlags::default()),
        Err(Error::Vetoed)
    );

    // The name must be free again.
    core.hooks.sink_new = crate::Hook::new();
    let mut builder = SinkBuilder::new("vetoed");
    builder.sample_spec = Some(spec());
    builder.namereg_fail = NameRegFail::Fail;
    assert!(core.create_sink(builder, SinkFlags::default()).is_ok());
}

#[test]
fn fixate_hook_gets_the_last_word() {
    let mut core = Core::new();
    core.hooks.sink_fixate.connect(|builder| {
        builder.muted = Some(true);
        HookResult::Continue
    });

    let mut builder = SinkBuilder::new("fixated");
    builder.sample_spec = Some(spec());
    let id = core.create_sink(builder, SinkFlags::default()).unwrap();
    assert!(core.sink(id).unwrap().is_muted());
}

#[test]
fn put_moves_to_idle_and_announces() {
    let mut core = Core::new();
    let mut builder = SinkBuilder::new("announced");
    builder.sample_spec = Some(spec());
    let id = core.create_sink(builder, SinkFlags::default()).unwrap();

    let events = core.subscribe();
    let puts = Arc::new(AtomicUsize::new(0));
    let seen = puts.clone();
    core.hooks.sink_put.connect(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        HookResult::Continue
    });

    let (core, id, handle) = spawn_io_owned(core, id);

    let sink = core.sink(id).unwrap();
    assert_eq!(sink.state(), SinkState::Idle);
    // Software volume implies a decibel-mapped curve.
    assert!(sink.flags().decibel_volume);
    assert_eq!(puts.load(Ordering::SeqCst), 1);

    let monitor = core.sink(id).unwrap().monitor();
    assert_eq!(core.source(monitor).unwrap().state(), SourceState::Idle);

    assert_eq!(
        events.try_recv(),
        Ok(CoreEvent::Source {
            kind: EventKind::New,
            id: monitor
        })
    );
    assert_eq!(
        events.try_recv(),
        Ok(CoreEvent::Sink {
            kind: EventKind::New,
            id
        })
    );

    drop(core);
    handle.join().unwrap();
}

// Scenario D: demand moves the sink between IDLE and RUNNING; corked
// streams don't count as demand.
#[test]
fn update_status_follows_demand() {
    let (mut core, id, handle) = running_sink("demand");

    let a = core
        .add_sink_input(id, InputBuilder::new(PatternStream::new(1)))
        .unwrap();
    let b = core
        .add_sink_input(id, InputBuilder::new(PatternStream::new(2)))
        .unwrap();

    assert_eq!(core.sink(id).unwrap().state(), SinkState::Running);
    assert_eq!(core.sink_used_by(id).unwrap(), 2);

    core.cork_sink_input(a, true).unwrap();
    assert_eq!(core.sink(id).unwrap().state(), SinkState::Running);
    assert_eq!(core.sink_used_by(id).unwrap(), 1);

    core.cork_sink_input(b, true).unwrap();
    assert_eq!(core.sink(id).unwrap().state(), SinkState::Idle);
    assert_eq!(core.sink_used_by(id).unwrap(), 0);
    assert_eq!(core.sink(id).unwrap().n_corked(), 2);

    core.cork_sink_input(a, false).unwrap();
    assert_eq!(core.sink(id).unwrap().state(), SinkState::Running);

    drop(core);
    handle.join().unwrap();
}

#[test]
fn suspend_round_trip_respects_demand() {
    let (mut core, id, handle) = running_sink("suspend");

    let suspended = Arc::new(AtomicUsize::new(0));
    let seen = suspended.clone();
    let mut builder = InputBuilder::new(PatternStream::new(1));
    builder.on_suspend = Some(Box::new(move |is_suspended| {
        if is_suspended {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    }));
    core.add_sink_input(id, builder).unwrap();
    assert_eq!(core.sink(id).unwrap().state(), SinkState::Running);

    core.suspend_sink(id, true).unwrap();
    assert_eq!(core.sink(id).unwrap().state(), SinkState::Suspended);
    assert_eq!(suspended.load(Ordering::SeqCst), 1);

    // update_status leaves SUSPENDED alone.
    core.update_sink_status(id).unwrap();
    assert_eq!(core.sink(id).unwrap().state(), SinkState::Suspended);

    core.suspend_sink(id, false).unwrap();
    assert_eq!(core.sink(id).unwrap().state(), SinkState::Running);

    drop(core);
    handle.join().unwrap();
}

#[test]
fn volume_round_trips_through_the_io_thread() {
    let (mut core, id, handle) = running_sink("volume");

    let half = CVolume::uniform(2, Volume::from_linear(0.5));
    core.set_sink_volume(id, &half).unwrap();
    assert_eq!(core.get_sink_volume(id).unwrap(), half);

    // With refresh enabled the value is read back from the IO side, which
    // received the async update.
    core.set_sink_refresh_volume(id, true).unwrap();
    assert_eq!(core.get_sink_volume(id).unwrap(), half);

    core.set_sink_mute(id, true).unwrap();
    core.set_sink_refresh_mute(id, true).unwrap();
    assert!(core.get_sink_mute(id).unwrap());

    drop(core);
    handle.join().unwrap();
}

#[test]
fn volume_change_events_fire_only_on_change() {
    let (mut core, id, handle) = running_sink("volume-events");
    let events = core.subscribe();

    let half = CVolume::uniform(2, Volume::from_linear(0.5));
    core.set_sink_volume(id, &half).unwrap();
    core.set_sink_volume(id, &half).unwrap();

    let mut changes = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(
            event,
            CoreEvent::Sink {
                kind: EventKind::Change,
                ..
            }
        ) {
            changes += 1;
        }
    }
    assert_eq!(changes, 1);

    drop(core);
    handle.join().unwrap();
}

#[test]
fn failing_driver_volume_hook_disables_itself() {
    let (mut core, id, handle) = running_sink("self-disable");

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    core.set_sink_callbacks(
        id,
        SinkCallbacks {
            set_volume: Some(Box::new(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(Error::DriverFailure)
            })),
            ..SinkCallbacks::default()
        },
    )
    .unwrap();

    let half = CVolume::uniform(2, Volume::from_linear(0.5));
    core.set_sink_volume(id, &half).unwrap();
    core.set_sink_volume(id, &CVolume::norm(2)).unwrap();

    // The hook failed once and was never consulted again.
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The software path still works: the IO side has the latest value.
    core.set_sink_refresh_volume(id, true).unwrap();
    assert!(core.get_sink_volume(id).unwrap().is_norm());

    drop(core);
    handle.join().unwrap();
}

#[test]
fn linkage_counts_monitor_clients_but_usage_does_not() {
    let (mut core, id, handle) = running_sink("asymmetry");

    core.add_sink_input(id, InputBuilder::new(PatternStream::new(1)))
        .unwrap();

    let monitor = core.sink(id).unwrap().monitor();
    core.add_source_output(monitor, Box::new(Collector::default()), false)
        .unwrap();

    assert_eq!(core.sink_linked_by(id).unwrap(), 2);
    assert_eq!(core.sink_used_by(id).unwrap(), 1);
    assert_eq!(core.source_linked_by(monitor).unwrap(), 1);
    assert_eq!(core.source_used_by(monitor).unwrap(), 1);
    assert_eq!(core.source(monitor).unwrap().state(), SourceState::Running);

    drop(core);
    handle.join().unwrap();
}

#[test]
fn latency_prefers_the_driver_hook() {
    let (mut core, id, handle) = running_sink("latency-cb");

    core.set_sink_callbacks(
        id,
        SinkCallbacks {
            get_latency: Some(Box::new(|_| MicroSeconds::from_millis(42))),
            ..SinkCallbacks::default()
        },
    )
    .unwrap();

    assert_eq!(
        core.get_sink_latency(id).unwrap(),
        MicroSeconds::from_millis(42)
    );

    core.suspend_sink(id, true).unwrap();
    assert_eq!(core.get_sink_latency(id).unwrap(), MicroSeconds::ZERO);

    drop(core);
    handle.join().unwrap();
}

#[test]
fn requested_latency_crosses_the_io_thread() {
    let mut core = Core::new();
    let mut builder = SinkBuilder::new("requested-latency");
    builder.sample_spec = Some(spec());
    let id = core.create_sink(builder, SinkFlags::default()).unwrap();
    core.set_sink_latency_range(
        id,
        MicroSeconds::from_millis(4),
        MicroSeconds::from_millis(200),
    )
    .unwrap();

    let (mut core, id, handle) = spawn_io_owned(core, id);

    assert_eq!(core.get_sink_requested_latency(id).unwrap(), None);

    let mut builder = InputBuilder::new(PatternStream::new(1));
    builder.requested_sink_latency = Some(MicroSeconds::from_millis(50));
    core.add_sink_input(id, builder).unwrap();

    assert_eq!(
        core.get_sink_requested_latency(id).unwrap(),
        Some(MicroSeconds::from_millis(50))
    );

    drop(core);
    handle.join().unwrap();
}

#[test]
fn detach_and_attach_reach_every_stream() {
    let (mut core, id, handle) = running_sink("detach");

    let stream = SliceStream::new(1, 4096, CVolume::norm(2));
    let attached = stream.attached.clone();
    core.add_sink_input(id, InputBuilder::new(stream)).unwrap();
    assert!(attached.load(Ordering::SeqCst));

    core.detach_sink(id).unwrap();
    assert!(!attached.load(Ordering::SeqCst));

    core.attach_sink(id).unwrap();
    assert!(attached.load(Ordering::SeqCst));

    drop(core);
    handle.join().unwrap();
}

#[test]
fn description_changes_propagate_to_the_monitor() {
    let (mut core, id, handle) = running_sink("describe");

    let proplist_changed = Arc::new(AtomicUsize::new(0));
    let seen = proplist_changed.clone();
    core.hooks.sink_proplist_changed.connect(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        HookResult::Continue
    });

    core.set_sink_description(id, Some("Fancy Speakers")).unwrap();

    let monitor = core.sink(id).unwrap().monitor();
    assert_eq!(
        core.source(monitor).unwrap().proplist().get(crate::DEVICE_DESCRIPTION),
        Some("Monitor of Fancy Speakers")
    );
    assert_eq!(proplist_changed.load(Ordering::SeqCst), 1);

    // Setting the same description again is a no-op.
    core.set_sink_description(id, Some("Fancy Speakers")).unwrap();
    assert_eq!(proplist_changed.load(Ordering::SeqCst), 1);

    drop(core);
    handle.join().unwrap();
}

#[test]
fn synchronized_streams_share_a_group_and_cannot_move() {
    let (mut core, id, handle) = running_sink("sync-group");
    let mut builder = SinkBuilder::new("sync-dest");
    builder.sample_spec = Some(spec());
    let dest = core.create_sink(builder, SinkFlags::default()).unwrap();
    let (mut core, dest, dest_handle) = spawn_io_owned(core, dest);

    let a = core
        .add_sink_input(id, InputBuilder::new(PatternStream::new(1)))
        .unwrap();

    let mut synced = InputBuilder::new(PatternStream::new(2));
    synced.sync_with = Some(a);
    let b = core.add_sink_input(id, synced).unwrap();

    assert_eq!(
        core.move_sink_input(a, dest, 0),
        Err(Error::Synchronized)
    );
    assert_eq!(
        core.move_sink_input(b, dest, 0),
        Err(Error::Synchronized)
    );

    // Removing a member relinks the group; the removal itself must not
    // trip the worker's sync assertions.
    core.remove_sink_input(b).unwrap();
    core.move_sink_input(a, dest, 0).unwrap();
    assert_eq!(core.sink_input_sink(a).unwrap(), dest);

    drop(core);
    handle.join().unwrap();
    dest_handle.join().unwrap();
}

// Scenario F: unlink is observable exactly once; repeating it is a no-op.
#[test]
fn unlink_is_idempotent() {
    let (mut core, id, handle) = running_sink("unlink");
    let events = core.subscribe();

    let unlink_count = Arc::new(AtomicUsize::new(0));
    let post_count = Arc::new(AtomicUsize::new(0));
    let seen_unlink = unlink_count.clone();
    let seen_post = post_count.clone();
    core.hooks.sink_unlink.connect(move |_| {
        seen_unlink.fetch_add(1, Ordering::SeqCst);
        HookResult::Continue
    });
    core.hooks.sink_unlink_post.connect(move |_| {
        seen_post.fetch_add(1, Ordering::SeqCst);
        HookResult::Continue
    });

    let killed = Arc::new(AtomicBool::new(false));
    let seen_kill = killed.clone();
    let mut builder = InputBuilder::new(PatternStream::new(1));
    builder.on_kill = Some(Box::new(move || {
        seen_kill.store(true, Ordering::SeqCst);
    }));
    core.add_sink_input(id, builder).unwrap();

    core.unlink_sink(id).unwrap();

    assert!(killed.load(Ordering::SeqCst));
    assert_eq!(core.sink(id).unwrap().state(), SinkState::Unlinked);
    assert!(core.sink(id).unwrap().inputs().is_empty());
    assert_eq!(unlink_count.load(Ordering::SeqCst), 1);
    assert_eq!(post_count.load(Ordering::SeqCst), 1);

    let monitor = core.sink(id).unwrap().monitor();
    assert_eq!(core.source(monitor).unwrap().state(), SourceState::Unlinked);

    let mut removes = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(
            event,
            CoreEvent::Sink {
                kind: EventKind::Remove,
                ..
            }
        ) {
            removes += 1;
        }
    }
    assert_eq!(removes, 1);

    // Round two: no hooks, no events, no crash.
    core.unlink_sink(id).unwrap();
    assert_eq!(unlink_count.load(Ordering::SeqCst), 1);
    assert_eq!(post_count.load(Ordering::SeqCst), 1);
    assert!(events.try_recv().is_err());

    // The name is free again.
    let mut builder = SinkBuilder::new("unlink");
    builder.sample_spec = Some(spec());
    builder.namereg_fail = NameRegFail::Fail;
    assert!(core.create_sink(builder, SinkFlags::default()).is_ok());

    drop(core);
    let worker = handle.join().unwrap();
    assert_eq!(worker.state(), SinkState::Unlinked);
    assert!(worker.attached_inputs().is_empty());
}

#[test]
fn remove_sink_frees_the_monitor_too() {
    let (mut core, id, handle) = running_sink("free");
    let monitor = core.sink(id).unwrap().monitor();

    core.unlink_sink(id).unwrap();
    core.remove_sink(id).unwrap();

    assert_eq!(core.sink(id).err(), Some(Error::InvalidId));
    assert!(core.source(monitor).is_err());

    drop(core);
    handle.join().unwrap();
}

#[test]
fn suspend_all_covers_every_linked_sink() {
    let (mut core, first, first_handle) = running_sink("all-1");
    let mut builder = SinkBuilder::new("all-2");
    builder.sample_spec = Some(spec());
    let second = core.create_sink(builder, SinkFlags::default()).unwrap();
    let (mut core, second, second_handle) = spawn_io_owned(core, second);

    core.suspend_all(true).unwrap();
    assert_eq!(core.sink(first).unwrap().state(), SinkState::Suspended);
    assert_eq!(core.sink(second).unwrap().state(), SinkState::Suspended);

    core.suspend_all(false).unwrap();
    assert_eq!(core.sink(first).unwrap().state(), SinkState::Idle);
    assert_eq!(core.sink(second).unwrap().state(), SinkState::Idle);

    drop(core);
    first_handle.join().unwrap();
    second_handle.join().unwrap();
}

#[test]
#[should_panic(expected = "put is only legal from INIT")]
fn put_twice_fails_loudly() {
    let (mut core, id, _handle) = running_sink("double-put");
    let _ = core.put_sink(id);
}
