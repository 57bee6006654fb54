//! A minimal driver: a null sink that pulls mixed audio on its own IO
//! thread and throws it away, paced by wall-clock time.

use std::sync::Arc;
use std::time::Duration;

use resound_core::memory::MemChunk;
use resound_core::sample::{SampleFormat, SampleSpec};
use resound_core::volume::CVolume;
use resound_engine::{
    message_queue, Core, InputBuilder, RtPoll, SinkBuilder, SinkFlags, Stream, StreamError,
};

struct SawtoothStream {
    phase: i16,
}

impl Stream for SawtoothStream {
    fn peek(&mut self, length: usize) -> Result<(MemChunk, CVolume), StreamError> {
        let length = length.min(4096);
        let mut data = Vec::with_capacity(length);
        for _ in 0..length / 4 {
            self.phase = self.phase.wrapping_add(64);
            data.extend_from_slice(&self.phase.to_ne_bytes());
            data.extend_from_slice(&self.phase.to_ne_bytes());
        }
        Ok((
            MemChunk::new(resound_core::memory::Memblock::from_bytes(data)),
            CVolume::norm(2),
        ))
    }

    fn drop_bytes(&mut self, _length: usize) {}
}

fn main() {
    let mut core = Core::new();

    let mut builder = SinkBuilder::new("null");
    builder.driver = Some("null-driver".into());
    builder.sample_spec = Some(SampleSpec::new(SampleFormat::S16, 44_100, 2));
    let id = core
        .create_sink(builder, SinkFlags::default())
        .expect("sink construction");

    let (tx, rx) = message_queue();
    core.set_sink_msgq(id, tx).unwrap();
    core.set_sink_rtpoll(id, Arc::new(RtPoll::new(|| {}))).unwrap();

    let mut worker = core.take_sink_worker(id).unwrap();
    let io = std::thread::spawn(move || {
        // A real driver would block on its poll object; the null driver
        // just paces itself and drains both audio and messages.
        for _ in 0..50 {
            while let Some(msg) = rx.try_recv() {
                worker.process_msg(msg);
            }
            if worker.state().is_opened() {
                let chunk = worker.render(0);
                drop(chunk);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        while let Some(msg) = rx.try_recv() {
            worker.process_msg(msg);
        }
    });

    core.put_sink(id).unwrap();
    core.add_sink_input(id, InputBuilder::new(SawtoothStream { phase: 0 }))
        .unwrap();

    std::thread::sleep(Duration::from_millis(200));

    core.unlink_sink(id).unwrap();
    io.join().unwrap();
}
