use std::collections::VecDeque;

use crate::memory::MemChunk;

/// The chunk is handed back so the caller can decide what to do with the
/// audio that didn't fit.
#[derive(Debug, thiserror::Error)]
#[error("queue is full")]
pub struct QueueFull(pub MemChunk);

/// A byte-bounded FIFO of PCM chunks. Backs ghost streams during a
/// sink-input move.
#[derive(Debug)]
pub struct MemQueue {
    chunks: VecDeque<MemChunk>,
    nbytes: usize,
    maxlength: usize,
}

impl MemQueue {
    pub fn new(maxlength: usize) -> MemQueue {
        MemQueue {
            chunks: VecDeque::new(),
            nbytes: 0,
            maxlength,
        }
    }

    pub fn unbounded() -> MemQueue {
        MemQueue::new(usize::MAX)
    }

    pub fn len_bytes(&self) -> usize {
        self.nbytes
    }

    pub fn is_empty(&self) -> bool {
        self.nbytes == 0
    }

    pub fn push(&mut self, chunk: MemChunk) -> Result<(), QueueFull> {
        if chunk.length == 0 {
            return Ok(());
        }
        if self.nbytes + chunk.length > self.maxlength {
            return Err(QueueFull(chunk));
        }
        self.nbytes += chunk.length;
        self.chunks.push_back(chunk);
        Ok(())
    }

    /// A view of the chunk at the read pointer; the queue is not advanced.
    pub fn peek(&self) -> Option<MemChunk> {
        self.chunks.front().cloned()
    }

    pub fn drop_bytes(&mut self, mut length: usize) {
        length = length.min(self.nbytes);
        self.nbytes -= length;

        while length > 0 {
            let front = match self.chunks.front_mut() {
                Some(front) => front,
                None => return,
            };

            if front.length > length {
                front.advance(length);
                return;
            }

            length -= front.length;
            self.chunks.pop_front();
        }
    }

    /// Appends everything queued in `other`, ignoring this queue's byte
    /// bound. Used to carry over a stream's already-rendered tail.
    pub fn splice(&mut self, other: &mut MemQueue) {
        self.nbytes += other.nbytes;
        other.nbytes = 0;
        self.chunks.append(&mut other.chunks);
    }
}
