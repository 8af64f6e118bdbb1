//! Thread-safe, bounded FIFO of bytes with blocking pop with timeout.
//!
//! One pipe per direction per subscriber, plus the ephemeral pipes used
//! internally by the demuxers. Single-producer/single-consumer is the only
//! concurrency shape required — the session reader is the sole producer for
//! a given subscriber's `video_in`/`audio_in`, and the remux worker is the
//! sole consumer.
//!
//! Overflow policy: `push` blocks the caller while the pipe is full and
//! non-empty, draining as the consumer catches up (§5's "block the
//! producer" choice). A single push larger than the pipe's capacity is
//! still accepted once the pipe is empty, rather than wedged forever. The
//! wait is bounded by [`PUSH_STALL_TIMEOUT`]: if the consumer hasn't
//! drained enough room by then, the oldest buffered bytes are dropped to
//! make room, so a dead or stalled consumer (e.g. a disconnected HTTP
//! client downstream of `remuxed_out`) cannot wedge the producer — the
//! session reader's `fan_out_*`, in particular, holds the subscriber-set
//! mutex while pushing and must never block forever.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Default cap used when a subscriber doesn't override it (§6, `pipe_capacity`).
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

/// Upper bound on how long `push` will wait for the consumer to drain
/// before falling back to dropping the oldest buffered bytes.
pub const PUSH_STALL_TIMEOUT: Duration = Duration::from_millis(500);

/// Granularity of each `wait_for` call inside the retry loop, so the loop
/// notices a shrinking deadline promptly instead of oversleeping it.
const PUSH_RETRY_INTERVAL: Duration = Duration::from_millis(50);

pub struct PipeBuffer {
    queue: Mutex<VecDeque<u8>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl PipeBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Append `bytes`, blocking while the pipe is full and a reader is
    /// still expected to drain it. Never reorders bytes; only drops the
    /// oldest buffered bytes, and only once [`PUSH_STALL_TIMEOUT`] has
    /// elapsed with no consumer progress.
    pub fn push(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut queue = self.queue.lock();
        let deadline = Instant::now() + PUSH_STALL_TIMEOUT;
        while !queue.is_empty() && queue.len() + bytes.len() > self.capacity {
            let now = Instant::now();
            if now >= deadline {
                let overflow = queue.len() + bytes.len() - self.capacity;
                for _ in 0..overflow.min(queue.len()) {
                    queue.pop_front();
                }
                break;
            }
            let wait = (deadline - now).min(PUSH_RETRY_INTERVAL);
            self.not_full.wait_for(&mut queue, wait);
        }
        queue.extend(bytes.iter().copied());
        drop(queue);
        self.not_empty.notify_one();
    }

    /// Instantaneous size estimate; may be stale but is monotone between
    /// concurrent writers' completions.
    pub fn read_available(&self) -> usize {
        self.queue.lock().len()
    }

    /// Copy up to `dst.len()` bytes without blocking. Returns 0 if empty.
    pub fn try_pop(&self, dst: &mut [u8]) -> usize {
        let mut queue = self.queue.lock();
        Self::drain(&mut queue, dst, &self.not_full)
    }

    /// Block up to `timeout` for at least one byte to appear, then copy up
    /// to `dst.len()`. Returns 0 only when `timeout` elapses with the pipe
    /// still empty.
    pub fn wait_and_pop(&self, dst: &mut [u8], timeout: Duration) -> usize {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            self.not_empty.wait_for(&mut queue, timeout);
        }
        Self::drain(&mut queue, dst, &self.not_full)
    }

    fn drain(queue: &mut VecDeque<u8>, dst: &mut [u8], not_full: &Condvar) -> usize {
        let n = queue.len().min(dst.len());
        for slot in dst.iter_mut().take(n) {
            *slot = queue.pop_front().expect("checked len above");
        }
        if n > 0 {
            not_full.notify_one();
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order_preserved() {
        let pipe = PipeBuffer::new(DEFAULT_CAPACITY);
        pipe.push(&[1, 2, 3]);
        pipe.push(&[4, 5]);
        let mut buf = [0u8; 5];
        assert_eq!(pipe.try_pop(&mut buf), 5);
        assert_eq!(buf, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn empty_wait_and_pop_times_out_with_zero() {
        let pipe = PipeBuffer::new(DEFAULT_CAPACITY);
        let mut buf = [0u8; 4];
        let n = pipe.wait_and_pop(&mut buf, Duration::from_millis(20));
        assert_eq!(n, 0);
    }

    #[test]
    fn wait_and_pop_wakes_on_push() {
        let pipe = Arc::new(PipeBuffer::new(DEFAULT_CAPACITY));
        let writer = Arc::clone(&pipe);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.push(b"hello");
        });
        let mut buf = [0u8; 5];
        let n = pipe.wait_and_pop(&mut buf, Duration::from_secs(1));
        handle.join().unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn zero_length_push_is_a_no_op() {
        let pipe = PipeBuffer::new(DEFAULT_CAPACITY);
        pipe.push(&[]);
        assert_eq!(pipe.read_available(), 0);
    }

    #[test]
    fn push_larger_than_capacity_into_empty_pipe_is_accepted() {
        let pipe = PipeBuffer::new(4);
        let data = vec![7u8; 16];
        pipe.push(&data);
        assert_eq!(pipe.read_available(), 16);
    }

    #[test]
    fn stalled_consumer_does_not_wedge_push_forever() {
        let pipe = PipeBuffer::new(4);
        pipe.push(&[1, 2, 3, 4]); // fills the pipe; nobody ever reads it

        let started = Instant::now();
        pipe.push(&[5, 6]); // must return once PUSH_STALL_TIMEOUT elapses
        assert!(started.elapsed() < PUSH_STALL_TIMEOUT + Duration::from_millis(200));

        // Oldest bytes were dropped to make room, not reordered.
        let mut buf = [0u8; 4];
        let n = pipe.try_pop(&mut buf);
        assert_eq!(&buf[..n], &[3, 4, 5, 6]);
    }

    #[test]
    fn full_pipe_blocks_producer_until_drained() {
        let pipe = Arc::new(PipeBuffer::new(4));
        pipe.push(&[1, 2, 3, 4]);
        let writer = Arc::clone(&pipe);
        let handle = thread::spawn(move || {
            writer.push(&[5, 6]);
        });
        thread::sleep(Duration::from_millis(20));
        assert_eq!(pipe.read_available(), 4); // still blocked, queue unchanged
        let mut buf = [0u8; 4];
        assert_eq!(pipe.try_pop(&mut buf), 4);
        handle.join().unwrap();
        assert_eq!(pipe.read_available(), 2);
    }
}
