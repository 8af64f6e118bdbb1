//! Subscriber stream (component E): a per-HTTP-client triple of byte pipes
//! plus the remux worker bound to them. Registers itself into the owning
//! session's subscriber set on construction and deregisters on drop, per
//! the non-owning back-reference design in spec §9 — the subscriber holds
//! a strong `Arc<Session>`, the session only ever holds a `Weak` pointer
//! back, so no reference cycle exists.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use foscam_core::session::MediaSink;
use foscam_core::{PipeBuffer, Session};

use crate::worker::{RemuxWorker, WorkerConfig};

const GET_VIDEO_STREAM_DATA_TIMEOUT: Duration = Duration::from_millis(100);

pub struct SubscriberConfig {
    pub pipe_capacity: usize,
    pub probe_size: usize,
    pub video_buffer_size: usize,
    pub audio_buffer_size: usize,
}

pub struct Subscriber {
    session: Arc<Session>,
    id: u64,
    video_in: Arc<PipeBuffer>,
    audio_in: Arc<PipeBuffer>,
    remuxed_out: Arc<PipeBuffer>,
    stop: Arc<AtomicBool>,
    worker_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Subscriber {
    /// Allocates the three pipes, spawns the remux worker on a dedicated
    /// thread, and registers with `session`'s subscriber set. Never
    /// blocks (spec §4.E).
    pub fn create(session: Arc<Session>, config: SubscriberConfig) -> Arc<Self> {
        let video_in = Arc::new(PipeBuffer::new(config.pipe_capacity));
        let audio_in = Arc::new(PipeBuffer::new(config.pipe_capacity));
        let remuxed_out = Arc::new(PipeBuffer::new(config.pipe_capacity));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = RemuxWorker::new(
            Arc::clone(&video_in),
            Arc::clone(&audio_in),
            Arc::clone(&remuxed_out),
            Arc::clone(&stop),
            WorkerConfig {
                probe_size: config.probe_size,
                video_buffer_size: config.video_buffer_size,
                audio_buffer_size: config.audio_buffer_size,
                framerate: session.framerate,
            },
        );
        let worker_handle = std::thread::Builder::new()
            .name("foscam-remux-worker".into())
            .spawn(move || worker.run())
            .expect("spawning remux worker thread");

        let subscriber = Arc::new_cyclic(|weak: &std::sync::Weak<Subscriber>| {
            let id = session.register_subscriber(weak.clone() as std::sync::Weak<dyn MediaSink>);
            Subscriber {
                session,
                id,
                video_in,
                audio_in,
                remuxed_out,
                stop,
                worker_handle: std::sync::Mutex::new(Some(worker_handle)),
            }
        });
        subscriber
    }

    /// Delegates to `remuxed_out.wait_and_pop` with the fixed 100 ms
    /// timeout the spec mandates (§4.E).
    pub fn get_video_stream_data(&self, dst: &mut [u8]) -> usize {
        self.remuxed_out
            .wait_and_pop(dst, GET_VIDEO_STREAM_DATA_TIMEOUT)
    }
}

impl MediaSink for Subscriber {
    fn push_video(&self, bytes: &[u8]) {
        self.video_in.push(bytes);
    }

    fn push_audio(&self, bytes: &[u8]) {
        self.audio_in.push(bytes);
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.session.deregister_subscriber(self.id);
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// S6 (destroyed before the probe threshold): a subscriber torn down
    /// before its video pipe accumulates `probe_size` bytes must observe
    /// zero bytes on `remuxed_out` and its worker must not have written a
    /// container header (checked indirectly: the worker thread exits
    /// quickly once `stop` is observed, since `wait_for_probe_threshold`
    /// polls it).
    #[test]
    fn subscriber_torn_down_before_probe_threshold_emits_nothing() {
        let video_in = Arc::new(PipeBuffer::new(1024));
        let audio_in = Arc::new(PipeBuffer::new(1024));
        let remuxed_out = Arc::new(PipeBuffer::new(1024));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = RemuxWorker::new(
            Arc::clone(&video_in),
            Arc::clone(&audio_in),
            Arc::clone(&remuxed_out),
            Arc::clone(&stop),
            WorkerConfig {
                probe_size: 256 * 1024,
                video_buffer_size: 4096,
                audio_buffer_size: 4096,
                framerate: 15,
            },
        );
        let handle = std::thread::spawn(move || worker.run());

        std::thread::sleep(Duration::from_millis(30));
        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();

        assert_eq!(remuxed_out.read_available(), 0);
    }
}
