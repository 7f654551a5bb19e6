// src/stream/event.rs

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use super::Stream;
use crate::error::{AeError, AeResult};

/// Producer callback: the stream that wants data and its free space in frames.
pub type StreamCallback = Arc<dyn Fn(&Stream, usize) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifierState {
    Idle,
    Signaled,
    Terminated,
}

struct Shared {
    /// Level-triggered signal. Only ever locked to set, clear or wait on it.
    signaled: Mutex<bool>,
    cond: Condvar,
    running: AtomicBool,
    callback: Mutex<Option<StreamCallback>>,
}

/// Background waiter that calls a producer back whenever its stream is
/// triggered.
///
/// The callback runs on the waiter thread with no lock held, so it may call
/// straight back into `Stream::add_data` or `trigger` without deadlocking.
/// Triggers that land while a callback is pending or running collapse into
/// that one call.
pub struct EventNotifier {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl EventNotifier {
    pub fn spawn(stream: Weak<Stream>, callback: Option<StreamCallback>) -> AeResult<Self> {
        let shared = Arc::new(Shared {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
            running: AtomicBool::new(true),
            callback: Mutex::new(callback),
        });

        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("ae-stream-event".to_string())
            .spawn(move || run(thread_shared, stream))
            .map_err(AeError::Io)?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn set_callback(&self, callback: Option<StreamCallback>) {
        *self.shared.callback.lock() = callback;
    }

    pub fn trigger(&self) {
        let mut signaled = self.shared.signaled.lock();
        *signaled = true;
        self.shared.cond.notify_one();
    }

    pub fn state(&self) -> NotifierState {
        if !self.shared.running.load(Ordering::Acquire) {
            NotifierState::Terminated
        } else if *self.shared.signaled.lock() {
            NotifierState::Signaled
        } else {
            NotifierState::Idle
        }
    }
}

impl Drop for EventNotifier {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);

        // the waiter may already be parked on the signal
        self.trigger();

        if let Some(handle) = self.thread.take() {
            // The last handle to a stream can be released from inside its own
            // callback; the thread exits on its own once the callback returns.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        log::debug!("stream event thread stopped");
    }
}

fn run(shared: Arc<Shared>, stream: Weak<Stream>) {
    loop {
        {
            let mut signaled = shared.signaled.lock();
            while !*signaled && shared.running.load(Ordering::Acquire) {
                shared.cond.wait(&mut signaled);
            }
        }

        if !shared.running.load(Ordering::Acquire) {
            return;
        }

        let callback = shared.callback.lock().clone();
        if let Some(cb) = callback {
            if let Some(stream) = stream.upgrade() {
                let space = stream.space();
                cb(&stream, space);
            }
        }

        *shared.signaled.lock() = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{AudioFormat, ChannelLayout, DataFormat, StdLayout};
    use crate::stream::{Buffering, StreamId, StreamOptions};
    use std::sync::mpsc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);
    const QUIET: Duration = Duration::from_millis(200);

    fn stream() -> Arc<Stream> {
        let layout = ChannelLayout::from_std(StdLayout::Stereo);
        Arc::new(Stream::new(
            StreamId(7),
            AudioFormat::new(DataFormat::S16LE, 48_000, layout.clone(), 0),
            StreamOptions::default(),
            &AudioFormat::new(DataFormat::FloatLE, 48_000, layout, 1000),
            Buffering::default(),
        ))
    }

    #[test]
    fn register_fires_once_with_free_space() {
        let s = stream();
        let (tx, rx) = mpsc::channel();
        s.register_callback(move |_, space| {
            let _ = tx.send(space);
        })
        .unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 24_000);
        assert!(rx.recv_timeout(QUIET).is_err());
    }

    #[test]
    fn callback_may_feed_the_stream() {
        let s = stream();
        let (tx, rx) = mpsc::channel();
        s.register_callback(move |stream, space| {
            let bytes = vec![0u8; space.min(2000) * 4];
            let taken = stream.add_data(&bytes);
            stream.trigger();
            let _ = tx.send(taken);
        })
        .unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 2000);
        // the trigger from inside the callback is cleared with it
        assert!(rx.recv_timeout(QUIET).is_err());
        s.unregister_callback();
    }

    #[test]
    fn triggers_during_a_callback_collapse() {
        let s = stream();
        let (calls_tx, calls_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Mutex::new(gate_rx);
        s.register_callback(move |_, _| {
            let _ = calls_tx.send(());
            let _ = gate_rx.lock().recv_timeout(WAIT);
        })
        .unwrap();

        calls_rx.recv_timeout(WAIT).unwrap();
        for _ in 0..5 {
            s.trigger();
        }
        gate_tx.send(()).unwrap();
        assert!(calls_rx.recv_timeout(QUIET).is_err());

        s.trigger();
        calls_rx.recv_timeout(WAIT).unwrap();
        gate_tx.send(()).unwrap();
    }

    #[test]
    fn unregister_from_inside_callback() {
        let s = stream();
        let (tx, rx) = mpsc::channel();
        s.register_callback(move |stream, _| {
            stream.unregister_callback();
            let _ = tx.send(());
        })
        .unwrap();
        rx.recv_timeout(WAIT).unwrap();
        s.trigger();
        assert!(rx.recv_timeout(QUIET).is_err());
    }

    #[test]
    fn dropped_notifier_reports_terminated() {
        let s = stream();
        let notifier = EventNotifier::spawn(Arc::downgrade(&s), None).unwrap();
        assert_eq!(notifier.state(), NotifierState::Idle);
        notifier.shared.running.store(false, Ordering::Release);
        assert_eq!(notifier.state(), NotifierState::Terminated);
    }
}
