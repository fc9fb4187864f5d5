//! Network output thread
//!
//! When network-multithreaded mode is on, a long-running worker owns the
//! top-of-tree `send` call so a slow transport never stalls rendering. The
//! engine wakes it at the end of each frame; the worker copies the
//! published main frame into a private buffer under the buffer lock, drops
//! the lock, and sends, so the engine renders the next frame concurrently.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::engine::FrameBuffers;
use crate::types::ColorBuffer;

use super::Output;

struct NetState {
    pending: bool,
    interrupted: bool,
}

struct NetSignal {
    state: Mutex<NetState>,
    wake: Condvar,
}

/// Handle to the network output worker.
pub(crate) struct NetworkThread {
    signal: Arc<NetSignal>,
    frame_rate: Arc<AtomicU32>,
    handle: Option<JoinHandle<()>>,
}

impl NetworkThread {
    pub fn new() -> Self {
        Self {
            signal: Arc::new(NetSignal {
                state: Mutex::new(NetState {
                    pending: false,
                    interrupted: false,
                }),
                wake: Condvar::new(),
            }),
            frame_rate: Arc::new(AtomicU32::new(0)),
            handle: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.handle.is_some()
    }

    /// Spawn the worker. Called once; the started thread runs until the
    /// engine shuts down.
    pub fn start(
        &mut self,
        frames: Arc<FrameBuffers>,
        output: Arc<Mutex<Output>>,
        epoch: Instant,
        num_points: usize,
    ) {
        if self.handle.is_some() {
            return;
        }
        let signal = Arc::clone(&self.signal);
        let frame_rate = Arc::clone(&self.frame_rate);
        let handle = thread::Builder::new()
            .name("lumen-network".to_string())
            .spawn(move || network_main(signal, frames, output, epoch, num_points, frame_rate))
            .expect("failed to spawn network output thread");
        self.handle = Some(handle);
    }

    /// Wake the worker for a freshly published frame.
    pub fn notify(&self) {
        let mut state = self.signal.state.lock().unwrap();
        state.pending = true;
        self.signal.wake.notify_one();
    }

    /// Frames per second the worker is achieving.
    pub fn frame_rate(&self) -> f32 {
        f32::from_bits(self.frame_rate.load(Ordering::Acquire))
    }

    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            {
                let mut state = self.signal.state.lock().unwrap();
                state.interrupted = true;
                self.signal.wake.notify_one();
            }
            let _ = handle.join();
        }
    }
}

impl Drop for NetworkThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn network_main(
    signal: Arc<NetSignal>,
    frames: Arc<FrameBuffers>,
    output: Arc<Mutex<Output>>,
    epoch: Instant,
    num_points: usize,
    frame_rate: Arc<AtomicU32>,
) {
    log::info!("[NETWORK] output thread started");
    let mut buffer = ColorBuffer::new(num_points);
    let mut last_frame = epoch.elapsed().as_millis() as u64;

    loop {
        {
            let mut state = signal.state.lock().unwrap();
            while !state.pending && !state.interrupted {
                state = signal.wake.wait(state).unwrap();
            }
            if state.interrupted {
                break;
            }
            state.pending = false;
        }

        let enabled = output.lock().unwrap().enabled.is_on();
        if enabled {
            // Copy out of the double buffer, then send without the buffer
            // lock so the engine keeps rendering.
            frames.copy_main(buffer.as_mut_slice());
            let now = epoch.elapsed().as_millis() as u64;
            output.lock().unwrap().send(buffer.as_slice(), now);
        }

        let now = epoch.elapsed().as_millis() as u64;
        let elapsed = now.saturating_sub(last_frame).max(1);
        frame_rate.store((1000.0 / elapsed as f32).to_bits(), Ordering::Release);
        last_frame = now;
    }

    log::info!("[NETWORK] output thread finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Color;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink {
        sends: Arc<AtomicUsize>,
    }

    impl crate::output::Sink for CountingSink {
        fn on_send(&mut self, _colors: &[Color]) {
            self.sends.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_network_thread_sends_on_notify() {
        let engine = crate::engine::Engine::new(8);
        let frames = engine.frames();

        let sends = Arc::new(AtomicUsize::new(0));
        let mut root = Output::group("Output", 8);
        root.add_child(Output::new(
            "Counting",
            8,
            Box::new(CountingSink {
                sends: Arc::clone(&sends),
            }),
        ));
        let output = Arc::new(Mutex::new(root));

        let mut network = NetworkThread::new();
        network.start(frames, Arc::clone(&output), Instant::now(), 8);

        for _ in 0..3 {
            network.notify();
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        network.shutdown();

        let count = sends.load(Ordering::SeqCst);
        assert!(count >= 1, "network thread never sent");
        assert!(count <= 3);
    }
}
