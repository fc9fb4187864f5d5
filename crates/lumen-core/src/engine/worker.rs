//! Per-channel worker threads
//!
//! In channel-multithreaded mode every channel owns a persistent worker that
//! runs the channel's frame work when signaled. The scheduler requests work
//! on every channel, then collects completions; workers finish in any order
//! but the mixer only runs once all are collected.
//!
//! Each worker is a four-state machine: Idle -> WorkRequested -> Working ->
//! WorkDone, back to Idle at collection. The thread itself is started
//! lazily on the first request and interrupted cleanly at the next wait
//! when its channel is removed.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use super::channel::ChannelBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerPhase {
    Idle,
    WorkRequested,
    Working,
    WorkDone,
}

struct WorkerState {
    phase: WorkerPhase,
    delta_ms: f64,
    interrupted: bool,
}

struct WorkSignal {
    state: Mutex<WorkerState>,
    work: Condvar,
    done: Condvar,
}

/// Handle to one channel's worker thread.
pub(crate) struct ChannelWorker {
    signal: Arc<WorkSignal>,
    handle: Option<JoinHandle<()>>,
}

impl ChannelWorker {
    pub fn new() -> Self {
        Self {
            signal: Arc::new(WorkSignal {
                state: Mutex::new(WorkerState {
                    phase: WorkerPhase::Idle,
                    delta_ms: 0.0,
                    interrupted: false,
                }),
                work: Condvar::new(),
                done: Condvar::new(),
            }),
            handle: None,
        }
    }

    /// Hand this frame's delta to the worker and wake it. Starts the thread
    /// on first use.
    pub fn request(&mut self, bus: &Arc<Mutex<ChannelBus>>, delta_ms: f64) {
        if self.handle.is_none() {
            let label = bus.lock().unwrap().label().to_string();
            let bus = Arc::clone(bus);
            let signal = Arc::clone(&self.signal);
            let handle = thread::Builder::new()
                .name(format!("lumen-channel-{label}"))
                .spawn(move || worker_main(bus, signal))
                .expect("failed to spawn channel worker thread");
            log::debug!("[CHANNEL] worker thread started for '{label}'");
            self.handle = Some(handle);
        }
        let mut state = self.signal.state.lock().unwrap();
        state.delta_ms = delta_ms;
        state.phase = WorkerPhase::WorkRequested;
        self.signal.work.notify_one();
    }

    /// Block until the worker reports done, then return it to idle.
    pub fn collect(&self) {
        let mut state = self.signal.state.lock().unwrap();
        while state.phase != WorkerPhase::WorkDone && !state.interrupted {
            state = self.signal.done.wait(state).unwrap();
        }
        state.phase = WorkerPhase::Idle;
    }

    /// Interrupt the worker and join its thread.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            {
                let mut state = self.signal.state.lock().unwrap();
                state.interrupted = true;
                self.signal.work.notify_one();
            }
            let _ = handle.join();
        }
    }
}

impl Drop for ChannelWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_main(bus: Arc<Mutex<ChannelBus>>, signal: Arc<WorkSignal>) {
    loop {
        let delta_ms = {
            let mut state = signal.state.lock().unwrap();
            while state.phase != WorkerPhase::WorkRequested && !state.interrupted {
                state = signal.work.wait(state).unwrap();
            }
            if state.interrupted {
                break;
            }
            state.phase = WorkerPhase::Working;
            state.delta_ms
        };

        bus.lock().unwrap().loop_frame(delta_ms);

        let mut state = signal.state.lock().unwrap();
        state.phase = WorkerPhase::WorkDone;
        signal.done.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blend;
    use crate::pattern::SolidPattern;

    fn test_bus() -> Arc<Mutex<ChannelBus>> {
        let labels = blend::labels(&blend::channel_blends());
        let bus = ChannelBus::new_channel(
            1,
            "Worker",
            8,
            vec![Box::new(SolidPattern::new(0xFF123456))],
            labels,
        );
        Arc::new(Mutex::new(bus))
    }

    #[test]
    fn test_worker_runs_channel_frame() {
        let bus = test_bus();
        let mut worker = ChannelWorker::new();

        worker.request(&bus, 16.0);
        worker.collect();

        let guard = bus.lock().unwrap();
        assert!(guard.is_animating());
        assert!(guard.colors().iter().all(|&c| c == 0xFF123456));
        drop(guard);
        worker.shutdown();
    }

    #[test]
    fn test_worker_multiple_frames() {
        let bus = test_bus();
        let mut worker = ChannelWorker::new();
        for _ in 0..10 {
            worker.request(&bus, 16.0);
            worker.collect();
        }
        worker.shutdown();
    }

    #[test]
    fn test_shutdown_before_first_request_is_noop() {
        let mut worker = ChannelWorker::new();
        worker.shutdown();
    }
}
