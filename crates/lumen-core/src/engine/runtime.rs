//! Engine thread lifecycle
//!
//! [`EngineHandle`] wraps the engine for hosts: in threaded mode a
//! dedicated render thread calls `run()` paced to the FPS target; in
//! non-threaded mode the host drives frames itself through `run()` or
//! `on_draw()`. Mode transitions are serialized under the handle's thread
//! lock and only take effect at frame boundaries; before the render thread
//! comes up both double buffers are synchronized and flipped so consumers
//! never observe a half-written frame.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::error::{EngineError, EngineResult};
use crate::parameter::Parameter;
use crate::types::Color;

use super::buffer::FrameBuffers;
use super::engine::Engine;
use super::tasks::{Task, TaskQueue};

struct RenderThread {
    handle: Option<JoinHandle<()>>,
    thread_id: Option<ThreadId>,
    interrupt: Arc<AtomicBool>,
}

/// Host-facing wrapper owning the engine and its render thread.
pub struct EngineHandle {
    engine: Arc<Mutex<Engine>>,
    tasks: Arc<TaskQueue>,
    frames: Arc<FrameBuffers>,
    running: Arc<AtomicBool>,
    frame_rate: Arc<AtomicU32>,
    thread: Mutex<RenderThread>,
}

impl EngineHandle {
    pub fn new(engine: Engine) -> Self {
        let tasks = engine.tasks();
        let frames = engine.frames();
        let running = engine.engine_thread_flag();
        let frame_rate = engine.frame_rate_atomic();
        Self {
            engine: Arc::new(Mutex::new(engine)),
            tasks,
            frames,
            running,
            frame_rate,
            thread: Mutex::new(RenderThread {
                handle: None,
                thread_id: None,
                interrupt: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    /// Lock the engine for direct manipulation. In threaded mode this
    /// blocks until the frame boundary.
    pub fn engine(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock().unwrap()
    }

    /// Advance one frame synchronously (non-threaded hosts).
    pub fn run(&self) {
        self.engine().run();
    }

    /// Whether the render thread is currently running.
    pub fn is_threaded(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Measured render frame rate; zero while not threaded.
    pub fn frame_rate(&self) -> f32 {
        f32::from_bits(self.frame_rate.load(Ordering::Acquire))
    }

    /// Start the render thread. Rejected in host-embedded mode, where the
    /// host's draw loop drives `on_draw` instead.
    pub fn start(&self) -> EngineResult<()> {
        if self.engine().is_host_embedded() {
            return Err(EngineError::HostEmbedded);
        }
        self.engine().multithreaded.set(true);
        let mut thread = self.thread.lock().unwrap();
        self.spawn_render_thread(&mut thread)
    }

    /// Stop the render thread. Rejected in host-embedded mode.
    pub fn stop(&self) -> EngineResult<()> {
        if self.engine().is_host_embedded() {
            return Err(EngineError::HostEmbedded);
        }
        self.engine().multithreaded.set(false);
        let mut thread = self.thread.lock().unwrap();
        self.join_render_thread(&mut thread)
    }

    /// Set threaded mode, reconciling immediately outside embedded hosts.
    pub fn set_threaded(&self, threaded: bool) -> EngineResult<()> {
        let embedded = {
            let mut engine = self.engine();
            engine.multithreaded.set(threaded);
            engine.is_host_embedded()
        };
        if embedded {
            // The host's draw loop picks the change up in on_draw()
            return Ok(());
        }
        let mut thread = self.thread.lock().unwrap();
        if threaded {
            self.spawn_render_thread(&mut thread)
        } else {
            self.join_render_thread(&mut thread)
        }
    }

    /// Embedded-host entry point: reconcile the threaded flag with the
    /// actual thread state, then run a frame if not threaded.
    pub fn on_draw(&self) -> EngineResult<()> {
        let want = self.engine().multithreaded.is_on();
        if want != self.is_threaded() {
            let mut thread = self.thread.lock().unwrap();
            if want {
                self.spawn_render_thread(&mut thread)?;
            } else {
                self.join_render_thread(&mut thread)?;
            }
        }
        if !self.is_threaded() {
            self.run();
        }
        Ok(())
    }

    fn spawn_render_thread(&self, thread: &mut RenderThread) -> EngineResult<()> {
        if thread.handle.is_some() {
            return Ok(());
        }

        // Publish a coherent frame before consumers start reading
        self.engine().sync_buffers();

        let interrupt = Arc::new(AtomicBool::new(false));
        let engine = Arc::clone(&self.engine);
        let running = Arc::clone(&self.running);
        let frame_rate = Arc::clone(&self.frame_rate);
        let thread_interrupt = Arc::clone(&interrupt);

        self.running.store(true, Ordering::Release);
        let handle = thread::Builder::new()
            .name("lumen-render".to_string())
            .spawn(move || render_main(engine, thread_interrupt, running, frame_rate))
            .expect("failed to spawn render thread");

        thread.thread_id = Some(handle.thread().id());
        thread.interrupt = interrupt;
        thread.handle = Some(handle);
        Ok(())
    }

    fn join_render_thread(&self, thread: &mut RenderThread) -> EngineResult<()> {
        let Some(handle) = thread.handle.take() else {
            return Ok(());
        };
        thread.interrupt.store(true, Ordering::Release);
        self.running.store(false, Ordering::Release);

        // A thread stopping itself cannot join; it unwinds at the next
        // interrupt check instead.
        if thread.thread_id != Some(thread::current().id()) {
            handle.join().map_err(|_| EngineError::ThreadJoin)?;
        }
        thread.thread_id = None;
        Ok(())
    }

    /// Enqueue a one-shot engine-thread action from any thread.
    pub fn add_task(&self, task: Task) {
        self.tasks.push(task);
    }

    /// Copy the most recently published frame (cue frame while cueing)
    /// into a caller-provided buffer. Safe from any thread.
    pub fn copy_ui_buffer(&self, dst: &mut [Color]) {
        self.frames.copy_ui_buffer(dst);
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        let mut thread = self.thread.lock().unwrap();
        let _ = self.join_render_thread(&mut thread);
    }
}

fn render_main(
    engine: Arc<Mutex<Engine>>,
    interrupt: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    frame_rate: Arc<AtomicU32>,
) {
    log::info!("[ENGINE] render thread started");
    while !interrupt.load(Ordering::Acquire) {
        let frame_start = Instant::now();
        let target_fps = {
            let mut engine = engine.lock().unwrap();
            engine.run();
            engine.frames_per_second.value()
        };
        if interrupt.load(Ordering::Acquire) {
            break;
        }

        let frame_ms = (frame_start.elapsed().as_secs_f64() * 1000.0).max(1e-3);
        let mut measured = (1000.0 / frame_ms) as f32;
        if target_fps > 0.0 {
            let min_frame_ms = 1000.0 / target_fps;
            if frame_ms < min_frame_ms {
                measured = target_fps as f32;
                thread::sleep(Duration::from_secs_f64((min_frame_ms - frame_ms) / 1000.0));
            }
        }
        frame_rate.store(measured.to_bits(), Ordering::Release);
    }

    frame_rate.store(0f32.to_bits(), Ordering::Release);
    running.store(false, Ordering::Release);
    log::info!("[ENGINE] render thread finished");
}
