//! Frame double buffering
//!
//! The engine renders into buffers it owns exclusively; consumers (UI,
//! network thread) read from published buffers behind a shared lock. At the
//! end of a multithreaded frame the two sides are flipped: an O(1) swap of
//! the buffer storage under the lock, so no reader ever observes a torn
//! frame. In fully single-threaded operation no flip happens and the host
//! reads the render side directly.
//!
//! There are two render/publish pairs, MAIN and CUE, flipped together along
//! with the `cue_on` flag that tells consumers which one to read.

use std::sync::Mutex;

use crate::types::{Color, ColorBuffer};

struct Published {
    main: ColorBuffer,
    cue: ColorBuffer,
    cue_on: bool,
}

/// The consumer-facing side of the double buffer. Shared with UI threads
/// and the network output thread through an `Arc`.
pub struct FrameBuffers {
    published: Mutex<Published>,
}

impl FrameBuffers {
    fn new(num_points: usize) -> Self {
        Self {
            published: Mutex::new(Published {
                main: ColorBuffer::new(num_points),
                cue: ColorBuffer::new(num_points),
                cue_on: false,
            }),
        }
    }

    /// Copy the published frame into a caller-provided buffer: the cue frame
    /// when cueing is active, the main frame otherwise.
    pub fn copy_ui_buffer(&self, dst: &mut [Color]) {
        let published = self.published.lock().unwrap();
        if published.cue_on {
            dst.copy_from_slice(published.cue.as_slice());
        } else {
            dst.copy_from_slice(published.main.as_slice());
        }
    }

    /// Copy the published main frame into a caller-provided buffer.
    pub(crate) fn copy_main(&self, dst: &mut [Color]) {
        let published = self.published.lock().unwrap();
        dst.copy_from_slice(published.main.as_slice());
    }

    /// Run `f` against the published main frame while holding the buffer
    /// lock.
    pub(crate) fn with_main<R>(&self, f: impl FnOnce(&[Color]) -> R) -> R {
        let published = self.published.lock().unwrap();
        f(published.main.as_slice())
    }
}

/// The engine-owned side of the double buffer: the MAIN and CUE render
/// targets plus the handle to the published pair.
pub(crate) struct RenderTarget {
    main: ColorBuffer,
    cue: ColorBuffer,
    cue_on: bool,
    shared: std::sync::Arc<FrameBuffers>,
}

impl RenderTarget {
    pub fn new(num_points: usize) -> Self {
        Self {
            main: ColorBuffer::new(num_points),
            cue: ColorBuffer::new(num_points),
            cue_on: false,
            shared: std::sync::Arc::new(FrameBuffers::new(num_points)),
        }
    }

    pub fn shared(&self) -> std::sync::Arc<FrameBuffers> {
        std::sync::Arc::clone(&self.shared)
    }

    pub fn main(&self) -> &ColorBuffer {
        &self.main
    }

    pub fn main_mut(&mut self) -> &mut ColorBuffer {
        &mut self.main
    }

    /// Both render buffers for the mixer to fill.
    pub fn render_pair_mut(&mut self) -> (&mut ColorBuffer, &mut ColorBuffer) {
        (&mut self.main, &mut self.cue)
    }

    /// Single-threaded publish: record the cue flag without touching the
    /// lock; consumers read the render side directly.
    pub fn set_cue_on(&mut self, cue_on: bool) {
        self.cue_on = cue_on;
    }

    /// End-of-frame flip for multithreaded operation: swap render and
    /// published storage for both pairs under the buffer lock.
    pub fn flip(&mut self, cue_on: bool) {
        let mut published = self.shared.published.lock().unwrap();
        std::mem::swap(&mut self.main, &mut published.main);
        std::mem::swap(&mut self.cue, &mut published.cue);
        published.cue_on = cue_on;
        self.cue_on = cue_on;
    }

    /// Copy render into published for both pairs. Called before a consumer
    /// thread is brought up so its first read is a fully written frame.
    pub fn sync(&self) {
        let mut published = self.shared.published.lock().unwrap();
        published.main.copy_from(&self.main);
        published.cue.copy_from(&self.cue);
        published.cue_on = self.cue_on;
    }

    /// Direct access to the current frame for single-threaded hosts. Not
    /// safe to use while the engine runs threaded.
    pub fn ui_buffer(&self) -> &[Color] {
        if self.cue_on {
            self.cue.as_slice()
        } else {
            self.main.as_slice()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BLACK;

    #[test]
    fn test_flip_swaps_storage() {
        let mut target = RenderTarget::new(4);
        target.main_mut().fill(0xFFFF0000);
        target.flip(false);

        let mut dst = vec![BLACK; 4];
        target.shared().copy_ui_buffer(&mut dst);
        assert!(dst.iter().all(|&c| c == 0xFFFF0000));

        // The render side now holds the previous published frame (black)
        assert!(target.main().as_slice().iter().all(|&c| c == BLACK));
    }

    #[test]
    fn test_cue_on_selects_cue_buffer() {
        let mut target = RenderTarget::new(4);
        target.main_mut().fill(0xFFFF0000);
        let (_, cue) = target.render_pair_mut();
        cue.fill(0xFF0000FF);
        target.flip(true);

        let mut dst = vec![BLACK; 4];
        target.shared().copy_ui_buffer(&mut dst);
        assert!(dst.iter().all(|&c| c == 0xFF0000FF));
    }

    #[test]
    fn test_sync_publishes_without_swapping() {
        let mut target = RenderTarget::new(4);
        target.main_mut().fill(0xFF00FF00);
        target.sync();

        let mut dst = vec![BLACK; 4];
        target.shared().copy_ui_buffer(&mut dst);
        assert!(dst.iter().all(|&c| c == 0xFF00FF00));
        // Render side untouched
        assert!(target.main().as_slice().iter().all(|&c| c == 0xFF00FF00));
    }

    #[test]
    fn test_ui_buffer_follows_cue_flag() {
        let mut target = RenderTarget::new(2);
        target.main_mut().fill(0xFF111111);
        target.set_cue_on(false);
        assert_eq!(target.ui_buffer()[0], 0xFF111111);
        target.set_cue_on(true);
        assert_eq!(target.ui_buffer()[0], BLACK);
    }
}
