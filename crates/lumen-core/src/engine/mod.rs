//! The frame engine
//!
//! Everything that happens inside one frame lives here: the scheduler and
//! run loop ([`engine`]), per-channel state and generators ([`channel`]),
//! the bus compositor ([`mixer`]), the render/publish double buffer
//! ([`buffer`]), the foreign-thread task queue ([`tasks`]), the per-channel
//! worker threads ([`worker`]), and the render-thread lifecycle
//! ([`runtime`]).

mod buffer;
mod channel;
#[allow(clippy::module_inception)]
mod engine;
mod master;
mod mixer;
mod runtime;
mod tasks;
mod worker;

pub use buffer::FrameBuffers;
pub use channel::{ChannelBus, ChannelId, CrossfadeGroup};
pub use engine::{ClipTarget, Engine, EngineListener, Timer};
pub use master::MasterChannel;
pub use runtime::EngineHandle;
pub use tasks::{Task, TaskQueue};
