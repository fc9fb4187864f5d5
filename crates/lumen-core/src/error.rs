//! Engine error types

use thiserror::Error;

/// Errors surfaced by the engine and its substrate.
///
/// Contract violations are programmer errors and fail loudly at the call
/// site. Buffer-length invariant violations panic instead; they indicate
/// corrupted state that no caller can recover from.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A parameter was attached to a component twice
    #[error("parameter is already attached at '{0}'")]
    ParameterAttached(String),

    /// Two parameters registered under the same key on one component
    #[error("duplicate parameter key '{key}' on component '{component}'")]
    DuplicateParameterKey { component: String, key: String },

    /// `set_value` invoked on a computed (functional) parameter
    #[error("cannot set value of computed parameter '{0}'")]
    ComputedParameter(String),

    /// A loop task was registered twice under the same key
    #[error("loop task '{0}' is already registered")]
    DuplicateLoopTask(String),

    /// A channel operation referenced a channel this engine does not own
    #[error("engine does not contain channel {0}")]
    UnknownChannel(u64),

    /// `start`/`stop` used while the engine is embedded in a host draw loop
    #[error("engine thread control is unavailable in host-embedded mode, use on_draw()")]
    HostEmbedded,

    /// The render thread could not be joined during a mode transition.
    /// Engine state is undefined after this error.
    #[error("failed to join the render thread")]
    ThreadJoin,

    /// The channel blend set was replaced after the first frame ran
    #[error("channel blends may only be replaced before the engine has started")]
    EngineStarted,
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
