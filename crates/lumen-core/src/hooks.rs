//! Collaborator hooks
//!
//! The engine coordinates a set of external collaborators it knows nothing
//! about internally: tempo, audio, modulation, palette, and script engines
//! that advance with frame time, and the MIDI/OSC/UI input dispatchers that
//! drain their event queues at the top of each frame. Hosts install real
//! implementations; the defaults are inert but still round-trip any state a
//! loaded project carried for them.

use serde_json::Value;

/// A per-frame hook invoked with the scaled frame delta.
pub trait LoopTask: Send {
    fn tick(&mut self, delta_ms: f64);
}

/// An input dispatcher pumped once per frame, before time advances.
pub trait Dispatch: Send {
    /// Drain the dispatcher's queue on the engine thread.
    fn dispatch(&mut self);
}

/// A time-advancing collaborator with a slot in the project tree.
pub trait Collaborator: Send {
    /// Advance collaborator time.
    fn tick(&mut self, delta_ms: f64);

    /// Serialize collaborator state into the project tree.
    fn save(&self) -> Value {
        Value::Null
    }

    /// Restore collaborator state from the project tree.
    fn load(&mut self, _obj: &Value) {}
}

/// An event-pump collaborator (MIDI, OSC): dispatched each frame and
/// persisted in the project tree.
pub trait EventEngine: Send {
    fn dispatch(&mut self);

    fn save(&self) -> Value {
        Value::Null
    }

    fn load(&mut self, _obj: &Value) {}
}

/// A user component registered with the engine for persistence.
pub trait Saveable: Send {
    fn save(&self) -> Value;
    fn load(&mut self, obj: &Value);
}

/// Default collaborator: does nothing per frame but preserves whatever
/// project state was loaded for its slot, so a project saved with inert
/// slots round-trips unchanged.
pub struct InertCollaborator {
    state: Value,
}

impl InertCollaborator {
    pub fn new() -> Self {
        Self { state: Value::Null }
    }
}

impl Default for InertCollaborator {
    fn default() -> Self {
        Self::new()
    }
}

impl Collaborator for InertCollaborator {
    fn tick(&mut self, _delta_ms: f64) {}

    fn save(&self) -> Value {
        self.state.clone()
    }

    fn load(&mut self, obj: &Value) {
        self.state = obj.clone();
    }
}

/// Default event engine, same state-preserving behavior as
/// [`InertCollaborator`].
pub struct InertEventEngine {
    state: Value,
}

impl InertEventEngine {
    pub fn new() -> Self {
        Self { state: Value::Null }
    }
}

impl Default for InertEventEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEngine for InertEventEngine {
    fn dispatch(&mut self) {}

    fn save(&self) -> Value {
        self.state.clone()
    }

    fn load(&mut self, obj: &Value) {
        self.state = obj.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inert_collaborator_round_trips_state() {
        let mut c = InertCollaborator::new();
        assert_eq!(c.save(), Value::Null);
        c.load(&json!({"bpm": 120.0}));
        assert_eq!(c.save(), json!({"bpm": 120.0}));
    }
}
