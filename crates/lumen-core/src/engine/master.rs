//! The master channel
//!
//! A distinguished channel with no patterns: its effect chain runs over the
//! fully mixed main output, and it owns its own scene clip slots. In the
//! focused-channel index space the master sits at `channel_count`.

use serde_json::{json, Value};

use crate::clip::Clip;
use crate::component::ComponentCore;
use crate::effect::Effect;
use crate::parameter::BooleanParameter;
use crate::types::MAX_SCENES;

pub struct MasterChannel {
    core: ComponentCore,
    pub selected: BooleanParameter,
    effects: Vec<Box<dyn Effect>>,
    clips: Vec<Option<Clip>>,
}

impl MasterChannel {
    pub(crate) fn new() -> Self {
        let mut core = ComponentCore::new("Master", "/lx/engine/master");
        let mut selected = BooleanParameter::new("Selected", false)
            .with_description("Whether the master channel is selected in the UI");
        core.register("selected", &mut selected)
            .expect("master parameter registration");
        Self {
            core,
            selected,
            effects: Vec::new(),
            clips: (0..MAX_SCENES).map(|_| None).collect(),
        }
    }

    pub fn label(&self) -> &str {
        self.core.label()
    }

    pub fn path(&self) -> &str {
        self.core.path()
    }

    pub fn add_effect(&mut self, effect: Box<dyn Effect>) {
        self.effects.push(effect);
    }

    pub fn effects_mut(&mut self) -> &mut Vec<Box<dyn Effect>> {
        &mut self.effects
    }

    pub fn clip(&self, slot: usize) -> Option<&Clip> {
        self.clips.get(slot).and_then(|c| c.as_ref())
    }

    pub fn clip_mut(&mut self, slot: usize) -> Option<&mut Clip> {
        self.clips.get_mut(slot).and_then(|c| c.as_mut())
    }

    pub fn set_clip(&mut self, slot: usize, clip: Clip) {
        if slot < self.clips.len() {
            self.clips[slot] = Some(clip);
        }
    }

    pub(crate) fn clips_mut(&mut self) -> impl Iterator<Item = &mut Clip> {
        self.clips.iter_mut().flatten()
    }

    /// Master frame work: only clip time advances here; the effect chain is
    /// applied to the mixed output by the scheduler.
    pub(crate) fn loop_frame(&mut self, delta_ms: f64) {
        for clip in self.clips.iter_mut().flatten() {
            clip.tick(delta_ms);
        }
    }

    pub(crate) fn save(&self) -> Value {
        json!({
            "parameters": {
                "selected": self.selected.is_on(),
            }
        })
    }

    pub(crate) fn load(&mut self, obj: &Value) {
        if let Some(parameters) = obj.get("parameters") {
            if let Some(selected) = parameters.get("selected").and_then(Value::as_bool) {
                self.selected.set(selected);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_advances_clips() {
        let mut master = MasterChannel::new();
        master.set_clip(0, Clip::new("Opening"));
        master.clip_mut(0).unwrap().trigger();
        master.loop_frame(40.0);
        assert_eq!(master.clip(0).unwrap().elapsed_ms(), 40.0);
    }

    #[test]
    fn test_master_save_load() {
        let mut master = MasterChannel::new();
        master.selected.set(true);
        let saved = master.save();

        let mut restored = MasterChannel::new();
        restored.load(&saved);
        assert!(restored.selected.is_on());
    }
}
