//! Channels and groups
//!
//! A channel is the unit of animation: it owns a pattern rotation, an
//! effect chain, a fader, a blend mode, a crossfade-group assignment, and
//! its own color buffer. A group is a channel that composites an ordered
//! set of sub-channels into its buffer instead of running patterns;
//! sub-channels do not blend into the main buses on their own.
//!
//! Channel state lives behind a mutex so that per-channel worker threads
//! and the engine thread can hand a channel back and forth; in
//! single-threaded operation the locks are uncontended.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::clip::Clip;
use crate::component::ComponentCore;
use crate::effect::Effect;
use crate::parameter::{
    BooleanParameter, BoundedParameter, CompoundParameter, EnumParameter, ObjectParameter,
    Parameter, Units,
};
use crate::pattern::Pattern;
use crate::types::{lerp, Color, ColorBuffer, MAX_SCENES};

use super::worker::ChannelWorker;

/// Stable identifier of a channel within one engine.
pub type ChannelId = u64;

/// Which crossfade bus a channel blends into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CrossfadeGroup {
    A,
    B,
    Bypass,
}

impl CrossfadeGroup {
    fn variants() -> Vec<(&'static str, CrossfadeGroup)> {
        vec![
            ("A", CrossfadeGroup::A),
            ("B", CrossfadeGroup::B),
            ("BYPASS", CrossfadeGroup::Bypass),
        ]
    }
}

/// Pattern rotation state of a leaf channel: one active pattern, and
/// optionally one pending pattern mid-transition.
struct PatternSlot {
    patterns: Vec<Box<dyn Pattern>>,
    active: usize,
    pending: Option<usize>,
    progress: f64,
}

enum BusKind {
    Patterns(PatternSlot),
    Group { children: Vec<ChannelId> },
}

/// Engine-side record for one channel: the shared bus state plus the
/// worker-thread handle for channel-multithreaded mode.
pub(crate) struct ChannelCell {
    pub id: ChannelId,
    pub bus: Arc<Mutex<ChannelBus>>,
    pub worker: ChannelWorker,
}

impl ChannelCell {
    pub fn new(bus: ChannelBus) -> Self {
        Self {
            id: bus.id(),
            bus: Arc::new(Mutex::new(bus)),
            worker: ChannelWorker::new(),
        }
    }

    /// Signal this channel's worker to run one frame.
    pub fn request_work(&mut self, delta_ms: f64) {
        self.worker.request(&self.bus, delta_ms);
    }
}

/// A channel or group in the engine's channel list.
pub struct ChannelBus {
    core: ComponentCore,
    id: ChannelId,
    index: usize,
    group: Option<ChannelId>,
    is_animating: bool,

    pub fader: CompoundParameter,
    pub blend_mode: ObjectParameter,
    pub crossfade_group: EnumParameter<CrossfadeGroup>,
    pub enabled: BooleanParameter,
    pub cue_active: BooleanParameter,
    pub selected: BooleanParameter,
    pub transition_ms: BoundedParameter,

    colors: ColorBuffer,
    scratch: ColorBuffer,
    clips: Vec<Option<Clip>>,
    effects: Vec<Box<dyn Effect>>,
    kind: BusKind,
}

impl ChannelBus {
    fn new(
        id: ChannelId,
        label: &str,
        num_points: usize,
        blend_labels: Vec<String>,
        kind: BusKind,
    ) -> Self {
        let mut core = ComponentCore::new(label, &format!("/lx/engine/channel/{id}")).with_id(id);
        let mut fader = CompoundParameter::new("Fader", 0.0, 0.0, 1.0)
            .with_description("Level of the channel in the mix");
        let mut blend_mode = ObjectParameter::new("Blend", blend_labels)
            .with_description("Blend mode used when mixing this channel down");
        let mut crossfade_group = EnumParameter::new(
            "Crossfade Group",
            CrossfadeGroup::variants(),
            CrossfadeGroup::Bypass,
        )
        .with_description("Assigns this channel to crossfade group A or B");
        let mut enabled = BooleanParameter::new("Enabled", true)
            .with_description("Whether the channel is enabled");
        let mut cue_active = BooleanParameter::new("Cue", false)
            .with_description("Toggles the channel into cue preview");
        let mut selected = BooleanParameter::new("Selected", false)
            .with_description("Whether the channel is selected in the UI");
        let mut transition_ms = BoundedParameter::new("Transition", 0.0, 0.0, 60_000.0)
            .with_units(Units::Milliseconds)
            .with_description("Duration of pattern transitions, 0 for immediate");

        for (key, parameter) in [
            ("fader", &mut fader as &mut dyn Parameter),
            ("blendMode", &mut blend_mode),
            ("crossfadeGroup", &mut crossfade_group),
            ("enabled", &mut enabled),
            ("cue", &mut cue_active),
            ("selected", &mut selected),
            ("transitionMs", &mut transition_ms),
        ] {
            core.register(key, parameter)
                .expect("channel parameter registration");
        }

        Self {
            core,
            id,
            index: 0,
            group: None,
            is_animating: false,
            fader,
            blend_mode,
            crossfade_group,
            enabled,
            cue_active,
            selected,
            transition_ms,
            colors: ColorBuffer::new(num_points),
            scratch: ColorBuffer::new(num_points),
            clips: (0..MAX_SCENES).map(|_| None).collect(),
            effects: Vec::new(),
            kind,
        }
    }

    /// A leaf channel running the given pattern rotation.
    pub fn new_channel(
        id: ChannelId,
        label: &str,
        num_points: usize,
        patterns: Vec<Box<dyn Pattern>>,
        blend_labels: Vec<String>,
    ) -> Self {
        Self::new(
            id,
            label,
            num_points,
            blend_labels,
            BusKind::Patterns(PatternSlot {
                patterns,
                active: 0,
                pending: None,
                progress: 0.0,
            }),
        )
    }

    /// A group bus compositing sub-channels.
    pub fn new_group(
        id: ChannelId,
        label: &str,
        num_points: usize,
        blend_labels: Vec<String>,
    ) -> Self {
        Self::new(
            id,
            label,
            num_points,
            blend_labels,
            BusKind::Group {
                children: Vec::new(),
            },
        )
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn label(&self) -> &str {
        self.core.label()
    }

    pub fn path(&self) -> &str {
        self.core.path()
    }

    /// Position in the engine's channel list, rewritten after any
    /// structural change.
    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, BusKind::Group { .. })
    }

    /// The owning group, if this channel is grouped.
    pub fn group(&self) -> Option<ChannelId> {
        self.group
    }

    pub(crate) fn set_group(&mut self, group: Option<ChannelId>) {
        self.group = group;
    }

    /// Sub-channel ids in composite order; `None` for leaf channels.
    pub fn children(&self) -> Option<&[ChannelId]> {
        match &self.kind {
            BusKind::Group { children } => Some(children),
            BusKind::Patterns(_) => None,
        }
    }

    pub(crate) fn add_child(&mut self, id: ChannelId) {
        if let BusKind::Group { children } = &mut self.kind {
            children.push(id);
        }
    }

    pub(crate) fn remove_child(&mut self, id: ChannelId) {
        if let BusKind::Group { children } = &mut self.kind {
            children.retain(|&c| c != id);
        }
    }

    /// Whether this bus produced output this frame.
    pub fn is_animating(&self) -> bool {
        self.is_animating
    }

    /// This channel's rendered colors for the current frame.
    pub fn colors(&self) -> &[Color] {
        self.colors.as_slice()
    }

    pub(crate) fn colors_mut(&mut self) -> &mut ColorBuffer {
        &mut self.colors
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

    /// Install a clip in a scene slot, replacing any previous occupant.
    pub fn set_clip(&mut self, slot: usize, clip: Clip) {
        if slot < self.clips.len() {
            self.clips[slot] = Some(clip);
        }
    }

    pub(crate) fn clips_mut(&mut self) -> impl Iterator<Item = &mut Clip> {
        self.clips.iter_mut().flatten()
    }

    /// Number of patterns in the rotation; zero for groups.
    pub fn pattern_count(&self) -> usize {
        match &self.kind {
            BusKind::Patterns(slot) => slot.patterns.len(),
            BusKind::Group { .. } => 0,
        }
    }

    /// Index of the active pattern; groups have none.
    pub fn active_pattern(&self) -> Option<usize> {
        match &self.kind {
            BusKind::Patterns(slot) => Some(slot.active),
            BusKind::Group { .. } => None,
        }
    }

    pub fn add_pattern(&mut self, pattern: Box<dyn Pattern>) {
        if let BusKind::Patterns(slot) = &mut self.kind {
            slot.patterns.push(pattern);
        }
    }

    /// Replace the whole pattern rotation, resetting to the first pattern.
    pub fn set_patterns(&mut self, patterns: Vec<Box<dyn Pattern>>) {
        if let BusKind::Patterns(slot) = &mut self.kind {
            slot.patterns = patterns;
            slot.active = 0;
            slot.pending = None;
            slot.progress = 0.0;
        }
    }

    /// Begin a transition to the pattern at `index`. With a zero transition
    /// time the switch completes within the next frame.
    pub fn go_index(&mut self, index: usize) {
        if let BusKind::Patterns(slot) = &mut self.kind {
            if index >= slot.patterns.len() || index == slot.active {
                return;
            }
            slot.pending = Some(index);
            slot.progress = 0.0;
        }
    }

    pub fn go_next(&mut self) {
        if let BusKind::Patterns(slot) = &self.kind {
            if slot.patterns.len() > 1 {
                let next = (slot.active + 1) % slot.patterns.len();
                self.go_index(next);
            }
        }
    }

    pub fn go_prev(&mut self) {
        if let BusKind::Patterns(slot) = &self.kind {
            if slot.patterns.len() > 1 {
                let prev = (slot.active + slot.patterns.len() - 1) % slot.patterns.len();
                self.go_index(prev);
            }
        }
    }

    /// Transition to the first pattern with a matching label.
    pub fn go_pattern(&mut self, label: &str) -> bool {
        let target = match &self.kind {
            BusKind::Patterns(slot) => slot.patterns.iter().position(|p| p.label() == label),
            BusKind::Group { .. } => None,
        };
        match target {
            Some(index) => {
                self.go_index(index);
                true
            }
            None => false,
        }
    }

    /// One frame of channel work: advance clips, run the pattern rotation
    /// (mixing in the pending pattern mid-transition), then the effect
    /// chain.
    pub fn loop_frame(&mut self, delta_ms: f64) {
        for clip in self.clips.iter_mut().flatten() {
            clip.tick(delta_ms);
        }

        match &mut self.kind {
            BusKind::Group { children } => {
                // Compositing happens on the engine thread after all
                // channels have looped; here the group only animates.
                self.is_animating = !children.is_empty();
            }
            BusKind::Patterns(slot) => {
                if slot.patterns.is_empty() {
                    self.is_animating = false;
                } else {
                    {
                        let pattern = &mut slot.patterns[slot.active];
                        pattern.advance(delta_ms);
                        pattern.render(self.colors.as_mut_slice());
                    }
                    if let Some(pending) = slot.pending {
                        {
                            let pattern = &mut slot.patterns[pending];
                            pattern.advance(delta_ms);
                            pattern.render(self.scratch.as_mut_slice());
                        }
                        let transition = self.transition_ms.value();
                        slot.progress = if transition <= 0.0 {
                            1.0
                        } else {
                            (slot.progress + delta_ms / transition).min(1.0)
                        };
                        let progress = slot.progress;
                        for (c, s) in self
                            .colors
                            .as_mut_slice()
                            .iter_mut()
                            .zip(self.scratch.as_slice())
                        {
                            *c = lerp(*c, *s, progress);
                        }
                        if progress >= 1.0 {
                            slot.active = pending;
                            slot.pending = None;
                            slot.progress = 0.0;
                        }
                    }
                    self.is_animating = true;
                }
            }
        }

        for effect in &mut self.effects {
            effect.apply(self.colors.as_mut_slice(), delta_ms);
        }
    }

    /// Serialize this bus (sub-channels of a group are appended by the
    /// engine, which owns them).
    pub(crate) fn save_own(&self) -> Value {
        json!({
            "class": if self.is_group() { "group" } else { "channel" },
            "label": self.core.label(),
            "parameters": {
                "fader": self.fader.base(),
                "blendMode": self.blend_mode.selected_label(),
                "crossfadeGroup": serde_json::to_value(self.crossfade_group.get())
                    .unwrap_or(Value::Null),
                "enabled": self.enabled.is_on(),
                "cue": self.cue_active.is_on(),
                "selected": self.selected.is_on(),
                "transitionMs": self.transition_ms.value(),
            }
        })
    }

    /// Restore bus parameters. Unknown keys are ignored; missing keys keep
    /// their defaults.
    pub(crate) fn load_own(&mut self, obj: &Value) {
        if let Some(label) = obj.get("label").and_then(Value::as_str) {
            self.core.set_label(label);
        }
        let Some(parameters) = obj.get("parameters") else {
            return;
        };
        if let Some(fader) = parameters.get("fader").and_then(Value::as_f64) {
            self.fader.set(fader);
        }
        if let Some(blend) = parameters.get("blendMode").and_then(Value::as_str) {
            if !self.blend_mode.set_label(blend) {
                log::warn!("[CHANNEL] unknown blend mode '{blend}' in project, keeping default");
            }
        }
        if let Some(group) = parameters.get("crossfadeGroup") {
            match serde_json::from_value::<CrossfadeGroup>(group.clone()) {
                Ok(g) => self.crossfade_group.set(g),
                Err(_) => {
                    log::warn!("[CHANNEL] unknown crossfade group in project, keeping default")
                }
            }
        }
        if let Some(enabled) = parameters.get("enabled").and_then(Value::as_bool) {
            self.enabled.set(enabled);
        }
        if let Some(cue) = parameters.get("cue").and_then(Value::as_bool) {
            self.cue_active.set(cue);
        }
        if let Some(selected) = parameters.get("selected").and_then(Value::as_bool) {
            self.selected.set(selected);
        }
        if let Some(transition) = parameters.get("transitionMs").and_then(Value::as_f64) {
            self.transition_ms.set(transition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blend;
    use crate::pattern::SolidPattern;

    fn blend_labels() -> Vec<String> {
        blend::labels(&blend::channel_blends())
    }

    fn solid(color: Color) -> Box<dyn Pattern> {
        Box::new(SolidPattern::new(color))
    }

    #[test]
    fn test_channel_renders_active_pattern() {
        let mut bus = ChannelBus::new_channel(1, "Ch", 8, vec![solid(0xFFFF0000)], blend_labels());
        assert!(!bus.is_animating());
        bus.loop_frame(16.0);
        assert!(bus.is_animating());
        assert!(bus.colors().iter().all(|&c| c == 0xFFFF0000));
    }

    #[test]
    fn test_transition_promotes_pending() {
        let mut bus = ChannelBus::new_channel(
            1,
            "Ch",
            4,
            vec![solid(0xFFFF0000), solid(0xFF00FF00)],
            blend_labels(),
        );
        bus.transition_ms.set(100.0);
        bus.go_index(1);

        // Halfway: an even mix of both patterns
        bus.loop_frame(50.0);
        assert_eq!(bus.active_pattern(), Some(0));
        let mid = bus.colors()[0];
        assert_eq!(crate::types::red(mid), 127);
        assert_eq!(crate::types::green(mid), 127);

        // Completion: pending becomes active
        bus.loop_frame(50.0);
        assert_eq!(bus.active_pattern(), Some(1));
        bus.loop_frame(16.0);
        assert!(bus.colors().iter().all(|&c| c == 0xFF00FF00));
    }

    #[test]
    fn test_zero_transition_switches_within_one_frame() {
        let mut bus = ChannelBus::new_channel(
            1,
            "Ch",
            4,
            vec![solid(0xFFFF0000), solid(0xFF00FF00)],
            blend_labels(),
        );
        bus.go_index(1);
        bus.loop_frame(16.0);
        assert_eq!(bus.active_pattern(), Some(1));
        assert!(bus.colors().iter().all(|&c| c == 0xFF00FF00));
    }

    #[test]
    fn test_go_next_wraps() {
        let mut bus = ChannelBus::new_channel(
            1,
            "Ch",
            4,
            vec![solid(0xFF000001), solid(0xFF000002)],
            blend_labels(),
        );
        bus.go_next();
        bus.loop_frame(16.0);
        assert_eq!(bus.active_pattern(), Some(1));
        bus.go_next();
        bus.loop_frame(16.0);
        assert_eq!(bus.active_pattern(), Some(0));
    }

    #[test]
    fn test_effects_run_after_patterns() {
        let mut bus =
            ChannelBus::new_channel(1, "Ch", 4, vec![solid(0xFFC86432)], blend_labels());
        bus.add_effect(Box::new(crate::effect::DimEffect::new(0.5)));
        bus.loop_frame(16.0);
        assert!(bus.colors().iter().all(|&c| c == 0xFF643219));
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut bus = ChannelBus::new_channel(1, "Ch", 4, vec![solid(0xFF0000FF)], blend_labels());
        bus.fader.set(0.75);
        bus.blend_mode.set_label("Normal");
        bus.crossfade_group.set(CrossfadeGroup::A);
        bus.enabled.set(false);
        bus.transition_ms.set(250.0);

        let saved = bus.save_own();
        let mut restored =
            ChannelBus::new_channel(2, "Ch2", 4, vec![solid(0xFF0000FF)], blend_labels());
        restored.load_own(&saved);

        assert_eq!(restored.fader.base(), 0.75);
        assert_eq!(restored.blend_mode.selected_label(), "Normal");
        assert_eq!(restored.crossfade_group.get(), CrossfadeGroup::A);
        assert!(!restored.enabled.is_on());
        assert_eq!(restored.transition_ms.value(), 250.0);
    }

    #[test]
    fn test_group_tracks_children() {
        let mut group = ChannelBus::new_group(9, "Group", 4, blend_labels());
        assert!(group.is_group());
        group.add_child(1);
        group.add_child(2);
        assert_eq!(group.children(), Some(&[1, 2][..]));
        group.remove_child(1);
        assert_eq!(group.children(), Some(&[2][..]));
        group.loop_frame(16.0);
        assert!(group.is_animating());
    }
}
