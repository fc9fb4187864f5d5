//! The engine core
//!
//! Owns the channel list, the master channel, the mixer, the double buffer,
//! the output tree, and every top-level parameter. One call to [`Engine::run`]
//! produces one frame: advance time, pump input dispatchers, tick the
//! time-based collaborators, drain marshalled tasks, loop the channels,
//! blend the buses, apply master effects, publish, and dispatch output.
//!
//! The engine itself is single-threaded state; the threading modes
//! (render thread, channel workers, network output) are layered on top of
//! it by [`super::runtime::EngineHandle`], the channel worker handles, and
//! the network thread.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::{json, Map, Value};

use crate::blend::Blend;
use crate::component::ComponentCore;
use crate::error::{EngineError, EngineResult};
use crate::hooks::{
    Collaborator, Dispatch, EventEngine, InertCollaborator, InertEventEngine, LoopTask, Saveable,
};
use crate::output::{NetworkThread, Output};
use crate::parameter::{
    BooleanParameter, BoundedParameter, CompoundParameter, DiscreteParameter, MutableParameter,
    ObjectParameter, Parameter, Polarity,
};
use crate::pattern::{CursorPattern, Pattern};
use crate::types::{Color, MAX_SCENES};

use super::buffer::{FrameBuffers, RenderTarget};
use super::channel::{ChannelBus, ChannelCell, ChannelId};
use super::mixer::{MixInputs, Mixer};
use super::tasks::{Task, TaskQueue};

/// Per-frame timing counters, in nanoseconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct Timer {
    pub run_nanos: u64,
    pub channel_nanos: u64,
    pub effect_nanos: u64,
    pub input_nanos: u64,
    pub midi_nanos: u64,
    pub osc_nanos: u64,
    pub output_nanos: u64,
}

/// Which bus a focused clip lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipTarget {
    Channel(ChannelId),
    Master,
}

/// Observer of structural channel-list changes.
pub trait EngineListener: Send {
    fn channel_added(&mut self, _index: usize, _id: ChannelId) {}
    fn channel_removed(&mut self, _id: ChannelId) {}
    fn channel_moved(&mut self, _index: usize, _id: ChannelId) {}
}

pub struct Engine {
    core: ComponentCore,
    host_embedded: bool,
    num_points: usize,

    // Timing
    epoch: Instant,
    last_millis: Option<u64>,
    fixed_delta_ms: f64,
    paused: bool,
    has_started: bool,
    pub timer: Timer,
    log_timers: bool,

    // Channels
    channels: Vec<ChannelCell>,
    next_channel_id: ChannelId,
    pub master: super::master::MasterChannel,
    mixer: Mixer,
    target: RenderTarget,

    // Parameters
    pub crossfader: CompoundParameter,
    pub crossfader_blend_mode: ObjectParameter,
    pub cue_a: BooleanParameter,
    pub cue_b: BooleanParameter,
    pub speed: BoundedParameter,
    pub frames_per_second: BoundedParameter,
    pub focused_channel: DiscreteParameter,
    pub focused_clip: MutableParameter,
    focused_clip_target: Option<(ClipTarget, usize)>,
    scenes: Vec<BooleanParameter>,
    pub multithreaded: BooleanParameter,
    pub channel_multithreaded: BooleanParameter,
    pub network_multithreaded: BooleanParameter,

    // Task and listener plumbing
    tasks: Arc<TaskQueue>,
    loop_tasks: Vec<(String, Box<dyn LoopTask>)>,
    listeners: Vec<(u64, Box<dyn EngineListener>)>,
    next_listener_id: u64,

    // Collaborators
    modulation: Box<dyn Collaborator>,
    tempo: Box<dyn Collaborator>,
    audio: Box<dyn Collaborator>,
    palette: Box<dyn Collaborator>,
    midi: Box<dyn EventEngine>,
    osc: Box<dyn EventEngine>,
    input_dispatch: Option<Box<dyn Dispatch>>,
    components: Vec<(String, Box<dyn Saveable>)>,

    // Output
    output: Arc<Mutex<Output>>,
    network: NetworkThread,

    // Shared with the runtime layer
    engine_thread_running: Arc<AtomicBool>,
    frame_rate: Arc<AtomicU32>,
}

impl Engine {
    /// Build a standalone engine driving `num_points` color points.
    pub fn new(num_points: usize) -> Self {
        Self::build(num_points, false)
    }

    /// Build an engine embedded in a host draw loop. Thread control happens
    /// through `on_draw` reconciliation; `start`/`stop` are rejected.
    pub fn embedded(num_points: usize) -> Self {
        Self::build(num_points, true)
    }

    fn build(num_points: usize, host_embedded: bool) -> Self {
        // Construction order matters: buffers, then blends, then modulation,
        // then the master channel, then the cue/scene dispatch, then the
        // midi/audio/osc slots. Later pieces assume the earlier ones exist.
        let mut core = ComponentCore::new("Engine", "/lx/engine");

        let target = RenderTarget::new(num_points);
        log::debug!("[ENGINE] init: buffers ({num_points} points)");

        let mixer = Mixer::new(num_points);
        let mut crossfader_blend_mode =
            ObjectParameter::new("Crossfader Blend", mixer.crossfader_blend_labels())
                .with_description("Sets the blend mode used for the master crossfader");
        log::debug!("[ENGINE] init: blends");

        let modulation: Box<dyn Collaborator> = Box::<InertCollaborator>::default();
        log::debug!("[ENGINE] init: modulation");

        let master = super::master::MasterChannel::new();
        log::debug!("[ENGINE] init: master channel");

        let mut crossfader = CompoundParameter::new("Crossfader", 0.5, 0.0, 1.0)
            .with_description("Applies blending between output groups A and B")
            .with_polarity(Polarity::Bipolar);
        let mut cue_a = BooleanParameter::new("Cue-A", false)
            .with_description("Enables cue preview of crossfade group A");
        let mut cue_b = BooleanParameter::new("Cue-B", false)
            .with_description("Enables cue preview of crossfade group B");
        let mut speed = BoundedParameter::new("Speed", 1.0, 0.0, 2.0)
            .with_description("Overall speed adjustment to the entire engine");
        let mut frames_per_second = BoundedParameter::new("FPS", 60.0, 0.0, 300.0)
            .with_description("Number of frames per second the engine runs at");
        let mut focused_channel = DiscreteParameter::new("Channel", 1)
            .with_description("Which channel is currently focused in the UI");
        let mut multithreaded = BooleanParameter::new("Threaded", false)
            .with_description("Whether the engine and UI are on separate threads");
        let mut channel_multithreaded = BooleanParameter::new("Channel Threaded", false)
            .with_description("Whether the engine is multi-threaded per channel");
        let mut network_multithreaded = BooleanParameter::new("Network Threaded", false)
            .with_description("Whether the network output is on a separate thread");

        let mut scenes: Vec<BooleanParameter> = (0..MAX_SCENES)
            .map(|i| {
                BooleanParameter::new(&format!("Scene-{}", i + 1), false)
                    .with_description("Fires the clips in this scene slot")
            })
            .collect();
        log::debug!("[ENGINE] init: cue and scenes");

        for (key, parameter) in [
            ("crossfader", &mut crossfader as &mut dyn Parameter),
            ("crossfaderBlendMode", &mut crossfader_blend_mode),
            ("speed", &mut speed),
            ("focusedChannel", &mut focused_channel),
            ("cueA", &mut cue_a),
            ("cueB", &mut cue_b),
            ("multithreaded", &mut multithreaded),
            ("channelMultithreaded", &mut channel_multithreaded),
            ("networkMultithreaded", &mut network_multithreaded),
            ("framesPerSecond", &mut frames_per_second),
        ] {
            core.register(key, parameter)
                .expect("engine parameter registration");
        }
        for (i, scene) in scenes.iter_mut().enumerate() {
            core.register(&format!("scene-{}", i + 1), scene)
                .expect("engine parameter registration");
        }

        let output = Arc::new(Mutex::new(Output::group("Output", num_points)));
        log::debug!("[ENGINE] init: output");

        let midi: Box<dyn EventEngine> = Box::<InertEventEngine>::default();
        log::debug!("[ENGINE] init: midi");
        let audio: Box<dyn Collaborator> = Box::<InertCollaborator>::default();
        log::debug!("[ENGINE] init: audio");
        let osc: Box<dyn EventEngine> = Box::<InertEventEngine>::default();
        log::debug!("[ENGINE] init: osc");

        Self {
            core,
            host_embedded,
            num_points,
            epoch: Instant::now(),
            last_millis: None,
            fixed_delta_ms: 0.0,
            paused: false,
            has_started: false,
            timer: Timer::default(),
            log_timers: false,
            channels: Vec::new(),
            next_channel_id: 1,
            master,
            mixer,
            target,
            crossfader,
            crossfader_blend_mode,
            cue_a,
            cue_b,
            speed,
            frames_per_second,
            focused_channel,
            focused_clip: MutableParameter::new("Focused Clip"),
            focused_clip_target: None,
            scenes,
            multithreaded,
            channel_multithreaded,
            network_multithreaded,
            tasks: Arc::new(TaskQueue::new()),
            loop_tasks: Vec::new(),
            listeners: Vec::new(),
            next_listener_id: 0,
            modulation,
            tempo: Box::<InertCollaborator>::default(),
            audio,
            palette: Box::<InertCollaborator>::default(),
            midi,
            osc,
            input_dispatch: None,
            components: Vec::new(),
            output,
            network: NetworkThread::new(),
            engine_thread_running: Arc::new(AtomicBool::new(false)),
            frame_rate: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn num_points(&self) -> usize {
        self.num_points
    }

    pub fn path(&self) -> &str {
        self.core.path()
    }

    pub fn is_host_embedded(&self) -> bool {
        self.host_embedded
    }

    /// Measured frames per second while the render thread runs.
    pub fn frame_rate(&self) -> f32 {
        f32::from_bits(self.frame_rate.load(Ordering::Acquire))
    }

    /// Deterministic animation time for offline rendering; 0 restores
    /// wall-clock deltas.
    pub fn set_fixed_delta_ms(&mut self, delta_ms: f64) {
        self.fixed_delta_ms = delta_ms;
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Dump the frame timers to the log after the next frame.
    pub fn log_timers(&mut self) {
        self.log_timers = true;
    }

    // ─────────────────────────────────────────────────────────────
    // Collaborators and hooks
    // ─────────────────────────────────────────────────────────────

    pub fn set_tempo(&mut self, tempo: Box<dyn Collaborator>) {
        self.tempo = tempo;
    }

    pub fn set_audio(&mut self, audio: Box<dyn Collaborator>) {
        self.audio = audio;
    }

    pub fn set_modulation(&mut self, modulation: Box<dyn Collaborator>) {
        self.modulation = modulation;
    }

    pub fn set_palette(&mut self, palette: Box<dyn Collaborator>) {
        self.palette = palette;
    }

    pub fn set_midi(&mut self, midi: Box<dyn EventEngine>) {
        self.midi = midi;
    }

    pub fn set_osc(&mut self, osc: Box<dyn EventEngine>) {
        self.osc = osc;
    }

    pub fn set_input_dispatch(&mut self, dispatch: Option<Box<dyn Dispatch>>) {
        self.input_dispatch = dispatch;
    }

    /// Register a component for persistence under a unique key.
    pub fn register_component(&mut self, key: &str, component: Box<dyn Saveable>) {
        self.components.push((key.to_string(), component));
    }

    /// Enqueue a one-shot task onto the engine thread from any thread.
    pub fn add_task(&self, task: Task) {
        self.tasks.push(task);
    }

    /// The shared task queue, for handing to foreign threads.
    pub fn tasks(&self) -> Arc<TaskQueue> {
        Arc::clone(&self.tasks)
    }

    /// Register a per-frame hook under a unique key.
    pub fn add_loop_task(&mut self, key: &str, task: Box<dyn LoopTask>) -> EngineResult<()> {
        if self.loop_tasks.iter().any(|(k, _)| k == key) {
            return Err(EngineError::DuplicateLoopTask(key.to_string()));
        }
        self.loop_tasks.push((key.to_string(), task));
        Ok(())
    }

    pub fn remove_loop_task(&mut self, key: &str) {
        self.loop_tasks.retain(|(k, _)| k != key);
    }

    pub fn add_listener(&mut self, listener: Box<dyn EngineListener>) -> u64 {
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn remove_listener(&mut self, id: u64) {
        self.listeners.retain(|(lid, _)| *lid != id);
    }

    /// Replace the channel blend set. Only allowed before the first frame.
    pub fn set_channel_blends(&mut self, blends: Vec<Box<dyn Blend>>) -> EngineResult<()> {
        if self.has_started {
            return Err(EngineError::EngineStarted);
        }
        self.mixer.set_channel_blends(blends);
        let labels = self.mixer.channel_blend_labels();
        for cell in &self.channels {
            cell.bus
                .lock()
                .unwrap()
                .blend_mode
                .set_options(labels.clone());
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Output
    // ─────────────────────────────────────────────────────────────

    /// Add a sink under the root output; it receives every published frame.
    pub fn add_output(&mut self, output: Output) {
        self.output.lock().unwrap().add_child(output);
    }

    /// The root of the output tree.
    pub fn output(&self) -> Arc<Mutex<Output>> {
        Arc::clone(&self.output)
    }

    /// The published frame pair, for UI threads.
    pub fn frames(&self) -> Arc<FrameBuffers> {
        self.target.shared()
    }

    /// Direct access to the current frame (cue frame while cueing).
    /// Single-threaded hosts only.
    pub fn ui_buffer(&self) -> &[Color] {
        self.target.ui_buffer()
    }

    // ─────────────────────────────────────────────────────────────
    // Channel management
    // ─────────────────────────────────────────────────────────────

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, index: usize) -> Option<Arc<Mutex<ChannelBus>>> {
        self.channels.get(index).map(|c| Arc::clone(&c.bus))
    }

    pub fn channel_by_id(&self, id: ChannelId) -> Option<Arc<Mutex<ChannelBus>>> {
        self.channels
            .iter()
            .find(|c| c.id == id)
            .map(|c| Arc::clone(&c.bus))
    }

    pub fn channel_by_label(&self, label: &str) -> Option<Arc<Mutex<ChannelBus>>> {
        self.channels
            .iter()
            .find(|c| c.bus.lock().unwrap().label() == label)
            .map(|c| Arc::clone(&c.bus))
    }

    /// The first leaf channel, target of the pattern conveniences below.
    pub fn default_channel(&self) -> Option<Arc<Mutex<ChannelBus>>> {
        self.channels
            .iter()
            .find(|c| !c.bus.lock().unwrap().is_group())
            .map(|c| Arc::clone(&c.bus))
    }

    pub fn set_patterns(&mut self, patterns: Vec<Box<dyn Pattern>>) {
        if let Some(channel) = self.default_channel() {
            channel.lock().unwrap().set_patterns(patterns);
        }
    }

    pub fn go_next(&mut self) {
        if let Some(channel) = self.default_channel() {
            channel.lock().unwrap().go_next();
        }
    }

    pub fn go_prev(&mut self) {
        if let Some(channel) = self.default_channel() {
            channel.lock().unwrap().go_prev();
        }
    }

    pub fn go_index(&mut self, index: usize) {
        if let Some(channel) = self.default_channel() {
            channel.lock().unwrap().go_index(index);
        }
    }

    fn index_of(&self, id: ChannelId) -> Option<usize> {
        self.channels.iter().position(|c| c.id == id)
    }

    fn reindex_channels(&mut self) {
        for (i, cell) in self.channels.iter().enumerate() {
            cell.bus.lock().unwrap().set_index(i);
        }
    }

    fn notify_added(&mut self, index: usize, id: ChannelId) {
        for (_, listener) in &mut self.listeners {
            listener.channel_added(index, id);
        }
    }

    fn notify_removed(&mut self, id: ChannelId) {
        for (_, listener) in &mut self.listeners {
            listener.channel_removed(id);
        }
    }

    fn notify_moved(&mut self, index: usize, id: ChannelId) {
        for (_, listener) in &mut self.listeners {
            listener.channel_moved(index, id);
        }
    }

    fn insert_cell(&mut self, cell: ChannelCell, index: usize) {
        let id = cell.id;
        self.channels.insert(index, cell);
        self.reindex_channels();
        self.focused_channel.set_range(self.channels.len() + 1);
        self.notify_added(index, id);
    }

    /// Add a channel running the built-in cursor pattern.
    pub fn add_channel(&mut self) -> ChannelId {
        self.add_channel_with_patterns(vec![Box::new(CursorPattern::new())])
    }

    /// Add a channel with an explicit pattern rotation.
    pub fn add_channel_with_patterns(&mut self, patterns: Vec<Box<dyn Pattern>>) -> ChannelId {
        let id = self.next_channel_id;
        self.next_channel_id += 1;
        let bus = ChannelBus::new_channel(
            id,
            &format!("Channel-{id}"),
            self.num_points,
            patterns,
            self.mixer.channel_blend_labels(),
        );
        self.insert_cell(ChannelCell::new(bus), self.channels.len());
        id
    }

    /// Add an empty group at the end of the channel list.
    pub fn add_empty_group(&mut self) -> ChannelId {
        let id = self.next_channel_id;
        self.next_channel_id += 1;
        let bus = ChannelBus::new_group(
            id,
            &format!("Group-{id}"),
            self.num_points,
            self.mixer.channel_blend_labels(),
        );
        self.insert_cell(ChannelCell::new(bus), self.channels.len());
        id
    }

    /// Gather the selected ungrouped channels into a new group at the first
    /// selected position. Returns `None` when nothing is selected.
    pub fn add_group(&mut self) -> Option<ChannelId> {
        let selected: Vec<usize> = self
            .channels
            .iter()
            .enumerate()
            .filter_map(|(i, cell)| {
                let bus = cell.bus.lock().unwrap();
                (!bus.is_group() && bus.selected.is_on() && bus.group().is_none()).then_some(i)
            })
            .collect();
        if selected.is_empty() {
            return None;
        }
        let group_index = selected[0];

        let mut pulled: Vec<ChannelCell> = Vec::with_capacity(selected.len());
        for &i in selected.iter().rev() {
            pulled.push(self.channels.remove(i));
        }
        pulled.reverse();

        let gid = self.next_channel_id;
        self.next_channel_id += 1;
        let mut group = ChannelBus::new_group(
            gid,
            &format!("Group-{gid}"),
            self.num_points,
            self.mixer.channel_blend_labels(),
        );
        let moved: Vec<ChannelId> = pulled.iter().map(|c| c.id).collect();
        for cell in &pulled {
            group.add_child(cell.id);
            cell.bus.lock().unwrap().set_group(Some(gid));
        }

        self.channels.insert(group_index, ChannelCell::new(group));
        for (k, cell) in pulled.into_iter().enumerate() {
            self.channels.insert(group_index + 1 + k, cell);
        }
        self.reindex_channels();
        self.focused_channel.set_range(self.channels.len() + 1);
        self.notify_added(group_index, gid);
        for id in moved {
            let index = self.index_of(id).unwrap_or(0);
            self.notify_moved(index, id);
        }

        if self.focused_channel.index() == group_index {
            self.focused_channel.bang();
        } else {
            self.focused_channel.set_index(group_index);
        }
        let _ = self.select_channel(gid, false);
        Some(gid)
    }

    /// Remove a channel; a group takes its sub-channels with it.
    pub fn remove_channel(&mut self, id: ChannelId) -> EngineResult<()> {
        let Some(pos) = self.index_of(id) else {
            return Err(EngineError::UnknownChannel(id));
        };

        let child_ids: Vec<ChannelId> = {
            let bus = self.channels[pos].bus.lock().unwrap();
            bus.children().map(<[_]>::to_vec).unwrap_or_default()
        };
        for child in child_ids {
            let _ = self.remove_channel(child);
        }

        let Some(pos) = self.index_of(id) else {
            return Err(EngineError::UnknownChannel(id));
        };
        let group_id = self.channels[pos].bus.lock().unwrap().group();
        if let Some(gid) = group_id {
            if let Some(gpos) = self.index_of(gid) {
                self.channels[gpos].bus.lock().unwrap().remove_child(id);
            }
        }

        // Dropping the cell interrupts and joins its worker thread
        let cell = self.channels.remove(pos);
        drop(cell);

        self.reindex_channels();
        let mut notified = false;
        if self.focused_channel.index() > self.channels.len() {
            self.focused_channel.decrement();
            notified = true;
        }
        self.focused_channel.set_range(self.channels.len() + 1);
        if !notified {
            self.focused_channel.bang();
        }

        if let Some((ClipTarget::Channel(cid), _)) = self.focused_clip_target {
            if cid == id {
                self.clear_focused_clip();
            }
        }
        self.notify_removed(id);
        Ok(())
    }

    /// Remove every selected channel (grouped channels only go with their
    /// group).
    pub fn remove_selected_channels(&mut self) {
        let to_remove: Vec<ChannelId> = self
            .channels
            .iter()
            .filter_map(|cell| {
                let bus = cell.bus.lock().unwrap();
                (bus.selected.is_on() && (bus.group().is_none() || bus.is_group()))
                    .then_some(cell.id)
            })
            .collect();
        for id in to_remove {
            let _ = self.remove_channel(id);
        }
    }

    /// Move a channel to a new index. Grouped channels may only move within
    /// their group; a moving group carries its sub-channels along.
    pub fn move_channel(&mut self, id: ChannelId, index: usize) -> EngineResult<()> {
        let Some(pos) = self.index_of(id) else {
            return Err(EngineError::UnknownChannel(id));
        };
        let index = index.min(self.channels.len().saturating_sub(1));

        {
            let bus = self.channels[pos].bus.lock().unwrap();
            if let Some(gid) = bus.group() {
                if let Some(gpos) = self.index_of(gid) {
                    let gsize = self.channels[gpos]
                        .bus
                        .lock()
                        .unwrap()
                        .children()
                        .map(<[_]>::len)
                        .unwrap_or(0);
                    if index <= gpos || index > gpos + gsize {
                        return Ok(());
                    }
                }
            }
        }

        let focused = pos == self.focused_channel.index();
        let cell = self.channels.remove(pos);
        self.channels.insert(index, cell);

        let child_ids: Vec<ChannelId> = self.channels[index]
            .bus
            .lock()
            .unwrap()
            .children()
            .map(<[_]>::to_vec)
            .unwrap_or_default();
        for (k, cid) in child_ids.into_iter().enumerate() {
            if let Some(cpos) = self.index_of(cid) {
                let child = self.channels.remove(cpos);
                let gpos = self.index_of(id).unwrap_or(0);
                let at = (gpos + 1 + k).min(self.channels.len());
                self.channels.insert(at, child);
            }
        }

        self.reindex_channels();
        if focused {
            self.focused_channel.set_index(index);
        }
        self.notify_moved(index, id);
        Ok(())
    }

    /// Pull a channel out of its group, placing it right after the group
    /// block.
    pub fn ungroup(&mut self, id: ChannelId) -> EngineResult<()> {
        let Some(pos) = self.index_of(id) else {
            return Err(EngineError::UnknownChannel(id));
        };
        let Some(gid) = self.channels[pos].bus.lock().unwrap().group() else {
            return Ok(());
        };
        let focused = self.focused_channel.index() == pos;

        if let Some(gpos) = self.index_of(gid) {
            self.channels[gpos].bus.lock().unwrap().remove_child(id);
        }
        self.channels[pos].bus.lock().unwrap().set_group(None);
        let cell = self.channels.remove(pos);

        let target = match self.index_of(gid) {
            Some(gpos) => {
                let gsize = self.channels[gpos]
                    .bus
                    .lock()
                    .unwrap()
                    .children()
                    .map(<[_]>::len)
                    .unwrap_or(0);
                (gpos + gsize + 1).min(self.channels.len())
            }
            None => self.channels.len(),
        };
        self.channels.insert(target, cell);
        self.reindex_channels();
        self.notify_moved(target, id);
        if focused {
            self.focused_channel.set_index(target);
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Focus, selection, cue
    // ─────────────────────────────────────────────────────────────

    /// Focus a channel by index; `channel_count` focuses the master.
    pub fn set_focused_channel(&mut self, index: usize) {
        self.focused_channel.set_index(index);
        self.revalidate_focused_clip();
    }

    pub fn focused_is_master(&self) -> bool {
        self.focused_channel.index() == self.channels.len()
    }

    pub fn set_focused_clip(&mut self, target: ClipTarget, slot: usize) {
        if self.focused_clip_target != Some((target, slot)) {
            self.focused_clip_target = Some((target, slot));
            self.focused_clip.bang();
        }
    }

    pub fn focused_clip_target(&self) -> Option<(ClipTarget, usize)> {
        self.focused_clip_target
    }

    pub fn clear_focused_clip(&mut self) {
        if self.focused_clip_target.is_some() {
            self.focused_clip_target = None;
            self.focused_clip.bang();
        }
    }

    /// Drop the focused clip when focus moved off its bus.
    fn revalidate_focused_clip(&mut self) {
        if let Some((target, _)) = self.focused_clip_target {
            let still_focused = match target {
                ClipTarget::Master => self.focused_is_master(),
                ClipTarget::Channel(id) => self.index_of(id) == Some(self.focused_channel.index()),
            };
            if !still_focused {
                self.clear_focused_clip();
            }
        }
    }

    /// Select a channel; without `multiple`, everything else (except the
    /// channel's own sub-channels) is deselected.
    pub fn select_channel(&mut self, id: ChannelId, multiple: bool) -> EngineResult<()> {
        let Some(pos) = self.index_of(id) else {
            return Err(EngineError::UnknownChannel(id));
        };
        let multiple = multiple && !self.master.selected.is_on();
        if !multiple {
            for cell in &self.channels {
                if cell.id == id {
                    continue;
                }
                let mut bus = cell.bus.lock().unwrap();
                if bus.group() != Some(id) {
                    bus.selected.set(false);
                }
            }
            self.master.selected.set(false);
        }
        self.channels[pos].bus.lock().unwrap().selected.set(true);
        Ok(())
    }

    pub fn select_master(&mut self) {
        for cell in &self.channels {
            cell.bus.lock().unwrap().selected.set(false);
        }
        self.master.selected.set(true);
    }

    /// Deselect a channel, but never the last selected bus.
    pub fn deselect_channel(&mut self, id: ChannelId) -> EngineResult<()> {
        let Some(pos) = self.index_of(id) else {
            return Err(EngineError::UnknownChannel(id));
        };
        let other_selected = self.master.selected.is_on()
            || self
                .channels
                .iter()
                .any(|c| c.id != id && c.bus.lock().unwrap().selected.is_on());
        if other_selected {
            self.channels[pos].bus.lock().unwrap().selected.set(false);
        }
        Ok(())
    }

    /// Enable cue preview of crossfade group A. Mutually exclusive with
    /// cue-B and per-channel cues; the losing cues are reset here, after the
    /// triggering mutation, in deterministic order.
    pub fn set_cue_a(&mut self, on: bool) {
        self.cue_a.set(on);
        if on {
            self.cue_b.set(false);
            for cell in &self.channels {
                cell.bus.lock().unwrap().cue_active.set(false);
            }
        }
    }

    /// Enable cue preview of crossfade group B; see [`Engine::set_cue_a`].
    pub fn set_cue_b(&mut self, on: bool) {
        self.cue_b.set(on);
        if on {
            self.cue_a.set(false);
            for cell in &self.channels {
                cell.bus.lock().unwrap().cue_active.set(false);
            }
        }
    }

    /// Toggle a channel into cue preview, clearing the group cues.
    pub fn set_channel_cue(&mut self, id: ChannelId, on: bool) -> EngineResult<()> {
        let channel = self
            .channel_by_id(id)
            .ok_or(EngineError::UnknownChannel(id))?;
        channel.lock().unwrap().cue_active.set(on);
        if on {
            self.cue_a.set(false);
            self.cue_b.set(false);
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Scenes and clips
    // ─────────────────────────────────────────────────────────────

    pub fn scene(&self, index: usize) -> Option<&BooleanParameter> {
        self.scenes.get(index)
    }

    /// Edge-triggered scene button: setting true launches the scene and
    /// resets the button.
    pub fn set_scene(&mut self, index: usize, on: bool) {
        if index >= self.scenes.len() {
            return;
        }
        self.scenes[index].set(on);
        if on {
            self.launch_scene(index);
            self.scenes[index].set(false);
        }
    }

    /// Trigger the clip in slot `index` on every channel and the master.
    pub fn launch_scene(&mut self, index: usize) {
        for cell in &self.channels {
            if let Some(clip) = cell.bus.lock().unwrap().clip_mut(index) {
                clip.trigger();
            }
        }
        if let Some(clip) = self.master.clip_mut(index) {
            clip.trigger();
        }
    }

    /// Stop every running clip.
    pub fn stop_clips(&mut self) {
        for cell in &self.channels {
            for clip in cell.bus.lock().unwrap().clips_mut() {
                clip.stop();
            }
        }
        for clip in self.master.clips_mut() {
            clip.stop();
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Threading support
    // ─────────────────────────────────────────────────────────────

    pub(crate) fn engine_thread_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.engine_thread_running)
    }

    pub(crate) fn frame_rate_atomic(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.frame_rate)
    }

    /// Synchronize and flip the double buffers so a consumer thread about
    /// to come up reads a fully written frame.
    pub(crate) fn sync_buffers(&mut self) {
        self.target.sync();
        let cue_on = self.cue_a.is_on() || self.cue_b.is_on();
        self.target.flip(cue_on);
    }

    pub fn set_channel_multithreaded(&mut self, on: bool) {
        self.channel_multithreaded.set(on);
    }

    /// Enable or disable the network output thread. Enabling syncs the
    /// double buffer and starts the worker; the worker is a one-way latch
    /// and keeps running until the engine drops.
    pub fn set_network_multithreaded(&mut self, on: bool) {
        self.network_multithreaded.set(on);
        if on {
            self.target.sync();
            self.start_network();
        }
    }

    fn start_network(&mut self) {
        if !self.network.is_started() {
            self.network.start(
                self.target.shared(),
                Arc::clone(&self.output),
                self.epoch,
                self.num_points,
            );
        }
    }

    /// Frames per second the network output thread is achieving.
    pub fn network_frame_rate(&self) -> f32 {
        self.network.frame_rate()
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    // ─────────────────────────────────────────────────────────────
    // The frame
    // ─────────────────────────────────────────────────────────────

    /// Advance one frame.
    pub fn run(&mut self) {
        self.has_started = true;
        let run_start = Instant::now();

        // Elapsed time; the first frame is an arbitrary 16ms (~60fps)
        let now = self.now_millis();
        let last = self.last_millis.unwrap_or_else(|| now.saturating_sub(16));
        let mut delta_ms = now.saturating_sub(last) as f64;
        self.last_millis = Some(now);

        // Deterministic deltas for offline rendering
        if self.fixed_delta_ms > 0.0 {
            delta_ms = self.fixed_delta_ms;
        }

        if self.paused {
            self.timer.channel_nanos = 0;
            self.timer.effect_nanos = 0;
            self.timer.run_nanos = run_start.elapsed().as_nanos() as u64;
            return;
        }

        // Pump the input dispatchers
        let midi_start = Instant::now();
        self.midi.dispatch();
        self.timer.midi_nanos = midi_start.elapsed().as_nanos() as u64;

        let osc_start = Instant::now();
        self.osc.dispatch();
        self.timer.osc_nanos = osc_start.elapsed().as_nanos() as u64;

        match &mut self.input_dispatch {
            Some(input) => {
                let input_start = Instant::now();
                input.dispatch();
                self.timer.input_nanos = input_start.elapsed().as_nanos() as u64;
            }
            None => self.timer.input_nanos = 0,
        }

        // Tempo and audio follow wall-clock time
        self.tempo.tick(delta_ms);
        self.audio.tick(delta_ms);

        // Everything after this runs on scaled time
        let delta_ms = delta_ms * self.speed.value();

        self.modulation.tick(delta_ms);
        self.palette.tick(delta_ms);
        for (_, task) in &mut self.loop_tasks {
            task.tick(delta_ms);
        }

        // Drain marshalled tasks; anything they enqueue waits a frame
        for task in self.tasks.drain() {
            task(self);
        }

        // Channel pipeline
        let channel_start = Instant::now();
        if self.channel_multithreaded.is_on() {
            for cell in &mut self.channels {
                cell.request_work(delta_ms);
            }
            // Workers complete in any order; collect them all before mixing
            for cell in &self.channels {
                cell.worker.collect();
            }
        } else {
            for cell in &self.channels {
                cell.bus.lock().unwrap().loop_frame(delta_ms);
            }
        }
        self.master.loop_frame(delta_ms);
        self.timer.channel_nanos = channel_start.elapsed().as_nanos() as u64;

        // Groups composite their children before the blend-down
        self.mixer.composite_groups(&self.channels);

        // Blend everything onto the buses
        let inputs = MixInputs {
            crossfade: self.crossfader.value(),
            crossfader_blend: self.crossfader_blend_mode.index(),
            cue_a: self.cue_a.is_on(),
            cue_b: self.cue_b.is_on(),
        };
        let (main, cue) = self.target.render_pair_mut();
        let cue_on = self.mixer.blend(&self.channels, inputs, main, cue);

        // Master effects over the mixed output
        let effect_start = Instant::now();
        for effect in self.master.effects_mut() {
            effect.apply(self.target.main_mut().as_mut_slice(), delta_ms);
        }
        self.timer.effect_nanos = effect_start.elapsed().as_nanos() as u64;

        // Publish, then dispatch output
        let network_on = self.network_multithreaded.is_on();
        let flipped = self.engine_thread_running.load(Ordering::Acquire) || network_on;
        if flipped {
            self.target.flip(cue_on);
        } else {
            self.target.set_cue_on(cue_on);
        }

        if network_on {
            self.start_network();
            self.network.notify();
        } else {
            let output_start = Instant::now();
            let mut output = self.output.lock().unwrap();
            if flipped {
                self.target
                    .shared()
                    .with_main(|main| output.send(main, now));
            } else {
                output.send(self.target.main().as_slice(), now);
            }
            self.timer.output_nanos = output_start.elapsed().as_nanos() as u64;
        }

        self.timer.run_nanos = run_start.elapsed().as_nanos() as u64;

        if self.log_timers {
            let t = &self.timer;
            log::debug!(
                "[ENGINE] run {}us channels {}us effects {}us output {}us",
                t.run_nanos / 1_000,
                t.channel_nanos / 1_000,
                t.effect_nanos / 1_000,
                t.output_nanos / 1_000,
            );
            self.log_timers = false;
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────

    /// Serialize the whole engine into a project tree.
    pub fn save(&self) -> Value {
        let mut channels = Vec::new();
        for cell in &self.channels {
            let bus = cell.bus.lock().unwrap();
            if bus.group().is_some() {
                // Sub-channels save nested under their group
                continue;
            }
            let mut element = bus.save_own();
            if let Some(child_ids) = bus.children() {
                let children: Vec<Value> = child_ids
                    .iter()
                    .filter_map(|cid| {
                        self.channels
                            .iter()
                            .find(|c| c.id == *cid)
                            .map(|c| c.bus.lock().unwrap().save_own())
                    })
                    .collect();
                element["channels"] = Value::Array(children);
            }
            channels.push(element);
        }

        let mut scene_map = Map::new();
        for (i, scene) in self.scenes.iter().enumerate() {
            scene_map.insert(format!("scene-{}", i + 1), Value::Bool(scene.is_on()));
        }

        let mut components = Map::new();
        for (key, component) in &self.components {
            components.insert(key.clone(), component.save());
        }

        let mut parameters = json!({
            "crossfader": self.crossfader.base(),
            "crossfaderBlendMode": self.crossfader_blend_mode.selected_label(),
            "speed": self.speed.value(),
            "focusedChannel": self.focused_channel.index(),
            "cueA": self.cue_a.is_on(),
            "cueB": self.cue_b.is_on(),
            "multithreaded": self.multithreaded.is_on(),
            "channelMultithreaded": self.channel_multithreaded.is_on(),
            "networkMultithreaded": self.network_multithreaded.is_on(),
            "framesPerSecond": self.frames_per_second.value(),
        });
        if let Some(map) = parameters.as_object_mut() {
            map.extend(scene_map);
        }

        json!({
            "parameters": parameters,
            "palette": self.palette.save(),
            "channels": channels,
            "master": self.master.save(),
            "tempo": self.tempo.save(),
            "audio": self.audio.save(),
            "output": self.output.lock().unwrap().save(),
            "components": Value::Object(components),
            "modulation": self.modulation.save(),
            "osc": self.osc.save(),
            "midi": self.midi.save(),
        })
    }

    /// Restore the engine from a project tree. Unknown keys are ignored;
    /// missing sections keep defaults; a missing channel list produces one
    /// default channel at full fader.
    pub fn load(&mut self, obj: &Value) {
        // Clear modulation state before tearing down channels
        self.modulation.load(&Value::Null);

        let ids: Vec<ChannelId> = self.channels.iter().map(|c| c.id).rev().collect();
        for id in ids {
            let _ = self.remove_channel(id);
        }

        match obj.get("channels").and_then(Value::as_array) {
            Some(elements) => {
                for element in elements {
                    self.load_channel_element(element);
                }
            }
            None => {
                let id = self.add_channel();
                if let Some(channel) = self.channel_by_id(id) {
                    channel.lock().unwrap().fader.set(1.0);
                }
            }
        }

        if let Some(master) = obj.get("master") {
            self.master.load(master);
        }
        if let Some(palette) = obj.get("palette") {
            self.palette.load(palette);
        }
        if let Some(tempo) = obj.get("tempo") {
            self.tempo.load(tempo);
        }
        if let Some(audio) = obj.get("audio") {
            self.audio.load(audio);
        }
        if let Some(components) = obj.get("components") {
            for (key, component) in &mut self.components {
                if let Some(sub) = components.get(key.as_str()) {
                    component.load(sub);
                }
            }
        }
        if let Some(output) = obj.get("output") {
            self.output.lock().unwrap().load(output);
        }
        self.modulation
            .load(obj.get("modulation").unwrap_or(&Value::Null));
        if let Some(osc) = obj.get("osc") {
            self.osc.load(osc);
        }
        self.midi.load(obj.get("midi").unwrap_or(&Value::Null));

        if let Some(parameters) = obj.get("parameters") {
            self.load_parameters(parameters);
        }
    }

    fn load_channel_element(&mut self, element: &Value) {
        let Some(class) = element.get("class").and_then(Value::as_str) else {
            log::warn!("[ENGINE] channel entry missing 'class' key, skipping");
            return;
        };
        match class {
            "group" => {
                let gid = self.add_empty_group();
                if let Some(group) = self.channel_by_id(gid) {
                    group.lock().unwrap().load_own(element);
                }
                if let Some(children) = element.get("channels").and_then(Value::as_array) {
                    for child in children {
                        let Some(child_class) = child.get("class").and_then(Value::as_str)
                        else {
                            log::warn!("[ENGINE] channel entry missing 'class' key, skipping");
                            continue;
                        };
                        if child_class != "channel" {
                            log::warn!(
                                "[ENGINE] unsupported nested class '{child_class}', skipping"
                            );
                            continue;
                        }
                        let cid = self.add_channel();
                        self.attach_channel_to_group(cid, gid);
                        if let Some(channel) = self.channel_by_id(cid) {
                            channel.lock().unwrap().load_own(child);
                        }
                    }
                }
            }
            "channel" => {
                let id = self.add_channel();
                if let Some(channel) = self.channel_by_id(id) {
                    channel.lock().unwrap().load_own(element);
                }
            }
            other => {
                log::warn!("[ENGINE] unknown channel class '{other}', skipping");
            }
        }
    }

    fn attach_channel_to_group(&mut self, id: ChannelId, gid: ChannelId) {
        let Some(pos) = self.index_of(id) else {
            return;
        };
        let cell = self.channels.remove(pos);
        cell.bus.lock().unwrap().set_group(Some(gid));
        let target = match self.index_of(gid) {
            Some(gpos) => {
                let gsize = {
                    let mut group = self.channels[gpos].bus.lock().unwrap();
                    let len = group.children().map(<[_]>::len).unwrap_or(0);
                    group.add_child(id);
                    len
                };
                (gpos + gsize + 1).min(self.channels.len())
            }
            None => self.channels.len(),
        };
        self.channels.insert(target, cell);
        self.reindex_channels();
    }

    fn load_parameters(&mut self, parameters: &Value) {
        if let Some(v) = parameters.get("crossfader").and_then(Value::as_f64) {
            self.crossfader.set(v);
        }
        if let Some(v) = parameters.get("crossfaderBlendMode").and_then(Value::as_str) {
            if !self.crossfader_blend_mode.set_label(v) {
                log::warn!("[ENGINE] unknown crossfader blend '{v}' in project");
            }
        }
        if let Some(v) = parameters.get("speed").and_then(Value::as_f64) {
            self.speed.set(v);
        }
        if let Some(v) = parameters.get("framesPerSecond").and_then(Value::as_f64) {
            self.frames_per_second.set(v);
        }
        if let Some(v) = parameters.get("focusedChannel").and_then(Value::as_u64) {
            self.focused_channel.set_index(v as usize);
        }
        if let Some(v) = parameters.get("cueA").and_then(Value::as_bool) {
            self.set_cue_a(v);
        }
        if let Some(v) = parameters.get("cueB").and_then(Value::as_bool) {
            self.set_cue_b(v);
        }
        if let Some(v) = parameters.get("multithreaded").and_then(Value::as_bool) {
            self.multithreaded.set(v);
        }
        if let Some(v) = parameters
            .get("channelMultithreaded")
            .and_then(Value::as_bool)
        {
            self.channel_multithreaded.set(v);
        }
        if let Some(v) = parameters
            .get("networkMultithreaded")
            .and_then(Value::as_bool)
        {
            self.set_network_multithreaded(v);
        }
        for (i, scene) in self.scenes.iter_mut().enumerate() {
            if let Some(v) = parameters
                .get(format!("scene-{}", i + 1))
                .and_then(Value::as_bool)
            {
                scene.set(v);
            }
        }
    }
}
