//! Output stage
//!
//! Outputs take a finished frame and hand it to real devices. Every output
//! node can throttle its frame rate, apply gamma correction and brightness
//! in HSB space, force all-white or all-off test modes, and fan the
//! corrected buffer out to child outputs. The transport itself (wire
//! protocol, socket) lives behind the [`Sink`] trait.

mod network;

pub(crate) use network::NetworkThread;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::component::ComponentCore;
use crate::parameter::{
    BooleanParameter, BoundedParameter, DiscreteParameter, EnumParameter, Parameter,
};
use crate::types::{hsb, to_hsb, Color, ColorBuffer};

/// The transport behind an output node.
pub trait Sink: Send {
    /// Deliver one corrected frame to the device.
    fn on_send(&mut self, colors: &[Color]);
}

/// Operating mode of an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Normal,
    White,
    Raw,
    Off,
}

impl Mode {
    fn variants() -> Vec<(&'static str, Mode)> {
        vec![
            ("NORMAL", Mode::Normal),
            ("WHITE", Mode::White),
            ("RAW", Mode::Raw),
            ("OFF", Mode::Off),
        ]
    }
}

/// One node in the output tree.
pub struct Output {
    core: ComponentCore,

    pub enabled: BooleanParameter,
    pub mode: EnumParameter<Mode>,
    pub frames_per_second: BoundedParameter,
    pub gamma_correction: DiscreteParameter,
    pub brightness: BoundedParameter,

    last_frame_millis: Option<u64>,
    output_colors: ColorBuffer,
    // Scratch area rewritten on every WHITE-mode frame, not a cached
    // constant.
    all_white: ColorBuffer,
    all_off: ColorBuffer,
    sink: Option<Box<dyn Sink>>,
    children: Vec<Output>,
}

impl Output {
    fn build(label: &str, num_points: usize, sink: Option<Box<dyn Sink>>) -> Self {
        let mut core = ComponentCore::new(label, "/lx/output");
        let mut enabled = BooleanParameter::new("Enabled", true)
            .with_description("Whether the output is active");
        let mut mode = EnumParameter::new("Mode", Mode::variants(), Mode::Normal)
            .with_description("Operation mode of this output");
        let mut frames_per_second = BoundedParameter::new("FPS", 0.0, 0.0, 300.0)
            .with_description("Maximum frames per second this output will send, 0 for uncapped");
        let mut gamma_correction = DiscreteParameter::new("Gamma", 4)
            .with_description("Gamma correction on the output, 0 is none");
        let mut brightness = BoundedParameter::new("Brightness", 1.0, 0.0, 1.0)
            .with_description("Level of the output");

        for (key, parameter) in [
            ("enabled", &mut enabled as &mut dyn Parameter),
            ("mode", &mut mode),
            ("fps", &mut frames_per_second),
            ("gamma", &mut gamma_correction),
            ("brightness", &mut brightness),
        ] {
            core.register(key, parameter)
                .expect("output parameter registration");
        }

        Self {
            core,
            enabled,
            mode,
            frames_per_second,
            gamma_correction,
            brightness,
            last_frame_millis: None,
            output_colors: ColorBuffer::new(num_points),
            all_white: ColorBuffer::new(num_points),
            all_off: ColorBuffer::new(num_points),
            sink,
            children: Vec::new(),
        }
    }

    /// An output that delivers frames through `sink`.
    pub fn new(label: &str, num_points: usize, sink: Box<dyn Sink>) -> Self {
        Self::build(label, num_points, Some(sink))
    }

    /// A pure fanout node with no transport of its own.
    pub fn group(label: &str, num_points: usize) -> Self {
        Self::build(label, num_points, None)
    }

    pub fn label(&self) -> &str {
        self.core.label()
    }

    pub fn path(&self) -> &str {
        self.core.path()
    }

    /// Add a child output; children receive the already-corrected buffer.
    pub fn add_child(&mut self, child: Output) {
        self.children.push(child);
    }

    pub fn remove_child(&mut self, index: usize) -> Option<Output> {
        if index < self.children.len() {
            Some(self.children.remove(index))
        } else {
            None
        }
    }

    pub fn children(&self) -> &[Output] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut [Output] {
        &mut self.children
    }

    /// Send one frame through this node and its children, applying the
    /// throttle and color correction. `now_millis` is the caller's clock so
    /// the engine's frame clock drives throttling.
    pub fn send(&mut self, colors: &[Color], now_millis: u64) {
        if !self.enabled.is_on() {
            return;
        }
        let fps = self.frames_per_second.value();
        if fps > 0.0 {
            if let Some(last) = self.last_frame_millis {
                if (now_millis.saturating_sub(last)) as f64 <= 1000.0 / fps {
                    return;
                }
            }
        }

        let colors_to_send: &[Color] = match self.mode.get() {
            Mode::White => {
                let white = hsb(0.0, 0.0, self.brightness.valuef());
                self.all_white.fill(white);
                self.all_white.as_slice()
            }
            Mode::Off => self.all_off.as_slice(),
            Mode::Raw => colors,
            Mode::Normal => {
                let gamma = self.gamma_correction.index();
                let brightness = self.brightness.value();
                if gamma > 0 || brightness < 1.0 {
                    let out = self.output_colors.as_mut_slice();
                    for (o, &c) in out.iter_mut().zip(colors.iter()) {
                        let (h, s, v) = to_hsb(c);
                        let mut scaled = v;
                        for _ in 0..gamma {
                            scaled *= v;
                        }
                        scaled *= brightness as f32;
                        *o = hsb(h, s, scaled);
                    }
                    self.output_colors.as_slice()
                } else {
                    colors
                }
            }
        };

        if let Some(sink) = &mut self.sink {
            sink.on_send(colors_to_send);
        }
        for child in &mut self.children {
            child.send(colors_to_send, now_millis);
        }
        self.last_frame_millis = Some(now_millis);
    }

    pub(crate) fn save(&self) -> Value {
        json!({
            "parameters": {
                "enabled": self.enabled.is_on(),
                "mode": serde_json::to_value(self.mode.get()).unwrap_or(Value::Null),
                "fps": self.frames_per_second.value(),
                "gamma": self.gamma_correction.index(),
                "brightness": self.brightness.value(),
            },
            "children": self.children.iter().map(Output::save).collect::<Vec<_>>(),
        })
    }

    /// Restore parameters on this node and, positionally, on children that
    /// exist. Extra saved children are ignored; the tree itself is rebuilt
    /// by the host.
    pub(crate) fn load(&mut self, obj: &Value) {
        if let Some(parameters) = obj.get("parameters") {
            if let Some(enabled) = parameters.get("enabled").and_then(Value::as_bool) {
                self.enabled.set(enabled);
            }
            if let Some(mode) = parameters.get("mode") {
                match serde_json::from_value::<Mode>(mode.clone()) {
                    Ok(m) => self.mode.set(m),
                    Err(_) => log::warn!("[OUTPUT] unknown output mode in project, keeping default"),
                }
            }
            if let Some(fps) = parameters.get("fps").and_then(Value::as_f64) {
                self.frames_per_second.set(fps);
            }
            if let Some(gamma) = parameters.get("gamma").and_then(Value::as_u64) {
                self.gamma_correction.set_index(gamma as usize);
            }
            if let Some(brightness) = parameters.get("brightness").and_then(Value::as_f64) {
                self.brightness.set(brightness);
            }
        }
        if let Some(children) = obj.get("children").and_then(Value::as_array) {
            for (child, child_obj) in self.children.iter_mut().zip(children.iter()) {
                child.load(child_obj);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{rgb, BLACK, WHITE};
    use std::sync::{Arc, Mutex};

    struct RecordingSink {
        frames: Arc<Mutex<Vec<Vec<Color>>>>,
    }

    impl Sink for RecordingSink {
        fn on_send(&mut self, colors: &[Color]) {
            self.frames.lock().unwrap().push(colors.to_vec());
        }
    }

    fn recording_output(num_points: usize) -> (Output, Arc<Mutex<Vec<Vec<Color>>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = RecordingSink {
            frames: Arc::clone(&frames),
        };
        (Output::new("Test", num_points, Box::new(sink)), frames)
    }

    #[test]
    fn test_raw_passes_through() {
        let (mut output, frames) = recording_output(4);
        output.mode.set(Mode::Raw);
        let colors = vec![rgb(12, 34, 56); 4];
        output.send(&colors, 0);
        assert_eq!(frames.lock().unwrap()[0], colors);
    }

    #[test]
    fn test_off_sends_black() {
        let (mut output, frames) = recording_output(4);
        output.mode.set(Mode::Off);
        output.send(&[WHITE; 4], 0);
        assert!(frames.lock().unwrap()[0].iter().all(|&c| c == BLACK));
    }

    #[test]
    fn test_white_scales_with_brightness() {
        let (mut output, frames) = recording_output(2);
        output.mode.set(Mode::White);
        output.brightness.set(0.5);
        output.send(&[BLACK; 2], 0);
        let sent = frames.lock().unwrap()[0].clone();
        assert!(sent.iter().all(|&c| c == hsb(0.0, 0.0, 0.5)));
    }

    #[test]
    fn test_normal_untouched_without_correction() {
        let (mut output, frames) = recording_output(3);
        let colors = vec![rgb(200, 100, 50); 3];
        output.send(&colors, 0);
        assert_eq!(frames.lock().unwrap()[0], colors);
    }

    #[test]
    fn test_gamma_darkens() {
        let (mut output, frames) = recording_output(1);
        output.gamma_correction.set_index(2);
        output.send(&[rgb(128, 128, 128)], 0);
        let sent = frames.lock().unwrap()[0][0];
        // v^3 of ~0.5 is ~0.125
        assert!(crate::types::red(sent) < 40);
        assert!(crate::types::red(sent) > 20);
    }

    #[test]
    fn test_disabled_sends_nothing() {
        let (mut output, frames) = recording_output(2);
        output.enabled.set(false);
        output.send(&[WHITE; 2], 0);
        assert!(frames.lock().unwrap().is_empty());
    }

    #[test]
    fn test_fps_throttle() {
        let (mut output, frames) = recording_output(1);
        output.frames_per_second.set(10.0);

        // 30 sends over one second at 100Hz: only ~3 land within the
        // 100ms throttle window
        for i in 0..30u64 {
            output.send(&[WHITE], i * 10);
        }
        let count = frames.lock().unwrap().len();
        assert!((2..=4).contains(&count), "got {count} frames");
    }

    #[test]
    fn test_children_receive_corrected_buffer() {
        let (child, child_frames) = recording_output(1);
        let mut parent = Output::group("Parent", 1);
        parent.brightness.set(0.0);
        parent.add_child(child);

        parent.send(&[WHITE], 0);
        let sent = child_frames.lock().unwrap()[0][0];
        assert_eq!(sent, BLACK);
    }

    #[test]
    fn test_save_load_round_trip() {
        let (mut output, _) = recording_output(2);
        output.mode.set(Mode::White);
        output.frames_per_second.set(30.0);
        output.gamma_correction.set_index(2);
        output.brightness.set(0.25);
        output.enabled.set(false);

        let saved = output.save();
        let (mut restored, _) = recording_output(2);
        restored.load(&saved);

        assert_eq!(restored.mode.get(), Mode::White);
        assert_eq!(restored.frames_per_second.value(), 30.0);
        assert_eq!(restored.gamma_correction.index(), 2);
        assert_eq!(restored.brightness.value(), 0.25);
        assert!(!restored.enabled.is_on());
    }
}
