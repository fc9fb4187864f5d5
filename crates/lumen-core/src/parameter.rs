//! Typed, observable parameters
//!
//! Every user-facing control in the engine is a parameter: a named, typed
//! value with listeners that are invoked synchronously on the mutating
//! thread. Parameters belong to exactly one owning component and are given a
//! stable slash-separated path when the component registers them; attaching
//! a parameter twice is a contract violation.
//!
//! Mutation from non-engine threads is not guaranteed safe; foreign threads
//! should route writes through the engine task queue.

use crate::error::{EngineError, EngineResult};

/// Whether a parameter's range is centered (bipolar) or one-sided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Unipolar,
    Bipolar,
}

/// Units metadata for display formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Units {
    None,
    Milliseconds,
    Percent,
    Hertz,
}

/// Handle returned by [`Parameter::add_listener`], used for removal.
pub type ListenerId = u64;

type ListenerFn = Box<dyn FnMut(f64) + Send>;

/// Shared metadata and listener list embedded in every parameter type.
pub struct ParamCore {
    label: String,
    description: String,
    path: Option<String>,
    polarity: Polarity,
    units: Units,
    listeners: Vec<(ListenerId, ListenerFn)>,
    next_listener_id: ListenerId,
}

impl ParamCore {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            description: String::new(),
            path: None,
            polarity: Polarity::Unipolar,
            units: Units::None,
            listeners: Vec::new(),
            next_listener_id: 0,
        }
    }

    fn notify(&mut self, value: f64) {
        for (_, listener) in &mut self.listeners {
            listener(value);
        }
    }
}

/// The common surface of every parameter type.
///
/// Concrete types expose richer typed accessors (`is_on`, `index`, ...);
/// this trait carries the untyped double-precision view plus the metadata
/// and listener plumbing shared by all of them.
pub trait Parameter {
    fn core(&self) -> &ParamCore;
    fn core_mut(&mut self) -> &mut ParamCore;

    /// Current value as a double.
    fn value(&self) -> f64;

    /// Set the value from a double. The value is clamped and quantized per
    /// the parameter type. Setting an unchanged value is silent.
    fn set_value(&mut self, value: f64) -> EngineResult<()>;

    /// Single-precision convenience accessor.
    fn valuef(&self) -> f32 {
        self.value() as f32
    }

    /// Force-notify all listeners with the current value.
    fn bang(&mut self) {
        let v = self.value();
        self.core_mut().notify(v);
    }

    fn label(&self) -> &str {
        &self.core().label
    }

    fn description(&self) -> &str {
        &self.core().description
    }

    /// Stable path assigned by the owning component, if attached.
    fn path(&self) -> Option<&str> {
        self.core().path.as_deref()
    }

    fn polarity(&self) -> Polarity {
        self.core().polarity
    }

    fn units(&self) -> Units {
        self.core().units
    }

    /// One-shot association with an owning component. A second call is a
    /// contract violation.
    fn attach(&mut self, path: &str) -> EngineResult<()> {
        if let Some(existing) = &self.core().path {
            return Err(EngineError::ParameterAttached(existing.clone()));
        }
        self.core_mut().path = Some(path.to_string());
        Ok(())
    }

    /// Register a change listener, invoked synchronously on the mutating
    /// thread with the new value.
    fn add_listener(&mut self, listener: Box<dyn FnMut(f64) + Send>) -> ListenerId {
        let core = self.core_mut();
        let id = core.next_listener_id;
        core.next_listener_id += 1;
        core.listeners.push((id, listener));
        id
    }

    /// Remove a previously registered listener.
    fn remove_listener(&mut self, id: ListenerId) {
        self.core_mut().listeners.retain(|(lid, _)| *lid != id);
    }
}

/// A real-valued parameter bounded to `[min, max]`.
pub struct BoundedParameter {
    core: ParamCore,
    value: f64,
    min: f64,
    max: f64,
}

impl BoundedParameter {
    pub fn new(label: &str, default: f64, min: f64, max: f64) -> Self {
        Self {
            core: ParamCore::new(label),
            value: default.clamp(min, max),
            min,
            max,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.core.description = description.to_string();
        self
    }

    pub fn with_units(mut self, units: Units) -> Self {
        self.core.units = units;
        self
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    /// Clamp and store; notifies listeners only when the value changed.
    pub fn set(&mut self, value: f64) {
        let clamped = value.clamp(self.min, self.max);
        if clamped != self.value {
            self.value = clamped;
            self.core.notify(clamped);
        }
    }
}

impl Parameter for BoundedParameter {
    fn core(&self) -> &ParamCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ParamCore {
        &mut self.core
    }

    fn value(&self) -> f64 {
        self.value
    }

    fn set_value(&mut self, value: f64) -> EngineResult<()> {
        self.set(value);
        Ok(())
    }
}

/// A boolean parameter.
pub struct BooleanParameter {
    core: ParamCore,
    value: bool,
}

impl BooleanParameter {
    pub fn new(label: &str, default: bool) -> Self {
        Self {
            core: ParamCore::new(label),
            value: default,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.core.description = description.to_string();
        self
    }

    pub fn is_on(&self) -> bool {
        self.value
    }

    pub fn set(&mut self, value: bool) {
        if value != self.value {
            self.value = value;
            self.core.notify(if value { 1.0 } else { 0.0 });
        }
    }

    pub fn toggle(&mut self) {
        let next = !self.value;
        self.set(next);
    }
}

impl Parameter for BooleanParameter {
    fn core(&self) -> &ParamCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ParamCore {
        &mut self.core
    }

    fn value(&self) -> f64 {
        if self.value {
            1.0
        } else {
            0.0
        }
    }

    fn set_value(&mut self, value: f64) -> EngineResult<()> {
        self.set(value != 0.0);
        Ok(())
    }
}

/// A discrete integer parameter in `[0, range)`.
///
/// Setting from a double rounds to the nearest integer, then clamps into the
/// range. The range itself may be adjusted at runtime (the focused-channel
/// parameter grows and shrinks with the channel list).
pub struct DiscreteParameter {
    core: ParamCore,
    value: usize,
    range: usize,
}

impl DiscreteParameter {
    pub fn new(label: &str, range: usize) -> Self {
        assert!(range > 0, "discrete parameter range must be positive");
        Self {
            core: ParamCore::new(label),
            value: 0,
            range,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.core.description = description.to_string();
        self
    }

    pub fn index(&self) -> usize {
        self.value
    }

    pub fn range(&self) -> usize {
        self.range
    }

    pub fn set_index(&mut self, index: usize) {
        let clamped = index.min(self.range - 1);
        if clamped != self.value {
            self.value = clamped;
            self.core.notify(clamped as f64);
        }
    }

    /// Adjust the valid range, clamping the current value into it.
    pub fn set_range(&mut self, range: usize) {
        assert!(range > 0, "discrete parameter range must be positive");
        self.range = range;
        if self.value >= range {
            self.value = range - 1;
            self.core.notify(self.value as f64);
        }
    }

    pub fn increment(&mut self) {
        if self.value + 1 < self.range {
            self.set_index(self.value + 1);
        }
    }

    pub fn decrement(&mut self) {
        if self.value > 0 {
            self.set_index(self.value - 1);
        }
    }
}

impl Parameter for DiscreteParameter {
    fn core(&self) -> &ParamCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ParamCore {
        &mut self.core
    }

    fn value(&self) -> f64 {
        self.value as f64
    }

    fn set_value(&mut self, value: f64) -> EngineResult<()> {
        let rounded = value.round().max(0.0) as usize;
        self.set_index(rounded);
        Ok(())
    }
}

/// A selection from a fixed set of owned options, addressed by index or
/// label. The engine uses this for blend-mode and output-mode selection;
/// the option instances themselves live with the component that interprets
/// the index.
pub struct ObjectParameter {
    core: ParamCore,
    options: Vec<String>,
    index: usize,
}

impl ObjectParameter {
    pub fn new(label: &str, options: Vec<String>) -> Self {
        assert!(!options.is_empty(), "object parameter needs options");
        Self {
            core: ParamCore::new(label),
            options,
            index: 0,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.core.description = description.to_string();
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn selected_label(&self) -> &str {
        &self.options[self.index]
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn set_index(&mut self, index: usize) {
        let clamped = index.min(self.options.len() - 1);
        if clamped != self.index {
            self.index = clamped;
            self.core.notify(clamped as f64);
        }
    }

    /// Select by label; returns false when no option matches.
    pub fn set_label(&mut self, label: &str) -> bool {
        if let Some(i) = self.options.iter().position(|o| o == label) {
            self.set_index(i);
            true
        } else {
            false
        }
    }

    /// Replace the option set, keeping the selection index when possible.
    pub fn set_options(&mut self, options: Vec<String>) {
        assert!(!options.is_empty(), "object parameter needs options");
        self.options = options;
        if self.index >= self.options.len() {
            self.index = self.options.len() - 1;
            self.core.notify(self.index as f64);
        }
    }
}

impl Parameter for ObjectParameter {
    fn core(&self) -> &ParamCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ParamCore {
        &mut self.core
    }

    fn value(&self) -> f64 {
        self.index as f64
    }

    fn set_value(&mut self, value: f64) -> EngineResult<()> {
        self.set_index(value.round().max(0.0) as usize);
        Ok(())
    }
}

/// A selection from the variants of a plain enum, each with a display label.
///
/// Like [`ObjectParameter`] but strongly typed: `get` returns the selected
/// variant directly. Used for the output mode and crossfade-group controls.
pub struct EnumParameter<T: Copy + PartialEq + Send> {
    core: ParamCore,
    variants: Vec<(&'static str, T)>,
    index: usize,
}

impl<T: Copy + PartialEq + Send> EnumParameter<T> {
    pub fn new(label: &str, variants: Vec<(&'static str, T)>, default: T) -> Self {
        assert!(!variants.is_empty(), "enum parameter needs variants");
        let index = variants
            .iter()
            .position(|(_, v)| *v == default)
            .unwrap_or(0);
        Self {
            core: ParamCore::new(label),
            variants,
            index,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.core.description = description.to_string();
        self
    }

    pub fn get(&self) -> T {
        self.variants[self.index].1
    }

    pub fn selected_label(&self) -> &'static str {
        self.variants[self.index].0
    }

    pub fn set(&mut self, value: T) {
        if let Some(i) = self.variants.iter().position(|(_, v)| *v == value) {
            if i != self.index {
                self.index = i;
                self.core.notify(i as f64);
            }
        }
    }

    /// Select by label; returns false when no variant matches.
    pub fn set_label(&mut self, label: &str) -> bool {
        if let Some(i) = self.variants.iter().position(|(l, _)| *l == label) {
            if i != self.index {
                self.index = i;
                self.core.notify(i as f64);
            }
            true
        } else {
            false
        }
    }
}

impl<T: Copy + PartialEq + Send> Parameter for EnumParameter<T> {
    fn core(&self) -> &ParamCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ParamCore {
        &mut self.core
    }

    fn value(&self) -> f64 {
        self.index as f64
    }

    fn set_value(&mut self, value: f64) -> EngineResult<()> {
        let i = (value.round().max(0.0) as usize).min(self.variants.len() - 1);
        if i != self.index {
            self.index = i;
            self.core.notify(i as f64);
        }
        Ok(())
    }
}

/// One modulation layer on a compound parameter.
///
/// `value` is refreshed by the modulation collaborator each frame; `amount`
/// scales its contribution to the effective value.
#[derive(Debug, Clone, Copy)]
pub struct Modulation {
    pub amount: f64,
    pub value: f64,
}

/// A bounded parameter with layered modulation inputs.
///
/// The effective value is the base value plus the sum of all modulation
/// contributions, clamped back into `[min, max]`. Listeners fire on base
/// value changes only; modulation is polled every frame by consumers.
pub struct CompoundParameter {
    core: ParamCore,
    base: f64,
    min: f64,
    max: f64,
    modulation: Vec<Modulation>,
}

impl CompoundParameter {
    pub fn new(label: &str, default: f64, min: f64, max: f64) -> Self {
        Self {
            core: ParamCore::new(label),
            base: default.clamp(min, max),
            min,
            max,
            modulation: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.core.description = description.to_string();
        self
    }

    pub fn with_polarity(mut self, polarity: Polarity) -> Self {
        self.core.polarity = polarity;
        self
    }

    /// Base value without modulation applied.
    pub fn base(&self) -> f64 {
        self.base
    }

    pub fn set(&mut self, value: f64) {
        let clamped = value.clamp(self.min, self.max);
        if clamped != self.base {
            self.base = clamped;
            self.core.notify(clamped);
        }
    }

    /// Add a modulation layer, returning its slot index.
    pub fn add_modulation(&mut self, amount: f64) -> usize {
        self.modulation.push(Modulation { amount, value: 0.0 });
        self.modulation.len() - 1
    }

    /// Update a modulation layer's current source value.
    pub fn set_modulation(&mut self, slot: usize, value: f64) {
        if let Some(m) = self.modulation.get_mut(slot) {
            m.value = value;
        }
    }

    pub fn clear_modulation(&mut self) {
        self.modulation.clear();
    }
}

impl Parameter for CompoundParameter {
    fn core(&self) -> &ParamCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ParamCore {
        &mut self.core
    }

    fn value(&self) -> f64 {
        let modulated: f64 = self
            .modulation
            .iter()
            .map(|m| m.amount * m.value)
            .sum::<f64>();
        (self.base + modulated).clamp(self.min, self.max)
    }

    fn set_value(&mut self, value: f64) -> EngineResult<()> {
        self.set(value);
        Ok(())
    }
}

/// An unbounded value used as a change signal (the focused-clip slot).
pub struct MutableParameter {
    core: ParamCore,
    value: f64,
}

impl MutableParameter {
    pub fn new(label: &str) -> Self {
        Self {
            core: ParamCore::new(label),
            value: 0.0,
        }
    }
}

impl Parameter for MutableParameter {
    fn core(&self) -> &ParamCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ParamCore {
        &mut self.core
    }

    fn value(&self) -> f64 {
        self.value
    }

    fn set_value(&mut self, value: f64) -> EngineResult<()> {
        if value != self.value {
            self.value = value;
            self.core.notify(value);
        }
        Ok(())
    }
}

/// A parameter whose value is computed by a function of other state.
///
/// Computed parameters reject `set_value`; that is a contract violation.
pub struct FunctionalParameter {
    core: ParamCore,
    function: Box<dyn Fn() -> f64 + Send>,
}

impl FunctionalParameter {
    pub fn new(label: &str, function: Box<dyn Fn() -> f64 + Send>) -> Self {
        Self {
            core: ParamCore::new(label),
            function,
        }
    }
}

impl Parameter for FunctionalParameter {
    fn core(&self) -> &ParamCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ParamCore {
        &mut self.core
    }

    fn value(&self) -> f64 {
        (self.function)()
    }

    fn set_value(&mut self, _value: f64) -> EngineResult<()> {
        Err(EngineError::ComputedParameter(self.core.label.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_bounded_clamps() {
        let mut p = BoundedParameter::new("Speed", 1.0, 0.0, 2.0);
        p.set(5.0);
        assert_eq!(p.value(), 2.0);
        p.set(-1.0);
        assert_eq!(p.value(), 0.0);
        p.set(1.5);
        assert_eq!(p.value(), 1.5);
    }

    #[test]
    fn test_discrete_rounds_and_clamps() {
        let mut p = DiscreteParameter::new("Gamma", 4);
        p.set_value(2.6).unwrap();
        assert_eq!(p.index(), 3);
        p.set_value(99.0).unwrap();
        assert_eq!(p.index(), 3);
        p.set_value(-2.0).unwrap();
        assert_eq!(p.index(), 0);
    }

    #[test]
    fn test_discrete_range_shrink_clamps_value() {
        let mut p = DiscreteParameter::new("Channel", 5);
        p.set_index(4);
        p.set_range(3);
        assert_eq!(p.index(), 2);
        assert_eq!(p.range(), 3);
    }

    #[test]
    fn test_listener_notify_and_silence() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in = Arc::clone(&fired);
        let mut p = BooleanParameter::new("Cue", false);
        p.add_listener(Box::new(move |_| {
            fired_in.fetch_add(1, Ordering::SeqCst);
        }));

        p.set(true);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Same value: silent
        p.set(true);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // bang forces a notify
        p.bang();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_removal() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in = Arc::clone(&fired);
        let mut p = BoundedParameter::new("Fader", 0.0, 0.0, 1.0);
        let id = p.add_listener(Box::new(move |_| {
            fired_in.fetch_add(1, Ordering::SeqCst);
        }));
        p.set(0.5);
        p.remove_listener(id);
        p.set(1.0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_attach_is_one_shot() {
        let mut p = BoundedParameter::new("Fader", 0.0, 0.0, 1.0);
        p.attach("/lx/engine/fader").unwrap();
        assert_eq!(p.path(), Some("/lx/engine/fader"));
        assert!(matches!(
            p.attach("/lx/engine/other"),
            Err(EngineError::ParameterAttached(_))
        ));
    }

    #[test]
    fn test_compound_modulation_layers() {
        let mut p = CompoundParameter::new("Crossfader", 0.5, 0.0, 1.0);
        assert_eq!(p.value(), 0.5);
        let slot = p.add_modulation(0.5);
        p.set_modulation(slot, 1.0);
        assert_eq!(p.value(), 1.0);
        p.set_modulation(slot, -2.0);
        // Clamped back into range
        assert_eq!(p.value(), 0.0);
        p.clear_modulation();
        assert_eq!(p.value(), 0.5);
    }

    #[test]
    fn test_functional_rejects_set() {
        let mut p = FunctionalParameter::new("FPS", Box::new(|| 60.0));
        assert_eq!(p.value(), 60.0);
        assert!(matches!(
            p.set_value(30.0),
            Err(EngineError::ComputedParameter(_))
        ));
    }

    #[test]
    fn test_enum_parameter_typed_selection() {
        #[derive(Clone, Copy, PartialEq, Eq, Debug)]
        enum Mode {
            Normal,
            White,
            Off,
        }
        let mut p = EnumParameter::new(
            "Mode",
            vec![
                ("NORMAL", Mode::Normal),
                ("WHITE", Mode::White),
                ("OFF", Mode::Off),
            ],
            Mode::Normal,
        );
        assert_eq!(p.get(), Mode::Normal);
        p.set(Mode::Off);
        assert_eq!(p.get(), Mode::Off);
        assert_eq!(p.selected_label(), "OFF");
        assert!(p.set_label("WHITE"));
        assert_eq!(p.get(), Mode::White);
    }

    #[test]
    fn test_object_parameter_selection() {
        let mut p = ObjectParameter::new(
            "Blend",
            vec!["Add".into(), "Multiply".into(), "Normal".into()],
        );
        assert_eq!(p.selected_label(), "Add");
        assert!(p.set_label("Normal"));
        assert_eq!(p.index(), 2);
        assert!(!p.set_label("Bogus"));
        p.set_index(99);
        assert_eq!(p.index(), 2);
    }
}
