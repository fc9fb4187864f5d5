//! Component headers
//!
//! Channels, groups, the master, outputs, and the engine itself are
//! addressable components: each has a label, an optional unique id, a
//! slash-separated path, and a set of registered parameter keys. Keys must
//! be unique within a component; registration assigns each parameter its
//! stable path under the component.

use crate::error::{EngineError, EngineResult};
use crate::parameter::Parameter;

/// Header embedded in every addressable component.
pub struct ComponentCore {
    label: String,
    id: Option<u64>,
    path: String,
    keys: Vec<String>,
}

impl ComponentCore {
    pub fn new(label: &str, path: &str) -> Self {
        Self {
            label: label.to_string(),
            id: None,
            path: path.to_string(),
            keys: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_label(&mut self, label: &str) {
        self.label = label.to_string();
    }

    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Register a parameter under a key, attaching its path.
    ///
    /// The key must be unique within this component and the parameter must
    /// not already belong to another component.
    pub fn register(&mut self, key: &str, parameter: &mut dyn Parameter) -> EngineResult<()> {
        if self.keys.iter().any(|k| k == key) {
            return Err(EngineError::DuplicateParameterKey {
                component: self.label.clone(),
                key: key.to_string(),
            });
        }
        parameter.attach(&format!("{}/{}", self.path, key))?;
        self.keys.push(key.to_string());
        Ok(())
    }

    /// Keys in registration order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::BoundedParameter;

    #[test]
    fn test_register_assigns_path() {
        let mut core = ComponentCore::new("Engine", "/lx/engine");
        let mut fader = BoundedParameter::new("Fader", 0.0, 0.0, 1.0);
        core.register("fader", &mut fader).unwrap();
        assert_eq!(fader.path(), Some("/lx/engine/fader"));
        assert_eq!(core.keys(), ["fader".to_string()]);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut core = ComponentCore::new("Engine", "/lx/engine");
        let mut a = BoundedParameter::new("A", 0.0, 0.0, 1.0);
        let mut b = BoundedParameter::new("B", 0.0, 0.0, 1.0);
        core.register("fader", &mut a).unwrap();
        assert!(matches!(
            core.register("fader", &mut b),
            Err(EngineError::DuplicateParameterKey { .. })
        ));
    }
}
