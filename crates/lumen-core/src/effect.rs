//! Effect capability
//!
//! Effects post-process a color buffer in place: channels run their effect
//! chain after the pattern renders, and the master channel's effects run on
//! the fully mixed output. Implementations come from the host project.

use crate::types::{alpha, argb, blue, green, red, Color};

/// A buffer post-processor.
pub trait Effect: Send {
    fn label(&self) -> &str;

    /// Advance effect time by `delta_ms` and process `colors` in place.
    fn apply(&mut self, colors: &mut [Color], delta_ms: f64);
}

/// Scales every component toward black by a fixed amount. Useful as a
/// master dimmer and as a deterministic stand-in effect in tests.
pub struct DimEffect {
    amount: f64,
}

impl DimEffect {
    /// `amount` is the retained fraction: 1.0 passes through, 0.0 blacks out.
    pub fn new(amount: f64) -> Self {
        Self {
            amount: amount.clamp(0.0, 1.0),
        }
    }
}

impl Effect for DimEffect {
    fn label(&self) -> &str {
        "Dim"
    }

    fn apply(&mut self, colors: &mut [Color], _delta_ms: f64) {
        for c in colors.iter_mut() {
            let scale = |v: u8| (v as f64 * self.amount) as u8;
            *c = argb(alpha(*c), scale(red(*c)), scale(green(*c)), scale(blue(*c)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::rgb;

    #[test]
    fn test_dim_scales_components() {
        let mut effect = DimEffect::new(0.5);
        let mut colors = vec![rgb(200, 100, 50)];
        effect.apply(&mut colors, 16.0);
        assert_eq!(colors[0], rgb(100, 50, 25));
    }

    #[test]
    fn test_dim_full_passes_through() {
        let mut effect = DimEffect::new(1.0);
        let original = vec![rgb(12, 34, 56); 3];
        let mut colors = original.clone();
        effect.apply(&mut colors, 16.0);
        assert_eq!(colors, original);
    }
}
