//! Bus mixer / compositor
//!
//! Combines channel outputs into the MAIN bus plus the A and B crossfade
//! buses, applies the crossfader between A and B, adds the result onto
//! MAIN, and accumulates the CUE preview bus in parallel.
//!
//! Buses are seeded lazily from the opaque-black background: the first
//! channel on a bus blends against the background, later channels
//! accumulate in place. A channel whose fader sits at zero still seeds its
//! bus so that stale data from earlier frames never leaks through.

use crate::blend::{self, AddBlend, Blend};
use crate::parameter::Parameter;
use crate::types::ColorBuffer;

use super::channel::{ChannelCell, CrossfadeGroup};

/// Per-frame inputs the mixer needs from the engine's parameters.
pub(crate) struct MixInputs {
    pub crossfade: f64,
    pub crossfader_blend: usize,
    pub cue_a: bool,
    pub cue_b: bool,
}

pub(crate) struct Mixer {
    background: ColorBuffer,
    left: ColorBuffer,
    right: ColorBuffer,
    channel_blends: Vec<Box<dyn Blend>>,
    crossfader_blends: Vec<Box<dyn Blend>>,
    add: AddBlend,
}

impl Mixer {
    pub fn new(num_points: usize) -> Self {
        Self {
            background: ColorBuffer::new(num_points),
            left: ColorBuffer::new(num_points),
            right: ColorBuffer::new(num_points),
            channel_blends: blend::channel_blends(),
            crossfader_blends: blend::crossfader_blends(),
            add: AddBlend,
        }
    }

    pub fn background(&self) -> &ColorBuffer {
        &self.background
    }

    pub fn channel_blend_labels(&self) -> Vec<String> {
        blend::labels(&self.channel_blends)
    }

    pub fn crossfader_blend_labels(&self) -> Vec<String> {
        blend::labels(&self.crossfader_blends)
    }

    pub fn set_channel_blends(&mut self, blends: Vec<Box<dyn Blend>>) {
        self.channel_blends = blends;
    }

    /// Composite every animating group's sub-channels into the group's own
    /// buffer, in channel order, exactly as the top-level blend-down does.
    /// Runs after all channel loops and before [`Mixer::blend`].
    pub fn composite_groups(&self, cells: &[ChannelCell]) {
        for cell in cells {
            let children = {
                let bus = cell.bus.lock().unwrap();
                if !bus.is_group() || !bus.is_animating() {
                    continue;
                }
                bus.children().map(<[_]>::to_vec).unwrap_or_default()
            };

            let mut group = cell.bus.lock().unwrap();
            let mut count = 0usize;
            for child_id in children {
                let Some(child_cell) = cells.iter().find(|c| c.id == child_id) else {
                    continue;
                };
                let child = child_cell.bus.lock().unwrap();
                if !child.is_animating() || !child.enabled.is_on() {
                    continue;
                }
                let seeded = count > 0;
                count += 1;
                let alpha = child.fader.value();
                if alpha > 0.0 {
                    if !seeded {
                        group.colors_mut().copy_from(&self.background);
                    }
                    let blend = &self.channel_blends[child.blend_mode.index()];
                    blend.blend(group.colors_mut().as_mut_slice(), child.colors(), alpha);
                } else if !seeded {
                    group.colors_mut().copy_from(&self.background);
                }
            }
            if count == 0 {
                group.colors_mut().copy_from(&self.background);
            }
        }
    }

    /// Blend all top-level channels down into `main` and `cue`. Returns
    /// whether the cue bus carries content this frame.
    pub fn blend(
        &mut self,
        cells: &[ChannelCell],
        inputs: MixInputs,
        main: &mut ColorBuffer,
        cue: &mut ColorBuffer,
    ) -> bool {
        let Mixer {
            background,
            left,
            right,
            channel_blends,
            crossfader_blends,
            add,
        } = self;

        let left_active = inputs.crossfade < 1.0;
        let right_active = inputs.crossfade > 0.0;

        let mut left_count = 0usize;
        let mut right_count = 0usize;
        let mut main_count = 0usize;
        let mut cue_seeded = false;
        let mut cue_on = false;

        for cell in cells {
            let bus = cell.bus.lock().unwrap();

            // Sub-channels were already composited into their group, which
            // is itself a top-level channel; they only contribute to cue.
            let is_sub = bus.group().is_some();

            if !is_sub && bus.is_animating() && bus.enabled.is_on() {
                let (count, out, active) = match bus.crossfade_group.get() {
                    CrossfadeGroup::A => (
                        &mut left_count,
                        &mut *left,
                        left_active || inputs.cue_a,
                    ),
                    CrossfadeGroup::B => (
                        &mut right_count,
                        &mut *right,
                        right_active || inputs.cue_b,
                    ),
                    CrossfadeGroup::Bypass => (&mut main_count, &mut *main, true),
                };
                let seeded = *count > 0;
                *count += 1;
                if active {
                    let alpha = bus.fader.value();
                    if alpha > 0.0 {
                        if !seeded {
                            out.copy_from(background);
                        }
                        let blend = &channel_blends[bus.blend_mode.index()];
                        blend.blend(out.as_mut_slice(), bus.colors(), alpha);
                    } else if !seeded {
                        // Zero-fader channel contributes nothing, but its
                        // bus must not carry stale data from a prior frame.
                        out.copy_from(background);
                    }
                }
            }

            // The cue bus accumulates additively for any cued channel,
            // sub-channels included.
            if bus.cue_active.is_on() {
                cue_on = true;
                if !cue_seeded {
                    cue.copy_from(background);
                    cue_seeded = true;
                }
                add.blend(cue.as_mut_slice(), bus.colors(), 1.0);
            }
        }

        // A cued crossfade group replaces the accumulated cue content
        if inputs.cue_a {
            if left_count > 0 {
                cue.copy_from(left);
            }
            cue_on = true;
        } else if inputs.cue_b {
            if right_count > 0 {
                cue.copy_from(right);
            }
            cue_on = true;
        }

        // Mix the crossfade groups onto the main bus
        let left_content = left_active && left_count > 0;
        let right_content = right_active && right_count > 0;

        if left_content && right_content {
            let crossfader_blend = &crossfader_blends[inputs.crossfader_blend];
            let crossfaded: &ColorBuffer = if inputs.crossfade <= 0.5 {
                let alpha = (2.0 * inputs.crossfade).min(1.0);
                crossfader_blend.blend(left.as_mut_slice(), right.as_slice(), alpha);
                left
            } else {
                let alpha = (2.0 * (1.0 - inputs.crossfade)).min(1.0);
                crossfader_blend.blend(right.as_mut_slice(), left.as_slice(), alpha);
                right
            };
            if main_count == 0 {
                main.copy_from(background);
            }
            add.blend(main.as_mut_slice(), crossfaded.as_slice(), 1.0);
        } else if left_content {
            if main_count == 0 {
                main.copy_from(background);
            }
            let alpha = (2.0 * (1.0 - inputs.crossfade)).min(1.0);
            add.blend(main.as_mut_slice(), left.as_slice(), alpha);
        } else if right_content {
            if main_count == 0 {
                main.copy_from(background);
            }
            let alpha = (2.0 * inputs.crossfade).min(1.0);
            add.blend(main.as_mut_slice(), right.as_slice(), alpha);
        }

        // All channels off: clear stale data out of the main bus
        if left_count + right_count + main_count == 0 {
            main.copy_from(background);
        }

        cue_on
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blend;
    use crate::engine::channel::ChannelBus;
    use crate::pattern::SolidPattern;
    use crate::types::{green, red, BLACK};

    fn cell(id: u64, color: u32, group: CrossfadeGroup, fader: f64) -> ChannelCell {
        let labels = blend::labels(&blend::channel_blends());
        let mut bus = ChannelBus::new_channel(
            id,
            &format!("Ch-{id}"),
            4,
            vec![Box::new(SolidPattern::new(color))],
            labels,
        );
        bus.crossfade_group.set(group);
        bus.fader.set(fader);
        bus.blend_mode.set_label("Normal");
        bus.loop_frame(16.0);
        ChannelCell::new(bus)
    }

    fn inputs(crossfade: f64) -> MixInputs {
        MixInputs {
            crossfade,
            crossfader_blend: 0,
            cue_a: false,
            cue_b: false,
        }
    }

    #[test]
    fn test_empty_mix_is_background() {
        let mut mixer = Mixer::new(4);
        let mut main = ColorBuffer::new(4);
        let mut cue = ColorBuffer::new(4);
        main.fill(0xFF123456);

        let cue_on = mixer.blend(&[], inputs(0.5), &mut main, &mut cue);
        assert!(!cue_on);
        assert!(main.as_slice().iter().all(|&c| c == BLACK));
    }

    #[test]
    fn test_bypass_full_fader_normal_is_channel() {
        let mut mixer = Mixer::new(4);
        let cells = vec![cell(1, 0xFFFF0000, CrossfadeGroup::Bypass, 1.0)];
        let mut main = ColorBuffer::new(4);
        let mut cue = ColorBuffer::new(4);

        mixer.blend(&cells, inputs(0.5), &mut main, &mut cue);
        assert!(main.as_slice().iter().all(|&c| c == 0xFFFF0000));
    }

    #[test]
    fn test_bypass_zero_fader_is_background() {
        let mut mixer = Mixer::new(4);
        let cells = vec![cell(1, 0xFFFF0000, CrossfadeGroup::Bypass, 0.0)];
        let mut main = ColorBuffer::new(4);
        main.fill(0xFFABCDEF);
        let mut cue = ColorBuffer::new(4);

        mixer.blend(&cells, inputs(0.5), &mut main, &mut cue);
        assert!(main.as_slice().iter().all(|&c| c == BLACK));
    }

    #[test]
    fn test_crossfader_extremes() {
        let cells = vec![
            cell(1, 0xFFFF0000, CrossfadeGroup::A, 1.0),
            cell(2, 0xFF00FF00, CrossfadeGroup::B, 1.0),
        ];

        // Full left: main is A at full weight
        let mut mixer = Mixer::new(4);
        let mut main = ColorBuffer::new(4);
        let mut cue = ColorBuffer::new(4);
        mixer.blend(&cells, inputs(0.0), &mut main, &mut cue);
        assert!(main.as_slice().iter().all(|&c| c == 0xFFFF0000));

        // Full right: main is B at full weight
        let mut main = ColorBuffer::new(4);
        mixer.blend(&cells, inputs(1.0), &mut main, &mut cue);
        assert!(main.as_slice().iter().all(|&c| c == 0xFF00FF00));
    }

    #[test]
    fn test_crossfader_midpoint_dissolve() {
        let cells = vec![
            cell(1, 0xFFFF0000, CrossfadeGroup::A, 1.0),
            cell(2, 0xFF00FF00, CrossfadeGroup::B, 1.0),
        ];
        let mut mixer = Mixer::new(4);
        let mut main = ColorBuffer::new(4);
        let mut cue = ColorBuffer::new(4);
        mixer.blend(&cells, inputs(0.5), &mut main, &mut cue);

        let c = main.as_slice()[0];
        assert_eq!(red(c), 127);
        assert_eq!(green(c), 127);
    }

    #[test]
    fn test_cue_channel_sets_cue_bus() {
        let mut mixer = Mixer::new(4);
        let labels = blend::labels(&blend::channel_blends());
        let mut bus = ChannelBus::new_channel(
            1,
            "Cued",
            4,
            vec![Box::new(SolidPattern::new(0xFF0000FF))],
            labels,
        );
        bus.fader.set(1.0);
        bus.cue_active.set(true);
        bus.loop_frame(16.0);
        let cells = vec![ChannelCell::new(bus)];

        let mut main = ColorBuffer::new(4);
        let mut cue = ColorBuffer::new(4);
        let cue_on = mixer.blend(&cells, inputs(0.5), &mut main, &mut cue);
        assert!(cue_on);
        assert!(cue.as_slice().iter().all(|&c| c == 0xFF0000FF));
    }

    #[test]
    fn test_cue_a_previews_left_bus() {
        let cells = vec![cell(1, 0xFFFF0000, CrossfadeGroup::A, 1.0)];
        let mut mixer = Mixer::new(4);
        let mut main = ColorBuffer::new(4);
        let mut cue = ColorBuffer::new(4);

        let cue_on = mixer.blend(
            &cells,
            MixInputs {
                crossfade: 0.5,
                crossfader_blend: 0,
                cue_a: true,
                cue_b: false,
            },
            &mut main,
            &mut cue,
        );
        assert!(cue_on);
        assert!(cue.as_slice().iter().all(|&c| c == 0xFFFF0000));
    }

    #[test]
    fn test_group_composites_children() {
        let labels = blend::labels(&blend::channel_blends());
        let mut group = ChannelBus::new_group(10, "Group", 4, labels);
        group.fader.set(1.0);
        group.blend_mode.set_label("Normal");
        group.add_child(1);
        group.loop_frame(16.0);

        let child_cell = cell(1, 0xFF00FFFF, CrossfadeGroup::Bypass, 1.0);
        child_cell.bus.lock().unwrap().set_group(Some(10));

        let cells = vec![ChannelCell::new(group), child_cell];
        let mixer = Mixer::new(4);
        mixer.composite_groups(&cells);

        let group_colors: Vec<_> = cells[0].bus.lock().unwrap().colors().to_vec();
        assert!(group_colors.iter().all(|&c| c == 0xFF00FFFF));

        // The group now blends as a top-level channel
        let mut mixer = Mixer::new(4);
        let mut main = ColorBuffer::new(4);
        let mut cue = ColorBuffer::new(4);
        mixer.blend(&cells, inputs(0.5), &mut main, &mut cue);
        assert!(main.as_slice().iter().all(|&c| c == 0xFF00FFFF));
    }
}
