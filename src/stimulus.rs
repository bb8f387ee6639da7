//! Synthetic trigger signals generated from a waveform.
//!
//! [`TriggerStimulus`] spins a waveform at constant speed and yields the edges
//! a capture driver would report, [`render_pulse_train`] draws the channel
//! levels over one engine cycle for signal generators and scopes.

use num::traits::float::FloatCore;

use crate::error::FatalError;
use crate::math::{cylinder_angle, wrap_angle};
use crate::waveform::TriggerWaveform;
use crate::{Level, TimeUs, TriggerEdge, TriggerWheel, TRIGGER_CHANNEL_COUNT};

/// Endless edge stream of a waveform turning at constant RPM
pub struct TriggerStimulus<'a> {
    shape: &'a TriggerWaveform,
    us_per_degree: f64,
    start_us: TimeUs,
    start_angle: f64,
    index: usize,
}

impl<'a> TriggerStimulus<'a> {
    /// First edge is waveform edge `start_index`, reported at `start_us`
    pub fn new(shape: &'a TriggerWaveform, rpm: f32, start_index: usize, start_us: TimeUs) -> Self {
        let mut stimulus = TriggerStimulus {
            shape,
            us_per_degree: 1_000_000.0 * 60.0 / 360.0 / rpm as f64,
            start_us,
            start_angle: 0.0,
            index: start_index,
        };
        stimulus.start_angle = stimulus.unrolled_angle(start_index).unwrap_or(0.0);
        stimulus
    }

    fn unrolled_angle(&self, index: usize) -> Option<f64> {
        let size = self.shape.size();
        if size == 0 {
            return None;
        }
        let cycle = index / size;
        let position = self.shape.switch_angle(index % size)? as f64;
        Some(self.shape.cycle_duration() as f64 * cycle as f64 + position)
    }
}

impl<'a> Iterator for TriggerStimulus<'a> {
    type Item = TriggerEdge;

    fn next(&mut self) -> Option<Self::Item> {
        let angle = self.unrolled_angle(self.index)?;
        let event = self.shape.event(self.index % self.shape.size())?;
        self.index += 1;
        let offset = FloatCore::round((angle - self.start_angle) * self.us_per_degree);
        Some(TriggerEdge::new(
            event.channel,
            event.edge,
            self.start_us + offset as TimeUs,
        ))
    }
}

/// Bit positions of one pulse train sample
pub trait PulseBits {
    fn set_channel_lvl(&mut self, channel: TriggerWheel, lvl: Level);
    fn channel_is_high(&self, channel: TriggerWheel) -> bool;
    fn set_tdc_lvl(&mut self, tdc: usize, lvl: Level);
    fn tdc_is_high(&self, tdc: usize) -> bool;

    fn channel_is_low(&self, channel: TriggerWheel) -> bool {
        !self.channel_is_high(channel)
    }

    fn tdc_is_low(&self, tdc: usize) -> bool {
        !self.tdc_is_high(tdc)
    }
}

const CHANNEL_MSK: [u8; TRIGGER_CHANNEL_COUNT] = [0x01, 0x02];
/// TDC marks for up to six cylinders
pub const TDC_MSK: [u8; 6] = [0x04, 0x08, 0x10, 0x20, 0x40, 0x80];

fn set_bits(bits: &mut u8, mask: u8, lvl: Level) {
    match lvl {
        Level::Low => *bits &= !mask,
        Level::High => *bits |= mask,
    }
}

impl PulseBits for u8 {
    fn set_channel_lvl(&mut self, channel: TriggerWheel, lvl: Level) {
        set_bits(self, CHANNEL_MSK[channel.index()], lvl);
    }

    fn channel_is_high(&self, channel: TriggerWheel) -> bool {
        self & CHANNEL_MSK[channel.index()] != 0
    }

    fn set_tdc_lvl(&mut self, tdc: usize, lvl: Level) {
        if let Some(&mask) = TDC_MSK.get(tdc) {
            set_bits(self, mask, lvl);
        }
    }

    fn tdc_is_high(&self, tdc: usize) -> bool {
        TDC_MSK.get(tdc).map_or(false, |mask| self & mask != 0)
    }
}

/// Samples channel levels over one engine cycle into `pt`, sample `i` being
/// at `i * engine_cycle / pt.len()` degrees from the waveform start. TDC of
/// each cylinder is marked on the sample it falls on.
pub fn render_pulse_train(shape: &TriggerWaveform, cylinders: u8, pt: &mut [u8]) -> Result<(), FatalError> {
    if pt.is_empty() {
        return Ok(());
    }
    let engine_cycle = shape.engine_cycle();
    let step = engine_cycle / pt.len() as f32;
    let mut levels = shape.initial_state;
    let mut next_event = 0;
    let length = shape.length();

    for (sample, bits) in pt.iter_mut().enumerate() {
        let angle = step * sample as f32;
        while next_event < length {
            match shape.angle(next_event) {
                Some(event_angle) if event_angle <= angle => {
                    if let Some(event) = shape.event(next_event % shape.size()) {
                        levels[event.channel.index()] = event.edge.level();
                    }
                    next_event += 1;
                }
                _ => break,
            }
        }
        *bits = 0;
        bits.set_channel_lvl(TriggerWheel::Primary, levels[0]);
        bits.set_channel_lvl(TriggerWheel::Secondary, levels[1]);
    }

    for cyl in 0..cylinders.min(TDC_MSK.len() as u8) {
        if let Some(tdc) = cylinder_angle(cyl, cylinders, engine_cycle) {
            let angle = wrap_angle(shape.tdc_position + tdc, engine_cycle)?;
            let sample = FloatCore::round(angle / step) as usize % pt.len();
            pt[sample].set_tdc_lvl(cyl as usize, Level::High);
        }
    }
    Ok(())
}
