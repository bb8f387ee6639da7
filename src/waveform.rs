//! Declarative description of one trigger cycle.
//!
//! A waveform is a list of tooth edges, each at a normalized position within
//! the trigger cycle, plus the gap ratios which identify the synchronization
//! tooth. Angles are kept as cycle fractions, the operation mode scales them
//! to crank degrees when they are read.

use heapless::Vec;

use crate::config::OperationMode;
use crate::error::ShapeError;
use crate::trigger_form::TriggerFormDetails;
use crate::{Angle, Edge, Level, TriggerWheel, TRIGGER_CHANNEL_COUNT};

/// Maximum number of edges in one trigger cycle
pub const MAX_EVENT_COUNT: usize = 256;

/// Number of consecutive gap ratios which can take part in synchronization
pub const GAP_TRACKING_LENGTH: usize = 4;

/// Tolerance applied around a nominal gap ratio
pub const TRIGGER_GAP_DEVIATION: f32 = 0.25;
pub const TRIGGER_GAP_DEVIATION_LOW: f32 = 1.0 - TRIGGER_GAP_DEVIATION;
pub const TRIGGER_GAP_DEVIATION_HIGH: f32 = 1.0 + TRIGGER_GAP_DEVIATION;

/// Single tooth edge of the waveform
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(PartialEq, Clone, Copy, Debug)]
pub struct WaveformEvent {
    /// Position within the trigger cycle, in (0, 1]
    pub angle: f32,
    pub channel: TriggerWheel,
    pub edge: Edge,
}

/// Accepted range of `current gap / previous gap`
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(PartialEq, Clone, Copy, Debug)]
pub struct GapWindow {
    pub from: f32,
    pub to: f32,
}

impl GapWindow {
    /// NaN lower bound means "do not use this ratio"
    pub const DISABLED: GapWindow = GapWindow {
        from: f32::NAN,
        to: 100_000.0,
    };

    pub fn around(ratio: f32) -> Self {
        GapWindow {
            from: ratio * TRIGGER_GAP_DEVIATION_LOW,
            to: ratio * TRIGGER_GAP_DEVIATION_HIGH,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.from.is_nan()
    }

    pub fn contains(&self, ratio: f32) -> bool {
        ratio >= self.from && ratio <= self.to
    }
}

pub struct TriggerWaveform {
    operation_mode: Option<OperationMode>,
    events: Vec<WaveformEvent, MAX_EVENT_COUNT>,
    gaps: [GapWindow; GAP_TRACKING_LENGTH],
    gap_tracking_length: usize,
    expected_event_count: [usize; TRIGGER_CHANNEL_COUNT],
    needs_secondary_input: bool,
    shape_error: Option<ShapeError>,
    /// False for shapes where every primary tooth is the cycle start
    pub is_synchronization_needed: bool,
    /// Decoding needs both rising and falling edges
    pub both_fronts_required: bool,
    /// Only primary channel edges take part in gap tracking
    pub use_only_primary_for_sync: bool,
    /// Edge direction on which gaps are measured
    pub sync_edge: Edge,
    /// Shape has no fixed relation to TDC, the user offset provides it
    pub shape_without_tdc: bool,
    /// Angle from the synchronization point to TDC #1: DEG
    pub tdc_position: Angle,
    /// Level of each channel at the start of the cycle
    pub initial_state: [Level; TRIGGER_CHANNEL_COUNT],
}

impl Default for TriggerWaveform {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerWaveform {
    /// Empty waveform without an operation mode, every add fails until `initialize`
    pub fn new() -> Self {
        let mut shape = TriggerWaveform {
            operation_mode: None,
            events: Vec::new(),
            gaps: [GapWindow::DISABLED; GAP_TRACKING_LENGTH],
            gap_tracking_length: 1,
            expected_event_count: [0; TRIGGER_CHANNEL_COUNT],
            needs_secondary_input: false,
            shape_error: None,
            is_synchronization_needed: true,
            both_fronts_required: false,
            use_only_primary_for_sync: false,
            sync_edge: Edge::Rise,
            shape_without_tdc: false,
            tdc_position: 0.0,
            initial_state: [Level::Low; TRIGGER_CHANNEL_COUNT],
        };
        shape.reset(None);
        shape
    }

    /// Drops all events and goes back to default gap settings
    pub fn initialize(&mut self, operation_mode: OperationMode) {
        self.reset(Some(operation_mode));
    }

    fn reset(&mut self, operation_mode: Option<OperationMode>) {
        self.operation_mode = operation_mode;
        self.events.clear();
        self.gaps = [GapWindow::DISABLED; GAP_TRACKING_LENGTH];
        self.gaps[0] = GapWindow::around(2.0);
        self.gap_tracking_length = 1;
        self.expected_event_count = [0; TRIGGER_CHANNEL_COUNT];
        self.needs_secondary_input = false;
        self.shape_error = None;
        self.is_synchronization_needed = true;
        self.both_fronts_required = false;
        self.use_only_primary_for_sync = false;
        self.sync_edge = Edge::Rise;
        self.shape_without_tdc = false;
        self.tdc_position = 0.0;
        self.initial_state = [Level::Low; TRIGGER_CHANNEL_COUNT];
    }

    pub fn operation_mode(&self) -> Option<OperationMode> {
        self.operation_mode
    }

    fn fail(&mut self, error: ShapeError) -> Result<(), ShapeError> {
        log::warn!("trigger shape definition error: {}", error);
        if self.shape_error.is_none() {
            self.shape_error = Some(error);
        }
        Err(error)
    }

    /// Marks the shape as unusable, the first error is the one kept
    pub fn set_shape_definition_error(&mut self, error: ShapeError) {
        let _ = self.fail(error);
    }

    pub fn shape_error(&self) -> Option<ShapeError> {
        self.shape_error
    }

    pub fn is_valid(&self) -> bool {
        self.shape_error.is_none()
    }

    /// Appends an edge at `angle`, a fraction of the trigger cycle.
    ///
    /// Edges have to be added in strictly increasing angle order. A rejected
    /// edge leaves the event list untouched but invalidates the shape.
    pub fn add_event(&mut self, angle: f32, channel: TriggerWheel, edge: Edge) -> Result<(), ShapeError> {
        if self.operation_mode.is_none() {
            return self.fail(ShapeError::OperationModeUnset);
        }
        if !(angle > 0.0 && angle <= 1.0) {
            return self.fail(ShapeError::AngleOutOfRange { angle });
        }
        if self.events.iter().any(|e| e.angle == angle) {
            return self.fail(ShapeError::SameAngle { angle });
        }
        if let Some(previous) = self.events.last().map(|e| e.angle) {
            if angle <= previous {
                return self.fail(ShapeError::AngleOrder { angle, previous });
            }
        }
        if self.events.push(WaveformEvent { angle, channel, edge }).is_err() {
            return self.fail(ShapeError::TooManyEvents);
        }
        if channel == TriggerWheel::Secondary {
            self.needs_secondary_input = true;
        }
        Ok(())
    }

    /// `angle` in degrees of a 720 degree cycle
    pub fn add_event_720(&mut self, angle: Angle, channel: TriggerWheel, edge: Edge) -> Result<(), ShapeError> {
        self.add_event(angle / 720.0, channel, edge)
    }

    /// `angle` in crank degrees, for cam or crank shapes only
    pub fn add_event_360(&mut self, angle: Angle, channel: TriggerWheel, edge: Edge) -> Result<(), ShapeError> {
        match self.operation_mode {
            None => self.fail(ShapeError::OperationModeUnset),
            Some(OperationMode::FourStrokeCamSensor) | Some(OperationMode::FourStrokeCrankSensor) => {
                self.add_event(2.0 * angle / 720.0, channel, edge)
            }
            Some(_) => self.fail(ShapeError::NotAModeFor360),
        }
    }

    /// `angle` in degrees of this shape's own cycle duration
    pub fn add_event_angle(&mut self, angle: Angle, channel: TriggerWheel, edge: Edge) -> Result<(), ShapeError> {
        match self.operation_mode {
            None => self.fail(ShapeError::OperationModeUnset),
            Some(mode) => self.add_event(angle / mode.cycle_duration(), channel, edge),
        }
    }

    /// `angle` in engine cycle degrees, silently dropped outside `(filter_left, filter_right)`
    pub fn add_event_clamped(
        &mut self,
        angle: Angle,
        channel: TriggerWheel,
        edge: Edge,
        filter_left: Angle,
        filter_right: Angle,
    ) -> Result<(), ShapeError> {
        if !(angle > filter_left && angle < filter_right) {
            return Ok(());
        }
        match self.operation_mode {
            None => self.fail(ShapeError::OperationModeUnset),
            Some(mode) => self.add_event(angle / mode.engine_cycle(), channel, edge),
        }
    }

    /// Window of the tooth right after the gap
    pub fn set_trigger_synchronization_gap(&mut self, ratio: f32) -> Result<(), ShapeError> {
        let window = GapWindow::around(ratio);
        self.set_trigger_synchronization_gap3(0, window.from, window.to)
    }

    pub fn set_trigger_synchronization_gap2(&mut self, from: f32, to: f32) -> Result<(), ShapeError> {
        self.set_trigger_synchronization_gap3(0, from, to)
    }

    pub fn set_second_trigger_synchronization_gap(&mut self, ratio: f32) -> Result<(), ShapeError> {
        let window = GapWindow::around(ratio);
        self.set_trigger_synchronization_gap3(1, window.from, window.to)
    }

    pub fn set_second_trigger_synchronization_gap2(&mut self, from: f32, to: f32) -> Result<(), ShapeError> {
        self.set_trigger_synchronization_gap3(1, from, to)
    }

    pub fn set_third_trigger_synchronization_gap(&mut self, ratio: f32) -> Result<(), ShapeError> {
        let window = GapWindow::around(ratio);
        self.set_trigger_synchronization_gap3(2, window.from, window.to)
    }

    /// Gap 0 is the synchronization signature, higher indices look further
    /// back and only confirm it
    pub fn set_trigger_synchronization_gap3(
        &mut self,
        gap_index: usize,
        from: f32,
        to: f32,
    ) -> Result<(), ShapeError> {
        if gap_index >= GAP_TRACKING_LENGTH {
            return self.fail(ShapeError::GapIndexOutOfRange(gap_index));
        }
        self.is_synchronization_needed = true;
        self.gaps[gap_index] = GapWindow { from, to };
        self.gap_tracking_length = self.gap_tracking_length.max(gap_index + 1);
        Ok(())
    }

    pub fn gap(&self, gap_index: usize) -> GapWindow {
        self.gaps.get(gap_index).copied().unwrap_or(GapWindow::DISABLED)
    }

    pub fn gap_tracking_length(&self) -> usize {
        self.gap_tracking_length
    }

    /// Enabled windows with their gap index, gap 0 first
    pub fn gaps(&self) -> impl Iterator<Item = (usize, &GapWindow)> + '_ {
        self.gaps[..self.gap_tracking_length]
            .iter()
            .enumerate()
            .filter(|(_, g)| g.is_enabled())
    }

    /// Validates the finished shape against the edge policy and derives the
    /// per channel event counts.
    pub fn calculate_expected_event_counts(&mut self, use_only_rising_edge: bool) -> Result<(), ShapeError> {
        if self.events.is_empty() {
            return self.fail(ShapeError::Empty);
        }
        let mut counts = [0usize; TRIGGER_CHANNEL_COUNT];
        for event in self.events.iter() {
            if !use_only_rising_edge || event.edge == Edge::Rise {
                counts[event.channel.index()] += 1;
            }
        }
        self.expected_event_count = counts;

        if !use_only_rising_edge {
            if let Some((channel, &count)) = counts.iter().enumerate().find(|(_, c)| *c % 2 != 0) {
                return self.fail(ShapeError::OddEventCount { channel, count });
            }
        }

        let single_tooth_on_primary = if use_only_rising_edge {
            counts[0] == 1
        } else {
            counts[0] == 2
        };
        if !self.shape_without_tdc && single_tooth_on_primary != !self.is_synchronization_needed {
            return self.fail(ShapeError::SyncConstraint);
        }
        if single_tooth_on_primary {
            self.use_only_primary_for_sync = true;
        }
        if self.both_fronts_required && use_only_rising_edge {
            return self.fail(ShapeError::BothFrontsRequired);
        }
        Ok(())
    }

    pub fn expected_event_count(&self, channel: TriggerWheel) -> usize {
        self.expected_event_count[channel.index()]
    }

    /// Edges per trigger cycle on each channel, by channel index
    pub fn expected_event_counts(&self) -> &[usize; TRIGGER_CHANNEL_COUNT] {
        &self.expected_event_count
    }

    pub fn needs_secondary_input(&self) -> bool {
        self.needs_secondary_input
    }

    /// Edges per trigger cycle
    pub fn size(&self) -> usize {
        self.events.len()
    }

    /// Edges per engine cycle
    pub fn length(&self) -> usize {
        self.operation_mode
            .map_or(0, |mode| mode.cycle_multiplier() * self.size())
    }

    pub fn events(&self) -> &[WaveformEvent] {
        &self.events
    }

    pub fn event(&self, index: usize) -> Option<&WaveformEvent> {
        self.events.get(index)
    }

    /// Crank degrees of one trigger cycle
    pub fn cycle_duration(&self) -> Angle {
        self.operation_mode
            .map_or(crate::config::FOUR_STROKE_CYCLE_DURATION, |mode| mode.cycle_duration())
    }

    pub fn engine_cycle(&self) -> Angle {
        self.operation_mode
            .map_or(crate::config::FOUR_STROKE_CYCLE_DURATION, |mode| mode.engine_cycle())
    }

    /// Position of an edge within its trigger cycle: DEG
    pub fn switch_angle(&self, index: usize) -> Option<Angle> {
        self.events.get(index).map(|e| self.cycle_duration() * e.angle)
    }

    /// Engine cycle position of the `index`-th edge, counting across trigger
    /// cycles for crank mounted shapes
    pub fn angle(&self, index: usize) -> Option<Angle> {
        let size = self.size();
        if size == 0 {
            return None;
        }
        let crank_cycle = index / size;
        let position = self.switch_angle(index % size)?;
        Some(self.cycle_duration() * crank_cycle as f32 + position)
    }

    /// Level of `channel` right after edge `index`
    pub fn channel_level(&self, index: usize, channel: TriggerWheel) -> Level {
        self.events
            .iter()
            .take(index + 1)
            .filter(|e| e.channel == channel)
            .fold(self.initial_state[channel.index()], |_, e| e.edge.level())
    }

    /// Index of the last known edge at or before `target_angle`
    pub fn find_angle_index(&self, details: &TriggerFormDetails, target_angle: Angle) -> usize {
        details.find_angle_index(target_angle)
    }
}
