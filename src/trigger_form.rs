//! Engine cycle view of a waveform.
//!
//! The decoder numbers edges from the synchronization point, so everything
//! that maps an angle to a tooth needs the waveform's edges rotated to start
//! there and unrolled over the full engine cycle.

use heapless::Vec;

use crate::error::{Diagnostic, ShapeError, Warning};
use crate::math::wrap_angle;
use crate::waveform::{TriggerWaveform, MAX_EVENT_COUNT};
use crate::{Angle, Edge, TriggerWheel};

/// Edges per engine cycle the angle table can hold
pub const MAX_ENGINE_CYCLE_EVENTS: usize = 512;

/// Tooth plus angular offset, what an angle based event is anchored on
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(PartialEq, Clone, Copy, Debug)]
pub struct TriggerPosition {
    /// Edge index within the engine cycle, counted from the sync point
    pub trigger_event_index: usize,
    /// Degrees past that edge
    pub angle_offset: Angle,
}

pub struct TriggerFormDetails {
    /// Engine cycle angle of each counted edge relative to the sync point
    event_angles: Vec<Angle, MAX_ENGINE_CYCLE_EVENTS>,
    /// Waveform index of each edge the decoder counts
    useful_events: Vec<usize, MAX_EVENT_COUNT>,
    /// Position of the sync point within `useful_events`
    sync_point_index: usize,
    tdc_position: Angle,
    engine_cycle: Angle,
}

impl Default for TriggerFormDetails {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerFormDetails {
    pub fn new() -> Self {
        TriggerFormDetails {
            event_angles: Vec::new(),
            useful_events: Vec::new(),
            sync_point_index: 0,
            tdc_position: 0.0,
            engine_cycle: crate::config::FOUR_STROKE_CYCLE_DURATION,
        }
    }

    pub fn clear(&mut self) {
        self.event_angles.clear();
        self.useful_events.clear();
        self.sync_point_index = 0;
    }

    pub fn is_ready(&self) -> bool {
        !self.event_angles.is_empty()
    }

    /// Builds the angle table for a finished waveform. Nothing is prepared
    /// for a shape carrying a definition error.
    pub fn prepare(&mut self, shape: &TriggerWaveform, use_only_rising_edge: bool) -> Result<(), ShapeError> {
        self.clear();
        if let Some(error) = shape.shape_error() {
            return Err(error);
        }
        let mode = shape.operation_mode().ok_or(ShapeError::OperationModeUnset)?;

        for (index, event) in shape.events().iter().enumerate() {
            if !use_only_rising_edge || event.edge == Edge::Rise {
                self.useful_events
                    .push(index)
                    .map_err(|_| ShapeError::TooManyEvents)?;
            }
        }
        if self.useful_events.is_empty() {
            return Err(ShapeError::Empty);
        }

        let sync = match self.find_sync_point(shape) {
            Some(sync) => sync,
            None => {
                self.clear();
                return Err(ShapeError::SyncPointNotFound);
            }
        };
        self.sync_point_index = sync;

        let per_cycle = self.useful_events.len();
        let total = per_cycle * mode.cycle_multiplier();
        if total > MAX_ENGINE_CYCLE_EVENTS {
            self.clear();
            return Err(ShapeError::EventTableOverflow);
        }

        let base = self.useful_angle(shape, sync);
        for i in 0..total {
            let angle = self.useful_angle(shape, sync + i) - base;
            // capacity checked above
            let _ = self.event_angles.push(angle);
        }
        self.tdc_position = shape.tdc_position;
        self.engine_cycle = mode.engine_cycle();
        log::debug!(
            "trigger form ready: {} edges per cycle, sync at edge {}",
            per_cycle,
            self.useful_events[sync]
        );
        Ok(())
    }

    /// Angle of the `index`-th counted edge, unrolled across trigger cycles
    fn useful_angle(&self, shape: &TriggerWaveform, index: usize) -> Angle {
        let per_cycle = self.useful_events.len();
        let crank_cycle = index / per_cycle;
        let position = shape
            .switch_angle(self.useful_events[index % per_cycle])
            .unwrap_or(0.0);
        shape.cycle_duration() * crank_cycle as f32 + position
    }

    /// Finds the single counted edge where every enabled gap window matches
    fn find_sync_point(&self, shape: &TriggerWaveform) -> Option<usize> {
        let cycle = shape.cycle_duration();
        let mut gap_edges: Vec<(usize, Angle), MAX_EVENT_COUNT> = Vec::new();
        for (useful_index, &event_index) in self.useful_events.iter().enumerate() {
            let event = shape.event(event_index)?;
            if is_gap_edge(shape, event.channel, event.edge) {
                let _ = gap_edges.push((useful_index, event.angle * cycle));
            }
        }
        if gap_edges.is_empty() {
            return None;
        }
        if !shape.is_synchronization_needed {
            return Some(gap_edges[0].0);
        }
        let count = gap_edges.len();
        if count < 2 {
            return None;
        }

        // duration ending at gap edge k, wrapping around the cycle
        let duration = |k: usize| -> Angle {
            let current = gap_edges[k % count].1;
            let previous = gap_edges[(k + count - 1) % count].1;
            if k % count == 0 {
                current + cycle - previous
            } else {
                current - previous
            }
        };

        let mut found = None;
        for k in 0..count {
            let matches = shape.gaps().all(|(i, window)| {
                // walk back i gaps
                let newer = k + count * GAP_LOOKBACK - i;
                window.contains(duration(newer) / duration(newer - 1))
            });
            if matches {
                if found.is_some() {
                    return None;
                }
                found = Some(gap_edges[k].0);
            }
        }
        found
    }

    /// Counted edges per trigger cycle
    pub fn trigger_cycle_events(&self) -> usize {
        self.useful_events.len()
    }

    /// Counted edges per engine cycle
    pub fn engine_cycle_events(&self) -> usize {
        self.event_angles.len()
    }

    /// Waveform index of the synchronization edge
    pub fn sync_event_index(&self) -> Option<usize> {
        self.useful_events.get(self.sync_point_index).copied()
    }

    pub fn event_angles(&self) -> &[Angle] {
        &self.event_angles
    }

    pub fn event_angle(&self, index: usize) -> Option<Angle> {
        self.event_angles.get(index).copied()
    }

    pub fn engine_cycle(&self) -> Angle {
        self.engine_cycle
    }

    pub fn tdc_position(&self) -> Angle {
        self.tdc_position
    }

    /// Index of the last edge at or before `target_angle`, binary search over
    /// the sorted angle table
    pub fn find_angle_index(&self, target_angle: Angle) -> usize {
        self.event_angles
            .partition_point(|&angle| angle <= target_angle)
            .saturating_sub(1)
    }

    /// Maps an engine angle (0 = TDC #1) onto the tooth preceding it
    pub fn find_trigger_position(
        &self,
        angle: Angle,
        global_trigger_angle_offset: Angle,
    ) -> Result<TriggerPosition, Diagnostic> {
        if !self.is_ready() {
            return Err(Warning::ShapeDefinition(ShapeError::Empty).into());
        }
        let angle = wrap_angle(
            angle + self.tdc_position + global_trigger_angle_offset,
            self.engine_cycle,
        )?;
        let index = self.find_angle_index(angle);
        let tooth_angle = self.event_angles[index];
        let angle_offset = angle - tooth_angle;
        if angle_offset < 0.0 {
            return Err(Warning::AngleConstraintViolation { angle, tooth_angle }.into());
        }
        Ok(TriggerPosition {
            trigger_event_index: index,
            angle_offset,
        })
    }
}

/// Whole cycles added before walking back through gap durations, keeps the
/// index unsigned for tracking lengths up to four
const GAP_LOOKBACK: usize = 2;

/// Edges on which the decoder measures gaps
pub fn is_gap_edge(shape: &TriggerWaveform, channel: TriggerWheel, edge: Edge) -> bool {
    channel == TriggerWheel::Primary && edge == shape.sync_edge
}

#[cfg(test)]
mod tests {
    use crate::config::OperationMode;
    use crate::error::{Diagnostic, ShapeError, Warning};
    use crate::shapes::initialize_skipped_tooth_waveform;
    use crate::trigger_form::TriggerFormDetails;
    use crate::waveform::TriggerWaveform;
    use rstest::rstest;

    fn prepared(total: usize, skipped: usize, rising: bool) -> (TriggerWaveform, TriggerFormDetails) {
        let mut shape = TriggerWaveform::new();
        initialize_skipped_tooth_waveform(&mut shape, total, skipped, OperationMode::FourStrokeCrankSensor).unwrap();
        shape.calculate_expected_event_counts(rising).unwrap();
        let mut details = TriggerFormDetails::new();
        details.prepare(&shape, rising).unwrap();
        (shape, details)
    }

    #[test]
    fn sixty_minus_two_syncs_after_the_gap() {
        let (shape, details) = prepared(60, 2, false);
        assert_eq!(Some(0), details.sync_event_index());
        assert_eq!(116, details.trigger_cycle_events());
        assert_eq!(shape.length(), details.engine_cycle_events());
        assert_eq!(Some(0.0), details.event_angle(0));
        assert!((details.event_angle(1).unwrap() - 3.0).abs() < 1e-3);
        assert!(details.event_angles().windows(2).all(|w| w[0] < w[1]));
        assert!(*details.event_angles().last().unwrap() < 720.0);
    }

    #[test]
    fn rising_only_counts_half_the_edges() {
        let (_, details) = prepared(36, 1, true);
        assert_eq!(35, details.trigger_cycle_events());
        assert_eq!(70, details.engine_cycle_events());
        assert!((details.event_angle(1).unwrap() - 10.0).abs() < 1e-3);
    }

    #[rstest(angle, expected,
        case(0.0, 0),
        case(2.9, 0),
        case(3.5, 1),
        case(6.0, 2),
        case(719.0, 231)
    )]
    fn find_angle_index_test(angle: f32, expected: usize) {
        let (_, details) = prepared(60, 2, false);
        assert_eq!(expected, details.find_angle_index(angle));
    }

    #[test]
    fn trigger_position_wraps_and_offsets() {
        let (_, details) = prepared(60, 2, false);
        let pos = details.find_trigger_position(10.0, 0.0).unwrap();
        assert_eq!(3, pos.trigger_event_index);
        assert!((pos.angle_offset - 1.0).abs() < 1e-3);

        let pos = details.find_trigger_position(-710.0, 0.0).unwrap();
        assert_eq!(3, pos.trigger_event_index);

        let pos = details.find_trigger_position(0.0, 10.0).unwrap();
        assert_eq!(3, pos.trigger_event_index);
    }

    #[test]
    fn invalid_shape_is_not_prepared() {
        let mut shape = TriggerWaveform::new();
        shape.initialize(OperationMode::FourStrokeCamSensor);
        let _ = shape.add_event(1.5, crate::TriggerWheel::Primary, crate::Edge::Rise);
        let mut details = TriggerFormDetails::new();
        assert_eq!(
            Err(ShapeError::AngleOutOfRange { angle: 1.5 }),
            details.prepare(&shape, false)
        );
        assert!(!details.is_ready());
        assert_eq!(
            Err(Diagnostic::Warning(Warning::ShapeDefinition(ShapeError::Empty))),
            details.find_trigger_position(0.0, 0.0)
        );
    }
}
