//! Catalog of supported trigger wheels.
//!
//! Every pattern is a plain builder function filling a [`TriggerWaveform`];
//! selecting a wheel never involves more than picking the right function.

use crate::config::{EngineConfig, OperationMode};
use crate::error::ShapeError;
use crate::waveform::TriggerWaveform;
use crate::{Edge, TriggerWheel};

/// Fills an initialized waveform for the given operation mode
pub type ShapeBuilder = fn(&mut TriggerWaveform, OperationMode) -> Result<(), ShapeError>;

/// Type of trigger wheel
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum TriggerType {
    /// Missing tooth wheel with any tooth count, mounted per operation mode
    ToothedWheel { total: usize, skipped: usize },
    ToothedWheel60_2,
    ToothedWheel36_1,
    ToothedWheel36_2,
    ToothedWheel32_2,
    /// Twelve evenly spaced crank teeth, no phase information
    TwelveToothCrank,
    /// Single tooth per trigger cycle
    One,
    /// Three evenly spaced crank teeth, no phase information
    ThreeTooth,
    /// One cam tooth on the primary input, one on the secondary
    OnePlusOne,
    /// Single cam tooth plus a three tooth crank wheel
    ThreePlusOneCam,
}

impl TriggerType {
    /// Total and missing teeth for missing tooth wheels
    pub const fn toothed_wheel(&self) -> Option<(usize, usize)> {
        match *self {
            TriggerType::ToothedWheel { total, skipped } => Some((total, skipped)),
            TriggerType::ToothedWheel60_2 => Some((60, 2)),
            TriggerType::ToothedWheel36_1 => Some((36, 1)),
            TriggerType::ToothedWheel36_2 => Some((36, 2)),
            TriggerType::ToothedWheel32_2 => Some((32, 2)),
            _ => None,
        }
    }

    /// Builder for catalog patterns. The parameterized wheel has none, see
    /// [`TriggerType::build`].
    pub fn builder(&self) -> Option<ShapeBuilder> {
        let builder: ShapeBuilder = match *self {
            TriggerType::ToothedWheel { .. } => return None,
            TriggerType::ToothedWheel60_2 => build_60_2,
            TriggerType::ToothedWheel36_1 => build_36_1,
            TriggerType::ToothedWheel36_2 => build_36_2,
            TriggerType::ToothedWheel32_2 => build_32_2,
            TriggerType::TwelveToothCrank => build_twelve_tooth_crank,
            TriggerType::One => build_one,
            TriggerType::ThreeTooth => build_three_tooth,
            TriggerType::OnePlusOne => build_one_plus_one,
            TriggerType::ThreePlusOneCam => build_three_plus_one_cam,
        };
        Some(builder)
    }

    pub fn build(&self, shape: &mut TriggerWaveform, operation_mode: OperationMode) -> Result<(), ShapeError> {
        match (*self, self.builder()) {
            (TriggerType::ToothedWheel { total, skipped }, _) => {
                initialize_skipped_tooth_waveform(shape, total, skipped, operation_mode)
            }
            (_, Some(builder)) => builder(shape, operation_mode),
            (_, None) => Err(ShapeError::Empty),
        }
    }
}

/// Builds the configured wheel and validates it against the edge policy.
/// Any failure is kept in the waveform as its definition error.
pub fn initialize_trigger_waveform(shape: &mut TriggerWaveform, config: &EngineConfig) -> Result<(), ShapeError> {
    shape.initialize(config.operation_mode);
    let built = config
        .trigger
        .trigger_type
        .build(shape, config.operation_mode)
        .and_then(|_| shape.calculate_expected_event_counts(config.trigger.use_only_rising_edge));
    if let Err(error) = built {
        if shape.is_valid() {
            shape.set_shape_definition_error(error);
        }
        return Err(error);
    }
    log::info!(
        "trigger {:?}: {} edges per cycle, {} per engine cycle",
        config.trigger.trigger_type,
        shape.size(),
        shape.length()
    );
    Ok(())
}

/// Evenly spaced teeth with `skipped` of them removed before the cycle end.
/// Every tooth is half a pitch wide, the last one stretches to the cycle end.
pub fn initialize_skipped_tooth_waveform(
    shape: &mut TriggerWaveform,
    total: usize,
    skipped: usize,
    operation_mode: OperationMode,
) -> Result<(), ShapeError> {
    shape.initialize(operation_mode);
    if total == 0 || skipped >= total {
        let error = ShapeError::InvalidToothCount { total, skipped };
        shape.set_shape_definition_error(error);
        return Err(error);
    }
    shape.set_trigger_synchronization_gap((skipped + 1) as f32)?;
    shape.set_second_trigger_synchronization_gap(1.0)?;
    shape.is_synchronization_needed = total > 2 && skipped != 0;

    let engine_cycle = operation_mode.engine_cycle();
    let pitch = engine_cycle / total as f32;
    let present = total - skipped;
    for tooth in 0..present - 1 {
        let rise = pitch * (tooth as f32 + 0.5);
        let fall = pitch * (tooth as f32 + 1.0);
        shape.add_event_clamped(rise, TriggerWheel::Primary, Edge::Rise, 0.0, engine_cycle)?;
        shape.add_event_clamped(fall, TriggerWheel::Primary, Edge::Fall, 0.0, engine_cycle)?;
    }
    let last_rise = pitch * ((present - 1) as f32 + 0.5);
    shape.add_event_clamped(last_rise, TriggerWheel::Primary, Edge::Rise, 0.0, engine_cycle)?;
    shape.add_event(1.0, TriggerWheel::Primary, Edge::Fall)
}

fn build_60_2(shape: &mut TriggerWaveform, mode: OperationMode) -> Result<(), ShapeError> {
    initialize_skipped_tooth_waveform(shape, 60, 2, mode)
}

fn build_36_1(shape: &mut TriggerWaveform, mode: OperationMode) -> Result<(), ShapeError> {
    initialize_skipped_tooth_waveform(shape, 36, 1, mode)
}

fn build_36_2(shape: &mut TriggerWaveform, mode: OperationMode) -> Result<(), ShapeError> {
    initialize_skipped_tooth_waveform(shape, 36, 2, mode)?;
    shape.set_trigger_synchronization_gap2(1.6, 3.5)?;
    shape.set_second_trigger_synchronization_gap2(0.7, 1.3)
}

fn build_32_2(shape: &mut TriggerWaveform, mode: OperationMode) -> Result<(), ShapeError> {
    initialize_skipped_tooth_waveform(shape, 32, 2, mode)?;
    shape.set_third_trigger_synchronization_gap(1.0)
}

/// One tooth per trigger cycle, the cycle start on every rise
fn single_tooth(shape: &mut TriggerWaveform, mode: OperationMode) -> Result<(), ShapeError> {
    shape.initialize(mode);
    shape.is_synchronization_needed = false;
    shape.add_event(0.5, TriggerWheel::Primary, Edge::Rise)?;
    shape.add_event(1.0, TriggerWheel::Primary, Edge::Fall)
}

fn build_twelve_tooth_crank(shape: &mut TriggerWaveform, _mode: OperationMode) -> Result<(), ShapeError> {
    single_tooth(shape, OperationMode::FourStrokeTwelveTimesCrankSensor)
}

fn build_three_tooth(shape: &mut TriggerWaveform, _mode: OperationMode) -> Result<(), ShapeError> {
    single_tooth(shape, OperationMode::FourStrokeThreeTimesCrankSensor)
}

fn build_one(shape: &mut TriggerWaveform, mode: OperationMode) -> Result<(), ShapeError> {
    initialize_skipped_tooth_waveform(shape, 1, 0, mode)
}

fn build_one_plus_one(shape: &mut TriggerWaveform, _mode: OperationMode) -> Result<(), ShapeError> {
    shape.initialize(OperationMode::FourStrokeCamSensor);
    shape.add_event_720(180.0, TriggerWheel::Primary, Edge::Rise)?;
    shape.add_event_720(360.0, TriggerWheel::Primary, Edge::Fall)?;
    shape.add_event_720(540.0, TriggerWheel::Secondary, Edge::Rise)?;
    shape.add_event_720(720.0, TriggerWheel::Secondary, Edge::Fall)?;
    shape.is_synchronization_needed = false;
    shape.use_only_primary_for_sync = true;
    Ok(())
}

fn build_three_plus_one_cam(shape: &mut TriggerWaveform, _mode: OperationMode) -> Result<(), ShapeError> {
    shape.initialize(OperationMode::FourStrokeCamSensor);
    shape.add_event_720(10.0, TriggerWheel::Primary, Edge::Rise)?;
    shape.add_event_720(50.0, TriggerWheel::Primary, Edge::Fall)?;
    // crank teeth, 60 deg wide every 120 deg
    for tooth in 0..6 {
        let rise = 60.0 + 120.0 * tooth as f32;
        shape.add_event_720(rise, TriggerWheel::Secondary, Edge::Rise)?;
        shape.add_event_720(rise + 60.0, TriggerWheel::Secondary, Edge::Fall)?;
    }
    shape.is_synchronization_needed = false;
    shape.use_only_primary_for_sync = true;
    Ok(())
}
