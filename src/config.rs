use crate::shapes::TriggerType;
use crate::{Angle, TimeUs};

/// Engine cycle of a four stroke engine, in crank degrees
pub const FOUR_STROKE_CYCLE_DURATION: Angle = 720.0;
/// Engine cycle of a two stroke engine, in crank degrees
pub const TWO_STROKE_CYCLE_DURATION: Angle = 360.0;

/// Default window after which a silent trigger means the engine stopped
pub const NO_RPM_EVENTS_TIMEOUT_US: TimeUs = 2_000_000;

/// Above this the measured RPM is treated as noise
pub const UNREALISTIC_RPM: f32 = 30_000.0;

/// How one decoded trigger cycle relates to the engine cycle
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum OperationMode {
    /// Trigger wheel turns once per engine cycle (cam speed)
    FourStrokeCamSensor,
    /// Trigger wheel on the crank, two turns per engine cycle
    FourStrokeCrankSensor,
    /// Crank wheel repeating twice per revolution
    FourStrokeSymmetricalCrankSensor,
    /// Crank wheel repeating three times per revolution
    FourStrokeThreeTimesCrankSensor,
    /// Crank wheel repeating twelve times per revolution
    FourStrokeTwelveTimesCrankSensor,
    TwoStroke,
}

impl OperationMode {
    /// Duration of a full engine cycle in crank degrees
    pub const fn engine_cycle(&self) -> Angle {
        match *self {
            OperationMode::TwoStroke => TWO_STROKE_CYCLE_DURATION,
            _ => FOUR_STROKE_CYCLE_DURATION,
        }
    }

    /// Crank degrees covered by one trigger cycle
    pub const fn cycle_duration(&self) -> Angle {
        match *self {
            OperationMode::FourStrokeCamSensor => 720.0,
            OperationMode::FourStrokeCrankSensor | OperationMode::TwoStroke => 360.0,
            OperationMode::FourStrokeSymmetricalCrankSensor => 180.0,
            OperationMode::FourStrokeThreeTimesCrankSensor => 120.0,
            OperationMode::FourStrokeTwelveTimesCrankSensor => 30.0,
        }
    }

    /// Number of trigger cycles per engine cycle
    pub const fn cycle_multiplier(&self) -> usize {
        match *self {
            OperationMode::FourStrokeCamSensor | OperationMode::TwoStroke => 1,
            OperationMode::FourStrokeCrankSensor => 2,
            OperationMode::FourStrokeSymmetricalCrankSensor => 4,
            OperationMode::FourStrokeThreeTimesCrankSensor => 6,
            OperationMode::FourStrokeTwelveTimesCrankSensor => 24,
        }
    }

    /// Crank revolutions per engine cycle
    pub const fn revolutions_per_engine_cycle(&self) -> u32 {
        match *self {
            OperationMode::TwoStroke => 1,
            _ => 2,
        }
    }

    /// True when a single trigger cycle can't tell the two crank turns apart
    pub const fn needs_disambiguation(&self) -> bool {
        match *self {
            OperationMode::FourStrokeCamSensor | OperationMode::TwoStroke => false,
            _ => true,
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum InjectionMode {
    /// All injectors at once
    Simultaneous,
    Sequential,
    /// Injectors fire in pairs
    Batch,
    SinglePoint,
}

/// Trigger input configuration
#[derive(PartialEq, Clone, Copy, Debug)]
pub struct TriggerConfig {
    /// Wheel pattern
    pub trigger_type: TriggerType,
    /// Ignore falling edges entirely
    pub use_only_rising_edge: bool,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        TriggerConfig {
            trigger_type: TriggerType::ToothedWheel60_2,
            use_only_rising_edge: false,
        }
    }
}

/// Engine configuration, as read by the phase core
#[derive(PartialEq, Clone, Copy, Debug)]
pub struct EngineConfig {
    pub trigger: TriggerConfig,
    /// Used by patterns that can be mounted on either crank or cam
    pub operation_mode: OperationMode,
    /// At or above this RPM the engine is running
    pub cranking_rpm: f32,
    /// Start phase tracking from instant RPM before the first full cycle
    pub fast_spin_up: bool,
    /// Drive cached RPM from tooth-to-tooth speed instead of per cycle
    pub always_instant_rpm: bool,
    /// Ceiling above which RPM is replaced by the noisy sentinel
    pub unrealistic_rpm: f32,
    /// Silence window after which the engine is stopped
    pub no_rpm_events_timeout_us: TimeUs,
    /// User offset from the trigger's own TDC position: DEG
    pub global_trigger_angle_offset: Angle,
    pub cranking_injection_mode: InjectionMode,
    pub injection_mode: InjectionMode,
    /// Number of cylinders, used for TDC generation
    pub cylinders_count: u8,
}

impl EngineConfig {
    pub const fn engine_cycle(&self) -> Angle {
        self.operation_mode.engine_cycle()
    }

    /// Cranking and running fuel differently means in-flight injections
    /// can't survive a state change
    pub fn injection_modes_differ(&self) -> bool {
        self.cranking_injection_mode != self.injection_mode
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            trigger: TriggerConfig::default(),
            operation_mode: OperationMode::FourStrokeCrankSensor,
            cranking_rpm: 550.0,
            fast_spin_up: false,
            always_instant_rpm: false,
            unrealistic_rpm: UNREALISTIC_RPM,
            no_rpm_events_timeout_us: NO_RPM_EVENTS_TIMEOUT_US,
            global_trigger_angle_offset: 0.0,
            cranking_injection_mode: InjectionMode::Simultaneous,
            injection_mode: InjectionMode::Sequential,
            cylinders_count: 4,
        }
    }
}
