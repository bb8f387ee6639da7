use heapless::HistoryBuffer;
use thiserror_no_std::Error;

use crate::{Angle, TimeUs};

/// Malformed trigger shape. The shape stays invalid until it is rebuilt.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum ShapeError {
    #[error("operationMode not set")]
    OperationModeUnset,
    #[error("angle should be positive not above 1: angle {angle}")]
    AngleOutOfRange { angle: f32 },
    #[error("invalid angle order: new={angle} prev={previous}")]
    AngleOrder { angle: f32, previous: f32 },
    #[error("same angle: not supported, angle {angle}")]
    SameAngle { angle: f32 },
    #[error("trigger shape overflow")]
    TooManyEvents,
    #[error("not a mode for 360 degree events")]
    NotAModeFor360,
    #[error("gap index {0} out of range")]
    GapIndexOutOfRange(usize),
    #[error("should be even number of events channel={channel} count={count}")]
    OddEventCount { channel: usize, count: usize },
    #[error("single tooth primary does not match synchronization need")]
    SyncConstraint,
    #[error("both fronts required")]
    BothFrontsRequired,
    #[error("invalid tooth count for missing tooth wheel: {total}-{skipped}")]
    InvalidToothCount { total: usize, skipped: usize },
    #[error("no unique synchronization point in trigger shape")]
    SyncPointNotFound,
    #[error("engine cycle event table overflow")]
    EventTableOverflow,
    #[error("trigger shape has no events")]
    Empty,
}

impl ShapeError {
    /// Build-time bugs which must stop control output, not just the decoder
    pub fn fatal(&self) -> Option<FatalError> {
        match *self {
            ShapeError::OperationModeUnset => Some(FatalError::OperationModeUnset),
            ShapeError::NotAModeFor360 => Some(FatalError::NotAModeFor360),
            ShapeError::GapIndexOutOfRange(idx) => Some(FatalError::GapIndexOutOfRange(idx)),
            _ => None,
        }
    }
}

/// Recoverable condition, reported for visibility only
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum Warning {
    #[error("sync error: no gap at index {index}")]
    SyncError { index: usize },
    #[error("sync count mismatch channel={channel} expected={expected} actual={actual}")]
    SyncCountMismatch {
        channel: usize,
        expected: usize,
        actual: usize,
    },
    #[error("trigger edge out of order: {timestamp} after {previous}")]
    EdgeOutOfOrder { timestamp: TimeUs, previous: TimeUs },
    #[error("angle constraint violation: {angle} before tooth at {tooth_angle}")]
    AngleConstraintViolation { angle: Angle, tooth_angle: Angle },
    #[error("zero engine cycle period, noisy rpm")]
    ZeroPeriodRpm,
    #[error("unrealistic rpm {rpm}, noisy rpm")]
    UnrealisticRpm { rpm: f32 },
    #[error("cannot schedule by angle without rpm")]
    NoRpmForSchedule,
    #[error("trigger shape definition error: {0}")]
    ShapeDefinition(ShapeError),
}

impl Warning {
    /// Numeric code as shown on the console
    pub const fn code(&self) -> u16 {
        match *self {
            Warning::SyncError { .. } => 6040,
            Warning::SyncCountMismatch { .. } => 6041,
            Warning::EdgeOutOfOrder { .. } => 6042,
            Warning::AngleConstraintViolation { .. } => 6043,
            Warning::ZeroPeriodRpm => 6044,
            Warning::UnrealisticRpm { .. } => 6045,
            Warning::NoRpmForSchedule => 6046,
            Warning::ShapeDefinition(_) => 6599,
        }
    }
}

/// Configuration bug, control output has to stop
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum FatalError {
    #[error("operation mode not set when adding trigger event")]
    OperationModeUnset,
    #[error("not a mode for 360 degree events")]
    NotAModeFor360,
    #[error("gap index {0} out of range")]
    GapIndexOutOfRange(usize),
    #[error("cycle duration is zero or NaN")]
    InvalidCycleDuration,
    #[error("angle is NaN")]
    InvalidAngle,
    #[error("timer slot {0} does not exist")]
    InvalidTimerSlot(usize),
    #[error("no timer slot left")]
    TimerSlotsExhausted,
    #[error("angle event {0} does not exist")]
    UnknownAngleEvent(usize),
}

/// Either kind of report, for paths which can produce both
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Diagnostic {
    Warning(Warning),
    Fatal(FatalError),
}

impl From<Warning> for Diagnostic {
    fn from(warning: Warning) -> Self {
        Diagnostic::Warning(warning)
    }
}

impl From<FatalError> for Diagnostic {
    fn from(error: FatalError) -> Self {
        Diagnostic::Fatal(error)
    }
}

impl From<ShapeError> for Diagnostic {
    fn from(error: ShapeError) -> Self {
        match error.fatal() {
            Some(fatal) => Diagnostic::Fatal(fatal),
            None => Diagnostic::Warning(Warning::ShapeDefinition(error)),
        }
    }
}

/// Where warnings and fatal errors end up (console, telemetry, test log)
pub trait DiagnosticSink {
    fn warning(&mut self, warning: Warning);
    fn fatal(&mut self, error: FatalError);

    fn report(&mut self, diagnostic: Diagnostic) {
        match diagnostic {
            Diagnostic::Warning(warning) => self.warning(warning),
            Diagnostic::Fatal(error) => self.fatal(error),
        }
    }
}

/// Sink forwarding everything to the `log` facade
#[derive(Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn warning(&mut self, warning: Warning) {
        log::warn!("W{}: {}", warning.code(), warning);
    }

    fn fatal(&mut self, error: FatalError) {
        log::error!("fatal: {}", error);
    }
}

/// Keeps the last `N` warnings and the first fatal error, logging all of them
pub struct RecentWarnings<const N: usize> {
    recent: HistoryBuffer<Warning, N>,
    total: u32,
    fatal: Option<FatalError>,
}

impl<const N: usize> RecentWarnings<N> {
    pub const fn new() -> Self {
        RecentWarnings {
            recent: HistoryBuffer::new(),
            total: 0,
            fatal: None,
        }
    }

    /// Warnings currently held, at most `N`
    pub fn count(&self) -> usize {
        self.recent.len()
    }

    /// Warnings reported since creation, including evicted ones
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Oldest first
    pub fn get(&self, index: usize) -> Option<Warning> {
        self.recent.oldest_ordered().nth(index).copied()
    }

    pub fn last(&self) -> Option<Warning> {
        self.recent.recent().copied()
    }

    pub fn count_of(&self, code: u16) -> usize {
        self.recent
            .oldest_ordered()
            .filter(|w| w.code() == code)
            .count()
    }

    /// First fatal error reported, later ones are only logged
    pub fn first_fatal(&self) -> Option<FatalError> {
        self.fatal
    }

    pub fn clear(&mut self) {
        self.recent.clear();
        self.total = 0;
        self.fatal = None;
    }
}

impl<const N: usize> Default for RecentWarnings<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> DiagnosticSink for RecentWarnings<N> {
    fn warning(&mut self, warning: Warning) {
        log::warn!("W{}: {}", warning.code(), warning);
        self.recent.write(warning);
        self.total = self.total.saturating_add(1);
    }

    fn fatal(&mut self, error: FatalError) {
        log::error!("fatal: {}", error);
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::{DiagnosticSink, FatalError, RecentWarnings, ShapeError, Warning};

    #[test]
    fn recent_warnings_evict_oldest() {
        let mut sink = RecentWarnings::<2>::new();
        sink.warning(Warning::ZeroPeriodRpm);
        sink.warning(Warning::SyncError { index: 3 });
        sink.warning(Warning::NoRpmForSchedule);

        assert_eq!(2, sink.count());
        assert_eq!(3, sink.total());
        assert_eq!(Some(Warning::SyncError { index: 3 }), sink.get(0));
        assert_eq!(Some(Warning::NoRpmForSchedule), sink.last());
        assert_eq!(0, sink.count_of(Warning::ZeroPeriodRpm.code()));
    }

    #[test]
    fn first_fatal_is_kept() {
        let mut sink = RecentWarnings::<2>::new();
        sink.fatal(FatalError::InvalidCycleDuration);
        sink.fatal(FatalError::InvalidAngle);
        assert_eq!(Some(FatalError::InvalidCycleDuration), sink.first_fatal());
    }

    #[test]
    fn only_build_bugs_are_fatal() {
        assert_eq!(
            Some(FatalError::OperationModeUnset),
            ShapeError::OperationModeUnset.fatal()
        );
        assert_eq!(None, ShapeError::SameAngle { angle: 0.5 }.fatal());
    }
}
