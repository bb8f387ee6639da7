#![cfg_attr(not(test), no_std)]
//! Crank/cam trigger decoding, engine phase tracking and angle based scheduling.
//!
//! Edges captured on the trigger inputs go through the [`decoder`], which
//! recognizes the configured [`waveform`] and reports a tooth index once
//! synchronized. The [`rpm`] calculator derives speed from those teeth and the
//! [`scheduler`] turns crank angles into timer deadlines. [`engine::Engine`]
//! owns all of it and is the only entry point the board code needs.

pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod math;
pub mod rpm;
pub mod scheduler;
pub mod shapes;
pub mod stimulus;
pub mod trigger_form;
pub mod waveform;

pub use config::{EngineConfig, InjectionMode, OperationMode, TriggerConfig};
pub use engine::Engine;
pub use error::{DiagnosticSink, FatalError, ShapeError, Warning};
pub use shapes::TriggerType;

/// Crank angle in degrees
pub type Angle = f32;

/// Timestamp or duration in microseconds
pub type TimeUs = u64;

/// Signal level, for crank, cam and TDC signaling
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum Level {
    Low = 0,
    High = 1,
}

impl core::ops::Not for Level {
    type Output = Level;

    fn not(self) -> Self::Output {
        if self == Level::High {
            Level::Low
        } else {
            Level::High
        }
    }
}

/// Trigger input the edge was captured on
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum TriggerWheel {
    /// Usually the crankshaft wheel
    Primary,
    /// Usually the camshaft wheel
    Secondary,
}

/// Number of trigger inputs a waveform can describe
pub const TRIGGER_CHANNEL_COUNT: usize = 2;

impl TriggerWheel {
    pub const fn index(&self) -> usize {
        match *self {
            TriggerWheel::Primary => 0,
            TriggerWheel::Secondary => 1,
        }
    }
}

/// Direction of a signal transition
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum Edge {
    Rise,
    Fall,
}

impl Edge {
    /// Level of the signal right after this transition
    pub const fn level(&self) -> Level {
        match *self {
            Edge::Rise => Level::High,
            Edge::Fall => Level::Low,
        }
    }
}

/// One captured transition, as delivered by the capture driver
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(PartialEq, Clone, Copy, Debug)]
pub struct TriggerEdge {
    pub channel: TriggerWheel,
    pub edge: Edge,
    pub timestamp: TimeUs,
}

impl TriggerEdge {
    pub const fn new(channel: TriggerWheel, edge: Edge, timestamp: TimeUs) -> Self {
        TriggerEdge {
            channel,
            edge,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Edge, Level};
    use rstest::rstest;

    #[rstest(lvl, expected, case(Level::Low, Level::High), case(Level::High, Level::Low))]
    fn level_not_test(lvl: Level, expected: Level) {
        assert_eq!(expected, !lvl);
    }

    #[rstest(edge, expected, case(Edge::Rise, Level::High), case(Edge::Fall, Level::Low))]
    fn edge_level_test(edge: Edge, expected: Level) {
        assert_eq!(expected, edge.level());
    }
}
