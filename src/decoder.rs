//! Edge by edge trigger decoding.
//!
//! The decoder measures the time between consecutive gap edges, recognizes
//! the synchronization tooth from the ratio of those durations and numbers
//! every following edge. Edge counts between two synchronization points are
//! checked against the waveform, a wrong count or a missing gap drops the
//! decoder back to hunting for the next gap.

use crate::error::{DiagnosticSink, Warning};
use crate::trigger_form::{is_gap_edge, TriggerFormDetails};
use crate::waveform::{TriggerWaveform, GAP_TRACKING_LENGTH};
use crate::{Edge, TimeUs, TriggerEdge, TRIGGER_CHANNEL_COUNT};

/// Decoder synchronization state
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum SyncState {
    /// Looking for the synchronization gap
    Unsynchronized,
    /// Gap seen once, edge count not confirmed yet
    TentativeSync,
    /// Consecutive trigger cycles agree with the waveform
    Locked,
}

/// Edge decoded into a position
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(PartialEq, Clone, Copy, Debug)]
pub struct Tooth {
    /// Counted edges since the synchronization point
    pub index: usize,
    /// Same, folded over every trigger cycle of the engine cycle
    pub engine_index: usize,
    /// This edge is the synchronization point
    pub trigger_cycle_start: bool,
    /// This edge starts an engine cycle
    pub engine_cycle_start: bool,
    /// Sync was (re)acquired on this edge, the engine cycle count restarts
    /// here and the previous cycle start is not a valid reference
    pub resync: bool,
    pub timestamp: TimeUs,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(PartialEq, Clone, Copy, Debug)]
pub enum EdgeOutcome {
    /// Not a counted edge, dropped
    Ignored,
    /// Counted, but the position is unknown
    Unsynchronized,
    Tooth(Tooth),
}

pub struct TriggerDecoder {
    state: SyncState,
    /// Durations between gap edges, most recent first
    gap_history: [TimeUs; GAP_TRACKING_LENGTH + 1],
    gap_samples: usize,
    last_gap_edge: Option<TimeUs>,
    last_edge: Option<TimeUs>,
    current_index: usize,
    event_count: [usize; TRIGGER_CHANNEL_COUNT],
    /// Trigger cycles since the current synchronization started
    cycle_count: u32,
    consecutive_good_cycles: u32,
    total_desyncs: u32,
    out_of_order_edges: u32,
}

impl Default for TriggerDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerDecoder {
    pub const fn new() -> Self {
        TriggerDecoder {
            state: SyncState::Unsynchronized,
            gap_history: [0; GAP_TRACKING_LENGTH + 1],
            gap_samples: 0,
            last_gap_edge: None,
            last_edge: None,
            current_index: 0,
            event_count: [0; TRIGGER_CHANNEL_COUNT],
            cycle_count: 0,
            consecutive_good_cycles: 0,
            total_desyncs: 0,
            out_of_order_edges: 0,
        }
    }

    /// Forgets everything, counters included
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn lose_sync(&mut self) {
        self.state = SyncState::Unsynchronized;
        self.current_index = 0;
        self.event_count = [0; TRIGGER_CHANNEL_COUNT];
        self.cycle_count = 0;
        self.consecutive_good_cycles = 0;
    }

    /// Decodes one captured edge.
    ///
    /// Nothing is decoded against an invalid waveform or before the angle
    /// table is prepared.
    pub fn decode<D: DiagnosticSink + ?Sized>(
        &mut self,
        shape: &TriggerWaveform,
        details: &TriggerFormDetails,
        edge: TriggerEdge,
        use_only_rising_edge: bool,
        sink: &mut D,
    ) -> EdgeOutcome {
        if !shape.is_valid() || !details.is_ready() {
            return EdgeOutcome::Ignored;
        }
        if use_only_rising_edge && edge.edge == Edge::Fall {
            return EdgeOutcome::Ignored;
        }
        if let Some(previous) = self.last_edge {
            if edge.timestamp < previous {
                self.out_of_order_edges = self.out_of_order_edges.saturating_add(1);
                sink.warning(Warning::EdgeOutOfOrder {
                    timestamp: edge.timestamp,
                    previous,
                });
                return EdgeOutcome::Ignored;
            }
        }
        self.last_edge = Some(edge.timestamp);

        let mut sync_point = false;
        if is_gap_edge(shape, edge.channel, edge.edge) {
            self.track_gap(edge.timestamp);
            sync_point = !shape.is_synchronization_needed || self.gaps_match(shape);
        }

        let per_cycle = details.trigger_cycle_events();
        if sync_point {
            self.on_sync_point(shape, sink);
        } else if self.state != SyncState::Unsynchronized {
            self.current_index += 1;
            if self.current_index >= per_cycle {
                sink.warning(Warning::SyncError {
                    index: self.current_index,
                });
                self.total_desyncs = self.total_desyncs.saturating_add(1);
                self.lose_sync();
                return EdgeOutcome::Unsynchronized;
            }
        }
        self.event_count[edge.channel.index()] += 1;

        if self.state == SyncState::Unsynchronized {
            return EdgeOutcome::Unsynchronized;
        }
        let multiplier = (details.engine_cycle_events() / per_cycle.max(1)).max(1) as u32;
        let engine_index = self.current_index + per_cycle * (self.cycle_count % multiplier) as usize;
        EdgeOutcome::Tooth(Tooth {
            index: self.current_index,
            engine_index,
            trigger_cycle_start: sync_point,
            engine_cycle_start: engine_index == 0,
            resync: sync_point && self.state == SyncState::TentativeSync,
            timestamp: edge.timestamp,
        })
    }

    fn track_gap(&mut self, timestamp: TimeUs) {
        if let Some(last) = self.last_gap_edge {
            self.gap_history.copy_within(0..GAP_TRACKING_LENGTH, 1);
            self.gap_history[0] = timestamp - last;
            self.gap_samples = (self.gap_samples + 1).min(GAP_TRACKING_LENGTH + 1);
        }
        self.last_gap_edge = Some(timestamp);
    }

    /// Every configured window has to match, gap 0 is checked first
    fn gaps_match(&self, shape: &TriggerWaveform) -> bool {
        shape.gaps().all(|(i, window)| {
            i + 1 < self.gap_samples && window.contains(self.gap_ratio(i))
        })
    }

    /// `gap i / gap i+1`, gap 0 being the one which just ended
    pub fn gap_ratio(&self, index: usize) -> f32 {
        match (self.gap_history.get(index), self.gap_history.get(index + 1)) {
            (Some(&newer), Some(&older)) if older != 0 => newer as f32 / older as f32,
            _ => f32::NAN,
        }
    }

    fn on_sync_point<D: DiagnosticSink + ?Sized>(&mut self, shape: &TriggerWaveform, sink: &mut D) {
        match self.state {
            SyncState::Unsynchronized => {
                log::debug!("trigger gap found");
                self.state = SyncState::TentativeSync;
                self.cycle_count = 0;
            }
            SyncState::TentativeSync | SyncState::Locked => {
                let mismatch = shape
                    .expected_event_counts()
                    .iter()
                    .zip(self.event_count.iter())
                    .enumerate()
                    .map(|(channel, (&expected, &actual))| (channel, expected, actual))
                    .find(|&(_, expected, actual)| expected != actual);
                if let Some((channel, expected, actual)) = mismatch {
                    sink.warning(Warning::SyncCountMismatch {
                        channel,
                        expected,
                        actual,
                    });
                    self.total_desyncs = self.total_desyncs.saturating_add(1);
                    self.state = SyncState::TentativeSync;
                    self.cycle_count = 0;
                    self.consecutive_good_cycles = 0;
                } else {
                    if self.state == SyncState::TentativeSync {
                        log::info!("trigger synchronized");
                    }
                    self.state = SyncState::Locked;
                    self.cycle_count = self.cycle_count.wrapping_add(1);
                    self.consecutive_good_cycles = self.consecutive_good_cycles.saturating_add(1);
                }
            }
        }
        self.current_index = 0;
        self.event_count = [0; TRIGGER_CHANNEL_COUNT];
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Tooth positions are being reported
    pub fn is_synchronized(&self) -> bool {
        self.state != SyncState::Unsynchronized
    }

    pub fn is_locked(&self) -> bool {
        self.state == SyncState::Locked
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn total_desyncs(&self) -> u32 {
        self.total_desyncs
    }

    pub fn out_of_order_edges(&self) -> u32 {
        self.out_of_order_edges
    }

    pub fn consecutive_good_cycles(&self) -> u32 {
        self.consecutive_good_cycles
    }

    pub fn last_edge(&self) -> Option<TimeUs> {
        self.last_edge
    }

    /// An edge was seen less than `timeout` ago
    pub fn engine_moved_recently(&self, now: TimeUs, timeout: TimeUs) -> bool {
        self.last_edge
            .map_or(false, |last| now.saturating_sub(last) < timeout)
    }
}
