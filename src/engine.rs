//! Engine context.
//!
//! [`Engine`] owns the configuration and every piece of phase state. Board
//! code forwards captured edges, timer expiries and the slow periodic tick,
//! nothing else is shared.

use heapless::Vec;

use crate::config::EngineConfig;
use crate::decoder::{EdgeOutcome, Tooth, TriggerDecoder};
use crate::error::{Diagnostic, DiagnosticSink, FatalError, ShapeError};
use crate::math::cylinder_angle;
use crate::rpm::{InstantRpm, RpmCalculator, SpinningState, Transition};
use crate::scheduler::{Action, OneShotTimer, Scheduler};
use crate::shapes::initialize_trigger_waveform;
use crate::trigger_form::{TriggerFormDetails, TriggerPosition};
use crate::waveform::TriggerWaveform;
use crate::{Angle, TimeUs, TriggerEdge};

/// Timer slots available to the engine
pub const ENGINE_TIMER_SLOTS: usize = 32;

pub const MAX_CONFIGURATION_OBSERVERS: usize = 4;

/// Called after every configuration change
pub type ConfigurationObserver = fn(&EngineConfig);

pub struct Engine<T: OneShotTimer, D: DiagnosticSink> {
    config: EngineConfig,
    shape: TriggerWaveform,
    details: TriggerFormDetails,
    decoder: TriggerDecoder,
    rpm: RpmCalculator,
    instant_rpm: InstantRpm,
    scheduler: Scheduler<T, ENGINE_TIMER_SLOTS>,
    sink: D,
    observers: Vec<ConfigurationObserver, MAX_CONFIGURATION_OBSERVERS>,
    halted: Option<FatalError>,
}

impl<T: OneShotTimer, D: DiagnosticSink> Engine<T, D> {
    /// Builds the trigger shape right away, a bad configuration is reported
    /// to `sink` and leaves the engine refusing to decode
    pub fn new(config: EngineConfig, timer: T, sink: D) -> Self {
        let mut engine = Engine {
            config,
            shape: TriggerWaveform::new(),
            details: TriggerFormDetails::new(),
            decoder: TriggerDecoder::new(),
            rpm: RpmCalculator::new(&config),
            instant_rpm: InstantRpm::new(config.engine_cycle()),
            scheduler: Scheduler::new(timer),
            sink,
            observers: Vec::new(),
            halted: None,
        };
        let _ = engine.apply_configuration(config);
        engine
    }

    /// Rebuilds the trigger shape and restarts synchronization. Angle events
    /// are anchored again on the new shape, observers run last.
    pub fn apply_configuration(&mut self, config: EngineConfig) -> Result<(), ShapeError> {
        self.config = config;
        self.decoder.reset();
        self.instant_rpm.reset(config.engine_cycle());
        self.rpm.configure(&config);

        let mut built = initialize_trigger_waveform(&mut self.shape, &config);
        if built.is_ok() {
            built = self
                .details
                .prepare(&self.shape, config.trigger.use_only_rising_edge);
        }
        match built {
            Ok(()) => {
                self.halted = None;
                self.anchor_angle_events();
            }
            Err(error) => {
                self.details.clear();
                self.report(error.into());
            }
        }
        for observer in self.observers.iter() {
            observer(&self.config);
        }
        built
    }

    fn anchor_angle_events(&mut self) {
        let offset = self.config.global_trigger_angle_offset;
        for event in self.scheduler.angle_events_mut() {
            let angle = event.angle();
            if let Err(diagnostic) = event.set_angle(&self.details, angle, offset) {
                report(&mut self.sink, &mut self.halted, diagnostic);
            }
        }
    }

    pub fn add_configuration_observer(
        &mut self,
        observer: ConfigurationObserver,
    ) -> Result<(), ConfigurationObserver> {
        self.observers.push(observer)
    }

    /// Forwards a diagnostic to the sink, a fatal one stops scheduling until
    /// the next valid configuration
    pub fn report(&mut self, diagnostic: Diagnostic) {
        report(&mut self.sink, &mut self.halted, diagnostic);
    }

    /// Edge capture interrupt entry
    pub fn on_trigger_edge(&mut self, edge: TriggerEdge) -> EdgeOutcome {
        if !self.shape.is_valid() {
            return EdgeOutcome::Ignored;
        }
        let outcome = self.decoder.decode(
            &self.shape,
            &self.details,
            edge,
            self.config.trigger.use_only_rising_edge,
            &mut self.sink,
        );
        if outcome == EdgeOutcome::Ignored {
            return outcome;
        }
        if let Some(transition) = self.rpm.set_spinning_up(edge.timestamp) {
            self.on_transition(transition);
        }
        if let EdgeOutcome::Tooth(tooth) = outcome {
            self.on_tooth(tooth);
        }
        outcome
    }

    fn on_tooth(&mut self, tooth: Tooth) {
        let now = tooth.timestamp;
        if tooth.resync {
            self.instant_rpm.reset(self.config.engine_cycle());
        }
        if tooth.engine_cycle_start {
            if tooth.resync {
                self.rpm.on_engine_cycle_resync(now);
            } else if let Some(transition) = self.rpm.on_engine_cycle_start(now, true, &mut self.sink) {
                self.on_transition(transition);
            }
        }

        if let Some(angle) = self.details.event_angle(tooth.engine_index) {
            if let Some(instant) = self.instant_rpm.update(now, angle) {
                if self.config.always_instant_rpm {
                    if let Some(transition) = self.rpm.set_rpm_value(instant, now) {
                        self.on_transition(transition);
                    }
                } else if self.rpm.is_spinning_up() {
                    self.rpm.assign_rpm_value(instant);
                }
            }
        }

        let one_degree_us = self.rpm.one_degree_us();
        if self.halted.is_some() || !(one_degree_us > 0.0) {
            return;
        }
        if let Err(diagnostic) = self
            .scheduler
            .on_trigger_tooth(tooth.engine_index, now, one_degree_us)
        {
            self.report(diagnostic);
        }
    }

    fn on_transition(&mut self, transition: Transition) {
        if self.config.injection_modes_differ() {
            log::debug!("injection mode change, resetting overlap");
            self.scheduler.reset_overlapping();
        }
        if transition.to == SpinningState::Stopped {
            self.instant_rpm.reset(self.config.engine_cycle());
        }
    }

    /// Slow periodic tick, detects a stopped engine
    pub fn on_slow_callback(&mut self, now: TimeUs) -> Option<Transition> {
        let moved = self
            .decoder
            .engine_moved_recently(now, self.config.no_rpm_events_timeout_us);
        let transition = self.rpm.on_slow_callback(now, moved);
        if let Some(transition) = transition {
            self.on_transition(transition);
        }
        transition
    }

    /// Timer interrupt entry
    pub fn on_timer_expired(&self, slot: usize, now: TimeUs) -> bool {
        self.scheduler.on_timer_expired(slot, now)
    }

    pub fn allocate_timer_slot(&mut self) -> Result<usize, FatalError> {
        self.scheduler.allocate_slot()
    }

    /// Arms `slot` to fire `angle` degrees after the edge seen at
    /// `edge_timestamp`, at the current speed
    pub fn schedule_by_angle(
        &mut self,
        slot: usize,
        edge_timestamp: TimeUs,
        angle: Angle,
        action: Action,
    ) -> Result<TimeUs, Diagnostic> {
        if let Some(error) = self.halted {
            return Err(error.into());
        }
        let scheduled = self.scheduler.schedule_by_angle(
            slot,
            edge_timestamp,
            angle,
            action,
            self.rpm.one_degree_us(),
        );
        if let Err(diagnostic) = scheduled {
            self.report(diagnostic);
        }
        scheduled
    }

    /// Registers an action fired every engine cycle at `angle` (0 = TDC #1).
    /// An angle which can't be anchored yet is reported, the event is kept
    /// and anchored on the next valid configuration.
    pub fn add_angle_event(&mut self, angle: Angle, action: Action) -> Result<usize, FatalError> {
        let index = self.scheduler.add_angle_event(action)?;
        let _ = self.set_angle_event_angle(index, angle);
        Ok(index)
    }

    pub fn set_angle_event_angle(&mut self, index: usize, angle: Angle) -> Result<TriggerPosition, Diagnostic> {
        let offset = self.config.global_trigger_angle_offset;
        let event = self
            .scheduler
            .angle_event_mut(index)
            .ok_or(FatalError::UnknownAngleEvent(index))?;
        let anchored = event.set_angle(&self.details, angle, offset);
        if let Err(diagnostic) = anchored {
            self.report(diagnostic);
        }
        anchored
    }

    /// Fires `action` at TDC #1 every engine cycle
    pub fn set_tdc_mark(&mut self, action: Action) -> Result<usize, FatalError> {
        self.add_angle_event(0.0, action)
    }

    /// TDC mark of every cylinder, `callback` gets the cylinder index
    pub fn add_cylinder_tdc_marks(&mut self, callback: fn(usize)) -> Result<(), FatalError> {
        let count = self.config.cylinders_count;
        for cyl in 0..count {
            if let Some(angle) = cylinder_angle(cyl, count, self.config.engine_cycle()) {
                self.add_angle_event(angle, Action::new(callback, cyl as usize))?;
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn shape(&self) -> &TriggerWaveform {
        &self.shape
    }

    pub fn details(&self) -> &TriggerFormDetails {
        &self.details
    }

    pub fn decoder(&self) -> &TriggerDecoder {
        &self.decoder
    }

    pub fn rpm(&self) -> &RpmCalculator {
        &self.rpm
    }

    pub fn instant_rpm(&self) -> f32 {
        self.instant_rpm.rpm()
    }

    pub fn scheduler(&self) -> &Scheduler<T, ENGINE_TIMER_SLOTS> {
        &self.scheduler
    }

    pub fn sink(&self) -> &D {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut D {
        &mut self.sink
    }

    /// Fatal error holding back control output
    pub fn halted(&self) -> Option<FatalError> {
        self.halted
    }
}

fn report<D: DiagnosticSink>(sink: &mut D, halted: &mut Option<FatalError>, diagnostic: Diagnostic) {
    if let Diagnostic::Fatal(error) = diagnostic {
        if halted.is_none() {
            log::error!("control output halted");
            *halted = Some(error);
        }
    }
    sink.report(diagnostic);
}
