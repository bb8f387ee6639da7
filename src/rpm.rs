//! Engine speed and spinning state.
//!
//! Cycle RPM is measured between two engine cycle starts. Instant RPM comes
//! from the last tooth to tooth interval and covers spin-up, or replaces the
//! cycle value entirely when configured.

use crate::config::{EngineConfig, FOUR_STROKE_CYCLE_DURATION};
use crate::error::{DiagnosticSink, Warning};
use crate::math::{one_degree_time_us, wrap_angle};
use crate::{Angle, TimeUs};

/// Sentinel RPM for a measurement which can't be trusted
pub const NOISY_RPM: f32 = -1.0;

/// Engine spinning state
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub enum SpinningState {
    Stopped,
    /// Fast spin-up: moving, no cycle RPM yet
    SpinningUp,
    Cranking,
    Running,
}

/// Change of spinning state
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Eq, PartialEq, Clone, Copy, Debug)]
pub struct Transition {
    pub from: SpinningState,
    pub to: SpinningState,
}

/// RPM from the duration of one engine cycle.
///
/// `multiplier` is crank revolutions per engine cycle. A zero period and a
/// result above `ceiling` are reported as distinct warnings, the caller
/// substitutes [`NOISY_RPM`] for both.
pub fn rpm_from_period(period_s: f32, multiplier: f32, ceiling: f32) -> Result<f32, Warning> {
    if !(period_s > 0.0) {
        return Err(Warning::ZeroPeriodRpm);
    }
    let rpm = 60.0 * multiplier / period_s;
    if rpm > ceiling {
        return Err(Warning::UnrealisticRpm { rpm });
    }
    Ok(rpm)
}

pub struct RpmCalculator {
    rpm: f32,
    previous_rpm: f32,
    rpm_rate: f32,
    one_degree_us: f32,
    state: SpinningState,
    revolutions_since_boot: u32,
    revolutions_since_start: u32,
    last_cycle_start: Option<TimeUs>,
    /// Left the stopped state, reference until the first cycle mark
    spinning_since: Option<TimeUs>,
    engine_start: Option<TimeUs>,
    last_noise: Option<Warning>,
    cranking_rpm: f32,
    fast_spin_up: bool,
    unrealistic_rpm: f32,
    timeout_us: TimeUs,
    engine_cycle: Angle,
}

impl RpmCalculator {
    pub fn new(config: &EngineConfig) -> Self {
        let mut calculator = RpmCalculator {
            rpm: 0.0,
            previous_rpm: 0.0,
            rpm_rate: 0.0,
            one_degree_us: f32::NAN,
            state: SpinningState::Stopped,
            revolutions_since_boot: 0,
            revolutions_since_start: 0,
            last_cycle_start: None,
            spinning_since: None,
            engine_start: None,
            last_noise: None,
            cranking_rpm: 0.0,
            fast_spin_up: false,
            unrealistic_rpm: 0.0,
            timeout_us: 0,
            engine_cycle: FOUR_STROKE_CYCLE_DURATION,
        };
        calculator.configure(config);
        calculator
    }

    /// Picks up thresholds from a new configuration, measured values stay
    pub fn configure(&mut self, config: &EngineConfig) {
        self.cranking_rpm = config.cranking_rpm;
        self.fast_spin_up = config.fast_spin_up;
        self.unrealistic_rpm = config.unrealistic_rpm;
        self.timeout_us = config.no_rpm_events_timeout_us;
        self.engine_cycle = config.engine_cycle();
    }

    /// Crank revolutions per engine cycle
    fn multiplier(&self) -> f32 {
        self.engine_cycle / 360.0
    }

    /// Stores an RPM value without touching the spinning state
    pub fn assign_rpm_value(&mut self, rpm: f32) {
        self.previous_rpm = self.rpm;
        self.rpm = rpm;
        self.one_degree_us = if rpm > 0.0 {
            one_degree_time_us(rpm)
        } else {
            f32::NAN
        };
    }

    /// Stores an RPM value and moves the spinning state accordingly
    pub fn set_rpm_value(&mut self, rpm: f32, now: TimeUs) -> Option<Transition> {
        self.assign_rpm_value(rpm);
        let from = self.state;
        if self.rpm == 0.0 {
            self.state = SpinningState::Stopped;
        } else if self.rpm >= self.cranking_rpm {
            if self.state != SpinningState::Running {
                self.engine_start = Some(now);
            }
            self.state = SpinningState::Running;
        } else if self.state == SpinningState::Stopped || self.state == SpinningState::SpinningUp {
            // a running engine slowing down stays running
            self.state = SpinningState::Cranking;
        }
        if from == SpinningState::Stopped && self.state != SpinningState::Stopped {
            self.spinning_since = Some(now);
        }
        self.transition(from)
    }

    fn transition(&self, from: SpinningState) -> Option<Transition> {
        if from == self.state {
            return None;
        }
        log::info!("engine {:?} -> {:?}", from, self.state);
        Some(Transition { from, to: self.state })
    }

    /// Fast spin-up: first accepted edge after a full stop, at `now`
    pub fn set_spinning_up(&mut self, now: TimeUs) -> Option<Transition> {
        if !self.fast_spin_up || self.state != SpinningState::Stopped {
            return None;
        }
        self.state = SpinningState::SpinningUp;
        self.spinning_since = Some(now);
        self.transition(SpinningState::Stopped)
    }

    /// Cycle marks and trigger edges both arrived within the timeout. Before
    /// the first cycle mark the time spinning started stands in for it.
    pub fn check_if_spinning(&self, now: TimeUs, moved_recently: bool) -> bool {
        let recent_cycle = self
            .last_cycle_start
            .or(self.spinning_since)
            .map_or(false, |last| now.saturating_sub(last) <= self.timeout_us);
        recent_cycle && moved_recently
    }

    /// Measures RPM over the engine cycle which just ended
    pub fn on_engine_cycle_start<D: DiagnosticSink + ?Sized>(
        &mut self,
        now: TimeUs,
        moved_recently: bool,
        sink: &mut D,
    ) -> Option<Transition> {
        let spinning = self.last_cycle_start.is_some() && self.check_if_spinning(now, moved_recently);
        let period_us = self.last_cycle_start.map_or(0, |last| now.saturating_sub(last));
        self.last_cycle_start = Some(now);

        let mut transition = None;
        if spinning {
            let period_s = period_us as f32 / 1_000_000.0;
            let multiplier = self.multiplier();
            match rpm_from_period(period_s, multiplier, self.unrealistic_rpm) {
                Ok(rpm) => {
                    self.rpm_rate = (rpm - self.rpm) / (multiplier * period_s);
                    self.last_noise = None;
                    transition = self.set_rpm_value(rpm, now);
                }
                Err(warning) => {
                    self.rpm_rate = match warning {
                        Warning::UnrealisticRpm { rpm } => (rpm - self.rpm) / (multiplier * period_s),
                        _ => 0.0,
                    };
                    sink.warning(warning);
                    self.last_noise = Some(warning);
                    transition = self.set_rpm_value(NOISY_RPM, now);
                }
            }
        }
        self.count_revolution();
        transition
    }

    /// Engine cycle start right after the decoder (re)acquired sync. The
    /// previous mark may be one revolution off, so no sample is taken and
    /// `now` becomes the reference for the next cycle.
    pub fn on_engine_cycle_resync(&mut self, now: TimeUs) {
        log::debug!("engine cycle timing restarted");
        self.last_cycle_start = Some(now);
        self.count_revolution();
    }

    fn count_revolution(&mut self) {
        self.revolutions_since_boot = self.revolutions_since_boot.wrapping_add(1);
        self.revolutions_since_start = self.revolutions_since_start.wrapping_add(1);
    }

    /// Zeroes speed, the start counter and the rate
    pub fn set_stopped(&mut self) -> Option<Transition> {
        let from = self.state;
        self.revolutions_since_start = 0;
        self.rpm_rate = 0.0;
        self.last_cycle_start = None;
        self.spinning_since = None;
        if self.rpm != 0.0 {
            self.assign_rpm_value(0.0);
            log::info!("engine stopped");
        }
        self.state = SpinningState::Stopped;
        self.transition(from)
    }

    /// Periodic check, stops the engine once cycle marks or edges went silent
    pub fn on_slow_callback(&mut self, now: TimeUs, moved_recently: bool) -> Option<Transition> {
        if self.check_if_spinning(now, moved_recently) {
            return None;
        }
        self.set_stopped()
    }

    /// Cached RPM, [`NOISY_RPM`] when the last measurement was rejected
    pub fn rpm(&self) -> f32 {
        self.rpm
    }

    pub fn previous_rpm(&self) -> f32 {
        self.previous_rpm
    }

    /// RPM change per second
    pub fn rpm_acceleration(&self) -> f32 {
        self.rpm_rate
    }

    /// NaN while not spinning
    pub fn one_degree_us(&self) -> f32 {
        self.one_degree_us
    }

    pub fn state(&self) -> SpinningState {
        self.state
    }

    /// Spinning up without any RPM yet counts as stopped
    pub fn is_stopped(&self) -> bool {
        self.state == SpinningState::Stopped
            || (self.state == SpinningState::SpinningUp && self.rpm == 0.0)
    }

    pub fn is_spinning_up(&self) -> bool {
        self.state == SpinningState::SpinningUp
    }

    /// Spinning up with an instant RPM is as good as cranking
    pub fn is_cranking(&self) -> bool {
        self.state == SpinningState::Cranking
            || (self.state == SpinningState::SpinningUp && self.rpm > 0.0)
    }

    pub fn is_running(&self) -> bool {
        self.state == SpinningState::Running
    }

    pub fn revolutions_since_boot(&self) -> u32 {
        self.revolutions_since_boot
    }

    pub fn revolutions_since_start(&self) -> u32 {
        self.revolutions_since_start
    }

    /// Time the engine last entered the running state
    pub fn engine_start(&self) -> Option<TimeUs> {
        self.engine_start
    }

    pub fn seconds_since_engine_start(&self, now: TimeUs) -> Option<f32> {
        self.engine_start
            .map(|start| now.saturating_sub(start) as f32 / 1_000_000.0)
    }

    /// Why the last measurement was replaced by [`NOISY_RPM`]
    pub fn last_noise(&self) -> Option<Warning> {
        self.last_noise
    }
}

/// Speed from the angle covered between the last two teeth
pub struct InstantRpm {
    last: Option<(TimeUs, Angle)>,
    rpm: f32,
    engine_cycle: Angle,
}

impl InstantRpm {
    pub const fn new(engine_cycle: Angle) -> Self {
        InstantRpm {
            last: None,
            rpm: 0.0,
            engine_cycle,
        }
    }

    pub fn reset(&mut self, engine_cycle: Angle) {
        *self = Self::new(engine_cycle);
    }

    /// Feeds the engine cycle angle of a decoded tooth
    pub fn update(&mut self, timestamp: TimeUs, angle: Angle) -> Option<f32> {
        let previous = self.last.replace((timestamp, angle));
        let (last_time, last_angle) = previous?;
        let dt = timestamp.saturating_sub(last_time);
        if dt == 0 {
            return None;
        }
        let delta = wrap_angle(angle - last_angle, self.engine_cycle).ok()?;
        // deg/us to rev/min
        self.rpm = delta / dt as f32 * 1_000_000.0 / 6.0;
        Some(self.rpm)
    }

    pub fn rpm(&self) -> f32 {
        self.rpm
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{EngineConfig, OperationMode};
    use crate::error::{RecentWarnings, Warning};
    use crate::rpm::{rpm_from_period, InstantRpm, RpmCalculator, SpinningState, Transition, NOISY_RPM};
    use rstest::rstest;

    fn calculator(fast_spin_up: bool) -> RpmCalculator {
        RpmCalculator::new(&EngineConfig {
            fast_spin_up,
            ..EngineConfig::default()
        })
    }

    /// Engine cycle marks every `period_us`, from `start` on
    fn spin(calc: &mut RpmCalculator, sink: &mut RecentWarnings<8>, start: u64, period_us: u64, cycles: u64) {
        for n in 0..cycles {
            calc.on_engine_cycle_start(start + n * period_us, true, sink);
        }
    }

    #[rstest(rpm, mode,
        case(100.0, OperationMode::FourStrokeCrankSensor),
        case(1000.0, OperationMode::FourStrokeCrankSensor),
        case(7300.0, OperationMode::FourStrokeCrankSensor),
        case(30000.0, OperationMode::FourStrokeCrankSensor),
        case(1500.0, OperationMode::TwoStroke)
    )]
    fn period_round_trip(rpm: f32, mode: OperationMode) {
        let multiplier = mode.engine_cycle() / 360.0;
        let period_s = 60.0 * multiplier / rpm;
        let res = rpm_from_period(period_s, multiplier, 30000.0).unwrap();
        assert!((res - rpm).abs() / rpm < 1e-5);
    }

    #[test]
    fn zero_period_is_noise() {
        assert_eq!(Err(Warning::ZeroPeriodRpm), rpm_from_period(0.0, 2.0, 30000.0));
        assert!(matches!(
            rpm_from_period(0.002, 1.0, 30000.0),
            Err(Warning::UnrealisticRpm { .. })
        ));

        let mut calc = calculator(false);
        let mut sink = RecentWarnings::<8>::new();
        spin(&mut calc, &mut sink, 1_000, 0, 2);
        assert_eq!(NOISY_RPM, calc.rpm());
        assert_eq!(Some(Warning::ZeroPeriodRpm), calc.last_noise());
        assert_eq!(Some(Warning::ZeroPeriodRpm), sink.last());
        assert!(calc.one_degree_us().is_nan());
        assert_eq!(SpinningState::Cranking, calc.state());
    }

    #[test]
    fn unrealistic_rpm_is_noise() {
        let mut calc = calculator(false);
        let mut sink = RecentWarnings::<8>::new();
        // 720 deg in 2 ms
        spin(&mut calc, &mut sink, 1_000, 2_000, 2);
        assert_eq!(NOISY_RPM, calc.rpm());
        match calc.last_noise() {
            Some(Warning::UnrealisticRpm { rpm }) => assert!((rpm - 60000.0).abs() < 1.0),
            other => panic!("unexpected noise cause {:?}", other),
        }
        assert_eq!(Warning::UnrealisticRpm { rpm: 0.0 }.code(), sink.last().unwrap().code());
        // rate follows the raw sample, not the sentinel
        assert!(calc.rpm_acceleration() > 1.0e6);
    }

    #[test]
    fn first_cycle_gives_no_rpm() {
        let mut calc = calculator(false);
        let mut sink = RecentWarnings::<8>::new();
        spin(&mut calc, &mut sink, 1_000, 120_000, 1);
        assert_eq!(0.0, calc.rpm());
        assert!(calc.is_stopped());
        assert_eq!(1, calc.revolutions_since_boot());

        spin(&mut calc, &mut sink, 121_000, 120_000, 1);
        assert!((calc.rpm() - 1000.0).abs() < 0.1);
        assert!(calc.is_running());
        assert!((calc.one_degree_us() - 166.666_67).abs() < 1e-2);
    }

    #[test]
    fn cranking_to_running_once() {
        let mut calc = calculator(false);
        let mut sink = RecentWarnings::<8>::new();
        let mut transitions = [None; 8];
        let mut count = 0;
        let mut now = 0;
        // 200, 400, 600, 800 rpm: 720 deg periods of 600, 300, 200, 150 ms
        for &period in [600_000u64, 600_000, 300_000, 200_000, 150_000].iter() {
            now += period;
            if let Some(t) = calc.on_engine_cycle_start(now, true, &mut sink) {
                transitions[count] = Some(t);
                count += 1;
            }
        }
        assert_eq!(2, count);
        assert_eq!(
            Some(Transition { from: SpinningState::Stopped, to: SpinningState::Cranking }),
            transitions[0]
        );
        assert_eq!(
            Some(Transition { from: SpinningState::Cranking, to: SpinningState::Running }),
            transitions[1]
        );
        assert_eq!(Some(1_700_000), calc.engine_start());
        assert_eq!(Some(1.0), calc.seconds_since_engine_start(2_700_000));
        assert!(calc.rpm_acceleration() > 0.0);
    }

    #[test]
    fn running_never_drops_to_cranking() {
        let mut calc = calculator(false);
        calc.set_rpm_value(800.0, 0);
        assert!(calc.is_running());
        assert_eq!(None, calc.set_rpm_value(300.0, 10));
        assert!(calc.is_running());
        assert_eq!(Some(0), calc.engine_start());
    }

    #[test]
    fn silence_stops_the_engine() {
        let mut calc = calculator(false);
        let mut sink = RecentWarnings::<8>::new();
        spin(&mut calc, &mut sink, 0, 120_000, 4);
        assert!(calc.is_running());
        assert_eq!(4, calc.revolutions_since_start());

        assert_eq!(None, calc.on_slow_callback(360_000 + 1_000_000, true));
        let t = calc.on_slow_callback(360_000 + 2_000_001, true);
        assert_eq!(
            Some(Transition { from: SpinningState::Running, to: SpinningState::Stopped }),
            t
        );
        assert_eq!(0.0, calc.rpm());
        assert_eq!(0, calc.revolutions_since_start());
        assert_eq!(4, calc.revolutions_since_boot());
        assert_eq!(0.0, calc.rpm_acceleration());
        assert!(calc.one_degree_us().is_nan());
    }

    #[test]
    fn spin_up_without_cycle_marks_times_out() {
        let mut calc = calculator(true);
        calc.set_spinning_up(1_000);
        // edges keep coming, the decoder never reports a cycle start
        let mut now = 1_000;
        let mut stopped_at = None;
        while now < 3_000_000 && stopped_at.is_none() {
            now += 50_000;
            if calc.on_slow_callback(now, true).is_some() {
                stopped_at = Some(now);
            }
        }
        assert_eq!(Some(2_051_000), stopped_at);
        assert!(calc.is_stopped());
        assert_eq!(SpinningState::Stopped, calc.state());

        // a later edge starts a new spin-up
        assert!(calc.set_spinning_up(now + 10).is_some());
    }

    #[test]
    fn cranking_without_cycle_marks_times_out() {
        let mut calc = calculator(false);
        let mut sink = RecentWarnings::<8>::new();
        // 200 rpm
        spin(&mut calc, &mut sink, 0, 600_000, 2);
        assert_eq!(SpinningState::Cranking, calc.state());

        assert_eq!(None, calc.on_slow_callback(600_000 + 2_000_000, true));
        assert_eq!(
            Some(Transition { from: SpinningState::Cranking, to: SpinningState::Stopped }),
            calc.on_slow_callback(600_000 + 2_000_001, true)
        );
        assert_eq!(0.0, calc.rpm());
        assert_eq!(0, calc.revolutions_since_start());
    }

    #[test]
    fn instant_cranking_times_out_from_first_sample() {
        let mut calc = calculator(false);
        assert!(calc.set_rpm_value(300.0, 100).is_some());
        assert!(calc.is_cranking());
        assert_eq!(None, calc.on_slow_callback(50_000, true));
        assert!(calc.on_slow_callback(2_000_101, true).is_some());
        assert!(calc.is_stopped());
    }

    #[test]
    fn resync_restarts_cycle_timing() {
        let mut calc = calculator(false);
        let mut sink = RecentWarnings::<8>::new();
        spin(&mut calc, &mut sink, 0, 120_000, 3);
        assert!((calc.rpm() - 1000.0).abs() < 0.1);

        // sync lost and found again one revolution later
        calc.on_engine_cycle_resync(300_000);
        assert!((calc.rpm() - 1000.0).abs() < 0.1);
        assert_eq!(4, calc.revolutions_since_start());

        calc.on_engine_cycle_start(420_000, true, &mut sink);
        assert!((calc.rpm() - 1000.0).abs() < 0.1);
        assert_eq!(0, sink.total());
    }

    #[test]
    fn no_edges_stops_the_engine() {
        let mut calc = calculator(false);
        let mut sink = RecentWarnings::<8>::new();
        spin(&mut calc, &mut sink, 0, 120_000, 3);
        assert!(calc.is_running());
        assert!(calc.on_slow_callback(250_000, false).is_some());
        assert!(calc.is_stopped());
    }

    #[test]
    fn spin_up_only_when_enabled() {
        let mut calc = calculator(false);
        assert_eq!(None, calc.set_spinning_up(0));

        let mut calc = calculator(true);
        assert_eq!(
            Some(Transition { from: SpinningState::Stopped, to: SpinningState::SpinningUp }),
            calc.set_spinning_up(0)
        );
        assert!(calc.is_spinning_up());
        assert_eq!(None, calc.set_spinning_up(10));
        assert_eq!(None, calc.on_slow_callback(50_000, true));
        assert!(calc.is_spinning_up());
        // no rpm yet
        assert!(calc.is_stopped());
        assert!(!calc.is_cranking());

        calc.assign_rpm_value(150.0);
        assert!(calc.is_spinning_up());
        assert!(!calc.is_stopped());
        assert!(calc.is_cranking());
        assert_eq!(
            Some(Transition { from: SpinningState::SpinningUp, to: SpinningState::Cranking }),
            calc.set_rpm_value(200.0, 5)
        );
    }

    #[rstest(angles, expected,
        case([0.0, 6.0], 1000.0),
        case([714.0, 0.0], 1000.0),
        case([3.0, 9.0], 1000.0)
    )]
    fn instant_rpm_test(angles: [f32; 2], expected: f32) {
        let mut instant = InstantRpm::new(720.0);
        assert_eq!(None, instant.update(1_000, angles[0]));
        let rpm = instant.update(2_000, angles[1]).unwrap();
        assert!((rpm - expected).abs() < 1e-2);
        assert_eq!(rpm, instant.rpm());
    }
}
