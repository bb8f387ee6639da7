//! Angle to time conversion and one-shot timer slots.
//!
//! Each slot holds at most one pending event. Arming a slot again before it
//! fires replaces the event and retargets the timer, nothing is queued. Slot
//! contents are shared with the timer interrupt and only ever copied in or
//! out inside a critical section.

use core::cell::Cell;

use critical_section::Mutex;
use heapless::Vec;
use num::traits::float::FloatCore;

use crate::error::{Diagnostic, FatalError, Warning};
use crate::trigger_form::{TriggerFormDetails, TriggerPosition};
use crate::{Angle, TimeUs};

/// Hardware compare channel able to fire once at an absolute time
pub trait OneShotTimer {
    /// Sets the deadline of `slot`, replacing any previous one
    fn arm(&mut self, slot: usize, at_us: TimeUs);
}

/// Callback with its argument, invoked from the timer interrupt
#[derive(Clone, Copy)]
pub struct Action {
    callback: fn(usize),
    arg: usize,
}

impl Action {
    pub const fn new(callback: fn(usize), arg: usize) -> Self {
        Action { callback, arg }
    }

    pub fn invoke(&self) {
        (self.callback)(self.arg)
    }

    pub const fn arg(&self) -> usize {
        self.arg
    }
}

impl core::fmt::Debug for Action {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Action").field("arg", &self.arg).finish()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ScheduledEvent {
    pub at_us: TimeUs,
    pub action: Action,
}

/// Maximum number of tooth anchored events
pub const MAX_ANGLE_EVENTS: usize = 16;

/// Two timer slots used alternately by one actuator, so the next opening can
/// be armed while the previous closing is still pending
#[derive(Debug, PartialEq)]
pub struct ActuatorSlots {
    slots: [usize; 2],
    next: usize,
    overlapping: u32,
}

impl ActuatorSlots {
    pub const fn new(first: usize, second: usize) -> Self {
        ActuatorSlots {
            slots: [first, second],
            next: 0,
            overlapping: 0,
        }
    }

    /// Slot for the next arm call, and the one armed before it
    fn advance(&mut self) -> (usize, usize) {
        let slot = self.slots[self.next];
        self.next ^= 1;
        (slot, self.slots[self.next])
    }

    pub fn slots(&self) -> [usize; 2] {
        self.slots
    }

    /// Times an arm call found the other slot still pending
    pub fn overlapping(&self) -> u32 {
        self.overlapping
    }

    pub fn reset_overlapping(&mut self) {
        self.overlapping = 0;
    }
}

/// Action fired every engine cycle at a fixed crank angle
pub struct AngleEvent {
    angle: Angle,
    position: Mutex<Cell<Option<TriggerPosition>>>,
    slots: ActuatorSlots,
    action: Action,
}

impl AngleEvent {
    pub const fn new(slots: ActuatorSlots, action: Action) -> Self {
        AngleEvent {
            angle: 0.0,
            position: Mutex::new(Cell::new(None)),
            slots,
            action,
        }
    }

    /// Anchors the event on the tooth preceding `angle`. The position is
    /// searched first and only the result is stored under the lock, an
    /// angle that can't be anchored leaves the previous position in place.
    pub fn set_angle(
        &mut self,
        details: &TriggerFormDetails,
        angle: Angle,
        global_trigger_angle_offset: Angle,
    ) -> Result<TriggerPosition, Diagnostic> {
        self.angle = angle;
        let position = details.find_trigger_position(angle, global_trigger_angle_offset)?;
        critical_section::with(|cs| self.position.borrow(cs).set(Some(position)));
        Ok(position)
    }

    pub fn angle(&self) -> Angle {
        self.angle
    }

    pub fn position(&self) -> Option<TriggerPosition> {
        critical_section::with(|cs| self.position.borrow(cs).get())
    }

    pub fn slots(&self) -> &ActuatorSlots {
        &self.slots
    }
}

pub struct Scheduler<T: OneShotTimer, const SLOTS: usize> {
    timer: T,
    slots: [Mutex<Cell<Option<ScheduledEvent>>>; SLOTS],
    allocated: usize,
    angle_events: Vec<AngleEvent, MAX_ANGLE_EVENTS>,
}

impl<T: OneShotTimer, const SLOTS: usize> Scheduler<T, SLOTS> {
    pub fn new(timer: T) -> Self {
        Scheduler {
            timer,
            slots: core::array::from_fn(|_| Mutex::new(Cell::new(None))),
            allocated: 0,
            angle_events: Vec::new(),
        }
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    pub fn timer_mut(&mut self) -> &mut T {
        &mut self.timer
    }

    /// Hands out the next unused slot
    pub fn allocate_slot(&mut self) -> Result<usize, FatalError> {
        if self.allocated >= SLOTS {
            return Err(FatalError::TimerSlotsExhausted);
        }
        self.allocated += 1;
        Ok(self.allocated - 1)
    }

    pub fn allocate_actuator(&mut self) -> Result<ActuatorSlots, FatalError> {
        if self.allocated + 2 > SLOTS {
            return Err(FatalError::TimerSlotsExhausted);
        }
        let first = self.allocate_slot()?;
        let second = self.allocate_slot()?;
        Ok(ActuatorSlots::new(first, second))
    }

    /// Arms `slot` to fire `angle` degrees after the tooth seen at
    /// `edge_timestamp`. Returns the target time.
    pub fn schedule_by_angle(
        &mut self,
        slot: usize,
        edge_timestamp: TimeUs,
        angle: Angle,
        action: Action,
        one_degree_us: f32,
    ) -> Result<TimeUs, Diagnostic> {
        let at_us = target_time(edge_timestamp, angle, one_degree_us)?;
        arm(&mut self.timer, &self.slots, slot, at_us, action)?;
        Ok(at_us)
    }

    /// Arms the next slot of an actuator
    pub fn schedule_actuator(
        &mut self,
        actuator: &mut ActuatorSlots,
        edge_timestamp: TimeUs,
        angle: Angle,
        action: Action,
        one_degree_us: f32,
    ) -> Result<TimeUs, Diagnostic> {
        let at_us = target_time(edge_timestamp, angle, one_degree_us)?;
        arm_actuator(&mut self.timer, &self.slots, actuator, at_us, action)?;
        Ok(at_us)
    }

    /// Timer interrupt entry. Fires the pending event once it is due, an
    /// expiry left over from a retargeted deadline finds nothing to do.
    pub fn on_timer_expired(&self, slot: usize, now: TimeUs) -> bool {
        let cell = match self.slots.get(slot) {
            Some(cell) => cell,
            None => return false,
        };
        let due = critical_section::with(|cs| {
            let cell = cell.borrow(cs);
            match cell.get() {
                Some(event) if event.at_us <= now => cell.take(),
                _ => None,
            }
        });
        match due {
            Some(event) => {
                event.action.invoke();
                true
            }
            None => false,
        }
    }

    pub fn pending(&self, slot: usize) -> Option<ScheduledEvent> {
        let cell = self.slots.get(slot)?;
        critical_section::with(|cs| cell.borrow(cs).get())
    }

    /// Drops every pending event, the timer may still expire into empty slots
    pub fn clear(&mut self) {
        critical_section::with(|cs| {
            for cell in self.slots.iter() {
                cell.borrow(cs).set(None);
            }
        });
    }

    pub fn add_angle_event(&mut self, action: Action) -> Result<usize, FatalError> {
        if self.angle_events.is_full() {
            return Err(FatalError::TimerSlotsExhausted);
        }
        let slots = self.allocate_actuator()?;
        let index = self.angle_events.len();
        let _ = self.angle_events.push(AngleEvent::new(slots, action));
        Ok(index)
    }

    pub fn angle_event(&self, index: usize) -> Option<&AngleEvent> {
        self.angle_events.get(index)
    }

    pub fn angle_event_mut(&mut self, index: usize) -> Option<&mut AngleEvent> {
        self.angle_events.get_mut(index)
    }

    pub fn angle_events_mut(&mut self) -> impl Iterator<Item = &mut AngleEvent> + '_ {
        self.angle_events.iter_mut()
    }

    pub fn reset_overlapping(&mut self) {
        for event in self.angle_events.iter_mut() {
            event.slots.reset_overlapping();
        }
    }

    /// Arms every angle event anchored on `engine_index`. Returns how many
    /// were armed.
    pub fn on_trigger_tooth(
        &mut self,
        engine_index: usize,
        timestamp: TimeUs,
        one_degree_us: f32,
    ) -> Result<usize, Diagnostic> {
        let mut armed = 0;
        for event in self.angle_events.iter_mut() {
            let position = match event.position() {
                Some(position) if position.trigger_event_index == engine_index => position,
                _ => continue,
            };
            let at_us = target_time(timestamp, position.angle_offset, one_degree_us)?;
            arm_actuator(&mut self.timer, &self.slots, &mut event.slots, at_us, event.action)?;
            armed += 1;
        }
        Ok(armed)
    }
}

/// `edge + angle × one degree`, refused without a usable speed
pub fn target_time(edge_timestamp: TimeUs, angle: Angle, one_degree_us: f32) -> Result<TimeUs, Warning> {
    if one_degree_us.is_nan() || one_degree_us <= 0.0 {
        return Err(Warning::NoRpmForSchedule);
    }
    let delay = FloatCore::round(angle * one_degree_us);
    if delay <= 0.0 {
        return Ok(edge_timestamp);
    }
    Ok(edge_timestamp.saturating_add(delay as TimeUs))
}

fn arm<T: OneShotTimer>(
    timer: &mut T,
    slots: &[Mutex<Cell<Option<ScheduledEvent>>>],
    slot: usize,
    at_us: TimeUs,
    action: Action,
) -> Result<(), FatalError> {
    let cell = slots.get(slot).ok_or(FatalError::InvalidTimerSlot(slot))?;
    critical_section::with(|cs| cell.borrow(cs).set(Some(ScheduledEvent { at_us, action })));
    timer.arm(slot, at_us);
    Ok(())
}

fn arm_actuator<T: OneShotTimer>(
    timer: &mut T,
    slots: &[Mutex<Cell<Option<ScheduledEvent>>>],
    actuator: &mut ActuatorSlots,
    at_us: TimeUs,
    action: Action,
) -> Result<(), FatalError> {
    let (slot, other) = actuator.advance();
    let other_pending = slots
        .get(other)
        .map_or(false, |cell| critical_section::with(|cs| cell.borrow(cs).get().is_some()));
    if other_pending {
        actuator.overlapping = actuator.overlapping.saturating_add(1);
    }
    arm(timer, slots, slot, at_us, action)
}

#[cfg(test)]
mod tests {
    use crate::config::OperationMode;
    use crate::error::{Diagnostic, FatalError, Warning};
    use crate::scheduler::{target_time, Action, OneShotTimer, Scheduler};
    use crate::shapes::initialize_skipped_tooth_waveform;
    use crate::trigger_form::TriggerFormDetails;
    use crate::waveform::TriggerWaveform;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use rstest::rstest;

    /// Remembers the last deadline of each slot
    #[derive(Default)]
    struct RecordingTimer {
        armed: [Option<u64>; 8],
        arm_calls: usize,
    }

    impl OneShotTimer for RecordingTimer {
        fn arm(&mut self, slot: usize, at_us: u64) {
            self.armed[slot] = Some(at_us);
            self.arm_calls += 1;
        }
    }

    #[rstest(edge, angle, one_degree, expected,
        case(1_000, 10.0, 100.0, Ok(2_000)),
        case(0, 90.0, 166.666_67, Ok(15_000)),
        case(500, 0.0, 100.0, Ok(500)),
        case(500, -5.0, 100.0, Ok(500)),
        case(500, 10.0, f32::NAN, Err(Warning::NoRpmForSchedule)),
        case(500, 10.0, 0.0, Err(Warning::NoRpmForSchedule)),
        case(1_000, 1.0e30, 1.0, Ok(u64::MAX))
    )]
    fn target_time_test(edge: u64, angle: f32, one_degree: f32, expected: Result<u64, Warning>) {
        assert_eq!(expected, target_time(edge, angle, one_degree));
    }

    static OVERWRITE_FIRED: AtomicUsize = AtomicUsize::new(0);

    fn count_overwrite(_: usize) {
        OVERWRITE_FIRED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn second_schedule_overwrites_first() {
        let mut scheduler: Scheduler<RecordingTimer, 8> = Scheduler::new(RecordingTimer::default());
        let action = Action::new(count_overwrite, 0);

        assert_eq!(Ok(2_000), scheduler.schedule_by_angle(0, 1_000, 10.0, action, 100.0));
        assert_eq!(Ok(3_000), scheduler.schedule_by_angle(0, 1_000, 20.0, action, 100.0));
        assert_eq!(Some(3_000), scheduler.timer().armed[0]);
        assert_eq!(Some(3_000), scheduler.pending(0).map(|e| e.at_us));

        // stale expiry of the first deadline
        assert!(!scheduler.on_timer_expired(0, 2_000));
        assert_eq!(0, OVERWRITE_FIRED.load(Ordering::SeqCst));

        assert!(scheduler.on_timer_expired(0, 3_000));
        assert!(!scheduler.on_timer_expired(0, 3_001));
        assert_eq!(1, OVERWRITE_FIRED.load(Ordering::SeqCst));
        assert!(scheduler.pending(0).is_none());
    }

    fn ignore(_: usize) {}

    #[test]
    fn bad_slots_are_refused() {
        let mut scheduler: Scheduler<RecordingTimer, 2> = Scheduler::new(RecordingTimer::default());
        let action = Action::new(ignore, 0);
        assert_eq!(
            Err(Diagnostic::Fatal(FatalError::InvalidTimerSlot(2))),
            scheduler.schedule_by_angle(2, 0, 10.0, action, 100.0)
        );
        assert_eq!(
            Err(Diagnostic::Warning(Warning::NoRpmForSchedule)),
            scheduler.schedule_by_angle(0, 0, 10.0, action, f32::NAN)
        );
        assert_eq!(0, scheduler.timer().arm_calls);
        assert!(!scheduler.on_timer_expired(5, 0));

        assert_eq!(Ok(0), scheduler.allocate_slot());
        assert_eq!(Err(FatalError::TimerSlotsExhausted), scheduler.allocate_actuator());
        assert_eq!(Ok(1), scheduler.allocate_slot());
        assert_eq!(Err(FatalError::TimerSlotsExhausted), scheduler.allocate_slot());
    }

    #[test]
    fn actuator_alternates_and_counts_overlap() {
        let mut scheduler: Scheduler<RecordingTimer, 8> = Scheduler::new(RecordingTimer::default());
        let mut actuator = scheduler.allocate_actuator().unwrap();
        let action = Action::new(ignore, 0);

        scheduler.schedule_actuator(&mut actuator, 0, 10.0, action, 100.0).unwrap();
        scheduler.schedule_actuator(&mut actuator, 0, 20.0, action, 100.0).unwrap();
        assert_eq!(Some(1_000), scheduler.timer().armed[0]);
        assert_eq!(Some(2_000), scheduler.timer().armed[1]);
        assert_eq!(1, actuator.overlapping());

        assert!(scheduler.on_timer_expired(0, 1_000));
        assert!(scheduler.on_timer_expired(1, 2_000));
        scheduler.schedule_actuator(&mut actuator, 3_000, 10.0, action, 100.0).unwrap();
        assert_eq!(Some(4_000), scheduler.timer().armed[0]);
        assert_eq!(1, actuator.overlapping());

        actuator.reset_overlapping();
        assert_eq!(0, actuator.overlapping());
    }

    static TOOTH_FIRED: AtomicUsize = AtomicUsize::new(0);

    fn count_tooth(arg: usize) {
        TOOTH_FIRED.fetch_add(arg, Ordering::SeqCst);
    }

    #[test]
    fn angle_event_fires_from_its_tooth() {
        let mut shape = TriggerWaveform::new();
        initialize_skipped_tooth_waveform(&mut shape, 60, 2, OperationMode::FourStrokeCrankSensor).unwrap();
        shape.calculate_expected_event_counts(false).unwrap();
        let mut details = TriggerFormDetails::new();
        details.prepare(&shape, false).unwrap();

        let mut scheduler: Scheduler<RecordingTimer, 8> = Scheduler::new(RecordingTimer::default());
        let idx = scheduler.add_angle_event(Action::new(count_tooth, 10)).unwrap();
        let event = scheduler.angle_event_mut(idx).unwrap();
        let position = event.set_angle(&details, 10.0, 0.0).unwrap();
        assert_eq!(3, position.trigger_event_index);
        assert_eq!(Some(position), event.position());

        assert_eq!(Ok(0), scheduler.on_trigger_tooth(2, 0, 100.0));
        assert_eq!(Ok(1), scheduler.on_trigger_tooth(3, 5_000, 100.0));
        let at = scheduler.timer().armed[0].unwrap();
        assert!((at as i64 - 5_100).abs() <= 1);
        assert!(scheduler.on_timer_expired(0, at));
        assert_eq!(10, TOOTH_FIRED.load(Ordering::SeqCst));
    }

    #[test]
    fn unanchored_angle_keeps_position() {
        let details = TriggerFormDetails::new();
        let mut scheduler: Scheduler<RecordingTimer, 8> = Scheduler::new(RecordingTimer::default());
        let idx = scheduler.add_angle_event(Action::new(ignore, 0)).unwrap();
        let event = scheduler.angle_event_mut(idx).unwrap();
        assert!(event.set_angle(&details, 10.0, 0.0).is_err());
        assert_eq!(None, event.position());
        assert_eq!(10.0, event.angle());
    }
}
