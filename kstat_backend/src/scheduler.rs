/*!
Phase scheduling for a measurement.

A measurement runs on two timelines sharing one origin:

1. the instrument timeline (the job thread) sleeps until the purge deadline
   and then issues the single blocking instrument command;
2. the auxiliary timeline (a background thread) walks an ordered list of
   `(offset, action)` entries: phase labels, purge/stir switches and progress
   ticks at four per second.

Both check the job's [`CancelToken`] between steps. Waits are sliced so a
cancel or stop is seen within one slice.
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::Value;
use shared::CancelToken;
use tracing::{debug, warn};

use crate::state::{Change, StateChannel};

/// Progress ticks per second of phase time
pub const TICKS_PER_SECOND: f64 = 4.0;

/// Time source for both timelines
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's origin
    fn now(&self) -> Duration;

    /// Block until `now() >= deadline`
    fn sleep_until(&self, deadline: Duration);
}

/// Wall clock
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep_until(&self, deadline: Duration) {
        let now = self.now();
        if deadline > now {
            thread::sleep(deadline - now);
        }
    }
}

/// Fast-forward clock: sleeping jumps straight to the deadline
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        *self.lock() += by;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Duration> {
        self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.lock()
    }

    fn sleep_until(&self, deadline: Duration) {
        {
            let mut now = self.lock();
            if deadline > *now {
                *now = deadline;
            }
        }
        // Let the other timeline observe the jump
        thread::yield_now();
    }
}

/// Named segment of a measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Purge,
    Clean,
    Deposit,
    Scan,
    /// Constant-potential hold of the plating program
    Plating,
}

impl Phase {
    pub const ALL: [Phase; 5] = [Self::Purge, Self::Clean, Self::Deposit, Self::Scan, Self::Plating];

    /// Text written to `scan_progress_label.children`
    pub fn label(self) -> &'static str {
        match self {
            Self::Purge => "Purging",
            Self::Clean => "Cleaning",
            Self::Deposit => "Deposition",
            Self::Scan => "Scan",
            Self::Plating => "Plating",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhaseState {
    #[default]
    Pending,
    Active,
    Complete,
}

/// Per-phase state shared by both timelines
#[derive(Debug, Clone, Default)]
pub struct PhaseTracker {
    states: Arc<Mutex<[PhaseState; 5]>>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, [PhaseState; 5]> {
        self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self, phase: Phase) -> PhaseState {
        self.lock()[phase.index()]
    }

    pub fn begin(&self, phase: Phase) {
        let mut states = self.lock();
        if states[phase.index()] == PhaseState::Pending {
            states[phase.index()] = PhaseState::Active;
        }
    }

    pub fn complete(&self, phase: Phase) {
        self.lock()[phase.index()] = PhaseState::Complete;
    }

    /// The phase currently running, if any
    pub fn active(&self) -> Option<Phase> {
        let states = self.lock();
        Phase::ALL
            .into_iter()
            .find(|p| states[p.index()] == PhaseState::Active)
    }
}

/// Something the auxiliary timeline does at its offset
#[derive(Debug, Clone, PartialEq)]
pub enum AuxAction {
    /// Mark the phase active and show its label
    Begin(Phase),
    /// Mark the phase complete
    Complete(Phase),
    /// Switch the purge valve and/or stirrer components
    Outputs { purge: Option<bool>, stir: Option<bool> },
    /// Update the progress bar
    Progress { phase: Phase, percent: f64 },
}

impl AuxAction {
    fn apply(&self, channel: &StateChannel, tracker: &PhaseTracker) {
        match self {
            Self::Begin(phase) => {
                tracker.begin(*phase);
                channel.write(&[Change::new("scan_progress_label", "children", phase.label())]);
            }
            Self::Complete(phase) => tracker.complete(*phase),
            Self::Outputs { purge, stir } => {
                let mut changes = Vec::with_capacity(2);
                if let Some(on) = purge {
                    changes.push(Change::new("purge_switch", "on", *on));
                }
                if let Some(on) = stir {
                    changes.push(Change::new("stirr_switch", "on", *on));
                }
                if !changes.is_empty() {
                    channel.write(&changes);
                }
            }
            Self::Progress { percent, .. } => {
                channel.write(&[Change::new("scan_progress", "value", progress_value(*percent))]);
            }
        }
    }
}

/// Whole percentages are written as integers
pub fn progress_value(percent: f64) -> Value {
    if percent.fract() == 0.0 {
        Value::from(percent as i64)
    } else {
        Value::from(percent)
    }
}

/// Progress of tick `tick` in a phase lasting `duration` seconds
pub fn progress_percent(tick: u64, duration: f64) -> f64 {
    if duration <= 0.0 {
        return 100.0;
    }
    (tick as f64 / (duration * TICKS_PER_SECOND) * 100.0).clamp(0.0, 100.0)
}

/// Number of progress ticks after the first one in a phase of `duration`
fn tick_count(duration: f64) -> u64 {
    (duration.max(0.0) * TICKS_PER_SECOND).ceil() as u64
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    /// Seconds after the timeline origin
    pub offset: f64,
    /// Recorded for diagnostics; ties run in insertion order regardless
    pub priority: u8,
    seq: usize,
    pub action: AuxAction,
}

/// What was pushed: one action, or the progress ticks of a whole phase
#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Once(AuxAction),
    Ticks { phase: Phase, duration: f64 },
}

#[derive(Debug, Clone, PartialEq)]
struct Pushed {
    start: f64,
    priority: u8,
    slot: Slot,
}

impl Pushed {
    fn count(&self) -> u64 {
        match self.slot {
            Slot::Once(_) => 1,
            Slot::Ticks { duration, .. } => tick_count(duration) + 1,
        }
    }

    fn entry(&self, seq: usize, i: u64) -> ScheduleEntry {
        let (offset, action) = match &self.slot {
            Slot::Once(action) => (self.start, action.clone()),
            Slot::Ticks { phase, duration } => {
                let duration = duration.max(0.0);
                let offset = self.start + (i as f64 / TICKS_PER_SECOND).min(duration);
                (offset, AuxAction::Progress { phase: *phase, percent: progress_percent(i, duration) })
            }
        };
        ScheduleEntry { offset, priority: self.priority, seq, action }
    }
}

/// Ordered `(offset, priority, action)` list
///
/// Progress ticks are generated while the schedule is walked, so a long
/// phase costs no memory up front.
#[derive(Debug, Clone, Default)]
pub struct PhaseSchedule {
    pushed: Vec<Pushed>,
}

impl PhaseSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, offset: f64, priority: u8, action: AuxAction) {
        self.pushed.push(Pushed { start: offset.max(0.0), priority, slot: Slot::Once(action) });
    }

    /// Number of entries, ticks included
    pub fn len(&self) -> u64 {
        self.pushed.iter().map(Pushed::count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pushed.is_empty()
    }

    /// Entries by offset, insertion order on ties
    pub fn ordered(&self) -> Ordered<'_> {
        Ordered {
            pushed: &self.pushed,
            next: vec![0; self.pushed.len()],
        }
    }

    fn push_progress(&mut self, phase: Phase, start: f64, duration: f64, priority: u8) {
        self.pushed.push(Pushed { start: start.max(0.0), priority, slot: Slot::Ticks { phase, duration } });
    }
}

/// Iterator merging the pushed actions and tick runs by offset
pub struct Ordered<'a> {
    pushed: &'a [Pushed],
    next: Vec<u64>,
}

impl Iterator for Ordered<'_> {
    type Item = ScheduleEntry;

    fn next(&mut self) -> Option<ScheduleEntry> {
        let mut best: Option<ScheduleEntry> = None;
        for (seq, pushed) in self.pushed.iter().enumerate() {
            if self.next[seq] >= pushed.count() {
                continue;
            }
            let entry = pushed.entry(seq, self.next[seq]);
            let earlier = match &best {
                None => true,
                Some(b) => entry.offset.total_cmp(&b.offset).then(entry.seq.cmp(&b.seq)).is_lt(),
            };
            if earlier {
                best = Some(entry);
            }
        }

        let entry = best?;
        self.next[entry.seq] += 1;
        Some(entry)
    }
}

/// Nominal phase durations of one measurement, in seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhasePlan {
    pub purge_s: f64,
    pub clean_s: f64,
    pub deposit_s: f64,
    pub scan_s: f64,
    /// `Scan` for voltammetry, `Plating` for the plating hold
    pub final_phase: Phase,
}

impl PhasePlan {
    pub fn voltammetry(purge_s: f64, clean_s: f64, deposit_s: f64, scan_s: f64) -> Self {
        Self {
            purge_s: purge_s.max(0.0),
            clean_s: clean_s.max(0.0),
            deposit_s: deposit_s.max(0.0),
            scan_s: scan_s.max(0.0),
            final_phase: Phase::Scan,
        }
    }

    pub fn plating(duration_s: f64) -> Self {
        Self {
            purge_s: 0.0,
            clean_s: 0.0,
            deposit_s: 0.0,
            scan_s: duration_s.max(0.0),
            final_phase: Phase::Plating,
        }
    }

    /// When the instrument command is issued
    pub fn instrument_offset(&self) -> f64 {
        self.purge_s
    }

    /// When the final phase starts
    pub fn scan_start(&self) -> f64 {
        self.purge_s + self.clean_s + self.deposit_s
    }

    pub fn total(&self) -> f64 {
        self.scan_start() + self.scan_s
    }

    /// Labels, switches and progress ticks for the auxiliary timeline
    pub fn auxiliary_schedule(&self) -> PhaseSchedule {
        let mut schedule = PhaseSchedule::new();
        let purge_end = self.purge_s;
        let clean_end = purge_end + self.clean_s;
        let scan_start = self.scan_start();

        if self.purge_s > 0.0 {
            schedule.push(0.0, 1, AuxAction::Begin(Phase::Purge));
            schedule.push(0.0, 1, AuxAction::Outputs { purge: Some(true), stir: Some(true) });
            schedule.push_progress(Phase::Purge, 0.0, self.purge_s, 1);
            schedule.push(purge_end, 1, AuxAction::Outputs { purge: Some(false), stir: None });
            schedule.push(purge_end, 1, AuxAction::Complete(Phase::Purge));
        }

        if self.clean_s > 0.0 {
            schedule.push(purge_end, 2, AuxAction::Begin(Phase::Clean));
            schedule.push_progress(Phase::Clean, purge_end, self.clean_s, 2);
            schedule.push(clean_end, 2, AuxAction::Complete(Phase::Clean));
        }

        if self.deposit_s > 0.0 {
            schedule.push(clean_end, 2, AuxAction::Begin(Phase::Deposit));
            schedule.push_progress(Phase::Deposit, clean_end, self.deposit_s, 2);
            schedule.push(scan_start, 2, AuxAction::Complete(Phase::Deposit));
        }

        if self.final_phase == Phase::Scan {
            // Stirring stops before the sweep
            schedule.push(scan_start, 1, AuxAction::Outputs { purge: None, stir: Some(false) });
        }
        schedule.push(scan_start, 1, AuxAction::Begin(self.final_phase));
        schedule.push_progress(self.final_phase, scan_start, self.scan_s, 2);

        schedule
    }
}

/// Origin and cancellation shared by the timelines of one measurement
#[derive(Clone)]
pub struct Timeline {
    clock: Arc<dyn Clock>,
    origin: Duration,
    slice: Duration,
    cancel: CancelToken,
}

impl Timeline {
    /// Start a timeline at the clock's current time
    pub fn start(clock: Arc<dyn Clock>, slice: Duration, cancel: CancelToken) -> Self {
        let origin = clock.now();
        Self {
            clock,
            origin,
            slice: slice.max(Duration::from_millis(1)),
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Seconds since the origin
    pub fn elapsed(&self) -> f64 {
        self.clock.now().saturating_sub(self.origin).as_secs_f64()
    }

    /// Sleep until `offset` seconds after the origin; false when cancelled
    pub fn wait_until(&self, offset: f64) -> bool {
        self.wait(offset, || false)
    }

    fn wait(&self, offset: f64, stopped: impl Fn() -> bool) -> bool {
        let deadline = Duration::try_from_secs_f64(offset.max(0.0))
            .ok()
            .and_then(|d| self.origin.checked_add(d))
            .unwrap_or(Duration::MAX);
        loop {
            if self.cancel.is_cancelled() || stopped() {
                return false;
            }
            let now = self.clock.now();
            if now >= deadline {
                return true;
            }
            self.clock.sleep_until((now + self.slice).min(deadline));
        }
    }
}

/// Run the auxiliary entries on the calling thread until done, cancelled or
/// stopped
pub fn run_auxiliary(
    schedule: &PhaseSchedule,
    timeline: &Timeline,
    channel: &StateChannel,
    tracker: &PhaseTracker,
    stop: &AtomicBool,
) {
    for entry in schedule.ordered() {
        if !timeline.wait(entry.offset, || stop.load(Ordering::SeqCst)) {
            debug!("Auxiliary timeline interrupted at {:.2}s", timeline.elapsed());
            return;
        }
        entry.action.apply(channel, tracker);
    }
    debug!("Auxiliary timeline finished");
}

/// Background thread running an auxiliary schedule
pub struct AuxiliaryTimeline {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AuxiliaryTimeline {
    pub fn spawn(schedule: PhaseSchedule, timeline: Timeline, channel: StateChannel, tracker: PhaseTracker) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_worker = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            run_auxiliary(&schedule, &timeline, &channel, &tracker, &stop_worker);
        });

        Self { stop, handle: Some(handle) }
    }

    /// Stop the timeline and wait for its thread
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Auxiliary timeline thread panicked");
            }
        }
    }
}

impl Drop for AuxiliaryTimeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Document, MemoryStore};

    fn channel() -> StateChannel {
        StateChannel::new(Arc::new(MemoryStore::new(Document::with_defaults())), Duration::ZERO)
    }

    fn progress_of(entries: &[ScheduleEntry], phase: Phase) -> Vec<(f64, f64)> {
        entries
            .iter()
            .filter_map(|e| match e.action {
                AuxAction::Progress { phase: p, percent } if p == phase => Some((e.offset, percent)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_ties_run_in_insertion_order() {
        let mut schedule = PhaseSchedule::new();
        schedule.push(1.0, 2, AuxAction::Begin(Phase::Clean));
        schedule.push(0.5, 2, AuxAction::Begin(Phase::Purge));
        schedule.push(1.0, 1, AuxAction::Complete(Phase::Purge));

        let ordered: Vec<AuxAction> = schedule.ordered().map(|e| e.action).collect();
        assert_eq!(
            ordered,
            vec![
                AuxAction::Begin(Phase::Purge),
                AuxAction::Begin(Phase::Clean),
                AuxAction::Complete(Phase::Purge),
            ]
        );
    }

    #[test]
    fn test_progress_is_monotonic_and_ends_at_100() {
        let plan = PhasePlan::voltammetry(1.3, 2.0, 0.0, 7.0);
        let entries: Vec<ScheduleEntry> = plan.auxiliary_schedule().ordered().collect();

        for (phase, start, duration) in [(Phase::Purge, 0.0, 1.3), (Phase::Clean, 1.3, 2.0), (Phase::Scan, 3.3, 7.0)] {
            let ticks = progress_of(&entries, phase);
            assert!(ticks.windows(2).all(|w| w[0].1 <= w[1].1 && w[0].0 <= w[1].0), "{:?}", phase);
            let (offset, percent) = *ticks.last().unwrap();
            assert_eq!(percent, 100.0);
            assert!((offset - (start + duration)).abs() < 1e-9);
            assert_eq!(ticks.iter().filter(|t| t.1 == 100.0).count(), 1);
        }
        assert!(progress_of(&entries, Phase::Deposit).is_empty());
    }

    #[test]
    fn test_zero_length_phases_are_skipped() {
        let schedule = PhasePlan::voltammetry(0.0, 0.0, 0.0, 0.0).auxiliary_schedule();
        let actions: Vec<AuxAction> = schedule.ordered().map(|e| e.action).collect();

        assert_eq!(
            actions,
            vec![
                AuxAction::Outputs { purge: None, stir: Some(false) },
                AuxAction::Begin(Phase::Scan),
                AuxAction::Progress { phase: Phase::Scan, percent: 100.0 },
            ]
        );
    }

    #[test]
    fn test_long_phase_ticks_are_lazy() {
        let schedule = PhasePlan::plating(86_400.0).auxiliary_schedule();
        assert_eq!(schedule.len(), 1 + 86_400 * 4 + 1);

        let first: Vec<ScheduleEntry> = schedule.ordered().take(3).collect();
        assert_eq!(first[0].action, AuxAction::Begin(Phase::Plating));
        assert_eq!(first[1].action, AuxAction::Progress { phase: Phase::Plating, percent: 0.0 });
        assert_eq!(first[2].offset, 0.25);
    }

    #[test]
    fn test_far_deadline_does_not_overflow() {
        let cancel = CancelToken::new();
        let timeline = Timeline::start(Arc::new(ManualClock::new()), Duration::from_millis(50), cancel.clone());

        cancel.cancel();
        assert!(!timeline.wait_until(1e300));
        assert!(!timeline.wait_until(f64::INFINITY));
    }

    #[test]
    fn test_auxiliary_run_under_manual_clock() {
        let clock = Arc::new(ManualClock::new());
        let channel = channel();
        let tracker = PhaseTracker::new();
        let plan = PhasePlan::voltammetry(2.0, 1.0, 1.5, 3.0);
        let timeline = Timeline::start(clock.clone(), Duration::from_millis(50), CancelToken::new());

        run_auxiliary(&plan.auxiliary_schedule(), &timeline, &channel, &tracker, &AtomicBool::new(false));

        let doc = channel.read().unwrap();
        assert_eq!(doc.get_f64("scan_progress", "value").unwrap(), 100.0);
        assert_eq!(doc.get_str("scan_progress_label", "children").unwrap(), "Scan");
        assert!(!doc.get_bool("purge_switch", "on").unwrap());
        assert!(!doc.get_bool("stirr_switch", "on").unwrap());
        assert_eq!(tracker.state(Phase::Purge), PhaseState::Complete);
        assert_eq!(tracker.state(Phase::Deposit), PhaseState::Complete);
        assert_eq!(tracker.active(), Some(Phase::Scan));
        assert_eq!(clock.now(), Duration::from_secs_f64(plan.total()));
    }

    #[test]
    fn test_cancel_interrupts_waits() {
        let cancel = CancelToken::new();
        let timeline = Timeline::start(Arc::new(ManualClock::new()), Duration::from_millis(50), cancel.clone());
        assert!(timeline.wait_until(1.0));

        cancel.cancel();
        assert!(!timeline.wait_until(2.0));
        assert_eq!(timeline.elapsed(), 1.0);
    }

    #[test]
    fn test_stop_ends_background_timeline() {
        let tracker = PhaseTracker::new();
        let timeline = Timeline::start(Arc::new(SystemClock::new()), Duration::from_millis(10), CancelToken::new());
        let mut aux = AuxiliaryTimeline::spawn(
            PhasePlan::voltammetry(60.0, 0.0, 0.0, 1.0).auxiliary_schedule(),
            timeline,
            channel(),
            tracker.clone(),
        );

        thread::sleep(Duration::from_millis(30));
        let started = Instant::now();
        aux.stop();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_ne!(tracker.state(Phase::Purge), PhaseState::Complete);
    }
}
