/*!
Measurement orchestration.

The control loop polls the shared document, mirrors the purge and stir
switches onto the motor driver and reacts to the start, stop, home and
move-step buttons. A started program runs as a [`MeasurementJob`] on its
own thread, which owns the instrument link until it finishes and reports back
over a channel. Series programs run several measurements in one job: the
electrode test repeats a cyclic voltammogram, a profile measures at every
step of the profiler stage.

A job always ends the same way, whether it completed, failed or was
cancelled: the instrument is left idling at 0 mV, the purge and stir switches
go back to what they were when the job started and the controls are enabled
again.
*/

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Local;
use crossbeam_channel::{unbounded, Receiver, Sender};
use shared::codec::decode_scan_stream;
use shared::{CancelToken, Codec, DeviceLink, ProtocolError, Scan};
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, DeviceConfig};
use crate::error::{ConfigError, JobError, SyncError};
use crate::hardware::{format_position, HardwareError, MotorDriver, Profiler, PURGE_CHANNEL, STIR_CHANNEL};
use crate::results;
use crate::scheduler::{progress_value, AuxiliaryTimeline, Clock, Phase, PhasePlan, PhaseTracker, Timeline};
use crate::state::{Change, Document, StateChannel};
use crate::technique::{MeasurementSetup, ProfileParams, Series, Technique};

/// Purge and stir switch positions captured when a job starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSnapshot {
    pub purge_on: bool,
    pub stir_on: bool,
}

impl OutputSnapshot {
    pub fn from_document(doc: &Document) -> Result<Self, ConfigError> {
        Ok(Self {
            purge_on: doc.get_bool("purge_switch", "on")?,
            stir_on: doc.get_bool("stirr_switch", "on")?,
        })
    }

    /// Changes putting the switches back
    pub fn restore(&self) -> Vec<Change> {
        vec![
            Change::new("purge_switch", "on", self.purge_on),
            Change::new("stirr_switch", "on", self.stir_on),
        ]
    }
}

/// Enable or disable the controls that must not be used while busy
pub fn controls_disabled(disabled: bool) -> Vec<Change> {
    vec![
        Change::new("start_button", "disabled", disabled),
        Change::new("stop_button", "disabled", !disabled),
        Change::new("home_button", "disabled", disabled),
        Change::new("move_step_button", "disabled", disabled),
        Change::new("program_selection", "disabled", disabled),
    ]
}

/// Controls as they should be when the backend starts: everything enabled
/// except stop, and no button left triggered by an earlier run
pub fn startup_controls() -> Vec<Change> {
    let mut changes = controls_disabled(false);
    changes.push(Change::new("purge_switch", "disabled", false));
    changes.push(Change::new("stirr_switch", "disabled", false));
    for button in ["start_button", "stop_button", "home_button", "move_step_button"] {
        changes.push(Change::new(button, "triggered", false));
    }
    changes
}

/// One measurement program, configured from a document snapshot
#[derive(Debug, Clone)]
pub struct MeasurementJob {
    pub id: String,
    pub technique: Technique,
    pub setup: MeasurementSetup,
    pub series: Series,
    pub snapshot: OutputSnapshot,
    cancel: CancelToken,
}

impl MeasurementJob {
    /// Everything is validated here, before the instrument is touched
    pub fn from_document(doc: &Document, defaults: &DeviceConfig) -> Result<Self, ConfigError> {
        let id = match doc.get_str("popup_measurement_id", "value") {
            Ok(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => Local::now().format("%Y%m%d_%H%M%S").to_string(),
        };

        let series = Series::from_document(doc)?;
        let mut setup = MeasurementSetup::from_document(doc, defaults)?;
        // The profiler stage holds the electrode in place of the purge step
        if matches!(series, Series::Profile(_)) {
            setup.purge_s = 0.0;
        }

        Ok(Self {
            id,
            technique: Technique::from_document(doc)?,
            setup,
            series,
            snapshot: OutputSnapshot::from_document(doc)?,
            cancel: CancelToken::new(),
        })
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Phases of one measurement of this job
    pub fn plan(&self) -> PhasePlan {
        match &self.technique {
            Technique::Plating(p) => PhasePlan::plating(p.duration_s),
            technique => PhasePlan::voltammetry(
                self.setup.purge_s,
                self.setup.preconditioning.clean_s as f64,
                self.setup.preconditioning.deposit_s as f64,
                technique.scan_duration(),
            ),
        }
    }
}

/// What a finished job produced
#[derive(Debug, Clone)]
pub struct JobReport {
    pub id: String,
    pub scans: Vec<Scan>,
    pub files: Vec<PathBuf>,
    /// Base path of the last measurement's files
    pub base: Option<PathBuf>,
}

impl JobReport {
    fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            scans: Vec::new(),
            files: Vec::new(),
            base: None,
        }
    }

    fn absorb(&mut self, other: JobReport) {
        self.scans.extend(other.scans);
        self.files.extend(other.files);
        if other.base.is_some() {
            self.base = other.base;
        }
    }
}

/// Everything a job needs besides the link
#[derive(Clone)]
pub struct JobContext {
    pub channel: StateChannel,
    pub codec: Codec,
    pub clock: Arc<dyn Clock>,
    pub profiler: Arc<Mutex<Profiler>>,
    pub working_directory: PathBuf,
    /// Longest uninterrupted sleep on either timeline
    pub slice: Duration,
}

impl JobContext {
    fn lock_profiler(&self) -> MutexGuard<'_, Profiler> {
        self.profiler.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn series_progress(&self, percent: f64, label: String) {
        self.channel.write(&[
            Change::new("series_progress", "value", progress_value(percent)),
            Change::new("series_progress_label", "children", label),
        ]);
    }
}

/// Run one job to the end on the calling thread
pub fn run_job(ctx: &JobContext, link: &mut dyn DeviceLink, job: &MeasurementJob) -> Result<JobReport, JobError> {
    info!("🚀 Starting {} ({})", job.technique.title(), job.id);

    let mut changes = controls_disabled(true);
    changes.push(Change::new("scan_progress", "value", 0));
    if job.series != Series::Single {
        changes.push(Change::new("series_progress", "value", 0));
    }
    ctx.channel.write(&changes);

    let result = match &job.series {
        Series::Single => measure(ctx, link, job, &results::result_base(&ctx.working_directory, &job.id)),
        Series::ElectrodeTest { tests } => electrode_tests(ctx, link, job, *tests),
        Series::Profile(params) => profile(ctx, link, job, params),
    };
    finish(ctx, link, job, &result);
    result
}

/// One measurement whose files go to `base`
fn measure(ctx: &JobContext, link: &mut dyn DeviceLink, job: &MeasurementJob, base: &Path) -> Result<JobReport, JobError> {
    let plan = job.plan();
    let tracker = PhaseTracker::new();

    ctx.codec.abort(link)?;

    if matches!(job.technique, Technique::Plating(_)) {
        ctx.channel.write(&[
            Change::new("purge_switch", "on", false),
            Change::new("stirr_switch", "on", true),
        ]);
    }

    let timeline = Timeline::start(Arc::clone(&ctx.clock), ctx.slice, job.cancel_token());
    let mut aux = AuxiliaryTimeline::spawn(
        plan.auxiliary_schedule(),
        timeline.clone(),
        ctx.channel.clone(),
        tracker.clone(),
    );

    let scans = run_instrument(ctx, link, job, &plan, &timeline);
    aux.stop();
    let scans = scans?;

    tracker.complete(plan.final_phase);
    let mut changes = vec![Change::new("scan_progress", "value", 100)];
    if plan.final_phase == Phase::Plating {
        changes.push(Change::new("scan_progress_label", "children", ""));
    }
    ctx.channel.write(&changes);
    info!("✅ {} finished after {:.1}s", base.display(), timeline.elapsed());

    let mut report = JobReport::empty(&job.id);
    if !matches!(job.technique, Technique::Plating(_)) {
        report.files = results::write_scans(base, &scans, job.setup.pga_gain, job.setup.iv_gain)?;
        report.files.push(results::write_parameters(base, &job.technique, &job.setup)?);
        report.base = Some(base.to_path_buf());
    }
    report.scans = scans;
    Ok(report)
}

/// The instrument timeline: one blocking command at the purge deadline
fn run_instrument(
    ctx: &JobContext,
    link: &mut dyn DeviceLink,
    job: &MeasurementJob,
    plan: &PhasePlan,
    timeline: &Timeline,
) -> Result<Vec<Scan>, JobError> {
    if !timeline.wait_until(plan.instrument_offset()) {
        return Err(JobError::Cancelled);
    }

    // Plating holds the potential for the whole phase
    if let Technique::Plating(p) = &job.technique {
        ctx.codec.idle(link, p.potential_mv)?;
        if !timeline.wait_until(plan.total()) {
            return Err(JobError::Cancelled);
        }
        ctx.codec.abort(link)?;
        return Ok(Vec::new());
    }

    let setup = &job.setup;
    let frame = job
        .technique
        .command(&setup.preconditioning)
        .ok_or_else(|| ConfigError::UnknownProgram(job.technique.title().to_string()))?;

    ctx.codec.setup_adc(link, setup.adc_buffer, setup.sample_rate, setup.pga_gain)?;
    ctx.codec.set_gain(link, setup.iv_gain)?;

    ctx.codec.send_command_until(link, &frame, timeline.cancel_token())?;
    let bytes = ctx.codec.read_scan_stream(link, timeline.cancel_token())?;
    let scans = decode_scan_stream(&bytes, job.technique.shape(), job.technique.expected_scans())?;

    debug!(
        "Decoded {} scan(s): {:?} samples",
        scans.len(),
        scans.iter().map(Scan::len).collect::<Vec<_>>()
    );
    Ok(scans)
}

/// Repeat the measurement `tests` times; each run replaces the previous
/// run's files and the last one is named after the job
fn electrode_tests(ctx: &JobContext, link: &mut dyn DeviceLink, job: &MeasurementJob, tests: u32) -> Result<JobReport, JobError> {
    let mut report = JobReport::empty(&job.id);

    for test in 1..=tests {
        let id = if test == tests { job.id.clone() } else { format!("{}_test{}", job.id, test) };
        ctx.series_progress((test - 1) as f64 / tests as f64 * 100.0, format!("Test {}/{}", test, tests));

        let done = measure(ctx, link, job, &results::result_base(&ctx.working_directory, &id))?;
        results::remove_results(&report.files);
        if let Some(base) = &done.base {
            ctx.channel.write(&[Change::new("graph_file", "data", base.display().to_string())]);
        }
        report = done;
    }

    ctx.channel.write(&[Change::new("series_progress", "value", 100)]);
    Ok(report)
}

/// A profile in progress
struct ProfileRun<'a> {
    ctx: &'a JobContext,
    job: &'a MeasurementJob,
    params: &'a ProfileParams,
    directory: PathBuf,
    measurements: u32,
    report: JobReport,
}

impl ProfileRun<'_> {
    /// All replicates at one position
    fn measure_step(&mut self, link: &mut dyn DeviceLink, step: u32, position_mm: f64, measurement: u32) -> Result<(), JobError> {
        let replicates = self.params.replicates;
        for replicate in 1..=replicates {
            self.ctx.channel.write(&[Change::new(
                "series_progress_label",
                "children",
                format!("Measurement {}/{} - Scan {}/{}", measurement, self.measurements, replicate, replicates),
            )]);

            let name = results::profile_scan_name(&self.job.id, step, position_mm, replicate);
            let done = measure(self.ctx, link, self.job, &self.directory.join(name))?;
            if let Some(base) = &done.base {
                self.ctx.channel.write(&[Change::new("graph_file", "data", base.display().to_string())]);
            }
            self.report.absorb(done);
        }
        Ok(())
    }
}

/// Measure at the current position, then step the profiler and measure again
/// until all steps are done or the stage stops moving
fn profile(ctx: &JobContext, link: &mut dyn DeviceLink, job: &MeasurementJob, params: &ProfileParams) -> Result<JobReport, JobError> {
    let directory = results::profile_directory(&ctx.working_directory, &job.id)?;
    // A profile with the same id carries on where the last one stopped
    let last_step = results::last_profile_step(&directory)?;

    let mut profiler = ctx.lock_profiler();
    profiler.configure(params.max_speed_mm_s, params.max_acceleration_mm_s2)?;
    let mut position = profiler.position_mm()?;

    let measurements = params.steps + 1;
    let mut run = ProfileRun {
        ctx,
        job,
        params,
        directory,
        measurements,
        report: JobReport::empty(&job.id),
    };

    match last_step {
        None => {
            ctx.series_progress(100.0 / measurements as f64, format!("Measurement 1/{}", measurements));
            run.measure_step(link, 0, position, 1)?;
        }
        Some(step) => info!("📂 Continuing profile {} after step {}", job.id, step),
    }

    let first_step = last_step.unwrap_or(0);
    for i in 1..=params.steps {
        if job.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        ctx.channel.write(&[Change::new("scan_progress_label", "children", "Moving Sensor")]);
        ctx.series_progress(
            (i + 1) as f64 / measurements as f64 * 100.0,
            format!("Measurement {}/{}", i + 1, measurements),
        );
        profiler.move_step(params.step_mm)?;

        let previous = position;
        position = profiler.position_mm()?;
        ctx.channel.write(&[Change::new("profiler_position", "children", format_position(position))]);
        if position == previous {
            warn!("Profiler did not move, assuming it reached its limit");
            ctx.channel.write(&[Change::new("scan_progress_label", "children", "Reached limit of profiler")]);
            break;
        }

        run.measure_step(link, first_step + i, position, i + 1)?;
    }

    ctx.channel.write(&[Change::new("series_progress_label", "children", "profile completed")]);
    Ok(run.report)
}

/// Leave the instrument idle and the document consistent, whatever happened
fn finish(ctx: &JobContext, link: &mut dyn DeviceLink, job: &MeasurementJob, result: &Result<JobReport, JobError>) {
    let mut changes = job.snapshot.restore();

    match result {
        Ok(report) => {
            if let Some(base) = &report.base {
                changes.push(Change::new("graph_file", "data", base.display().to_string()));
            }
        }
        Err(e) => {
            let label = if matches!(e, JobError::Cancelled) {
                warn!("🛑 {} cancelled", job.id);
                "Cancelled"
            } else {
                error!("❌ {} failed: {}", job.id, e);
                "Failed"
            };
            if let Err(e) = ctx.codec.abort(link) {
                warn!("Abort after {} failed: {}", label.to_lowercase(), e);
            }
            changes.push(Change::new("scan_progress_label", "children", label));
        }
    }

    if let Err(e) = ctx.codec.idle(link, 0.0) {
        error!("❌ Could not return the instrument to idle: {}", e);
    }

    changes.extend(controls_disabled(false));
    ctx.channel.write(&changes);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown cause".to_string()
    }
}

/// Put the document back after a job thread panicked, then try to idle
fn recover(ctx: &JobContext, link: &Mutex<Box<dyn DeviceLink>>, job: &MeasurementJob) {
    let mut changes = job.snapshot.restore();
    changes.push(Change::new("scan_progress_label", "children", "Failed"));
    changes.extend(controls_disabled(false));
    ctx.channel.write(&changes);

    let idled = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut guard = link.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ctx.codec.idle(&mut **guard, 0.0)
    }));
    match idled {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("❌ Could not return the instrument to idle: {}", e),
        Err(_) => error!("❌ Instrument link failed again while idling"),
    }
}

/// Control loop settings taken from the application configuration
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub device: DeviceConfig,
    pub poll_interval: Duration,
    pub stir_speed_divisor: f64,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            device: config.device.clone(),
            poll_interval: config.state.poll_interval(),
            stir_speed_divisor: config.hardware.stir_speed_divisor,
        }
    }
}

type JobOutcome = (String, Result<JobReport, JobError>);

struct ActiveJob {
    id: String,
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

/// The backend's main loop
pub struct Orchestrator {
    ctx: JobContext,
    settings: OrchestratorSettings,
    link: Arc<Mutex<Box<dyn DeviceLink>>>,
    motor: Arc<dyn MotorDriver>,
    running: Arc<AtomicBool>,
    last_seen: Option<f64>,
    active: Option<ActiveJob>,
    done_tx: Sender<JobOutcome>,
    done_rx: Receiver<JobOutcome>,
}

impl Orchestrator {
    pub fn new(
        ctx: JobContext,
        settings: OrchestratorSettings,
        link: Box<dyn DeviceLink>,
        motor: Arc<dyn MotorDriver>,
    ) -> Self {
        let (done_tx, done_rx) = unbounded();
        Self {
            ctx,
            settings,
            link: Arc::new(Mutex::new(link)),
            motor,
            running: Arc::new(AtomicBool::new(true)),
            last_seen: None,
            active: None,
            done_tx,
            done_rx,
        }
    }

    /// Get a reference to the running flag for external control
    pub fn get_running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Whether a measurement is in progress
    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    /// Reset the controls left behind by an earlier run and bring the
    /// instrument to its default ADC and gain settings, idling at 0 mV
    pub fn initialize(&self) -> Result<(), ProtocolError> {
        info!("🔧 Resetting controls and instrument");
        self.ctx.channel.write(&startup_controls());

        let device = &self.settings.device;
        let codec = &self.ctx.codec;
        let mut link = self.lock_link();
        codec.abort(&mut **link)?;
        codec.setup_adc(&mut **link, device.adc_buffer != 0, device.sample_rate, device.pga_gain)?;
        codec.set_gain(&mut **link, device.iv_gain)?;
        codec.idle(&mut **link, 0.0)?;
        Ok(())
    }

    /// Poll until the running flag is cleared, then shut down
    pub fn run(&mut self) {
        info!("🔄 Control loop started (poll every {:?})", self.settings.poll_interval);

        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.step() {
                warn!("State poll failed: {}", e);
            }
            thread::sleep(self.settings.poll_interval);
        }

        self.shutdown();
    }

    /// One control loop iteration
    pub fn step(&mut self) -> Result<(), SyncError> {
        self.reap();

        if let Some(doc) = self.ctx.channel.poll(self.last_seen)? {
            self.last_seen = Some(doc.update_timestamp);
            self.handle_update(&doc);
        }
        Ok(())
    }

    /// Block until the active job reports back
    pub fn wait_for_job(&mut self) -> Option<JobOutcome> {
        self.active.as_ref()?;
        let outcome = self.done_rx.recv().ok()?;
        self.retire(&outcome);
        Some(outcome)
    }

    /// Cancel any job, wait for it and idle the instrument
    pub fn shutdown(&mut self) {
        info!("🛑 Shutting down control loop");
        if let Some(job) = &self.active {
            job.cancel.cancel();
            self.wait_for_job();
        }
        let mut link = self.lock_link();
        if let Err(e) = self.ctx.codec.idle(&mut **link, 0.0) {
            warn!("Could not idle the instrument on shutdown: {}", e);
        }
    }

    fn lock_link(&self) -> MutexGuard<'_, Box<dyn DeviceLink>> {
        self.link.lock().unwrap_or_else(|poisoned| {
            warn!("Instrument link lock poisoned by a failed job");
            poisoned.into_inner()
        })
    }

    fn reap(&mut self) {
        if let Ok(outcome) = self.done_rx.try_recv() {
            self.retire(&outcome);
        }
    }

    fn retire(&mut self, outcome: &JobOutcome) {
        let (id, result) = outcome;
        match result {
            Ok(report) => info!("📊 {}: {} scan(s), {} file(s)", id, report.scans.len(), report.files.len()),
            Err(e) => info!("📊 {}: {}", id, e),
        }

        if let Some(job) = self.active.take() {
            if job.id != *id {
                warn!("Job {} reported while {} was active", id, job.id);
            }
            if job.handle.join().is_err() {
                error!("Measurement thread for {} panicked", job.id);
            }
        }
    }

    fn handle_update(&mut self, doc: &Document) {
        self.apply_outputs(doc);

        if doc.is_triggered("start_button") {
            self.start(doc);
        }
        if doc.is_triggered("stop_button") {
            self.stop();
        }
        if doc.is_triggered("home_button") {
            self.move_profiler(doc, "home_button", |profiler, _| profiler.home());
        }
        if doc.is_triggered("move_step_button") {
            self.move_profiler(doc, "move_step_button", |profiler, doc| {
                let distance = doc.get_f64("profile_step_distance_input", "value").unwrap_or(0.0);
                profiler.move_step(distance)
            });
        }
    }

    /// Mirror the purge and stir switches onto the motor driver
    fn apply_outputs(&self, doc: &Document) {
        match doc.get_bool("purge_switch", "on") {
            Ok(true) => self.motor.activate(PURGE_CHANNEL),
            Ok(false) => self.motor.deactivate(PURGE_CHANNEL),
            Err(e) => debug!("Purge switch not set: {}", e),
        }

        match doc.get_bool("stirr_switch", "on") {
            Ok(true) => {
                let slider = doc.get_f64("stirr_speed_slider", "value").unwrap_or(0.0);
                self.motor.start(STIR_CHANNEL, slider / self.settings.stir_speed_divisor);
            }
            Ok(false) => self.motor.start(STIR_CHANNEL, 0.0),
            Err(e) => debug!("Stir switch not set: {}", e),
        }
    }

    fn start(&mut self, doc: &Document) {
        if let Some(active) = &self.active {
            warn!("Start ignored: {} ({})", JobError::Busy, active.id);
            self.ctx.channel.write(&[Change::new("start_button", "triggered", false)]);
            return;
        }

        self.ctx.channel.write(&[
            Change::new("start_button", "triggered", false),
            Change::new("stop_button", "disabled", false),
            Change::new("start_button", "disabled", true),
        ]);

        let job = match MeasurementJob::from_document(doc, &self.settings.device) {
            Ok(job) => job,
            Err(e) => {
                error!("❌ Measurement not started: {}", e);
                let mut changes = controls_disabled(false);
                changes.push(Change::new("scan_progress_label", "children", "Failed"));
                self.ctx.channel.write(&changes);
                return;
            }
        };

        let id = job.id.clone();
        let cancel = job.cancel_token();
        let ctx = self.ctx.clone();
        let link = Arc::clone(&self.link);
        let done_tx = self.done_tx.clone();

        let handle = thread::spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                let mut guard = link.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                run_job(&ctx, &mut **guard, &job)
            }))
            .unwrap_or_else(|payload| {
                let cause = panic_message(&*payload);
                error!("❌ Measurement thread for {} panicked: {}", job.id, cause);
                recover(&ctx, &link, &job);
                Err(JobError::Panicked(cause))
            });

            if done_tx.send((job.id.clone(), result)).is_err() {
                warn!("Control loop gone before {} reported", job.id);
            }
        });

        self.active = Some(ActiveJob { id, cancel, handle });
    }

    fn stop(&mut self) {
        self.ctx.channel.write(&[Change::new("stop_button", "triggered", false)]);

        if let Some(job) = &self.active {
            info!("🛑 Stop requested for {}", job.id);
            job.cancel.cancel();
            return;
        }

        // Nothing of ours is running, but the instrument may still be busy
        info!("🛑 Stop requested with no active measurement");
        {
            let mut link = self.lock_link();
            if let Err(e) = self.ctx.codec.abort(&mut **link) {
                warn!("Abort failed: {}", e);
            }
            if let Err(e) = self.ctx.codec.idle(&mut **link, 0.0) {
                error!("❌ Could not idle the instrument: {}", e);
            }
        }
        let mut changes = controls_disabled(false);
        changes.push(Change::new("scan_progress_label", "children", "Cancelled"));
        self.ctx.channel.write(&changes);
    }

    fn move_profiler(
        &mut self,
        doc: &Document,
        button: &str,
        action: impl FnOnce(&mut Profiler, &Document) -> Result<(), HardwareError>,
    ) {
        if self.active.is_some() {
            warn!("{} ignored while a measurement runs", button);
            self.ctx.channel.write(&[Change::new(button, "triggered", false)]);
            return;
        }

        self.ctx.channel.write(&[
            Change::new(button, "triggered", false),
            Change::new("start_button", "disabled", true),
            Change::new("stop_button", "disabled", true),
            Change::new("home_button", "disabled", true),
            Change::new("move_step_button", "disabled", true),
        ]);

        let speed = doc.get_f64("max_speed_input", "value");
        let acceleration = doc.get_f64("max_acceleration_input", "value");
        let moved = {
            let mut profiler = self.ctx.lock_profiler();
            match (speed, acceleration) {
                (Ok(speed), Ok(acceleration)) => profiler.configure(speed, acceleration),
                _ => Ok(()),
            }
            .and_then(|_| action(&mut *profiler, doc))
            .and_then(|_| profiler.position_label())
        };

        let mut changes = vec![
            Change::new("start_button", "disabled", false),
            Change::new("home_button", "disabled", false),
            Change::new("move_step_button", "disabled", false),
        ];
        match moved {
            Ok(label) => {
                info!("📍 {}", label);
                changes.push(Change::new("profiler_position", "children", label));
            }
            Err(e) => error!("❌ Profiler {} failed: {}", button, JobError::from(e)),
        }
        self.ctx.channel.write(&changes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{ChannelState, LoggingMotorDriver, NullPositioner};
    use crate::scheduler::ManualClock;
    use crate::state::{MemoryStore, StateStore};
    use shared::sim::{SimulatedDevice, StreamMode};
    use shared::RetryPolicy;
    use tempfile::{tempdir, TempDir};

    /// Store that cancels a job as soon as a given phase label is written
    struct CancelOnLabel {
        inner: MemoryStore,
        label: &'static str,
        token: CancelToken,
    }

    impl StateStore for CancelOnLabel {
        fn load(&self) -> Result<Document, SyncError> {
            self.inner.load()
        }

        fn store(&self, doc: &Document) -> Result<(), SyncError> {
            if doc.get_str("scan_progress_label", "children").ok() == Some(self.label) {
                self.token.cancel();
            }
            self.inner.store(doc)
        }
    }

    fn fast_codec() -> Codec {
        Codec::new(RetryPolicy {
            attempts: 3,
            retry_delay: Duration::ZERO,
            max_unresponsive_rounds: 3,
        })
    }

    fn context(channel: StateChannel, dir: &TempDir) -> JobContext {
        JobContext {
            channel,
            codec: fast_codec(),
            clock: Arc::new(ManualClock::new()),
            profiler: Arc::new(Mutex::new(Profiler::new(Box::new(NullPositioner::new()), 1600.0))),
            working_directory: dir.path().to_path_buf(),
            slice: Duration::from_millis(50),
        }
    }

    fn cv_document() -> Document {
        let mut doc = Document::with_defaults();
        for (component, value) in [
            ("purge_time_input", 0.0),
            ("cleaning_time_input", 0.0),
            ("deposition_time_input", 0.0),
            ("start_potential_input", -100.0),
            ("vertex_potential_input", -1850.0),
            ("end_potential_input", -100.0),
            ("slope_input", 500.0),
            ("n_scans_input", 1.0),
        ] {
            doc.set(component, "value", value);
        }
        doc.set("program_selection", "value", "single_cv");
        doc.set("popup_measurement_id", "value", "e2e");
        doc
    }

    struct Rig {
        orchestrator: Orchestrator,
        device: SimulatedDevice,
        channel: StateChannel,
        motor: Arc<LoggingMotorDriver>,
        dir: TempDir,
    }

    fn rig(doc: Document, device: SimulatedDevice) -> Rig {
        let dir = tempdir().unwrap();
        let channel = StateChannel::new(Arc::new(MemoryStore::new(doc)), Duration::ZERO);
        let motor = Arc::new(LoggingMotorDriver::new());
        let settings = OrchestratorSettings::from_config(&AppConfig::new());

        let orchestrator = Orchestrator::new(
            context(channel.clone(), &dir),
            settings,
            Box::new(device.clone()),
            motor.clone(),
        );

        Rig { orchestrator, device, channel, motor, dir }
    }

    #[test]
    fn test_cyclic_voltammetry_end_to_end() {
        let mut rig = rig(cv_document(), SimulatedDevice::new().with_scans(1, 10));
        rig.channel.write(&[Change::new("start_button", "triggered", true)]);

        rig.orchestrator.step().unwrap();
        assert!(rig.orchestrator.is_busy());
        let (id, result) = rig.orchestrator.wait_for_job().unwrap();
        let report = result.unwrap();

        assert_eq!(id, "e2e");
        assert_eq!(report.scans.len(), 1);
        assert_eq!(report.scans[0].len(), 7);
        assert!(!rig.orchestrator.is_busy());

        let doc = rig.channel.read().unwrap();
        assert_eq!(doc.get_f64("scan_progress", "value").unwrap(), 100.0);
        assert!(!doc.get_bool("start_button", "disabled").unwrap());
        assert!(!doc.is_triggered("start_button"));
        assert_eq!(
            doc.get_str("graph_file", "data").unwrap(),
            rig.dir.path().join("e2e").display().to_string()
        );
        assert!(rig.dir.path().join("e2e.csv").exists());
        assert!(rig.dir.path().join("e2e-parameters.txt").exists());

        let commands = rig.device.commands();
        assert_eq!(commands[0], "EA 2 A1 1");
        assert_eq!(commands[1], "EG 4");
        assert!(commands[2].starts_with("EC 0 0 "));
        assert!(commands[2].ends_with(" 3168 31168 31168 1 8000"));
        assert_eq!(commands.last().map(String::as_str), Some("EM 32768"));
    }

    #[test]
    fn test_cancellation_in_every_phase_restores_outputs() {
        for label in ["Purging", "Cleaning", "Deposition", "Scan"] {
            let dir = tempdir().unwrap();
            let mut doc = cv_document();
            doc.set("purge_time_input", "value", 1);
            doc.set("cleaning_time_input", "value", 1);
            doc.set("deposition_time_input", "value", 1);
            doc.set("purge_switch", "on", false);
            doc.set("stirr_switch", "on", true);

            let job = MeasurementJob::from_document(&doc, &DeviceConfig::default()).unwrap();
            let store = Arc::new(CancelOnLabel {
                inner: MemoryStore::new(doc),
                label,
                token: job.cancel_token(),
            });
            let channel = StateChannel::new(store, Duration::ZERO);
            let ctx = context(channel.clone(), &dir);
            let device = SimulatedDevice::new().with_stream_mode(StreamMode::Hold);

            let result = run_job(&ctx, &mut device.clone(), &job);

            assert!(matches!(result, Err(JobError::Cancelled)), "{}: {:?}", label, result);
            let doc = channel.read().unwrap();
            assert!(!doc.get_bool("purge_switch", "on").unwrap(), "{}", label);
            assert!(doc.get_bool("stirr_switch", "on").unwrap(), "{}", label);
            assert_eq!(doc.get_str("scan_progress_label", "children").unwrap(), "Cancelled");
            assert_eq!(device.commands().last().map(String::as_str), Some("EM 32768"), "{}", label);
            assert!(device.aborts() >= 2, "{}", label);
        }
    }

    #[test]
    fn test_empty_measurement_id_gets_timestamp() {
        let mut doc = cv_document();
        doc.set("popup_measurement_id", "value", "  ");

        let job = MeasurementJob::from_document(&doc, &DeviceConfig::default()).unwrap();

        assert_eq!(job.id.len(), "20261017_120000".len());
        assert_eq!(job.id.as_bytes()[8], b'_');
        assert_eq!(job.plan().total(), 7.0);
    }

    #[test]
    fn test_job_cancelled_before_start_sends_no_experiment() {
        let dir = tempdir().unwrap();
        let doc = cv_document();
        let channel = StateChannel::new(Arc::new(MemoryStore::new(doc.clone())), Duration::ZERO);
        let job = MeasurementJob::from_document(&doc, &DeviceConfig::default()).unwrap();
        let device = SimulatedDevice::new();

        job.cancel();
        let result = run_job(&context(channel.clone(), &dir), &mut device.clone(), &job);

        assert!(matches!(result, Err(JobError::Cancelled)));
        assert_eq!(device.commands(), vec!["EM 32768".to_string()]);
        assert!(!channel.read().unwrap().get_bool("start_button", "disabled").unwrap());
    }

    #[test]
    fn test_plating_holds_potential() {
        let dir = tempdir().unwrap();
        let mut doc = Document::with_defaults();
        doc.set("program_selection", "value", "hg_au_electrode_plating");
        doc.set("plating_time_input", "value", 2);
        doc.set("plating_potential_input", "value", -100);
        doc.set("stirr_switch", "on", false);

        let channel = StateChannel::new(Arc::new(MemoryStore::new(doc.clone())), Duration::ZERO);
        let job = MeasurementJob::from_document(&doc, &DeviceConfig::default()).unwrap();
        let device = SimulatedDevice::new();

        let report = run_job(&context(channel.clone(), &dir), &mut device.clone(), &job).unwrap();

        assert!(report.scans.is_empty());
        assert!(report.files.is_empty());
        assert_eq!(device.commands(), vec!["EM 31168".to_string(), "EM 32768".to_string()]);
        assert_eq!(device.aborts(), 2);

        let doc = channel.read().unwrap();
        assert_eq!(doc.get_str("scan_progress_label", "children").unwrap(), "");
        assert!(!doc.get_bool("stirr_switch", "on").unwrap());
        assert_eq!(doc.get_f64("scan_progress", "value").unwrap(), 100.0);
    }

    #[test]
    fn test_second_start_is_rejected() {
        let mut rig = rig(cv_document(), SimulatedDevice::new().with_stream_mode(StreamMode::Hold));
        let mut pressed = cv_document();
        pressed.set("start_button", "triggered", true);

        // Documents are handed over directly: the running job writes to the
        // store concurrently and could overwrite a trigger written there
        rig.orchestrator.handle_update(&pressed);
        assert!(rig.orchestrator.is_busy());
        rig.orchestrator.handle_update(&pressed);
        assert!(rig.orchestrator.is_busy());

        for _ in 0..500 {
            if rig.device.commands().iter().any(|c| c.starts_with("EC")) {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        let mut stop = cv_document();
        stop.set("stop_button", "triggered", true);
        rig.orchestrator.handle_update(&stop);
        let (_, result) = rig.orchestrator.wait_for_job().unwrap();

        assert!(matches!(result, Err(JobError::Cancelled)));
        assert!(!rig.orchestrator.is_busy());
        let doc = rig.channel.read().unwrap();
        assert_eq!(doc.get_str("scan_progress_label", "children").unwrap(), "Cancelled");
        assert!(!doc.get_bool("start_button", "disabled").unwrap());
        assert_eq!(rig.device.commands().iter().filter(|c| c.starts_with("EC")).count(), 1);
    }

    #[test]
    fn test_invalid_configuration_never_reaches_instrument() {
        let mut doc = cv_document();
        doc.set("program_selection", "value", "voltammetry_deluxe");
        let mut rig = rig(doc, SimulatedDevice::new());
        rig.channel.write(&[Change::new("start_button", "triggered", true)]);

        rig.orchestrator.step().unwrap();

        assert!(!rig.orchestrator.is_busy());
        assert_eq!(rig.device.announcements(), 0);
        assert_eq!(rig.device.aborts(), 0);
        let doc = rig.channel.read().unwrap();
        assert!(!doc.get_bool("start_button", "disabled").unwrap());
        assert_eq!(doc.get_str("scan_progress_label", "children").unwrap(), "Failed");
    }

    #[test]
    fn test_unbounded_phase_is_rejected_before_instrument() {
        let mut doc = Document::with_defaults();
        doc.set("program_selection", "value", "hg_au_electrode_plating");
        doc.set("plating_time_input", "value", 1e20);
        let mut rig = rig(doc, SimulatedDevice::new());
        rig.channel.write(&[Change::new("start_button", "triggered", true)]);

        rig.orchestrator.step().unwrap();

        assert!(!rig.orchestrator.is_busy());
        assert_eq!(rig.device.aborts(), 0);
        let doc = rig.channel.read().unwrap();
        assert_eq!(doc.get_str("scan_progress_label", "children").unwrap(), "Failed");
    }

    /// Link whose every write panics
    struct PanickingLink;

    impl DeviceLink for PanickingLink {
        fn write_all(&mut self, _: &[u8]) -> Result<(), shared::LinkError> {
            panic!("link fault");
        }

        fn read_chunk(&mut self, _: &mut [u8]) -> Result<usize, shared::LinkError> {
            Ok(0)
        }

        fn read_line(&mut self) -> Result<Vec<u8>, shared::LinkError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_panicked_job_is_reaped() {
        let dir = tempdir().unwrap();
        let mut doc = cv_document();
        doc.set("stirr_switch", "on", true);
        let channel = StateChannel::new(Arc::new(MemoryStore::new(doc)), Duration::ZERO);
        let mut orchestrator = Orchestrator::new(
            context(channel.clone(), &dir),
            OrchestratorSettings::from_config(&AppConfig::new()),
            Box::new(PanickingLink),
            Arc::new(LoggingMotorDriver::new()),
        );
        channel.write(&[Change::new("start_button", "triggered", true)]);

        orchestrator.step().unwrap();
        let (_, result) = orchestrator.wait_for_job().unwrap();

        assert!(matches!(result, Err(JobError::Panicked(ref cause)) if cause == "link fault"));
        assert!(!orchestrator.is_busy());
        let doc = channel.read().unwrap();
        assert_eq!(doc.get_str("scan_progress_label", "children").unwrap(), "Failed");
        assert!(!doc.get_bool("start_button", "disabled").unwrap());
        assert!(doc.get_bool("stirr_switch", "on").unwrap());

        // The next start is accepted rather than rejected as busy
        channel.write(&[Change::new("start_button", "triggered", true)]);
        orchestrator.step().unwrap();
        assert!(orchestrator.is_busy());
        orchestrator.wait_for_job();
    }

    #[test]
    fn test_startup_clears_stale_triggers() {
        let mut doc = cv_document();
        doc.set("start_button", "triggered", true);
        doc.set("start_button", "disabled", true);
        doc.set("stop_button", "disabled", false);
        doc.set("purge_switch", "disabled", true);
        let mut rig = rig(doc, SimulatedDevice::new());

        rig.orchestrator.initialize().unwrap();
        rig.orchestrator.step().unwrap();

        assert!(!rig.orchestrator.is_busy());
        let doc = rig.channel.read().unwrap();
        assert!(!doc.is_triggered("start_button"));
        assert!(!doc.get_bool("start_button", "disabled").unwrap());
        assert!(doc.get_bool("stop_button", "disabled").unwrap());
        assert!(!doc.get_bool("purge_switch", "disabled").unwrap());
        assert_eq!(rig.device.aborts(), 1);
        assert_eq!(
            rig.device.commands(),
            vec!["EA 2 A1 1".to_string(), "EG 4".to_string(), "EM 32768".to_string()]
        );
    }

    fn experiments(device: &SimulatedDevice) -> usize {
        device.commands().iter().filter(|c| c.starts_with("EC")).count()
    }

    #[test]
    fn test_electrode_test_series_keeps_last_run() {
        let dir = tempdir().unwrap();
        let mut doc = cv_document();
        doc.set("program_selection", "value", "hg_au_electrode_testing");
        doc.set("n_electrode_tests_input", "value", 2);
        doc.set("popup_measurement_id", "value", "hg");
        let channel = StateChannel::new(Arc::new(MemoryStore::new(doc.clone())), Duration::ZERO);
        let job = MeasurementJob::from_document(&doc, &DeviceConfig::default()).unwrap();
        let device = SimulatedDevice::new().with_scans(1, 10);

        let report = run_job(&context(channel.clone(), &dir), &mut device.clone(), &job).unwrap();

        assert_eq!(experiments(&device), 2);
        assert_eq!(
            report.files,
            vec![dir.path().join("hg.csv"), dir.path().join("hg-parameters.txt")]
        );
        assert!(!dir.path().join("hg_test1.csv").exists());
        assert!(!dir.path().join("hg_test1-parameters.txt").exists());

        let doc = channel.read().unwrap();
        assert_eq!(doc.get_f64("series_progress", "value").unwrap(), 100.0);
        assert_eq!(doc.get_str("series_progress_label", "children").unwrap(), "Test 2/2");
        assert_eq!(
            doc.get_str("graph_file", "data").unwrap(),
            dir.path().join("hg").display().to_string()
        );
        assert!(!doc.get_bool("start_button", "disabled").unwrap());
    }

    fn profile_document(steps: u32, distance_mm: f64) -> Document {
        let mut doc = cv_document();
        doc.set("program_selection", "value", "profiler_cv");
        doc.set("popup_measurement_id", "value", "depth");
        doc.set("profile_step_number_input", "value", steps);
        doc.set("profile_repeat_measurements_input", "value", 2);
        doc.set("profile_step_distance_input", "value", distance_mm);
        doc.set("purge_time_input", "value", 30);
        doc
    }

    #[test]
    fn test_profile_measures_every_step() {
        let dir = tempdir().unwrap();
        let doc = profile_document(2, 1.0);
        let channel = StateChannel::new(Arc::new(MemoryStore::new(doc.clone())), Duration::ZERO);
        let ctx = context(channel.clone(), &dir);
        let job = MeasurementJob::from_document(&doc, &DeviceConfig::default()).unwrap();
        let device = SimulatedDevice::new().with_scans(1, 10);
        assert_eq!(job.setup.purge_s, 0.0);

        let report = run_job(&ctx, &mut device.clone(), &job).unwrap();

        let profile = dir.path().join("depth");
        for name in [
            "depth_step000_000.0mm_01",
            "depth_step000_000.0mm_02",
            "depth_step001_001.0mm_01",
            "depth_step001_001.0mm_02",
            "depth_step002_002.0mm_01",
            "depth_step002_002.0mm_02",
        ] {
            assert!(profile.join(format!("{}.csv", name)).exists(), "{}", name);
        }
        assert_eq!(report.files.len(), 12);
        assert_eq!(experiments(&device), 6);

        let doc = channel.read().unwrap();
        assert_eq!(doc.get_str("series_progress_label", "children").unwrap(), "profile completed");
        assert_eq!(doc.get_f64("series_progress", "value").unwrap(), 100.0);
        assert_eq!(doc.get_str("profiler_position", "children").unwrap(), "Profiler Position: 002.0 mm");
        assert_eq!(
            doc.get_str("graph_file", "data").unwrap(),
            profile.join("depth_step002_002.0mm_02").display().to_string()
        );

        // Same id again: numbering continues and the start position is not repeated
        let again = MeasurementJob::from_document(&doc, &DeviceConfig::default()).unwrap();
        run_job(&ctx, &mut device.clone(), &again).unwrap();
        assert!(profile.join("depth_step003_003.0mm_01.csv").exists());
        assert!(profile.join("depth_step004_004.0mm_02.csv").exists());
        assert_eq!(experiments(&device), 10);
    }

    #[test]
    fn test_profile_stops_at_limit() {
        let dir = tempdir().unwrap();
        let doc = profile_document(3, 0.0);
        let channel = StateChannel::new(Arc::new(MemoryStore::new(doc.clone())), Duration::ZERO);
        let job = MeasurementJob::from_document(&doc, &DeviceConfig::default()).unwrap();
        let device = SimulatedDevice::new().with_scans(1, 10);

        let report = run_job(&context(channel.clone(), &dir), &mut device.clone(), &job).unwrap();

        assert_eq!(experiments(&device), 2);
        assert_eq!(report.files.len(), 4);
        let doc = channel.read().unwrap();
        assert_eq!(doc.get_str("scan_progress_label", "children").unwrap(), "Reached limit of profiler");
        assert_eq!(doc.get_str("series_progress_label", "children").unwrap(), "profile completed");
    }

    #[test]
    fn test_switches_drive_motor() {
        let mut rig = rig(Document::with_defaults(), SimulatedDevice::new());
        rig.channel.write(&[
            Change::new("purge_switch", "on", true),
            Change::new("stirr_switch", "on", true),
            Change::new("stirr_speed_slider", "value", 50),
        ]);
        rig.orchestrator.step().unwrap();

        assert_eq!(rig.motor.state(PURGE_CHANNEL), Some(ChannelState::Active));
        assert_eq!(rig.motor.state(STIR_CHANNEL), Some(ChannelState::Running(2.0)));

        rig.channel.write(&[Change::new("stirr_switch", "on", false)]);
        rig.orchestrator.step().unwrap();
        assert_eq!(rig.motor.state(STIR_CHANNEL), Some(ChannelState::Running(0.0)));
    }

    #[test]
    fn test_stop_without_job_idles_instrument() {
        let mut rig = rig(Document::with_defaults(), SimulatedDevice::new());
        rig.channel.write(&[Change::new("stop_button", "triggered", true)]);

        rig.orchestrator.step().unwrap();

        assert_eq!(rig.device.aborts(), 1);
        assert_eq!(rig.device.commands(), vec!["EM 32768".to_string()]);
        let doc = rig.channel.read().unwrap();
        assert_eq!(doc.get_str("scan_progress_label", "children").unwrap(), "Cancelled");
    }

    #[test]
    fn test_profiler_buttons_report_position() {
        let mut rig = rig(Document::with_defaults(), SimulatedDevice::new());
        rig.channel.write(&[
            Change::new("profile_step_distance_input", "value", 2.5),
            Change::new("move_step_button", "triggered", true),
        ]);
        rig.orchestrator.step().unwrap();

        let doc = rig.channel.read().unwrap();
        assert_eq!(doc.get_str("profiler_position", "children").unwrap(), "Profiler Position: 002.5 mm");
        assert!(!doc.is_triggered("move_step_button"));
        assert!(!doc.get_bool("home_button", "disabled").unwrap());

        rig.channel.write(&[Change::new("home_button", "triggered", true)]);
        rig.orchestrator.step().unwrap();
        let doc = rig.channel.read().unwrap();
        assert_eq!(doc.get_str("profiler_position", "children").unwrap(), "Profiler Position: 000.0 mm");
    }
}
