/*!
Measurement techniques and the settings shared by all of them.

Each technique carries its own parameters and knows its scan duration, the
instrument command that runs it and the data shape it produces. Values are
read from the shared document's `*_input` components.

A program is a technique plus a [`Series`]: most programs measure once, the
electrode test repeats a cyclic voltammogram and the profiler programs measure
at successive depths of the profiler stage.
*/

use shared::command::Preconditioning;
use shared::{CommandFrame, CurrentShape, IvGain, PgaGain, SampleRate};

use crate::config::DeviceConfig;
use crate::error::ConfigError;
use crate::state::Document;

#[derive(Debug, Clone, PartialEq)]
pub struct CyclicParams {
    pub start_mv: f64,
    pub vertex_mv: f64,
    pub end_mv: f64,
    pub slope_mv_s: f64,
    pub scans: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinearSweepParams {
    pub start_mv: f64,
    pub end_mv: f64,
    pub slope_mv_s: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DifferentialPulseParams {
    pub start_mv: f64,
    pub end_mv: f64,
    pub step_mv: f64,
    pub pulse_mv: f64,
    pub period_ms: u32,
    pub width_ms: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SquareWaveParams {
    pub start_mv: f64,
    pub end_mv: f64,
    pub step_mv: f64,
    pub pulse_mv: f64,
    pub frequency_hz: u32,
    pub scans: u32,
}

/// Constant-potential mercury plating of a gold electrode
#[derive(Debug, Clone, PartialEq)]
pub struct PlatingParams {
    pub potential_mv: f64,
    pub duration_s: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Technique {
    Cyclic(CyclicParams),
    LinearSweep(LinearSweepParams),
    DifferentialPulse(DifferentialPulseParams),
    SquareWave(SquareWaveParams),
    Plating(PlatingParams),
}

/// Longest purge, preconditioning, plating or scan phase accepted, in seconds
pub const MAX_PHASE_SECONDS: f64 = 86_400.0;

const PHASE_LIMIT: &str = "a duration of at most 86400 s";

/// How many measurements a program runs
#[derive(Debug, Clone, PartialEq)]
pub enum Series {
    Single,
    /// Repeated cyclic voltammetry on a freshly plated electrode; only the
    /// last run's files are kept
    ElectrodeTest { tests: u32 },
    /// Replicate measurements at each step of the profiler stage
    Profile(ProfileParams),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileParams {
    /// Steps after the measurement at the starting position
    pub steps: u32,
    pub step_mm: f64,
    pub replicates: u32,
    pub max_speed_mm_s: f64,
    pub max_acceleration_mm_s2: f64,
}

impl Series {
    /// Series of the program selected by `program_selection`
    pub fn from_document(doc: &Document) -> Result<Self, ConfigError> {
        let series = match doc.get_str("program_selection", "value")? {
            "hg_au_electrode_testing" => Self::ElectrodeTest {
                tests: at_least_one(whole(doc, "n_electrode_tests_input")?, "n_electrode_tests_input")?,
            },
            program if program.starts_with("profiler_") => {
                let step_mm = input(doc, "profile_step_distance_input")?;
                if !step_mm.is_finite() {
                    return Err(ConfigError::invalid("profile_step_distance_input", "value", "a number"));
                }
                Self::Profile(ProfileParams {
                    steps: whole(doc, "profile_step_number_input")?,
                    step_mm,
                    replicates: at_least_one(
                        whole(doc, "profile_repeat_measurements_input")?,
                        "profile_repeat_measurements_input",
                    )?,
                    max_speed_mm_s: positive(input(doc, "max_speed_input")?, "max_speed_input")?,
                    max_acceleration_mm_s2: positive(input(doc, "max_acceleration_input")?, "max_acceleration_input")?,
                })
            }
            _ => Self::Single,
        };
        Ok(series)
    }
}

fn input(doc: &Document, name: &str) -> Result<f64, ConfigError> {
    doc.get_f64(name, "value")
}

fn whole(doc: &Document, name: &str) -> Result<u32, ConfigError> {
    doc.get_u32(name, "value")
}

fn positive(value: f64, component: &str) -> Result<f64, ConfigError> {
    if value > 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::invalid(component, "value", "a positive number"))
    }
}

/// Phase length in seconds; negative means skip the phase
fn phase_seconds(value: f64, component: &str) -> Result<f64, ConfigError> {
    if value.is_finite() && value <= MAX_PHASE_SECONDS {
        Ok(value.max(0.0))
    } else {
        Err(ConfigError::invalid(component, "value", PHASE_LIMIT))
    }
}

fn whole_seconds(value: u32, component: &str) -> Result<u32, ConfigError> {
    phase_seconds(value as f64, component).map(|_| value)
}

fn at_least_one(value: u32, component: &str) -> Result<u32, ConfigError> {
    if value >= 1 {
        Ok(value)
    } else {
        Err(ConfigError::invalid(component, "value", "at least 1"))
    }
}

impl Technique {
    /// Parse the technique selected by `program_selection`
    pub fn from_document(doc: &Document) -> Result<Self, ConfigError> {
        let program = doc.get_str("program_selection", "value")?;
        Self::for_program(program, doc)
    }

    /// Series programs measure with the technique named after their suffix
    pub fn for_program(program: &str, doc: &Document) -> Result<Self, ConfigError> {
        let base = match program {
            "hg_au_electrode_testing" | "profiler_cv" => "single_cv",
            "profiler_lsv" => "single_lsv",
            "profiler_dpv" => "single_dpv",
            "profiler_swv" => "single_swv",
            other => other,
        };

        let technique = match base {
            "single_cv" => Self::Cyclic(CyclicParams {
                start_mv: input(doc, "start_potential_input")?,
                vertex_mv: input(doc, "vertex_potential_input")?,
                end_mv: input(doc, "end_potential_input")?,
                slope_mv_s: positive(input(doc, "slope_input")?, "slope_input")?,
                scans: at_least_one(whole(doc, "n_scans_input")?, "n_scans_input")?,
            }),
            "single_lsv" => Self::LinearSweep(LinearSweepParams {
                start_mv: input(doc, "start_potential_input")?,
                end_mv: input(doc, "end_potential_input")?,
                slope_mv_s: positive(input(doc, "slope_input")?, "slope_input")?,
            }),
            "single_dpv" => Self::DifferentialPulse(DifferentialPulseParams {
                start_mv: input(doc, "start_potential_input")?,
                end_mv: input(doc, "end_potential_input")?,
                step_mv: positive(input(doc, "step_size_input")?, "step_size_input")?,
                pulse_mv: input(doc, "pulse_height_input")?,
                period_ms: at_least_one(whole(doc, "period_input")?, "period_input")?,
                width_ms: whole(doc, "pulse_width_input")?,
            }),
            "single_swv" => Self::SquareWave(SquareWaveParams {
                start_mv: input(doc, "start_potential_input")?,
                end_mv: input(doc, "end_potential_input")?,
                step_mv: positive(input(doc, "step_size_input")?, "step_size_input")?,
                pulse_mv: input(doc, "pulse_height_input")?,
                frequency_hz: at_least_one(whole(doc, "frequency_input")?, "frequency_input")?,
                scans: at_least_one(whole(doc, "n_scans_input")?, "n_scans_input")?,
            }),
            "hg_au_electrode_plating" => Self::Plating(PlatingParams {
                potential_mv: input(doc, "plating_potential_input")?,
                duration_s: phase_seconds(input(doc, "plating_time_input")?, "plating_time_input")?,
            }),
            _ => return Err(ConfigError::UnknownProgram(program.to_string())),
        };

        let scan = technique.scan_duration();
        if !scan.is_finite() || scan > MAX_PHASE_SECONDS {
            return Err(ConfigError::invalid("program_selection", "value", "a scan of at most 86400 s"));
        }
        Ok(technique)
    }

    /// Nominal length of the scan phase in seconds
    pub fn scan_duration(&self) -> f64 {
        match self {
            Self::Cyclic(p) => {
                ((p.start_mv - p.vertex_mv).abs() + (p.vertex_mv - p.end_mv).abs()) / p.slope_mv_s
            }
            Self::LinearSweep(p) => (p.start_mv - p.end_mv).abs() / p.slope_mv_s,
            Self::DifferentialPulse(p) => {
                ((p.start_mv - p.end_mv).abs() / p.step_mv) * p.period_ms as f64 / 1000.0
            }
            Self::SquareWave(p) => {
                let period_ms = 1000.0 / p.frequency_hz as f64;
                ((p.start_mv - p.end_mv).abs() / p.step_mv) * period_ms / 1000.0 * p.scans as f64
            }
            Self::Plating(p) => p.duration_s,
        }
    }

    /// The instrument command starting the technique; `None` for plating,
    /// which only holds an idle potential
    pub fn command(&self, pre: &Preconditioning) -> Option<CommandFrame> {
        let frame = match self {
            Self::Cyclic(p) => {
                CommandFrame::cyclic(pre, p.vertex_mv, p.end_mv, p.start_mv, p.scans, p.slope_mv_s)
            }
            Self::LinearSweep(p) => CommandFrame::linear_sweep(pre, p.start_mv, p.end_mv, p.slope_mv_s),
            Self::DifferentialPulse(p) => CommandFrame::differential_pulse(
                pre, p.start_mv, p.end_mv, p.step_mv, p.pulse_mv, p.period_ms, p.width_ms,
            ),
            Self::SquareWave(p) => CommandFrame::square_wave(
                pre, p.start_mv, p.end_mv, p.step_mv, p.pulse_mv, p.frequency_hz, p.scans,
            ),
            Self::Plating(_) => return None,
        };
        Some(frame)
    }

    pub fn shape(&self) -> CurrentShape {
        match self {
            Self::DifferentialPulse(_) | Self::SquareWave(_) => CurrentShape::Dual,
            _ => CurrentShape::Single,
        }
    }

    /// Number of scans the instrument is expected to send
    pub fn expected_scans(&self) -> usize {
        match self {
            Self::Cyclic(p) => p.scans as usize,
            Self::SquareWave(p) => p.scans as usize,
            Self::LinearSweep(_) | Self::DifferentialPulse(_) => 1,
            Self::Plating(_) => 0,
        }
    }

    /// First line of the parameters sidecar
    pub fn title(&self) -> &'static str {
        match self {
            Self::Cyclic(_) => "Cyclic Voltammetry Experiment",
            Self::LinearSweep(_) => "Linear Sweep Voltammetry Experiment",
            Self::DifferentialPulse(_) => "Differential Pulse Voltammetry Experiment",
            Self::SquareWave(_) => "Squarewave Voltammetry Experiment",
            Self::Plating(_) => "Mercury Plating",
        }
    }

    /// Technique-specific `(key, value)` pairs for the parameters sidecar
    pub fn parameter_lines(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::Cyclic(p) => vec![
                ("v1", format!("{} mV", p.vertex_mv)),
                ("v2", format!("{} mV", p.end_mv)),
                ("start", format!("{} mV", p.start_mv)),
                ("n_scans", p.scans.to_string()),
                ("slope", format!("{} mV/s", p.slope_mv_s)),
            ],
            Self::LinearSweep(p) => vec![
                ("start", format!("{} mV", p.start_mv)),
                ("stop", format!("{} mV", p.end_mv)),
                ("slope", format!("{} mV/s", p.slope_mv_s)),
            ],
            Self::DifferentialPulse(p) => vec![
                ("start", format!("{} mV", p.start_mv)),
                ("stop", format!("{} mV", p.end_mv)),
                ("step_size", format!("{} mV", p.step_mv)),
                ("pulse_height", format!("{} mV", p.pulse_mv)),
                ("period", format!("{} ms", p.period_ms)),
                ("width", format!("{} ms", p.width_ms)),
            ],
            Self::SquareWave(p) => vec![
                ("start", format!("{} mV", p.start_mv)),
                ("stop", format!("{} mV", p.end_mv)),
                ("step_size", format!("{} mV", p.step_mv)),
                ("pulse_height", format!("{} mV", p.pulse_mv)),
                ("frequency", format!("{} Hz", p.frequency_hz)),
                ("n_scans", p.scans.to_string()),
            ],
            Self::Plating(p) => vec![
                ("potential", format!("{} mV", p.potential_mv)),
                ("time", format!("{} s", p.duration_s)),
            ],
        }
    }
}

/// Settings every technique shares
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementSetup {
    pub purge_s: f64,
    pub preconditioning: Preconditioning,
    pub sample_rate: SampleRate,
    pub pga_gain: PgaGain,
    pub iv_gain: IvGain,
    pub adc_buffer: bool,
    pub comment: String,
}

impl MeasurementSetup {
    /// Read the shared settings; ADC and gain inputs fall back to `defaults`
    /// when the document does not carry them
    pub fn from_document(doc: &Document, defaults: &DeviceConfig) -> Result<Self, ConfigError> {
        let sample_rate = match doc.get("samplefreq_input", "value") {
            None => defaults.sample_rate,
            Some(_) => doc.get_str("samplefreq_input", "value")?.parse()?,
        };
        let iv_gain = match doc.get("iv_gain_input", "value") {
            None => defaults.iv_gain,
            Some(_) => doc.get_str("iv_gain_input", "value")?.parse()?,
        };
        let pga_gain = match doc.get("pga_gain_input", "value") {
            None => defaults.pga_gain,
            Some(_) => {
                let value = doc.get_u32("pga_gain_input", "value")?;
                u8::try_from(value)
                    .ok()
                    .and_then(PgaGain::new)
                    .ok_or_else(|| ConfigError::invalid("pga_gain_input", "value", "1, 2, 4 ... 64"))?
            }
        };

        Ok(Self {
            purge_s: phase_seconds(input(doc, "purge_time_input")?, "purge_time_input")?,
            preconditioning: Preconditioning {
                clean_s: whole_seconds(whole(doc, "cleaning_time_input")?, "cleaning_time_input")?,
                deposit_s: whole_seconds(whole(doc, "deposition_time_input")?, "deposition_time_input")?,
                clean_mv: input(doc, "cleaning_potential_input")?,
                deposit_mv: input(doc, "deposition_potential_input")?,
            },
            sample_rate,
            pga_gain,
            iv_gain,
            adc_buffer: defaults.adc_buffer != 0,
            comment: doc.get_str("comment_input", "value").unwrap_or_default().to_string(),
        })
    }
}
