/*!
Result files for finished measurements.

Each scan becomes one CSV file, `<id>.csv` for a single scan or
`<id>-scan<i>.csv` when there are several. A `<id>-parameters.txt` sidecar
records what was measured and when.

Profiles keep their measurements in a directory named after the profile, one
`<id>_step<nnn>_<position>mm_<replicate>` base per measurement.
*/

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use shared::scan::ScanSeries;
use shared::{IvGain, PgaGain, Scan};
use tracing::{info, warn};

use crate::technique::{MeasurementSetup, Technique};

/// Base path of a measurement's files, without extension
pub fn result_base(working_directory: &Path, id: &str) -> PathBuf {
    working_directory.join(id)
}

/// Directory holding a profile's measurements; the working directory itself
/// when it is already named after the profile
pub fn profile_directory(working_directory: &Path, id: &str) -> std::io::Result<PathBuf> {
    let directory = if working_directory.file_name().is_some_and(|name| name == id) {
        working_directory.to_path_buf()
    } else {
        working_directory.join(id)
    };
    fs::create_dir_all(&directory)?;
    Ok(directory)
}

/// `<id>_step003_001.5mm_02`
pub fn profile_scan_name(id: &str, step: u32, position_mm: f64, replicate: u32) -> String {
    format!("{}_step{:03}_{:05.1}mm_{:02}", id, step, position_mm, replicate)
}

fn step_number(name: &str) -> Option<u32> {
    let at = name.rfind("_step")? + "_step".len();
    name.get(at..at + 3)?.parse().ok()
}

/// Highest step already measured in a profile directory, if any
pub fn last_profile_step(directory: &Path) -> std::io::Result<Option<u32>> {
    let mut last = None;
    for entry in fs::read_dir(directory)? {
        let name = entry?.file_name();
        if let Some(step) = name.to_str().and_then(step_number) {
            last = last.max(Some(step));
        }
    }
    Ok(last)
}

/// Delete result files that were superseded; failures are only logged
pub fn remove_results(files: &[PathBuf]) {
    for file in files {
        match fs::remove_file(file) {
            Ok(()) => info!("🗑️ Removed {}", file.display()),
            Err(e) => warn!("Could not remove {}: {}", file.display(), e),
        }
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Write one CSV per scan and return the paths written
pub fn write_scans(base: &Path, scans: &[Scan], pga: PgaGain, iv: IvGain) -> Result<Vec<PathBuf>, csv::Error> {
    if let Some(parent) = base.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut written = Vec::with_capacity(scans.len());
    for (i, scan) in scans.iter().enumerate() {
        let path = if scans.len() > 1 {
            with_suffix(base, &format!("-scan{}.csv", i))
        } else {
            with_suffix(base, ".csv")
        };

        let mut writer = csv::Writer::from_path(&path)?;
        match scan.to_series(pga, iv) {
            ScanSeries::Single { potential_mv, current_a } => {
                writer.write_record(["potential", "current"])?;
                for (p, c) in potential_mv.iter().zip(&current_a) {
                    writer.write_record([p.to_string(), c.to_string()])?;
                }
            }
            ScanSeries::Dual { potential_mv, forward_a, backward_a, net_a } => {
                writer.write_record(["potential", "forwardcurrent", "backwardcurrent", "fbcurrent"])?;
                for i in 0..potential_mv.len() {
                    writer.write_record([
                        potential_mv[i].to_string(),
                        forward_a[i].to_string(),
                        backward_a[i].to_string(),
                        net_a[i].to_string(),
                    ])?;
                }
            }
        }
        writer.flush()?;

        info!("💾 Wrote {} ({} samples)", path.display(), scan.len());
        written.push(path);
    }

    Ok(written)
}

/// Text of the parameters sidecar
pub fn parameters_text(technique: &Technique, setup: &MeasurementSetup, at: DateTime<Utc>) -> String {
    let mut lines = vec![technique.title().to_string()];
    let local: DateTime<Local> = at.with_timezone(&Local);
    let micros = at.timestamp_micros() as f64 / 1_000_000.0;

    lines.push(format!("Comment =\t{}", setup.comment));
    lines.push(format!("Localtime =\t{}", local.format("%Y-%m-%d %H:%M:%S")));
    lines.push(format!("UTC =\t{}", at.format("%Y-%m-%d %H:%M:%S")));
    lines.push(format!("Timestamp =\t{}", micros));
    lines.push("Parameters:".to_string());
    lines.push(format!("Samplerate =\t{}", setup.sample_rate));
    lines.push(format!("PGA gain =\t{}", setup.pga_gain.value()));
    lines.push(format!("IV gain =\t{}", setup.iv_gain));

    if !matches!(technique, Technique::Plating(_)) {
        let pre = &setup.preconditioning;
        lines.push(format!("t_preconditioning1 =\t{} s", pre.clean_s));
        lines.push(format!("t_preconditioning2 =\t{} s", pre.deposit_s));
        lines.push(format!("v_preconditioning1 =\t{} mV", pre.clean_mv));
        lines.push(format!("v_preconditioning2 =\t{} mV", pre.deposit_mv));
    }

    for (key, value) in technique.parameter_lines() {
        lines.push(format!("{} =\t{}", key, value));
    }

    lines.join("\n")
}

/// Write `<base>-parameters.txt`
pub fn write_parameters(base: &Path, technique: &Technique, setup: &MeasurementSetup) -> std::io::Result<PathBuf> {
    if let Some(parent) = base.parent() {
        fs::create_dir_all(parent)?;
    }
    let path = with_suffix(base, "-parameters.txt");
    let mut file = fs::File::create(&path)?;
    file.write_all(parameters_text(technique, setup, Utc::now()).as_bytes())?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::state::Document;
    use shared::{CurrentShape, ScanSample};
    use tempfile::tempdir;

    fn sample(potential: u16, current: i32, backward: Option<i32>) -> ScanSample {
        ScanSample { potential, current, backward }
    }

    fn setup() -> MeasurementSetup {
        MeasurementSetup::from_document(&Document::with_defaults(), &DeviceConfig::default()).unwrap()
    }

    #[test]
    fn test_single_scan_file() {
        let dir = tempdir().unwrap();
        let base = result_base(dir.path(), "run1");
        let scan = Scan::new(CurrentShape::Single, vec![sample(32768, 0, None), sample(32784, 100, None)]);

        let paths = write_scans(&base, &[scan], PgaGain::default(), IvGain::Gain300K).unwrap();

        assert_eq!(paths, vec![dir.path().join("run1.csv")]);
        let content = fs::read_to_string(&paths[0]).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "potential,current");
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("0,"));
        assert!(lines[2].starts_with("1,"));
    }

    #[test]
    fn test_multi_scan_files() {
        let dir = tempdir().unwrap();
        let base = result_base(dir.path(), "swv");
        let scans = vec![
            Scan::new(CurrentShape::Dual, vec![sample(32768, 10, Some(4))]),
            Scan::new(CurrentShape::Dual, vec![]),
        ];

        let paths = write_scans(&base, &scans, PgaGain::default(), IvGain::Gain3K).unwrap();

        assert_eq!(
            paths,
            vec![dir.path().join("swv-scan0.csv"), dir.path().join("swv-scan1.csv")]
        );
        let first = fs::read_to_string(&paths[0]).unwrap();
        assert!(first.starts_with("potential,forwardcurrent,backwardcurrent,fbcurrent\n"));
        assert_eq!(first.lines().count(), 2);
        assert_eq!(fs::read_to_string(&paths[1]).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_profile_names_and_continuation() {
        let dir = tempdir().unwrap();
        assert_eq!(profile_scan_name("depth", 3, 1.5, 2), "depth_step003_001.5mm_02");

        let profile = profile_directory(dir.path(), "depth").unwrap();
        assert_eq!(profile, dir.path().join("depth"));
        assert_eq!(profile_directory(&profile, "depth").unwrap(), profile);
        assert_eq!(last_profile_step(&profile).unwrap(), None);

        for name in ["depth_step000_000.0mm_01.csv", "depth_step012_012.0mm_01.csv", "notes.txt"] {
            fs::write(profile.join(name), "").unwrap();
        }
        assert_eq!(last_profile_step(&profile).unwrap(), Some(12));

        remove_results(&[profile.join("notes.txt")]);
        assert!(!profile.join("notes.txt").exists());
    }

    #[test]
    fn test_parameters_sidecar() {
        let dir = tempdir().unwrap();
        let mut doc = Document::with_defaults();
        doc.set("program_selection", "value", "single_cv");
        let technique = Technique::from_document(&doc).unwrap();

        let path = write_parameters(&result_base(dir.path(), "cv"), &technique, &setup()).unwrap();
        assert_eq!(path, dir.path().join("cv-parameters.txt"));

        let text = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Cyclic Voltammetry Experiment");
        assert!(lines.contains(&"Samplerate =\t1KHz"));
        assert!(lines.contains(&"v1 =\t-1850 mV"));
        assert!(lines.contains(&"slope =\t500 mV/s"));
        assert!(lines.iter().any(|l| l.starts_with("UTC =\t")));
    }
}
