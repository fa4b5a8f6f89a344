/*!
Shared state channel between the backend and the control surface.

The state is one document: component id -> attribute -> JSON value, plus an
`update_timestamp`. Writers read the latest document, patch it, bump the
timestamp and write the whole thing back. Readers poll the timestamp and only
fetch the document when it changed.

Concurrent writers are last-write-wins at document granularity: a UI edit and
a progress update landing in the same window can lose one of the two. The
backend's own writes are small and frequent, so in practice the next progress
tick repairs anything it overwrote, but a lost UI edit stays lost.
*/

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{ConfigError, SyncError};

/// The whole shared state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Seconds since the Unix epoch of the last write
    pub update_timestamp: f64,
    pub components: BTreeMap<String, BTreeMap<String, Value>>,
}

/// One attribute assignment
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub component: String,
    pub attribute: String,
    pub value: Value,
}

impl Change {
    pub fn new(component: &str, attribute: &str, value: impl Into<Value>) -> Self {
        Self {
            component: component.to_string(),
            attribute: attribute.to_string(),
            value: value.into(),
        }
    }
}

impl Document {
    /// A document carrying every component the backend reads
    pub fn with_defaults() -> Self {
        let mut doc = Self::default();
        let defaults = [
            ("purge_switch", json!({"on": false, "disabled": false})),
            ("stirr_switch", json!({"on": false, "disabled": false})),
            ("stirr_speed_slider", json!({"value": 50})),
            ("start_button", json!({"triggered": false, "disabled": false})),
            ("stop_button", json!({"triggered": false, "disabled": true})),
            ("home_button", json!({"triggered": false, "disabled": false})),
            ("move_step_button", json!({"triggered": false, "disabled": false})),
            ("program_selection", json!({"value": "single_cv", "disabled": false})),
            ("popup_measurement_id", json!({"value": "measurement"})),
            ("comment_input", json!({"value": ""})),
            ("scan_progress", json!({"value": 0})),
            ("scan_progress_label", json!({"children": ""})),
            ("series_progress", json!({"value": 0})),
            ("series_progress_label", json!({"children": ""})),
            ("graph_file", json!({"data": ""})),
            ("profiler_position", json!({"children": "Profiler Position: 000.0 mm"})),
            ("purge_time_input", json!({"value": 0})),
            ("cleaning_time_input", json!({"value": 5})),
            ("cleaning_potential_input", json!({"value": -900})),
            ("deposition_time_input", json!({"value": 2})),
            ("deposition_potential_input", json!({"value": -100})),
            ("start_potential_input", json!({"value": -100})),
            ("vertex_potential_input", json!({"value": -1850})),
            ("end_potential_input", json!({"value": -100})),
            ("slope_input", json!({"value": 500})),
            ("n_scans_input", json!({"value": 1})),
            ("step_size_input", json!({"value": 2})),
            ("pulse_height_input", json!({"value": 50})),
            ("pulse_width_input", json!({"value": 50})),
            ("period_input", json!({"value": 100})),
            ("frequency_input", json!({"value": 25})),
            ("plating_potential_input", json!({"value": -100})),
            ("plating_time_input", json!({"value": 240})),
            ("samplefreq_input", json!({"value": "1KHz"})),
            ("iv_gain_input", json!({"value": "POT_GAIN_300K"})),
            ("pga_gain_input", json!({"value": 2})),
            ("max_speed_input", json!({"value": 5})),
            ("max_acceleration_input", json!({"value": 5})),
            ("profile_step_distance_input", json!({"value": 1})),
            ("profile_step_number_input", json!({"value": 5})),
            ("profile_repeat_measurements_input", json!({"value": 1})),
            ("n_electrode_tests_input", json!({"value": 3})),
        ];

        for (component, attributes) in defaults {
            if let Value::Object(map) = attributes {
                doc.components
                    .insert(component.to_string(), map.into_iter().collect());
            }
        }
        doc
    }

    pub fn get(&self, component: &str, attribute: &str) -> Option<&Value> {
        self.components.get(component)?.get(attribute)
    }

    pub fn set(&mut self, component: &str, attribute: &str, value: impl Into<Value>) {
        self.components
            .entry(component.to_string())
            .or_default()
            .insert(attribute.to_string(), value.into());
    }

    pub fn apply(&mut self, changes: &[Change]) {
        for change in changes {
            self.set(&change.component, &change.attribute, change.value.clone());
        }
    }

    fn require(&self, component: &str, attribute: &str) -> Result<&Value, ConfigError> {
        self.get(component, attribute)
            .ok_or_else(|| ConfigError::missing(component, attribute))
    }

    pub fn get_bool(&self, component: &str, attribute: &str) -> Result<bool, ConfigError> {
        self.require(component, attribute)?
            .as_bool()
            .ok_or_else(|| ConfigError::invalid(component, attribute, "a boolean"))
    }

    pub fn get_f64(&self, component: &str, attribute: &str) -> Result<f64, ConfigError> {
        self.require(component, attribute)?
            .as_f64()
            .ok_or_else(|| ConfigError::invalid(component, attribute, "a number"))
    }

    /// A non-negative whole number; `2.0` is accepted, `2.5` is not
    pub fn get_u32(&self, component: &str, attribute: &str) -> Result<u32, ConfigError> {
        let value = self.get_f64(component, attribute)?;
        if value < 0.0 || value.fract() != 0.0 || value > u32::MAX as f64 {
            return Err(ConfigError::invalid(component, attribute, "a whole number"));
        }
        Ok(value as u32)
    }

    pub fn get_str(&self, component: &str, attribute: &str) -> Result<&str, ConfigError> {
        self.require(component, attribute)?
            .as_str()
            .ok_or_else(|| ConfigError::invalid(component, attribute, "a string"))
    }

    /// Shorthand for `get_bool(component, "triggered")`, false when absent
    pub fn is_triggered(&self, component: &str) -> bool {
        self.get_bool(component, "triggered").unwrap_or(false)
    }
}

/// Storage behind the state channel
pub trait StateStore: Send + Sync {
    /// Fetch the whole document
    fn load(&self) -> Result<Document, SyncError>;

    /// Replace the whole document
    fn store(&self, doc: &Document) -> Result<(), SyncError>;

    /// Timestamp of the stored document, cheaper than [`StateStore::load`]
    /// where the backend allows it
    fn timestamp(&self) -> Result<f64, SyncError> {
        Ok(self.load()?.update_timestamp)
    }
}

/// In-process store for tests and simulated runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    doc: Mutex<Document>,
    failures: AtomicU32,
}

impl MemoryStore {
    pub fn new(doc: Document) -> Self {
        Self {
            doc: Mutex::new(doc),
            failures: AtomicU32::new(0),
        }
    }

    /// Make the next `n` stores fail with an I/O error
    pub fn fail_next_stores(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Document> {
        self.doc.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<Document, SyncError> {
        Ok(self.lock().clone())
    }

    fn store(&self, doc: &Document) -> Result<(), SyncError> {
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(SyncError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "injected store failure",
            )));
        }
        *self.lock() = doc.clone();
        Ok(())
    }

    fn timestamp(&self) -> Result<f64, SyncError> {
        Ok(self.lock().update_timestamp)
    }
}

/// JSON document on disk, replaced atomically on every write
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Open the store at `path`, writing `seed` if no document exists yet
    pub fn open<P: AsRef<Path>>(path: P, seed: &Document) -> Result<Self, SyncError> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        if !store.path.exists() {
            if let Some(parent) = store.path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            store.store(seed)?;
            debug!("Seeded state document at {}", store.path.display());
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStore {
    fn load(&self) -> Result<Document, SyncError> {
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Err(SyncError::Corrupt(format!("{} is empty", self.path.display())));
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn store(&self, doc: &Document) -> Result<(), SyncError> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(doc)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Client handle passed to every component that reads or writes shared state
#[derive(Clone)]
pub struct StateChannel {
    store: Arc<dyn StateStore>,
    write_backoff: Duration,
}

impl StateChannel {
    pub fn new(store: Arc<dyn StateStore>, write_backoff: Duration) -> Self {
        Self { store, write_backoff }
    }

    /// Patch the document, retrying until the store accepts the write.
    ///
    /// Returns the new `update_timestamp`.
    pub fn write(&self, changes: &[Change]) -> f64 {
        let mut failures = 0u32;
        loop {
            match self.try_write(changes) {
                Ok(stamp) => return stamp,
                Err(e) => {
                    failures += 1;
                    warn!("Couldn't write state ({}), trying again [{}]", e, failures);
                    thread::sleep(self.write_backoff);
                }
            }
        }
    }

    fn try_write(&self, changes: &[Change]) -> Result<f64, SyncError> {
        let mut doc = self.store.load()?;
        doc.apply(changes);
        // Strictly increasing even when the clock has not moved
        doc.update_timestamp = epoch_seconds().max(doc.update_timestamp + 1e-6);
        self.store.store(&doc)?;
        Ok(doc.update_timestamp)
    }

    /// The document if its timestamp differs from `last_seen`
    pub fn poll(&self, last_seen: Option<f64>) -> Result<Option<Document>, SyncError> {
        let stamp = self.store.timestamp()?;
        if last_seen == Some(stamp) {
            return Ok(None);
        }
        self.store.load().map(Some)
    }

    /// The current document, unconditionally
    pub fn read(&self) -> Result<Document, SyncError> {
        self.store.load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn memory_channel(doc: Document) -> (Arc<MemoryStore>, StateChannel) {
        let store = Arc::new(MemoryStore::new(doc));
        let channel = StateChannel::new(store.clone(), Duration::ZERO);
        (store, channel)
    }

    #[test]
    fn test_write_then_poll_round_trip() {
        let (_, channel) = memory_channel(Document::with_defaults());
        let before = channel.read().unwrap().update_timestamp;

        channel.write(&[Change::new("scan_progress", "value", 42)]);

        let doc = channel.poll(Some(before)).unwrap().expect("document changed");
        assert_eq!(doc.get_f64("scan_progress", "value").unwrap(), 42.0);
        assert!(channel.poll(Some(doc.update_timestamp)).unwrap().is_none());
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let (_, channel) = memory_channel(Document::default());
        let mut last = 0.0;
        for i in 0..50 {
            let stamp = channel.write(&[Change::new("scan_progress", "value", i)]);
            assert!(stamp > last);
            last = stamp;
        }
    }

    #[test]
    fn test_write_retries_failed_stores() {
        let (store, channel) = memory_channel(Document::default());
        store.fail_next_stores(2);

        channel.write(&[Change::new("purge_switch", "on", true)]);

        assert!(channel.read().unwrap().get_bool("purge_switch", "on").unwrap());
    }

    #[test]
    fn test_last_write_wins() {
        let (_, channel) = memory_channel(Document::with_defaults());
        let stale = channel.read().unwrap();

        channel.write(&[Change::new("slope_input", "value", 250)]);

        // A writer holding an old copy overwrites the whole document
        let mut overwrite = stale.clone();
        overwrite.set("scan_progress", "value", 10);
        overwrite.update_timestamp += 1.0;
        channel.store.store(&overwrite).unwrap();

        let doc = channel.read().unwrap();
        assert_eq!(doc.get_f64("slope_input", "value").unwrap(), 500.0);
        assert_eq!(doc.get_f64("scan_progress", "value").unwrap(), 10.0);
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("kstat.json");
        let store = Arc::new(FileStore::open(&path, &Document::with_defaults()).unwrap());
        let channel = StateChannel::new(store.clone(), Duration::ZERO);

        let first = channel.poll(None).unwrap().expect("seeded document");
        channel.write(&[Change::new("start_button", "triggered", true)]);

        let doc = channel.poll(Some(first.update_timestamp)).unwrap().expect("changed");
        assert!(doc.is_triggered("start_button"));
        assert!(channel.poll(Some(doc.update_timestamp)).unwrap().is_none());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_typed_getters() {
        let mut doc = Document::with_defaults();
        doc.set("n_scans_input", "value", 2.5);
        doc.set("slope_input", "value", "fast");

        assert_eq!(doc.get_u32("pga_gain_input", "value").unwrap(), 2);
        assert_eq!(doc.get_str("iv_gain_input", "value").unwrap(), "POT_GAIN_300K");
        assert!(matches!(
            doc.get_u32("n_scans_input", "value"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            doc.get_f64("slope_input", "value"),
            Err(ConfigError::Invalid { .. })
        ));
        assert_eq!(
            doc.get_bool("nonexistent", "on"),
            Err(ConfigError::missing("nonexistent", "on"))
        );
        assert!(!doc.is_triggered("nonexistent"));
    }
}
