//! Register snapshot persistence.
//!
//! The snapshot file is a JSON object with one map per bank, keyed by the
//! client-visible address:
//!
//! ```json
//! {
//!   "discrete_inputs": {},
//!   "coils": { "3": true },
//!   "holding_registers": { "10": 300 },
//!   "input_registers": {}
//! }
//! ```
//!
//! Saves go to `<file>.tmp` first and are renamed into place, so a crash never
//! leaves a half-written snapshot behind. A save whose snapshot equals the last
//! one written is skipped.

use log::{debug, error, info};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::RegisterKind;
use crate::seed::{prepare_bits, prepare_words, RawRegisterMap, SeedMode};
use crate::store::{RegisterSnapshot, RegisterStore};

/// Result of a save attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// A new snapshot was written
    Written,
    /// Nothing changed since the last write
    Unchanged,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSnapshot {
    #[serde(default)]
    discrete_inputs: RawRegisterMap,
    #[serde(default)]
    coils: RawRegisterMap,
    #[serde(default)]
    holding_registers: RawRegisterMap,
    #[serde(default)]
    input_registers: RawRegisterMap,
}

impl RawSnapshot {
    fn prepare(&self) -> ModbusResult<RegisterSnapshot> {
        let strict = |e: crate::seed::SeedError| ModbusError::persistence(e.to_string());
        Ok(RegisterSnapshot {
            discrete_inputs: prepare_bits(RegisterKind::DiscreteInputs, &self.discrete_inputs, SeedMode::Strict)
                .map_err(strict)?,
            coils: prepare_bits(RegisterKind::Coils, &self.coils, SeedMode::Strict).map_err(strict)?,
            holding_registers: prepare_words(
                RegisterKind::HoldingRegisters,
                &self.holding_registers,
                SeedMode::Strict,
            )
            .map_err(strict)?,
            input_registers: prepare_words(RegisterKind::InputRegisters, &self.input_registers, SeedMode::Strict)
                .map_err(strict)?,
        })
    }
}

/// Load a snapshot file
///
/// Returns `Ok(None)` when the file does not exist. Any other problem (unreadable
/// file, invalid JSON, a malformed entry) is an error.
pub fn load_snapshot(path: &Path) -> ModbusResult<Option<RegisterSnapshot>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No register snapshot at {}, starting from configuration", path.display());
            return Ok(None);
        }
        Err(e) => {
            return Err(ModbusError::persistence(format!(
                "failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };

    let raw: RawSnapshot = serde_json::from_str(&text)
        .map_err(|e| ModbusError::persistence(format!("invalid snapshot {}: {}", path.display(), e)))?;
    let snapshot = raw.prepare()?;
    info!(
        "💾 Loaded {} register values from {}",
        snapshot.len(),
        path.display()
    );
    Ok(Some(snapshot))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Snapshot writer bound to one store and file
#[derive(Debug)]
pub struct RegisterPersistence {
    path: PathBuf,
    store: Arc<RegisterStore>,
    save_interval: Duration,
    last_saved: Mutex<Option<RegisterSnapshot>>,
}

impl RegisterPersistence {
    pub fn new(path: impl Into<PathBuf>, store: Arc<RegisterStore>, save_interval: Duration) -> Self {
        Self {
            path: path.into(),
            store,
            save_interval,
            last_saved: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remember `snapshot` as already on disk, so an unchanged store is not rewritten
    pub fn mark_saved(&self, snapshot: RegisterSnapshot) {
        if let Ok(mut last) = self.last_saved.lock() {
            *last = Some(snapshot);
        }
    }

    /// Write the current store contents if they changed since the last write
    pub fn save(&self) -> ModbusResult<SaveOutcome> {
        let snapshot = self.store.snapshot()?;

        let mut last = self
            .last_saved
            .lock()
            .map_err(|_| ModbusError::internal("snapshot cache lock poisoned"))?;
        if last.as_ref() == Some(&snapshot) {
            debug!("Register snapshot unchanged, skipping save");
            return Ok(SaveOutcome::Unchanged);
        }

        self.write_file(&snapshot)?;
        debug!("💾 Saved {} register values to {}", snapshot.len(), self.path.display());
        *last = Some(snapshot);
        Ok(SaveOutcome::Written)
    }

    fn write_file(&self, snapshot: &RegisterSnapshot) -> ModbusResult<()> {
        let fail = |what: &str, e: std::io::Error| {
            ModbusError::persistence(format!("{} {}: {}", what, self.path.display(), e))
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| fail("failed to create directory for", e))?;
            }
        }

        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| ModbusError::persistence(format!("failed to serialize snapshot: {}", e)))?;
        let tmp = temp_path(&self.path);
        fs::write(&tmp, json).map_err(|e| fail("failed to write temporary file for", e))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            fail("failed to replace", e)
        })
    }

    /// Run [`save`](Self::save) on the blocking pool
    async fn save_blocking(self: &Arc<Self>) -> ModbusResult<SaveOutcome> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || this.save())
            .await
            .map_err(|e| ModbusError::internal(format!("save task failed: {}", e)))?
    }

    /// Save every `save_interval` until `shutdown`, then save one last time
    pub fn spawn_auto_save(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.save_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            info!(
                "💾 Auto-save every {}s to {}",
                self.save_interval.as_secs(),
                self.path.display()
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.save_blocking().await {
                            error!("Auto-save failed: {}", e);
                        }
                    }
                }
            }

            match self.save_blocking().await {
                Ok(SaveOutcome::Written) => info!("💾 Final register snapshot saved to {}", self.path.display()),
                Ok(SaveOutcome::Unchanged) => info!("💾 Register snapshot already up to date"),
                Err(e) => error!("Final save failed: {}", e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BankSeed;
    use crate::register_bank::BankLayout;
    use std::collections::BTreeMap;

    fn persistence(dir: &Path, store: Arc<RegisterStore>) -> RegisterPersistence {
        RegisterPersistence::new(dir.join("data").join("registers.json"), store, Duration::from_secs(30))
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_snapshot(&dir.path().join("absent.json")).unwrap(), None);
    }

    #[test]
    fn test_load_holding_register() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registers.json");
        fs::write(&path, r#"{"holding_registers": {"10": 300}}"#).unwrap();

        let snapshot = load_snapshot(&path).unwrap().unwrap();
        assert_eq!(snapshot.holding_registers.get(&10), Some(&300));
        assert!(snapshot.coils.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registers.json");

        fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_snapshot(&path), Err(ModbusError::Persistence { .. })));

        fs::write(&path, r#"{"holding_registers": {"10": 70000}}"#).unwrap();
        assert!(matches!(load_snapshot(&path), Err(ModbusError::Persistence { .. })));

        fs::write(&path, r#"{"coils": {"x": true}}"#).unwrap();
        assert!(matches!(load_snapshot(&path), Err(ModbusError::Persistence { .. })));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RegisterStore::new(false));
        store.write_coils(3, &[true, false, true]).unwrap();
        store.write_holding_registers(10, &[300, 0xFFFF]).unwrap();
        store.set_input_registers(65535, &[7]).unwrap();

        let persistence = persistence(dir.path(), store.clone());
        assert_eq!(persistence.save().unwrap(), SaveOutcome::Written);
        assert!(persistence.path().exists());
        assert!(!temp_path(persistence.path()).exists());

        let loaded = load_snapshot(persistence.path()).unwrap().unwrap();
        assert_eq!(loaded, store.snapshot().unwrap());

        let restored = RegisterStore::builder(false).overlay_snapshot(&loaded).build();
        assert_eq!(restored.snapshot().unwrap(), store.snapshot().unwrap());
        assert_eq!(restored.read_holding_registers(10, 2).unwrap(), vec![300, 0xFFFF]);
    }

    #[test]
    fn test_unchanged_snapshot_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RegisterStore::new(true));
        let persistence = persistence(dir.path(), store.clone());

        assert_eq!(persistence.save().unwrap(), SaveOutcome::Written);
        assert_eq!(persistence.save().unwrap(), SaveOutcome::Unchanged);

        store.write_holding_registers(1, &[5]).unwrap();
        assert_eq!(persistence.save().unwrap(), SaveOutcome::Written);
        assert_eq!(persistence.save().unwrap(), SaveOutcome::Unchanged);
    }

    #[test]
    fn test_sparse_snapshot_emits_configured_set() {
        let dir = tempfile::tempdir().unwrap();
        let seed = BankSeed::new(
            BankLayout::Sparse { default_fill: false },
            [(10u16, 0u16), (11, 5)].into_iter().collect::<BTreeMap<_, _>>(),
        );
        let store = Arc::new(RegisterStore::builder(false).holding_registers(seed).build());
        let persistence = persistence(dir.path(), store);
        persistence.save().unwrap();

        let loaded = load_snapshot(persistence.path()).unwrap().unwrap();
        assert_eq!(loaded.holding_registers, BTreeMap::from([(10, 0), (11, 5)]));
    }

    #[tokio::test]
    async fn test_auto_save_final_flush() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RegisterStore::new(true));
        let persistence = Arc::new(RegisterPersistence::new(
            dir.path().join("registers.json"),
            store.clone(),
            Duration::from_secs(3600),
        ));

        let shutdown = CancellationToken::new();
        let task = persistence.clone().spawn_auto_save(shutdown.clone());
        store.write_holding_registers(42, &[4242]).unwrap();
        shutdown.cancel();
        task.await.unwrap();

        let loaded = load_snapshot(persistence.path()).unwrap().unwrap();
        assert_eq!(loaded.holding_registers.get(&42), Some(&4242));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_auto_save_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RegisterStore::new(true));
        store.write_coils(7, &[true]).unwrap();
        let persistence = Arc::new(RegisterPersistence::new(
            dir.path().join("registers.json"),
            store.clone(),
            Duration::from_millis(50),
        ));

        let shutdown = CancellationToken::new();
        let task = persistence.clone().spawn_auto_save(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Written by a tick, before any shutdown flush
        let loaded = load_snapshot(persistence.path()).unwrap().unwrap();
        assert_eq!(loaded.coils.get(&7), Some(&true));

        shutdown.cancel();
        task.await.unwrap();
    }
}
