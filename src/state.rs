//! Durable trigger flags and the in-memory alert table.
//!
//! The [`TriggerStateStore`] persists one flat JSON object mapping alert
//! identity to its `active` flag. It is loaded once at startup (a missing or
//! corrupt file degrades to an empty map, logged, never fatal) and rewritten
//! in full after every state-changing transition. The store is not an
//! incremental log; losing the last write on crash is an accepted risk.
//!
//! The [`AlertTable`] combines the durable flags with the volatile
//! hysteresis counters. The engine wraps it in one async lock, so every
//! read-modify-write of an identity's counters and every save are
//! serialized across concurrently scheduled rule evaluations.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::StateError;
use crate::identity::AlertIdentity;
use crate::machine::{self, AlertState, RuleKind, Transition};

/// File-backed map: alert identity -> currently-active flag.
#[derive(Debug)]
pub struct TriggerStateStore {
    path: PathBuf,
}

impl TriggerStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TriggerStateStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted flags.
    ///
    /// A missing file is normal on first run; a corrupt file is logged and
    /// treated as empty. Neither is fatal.
    pub fn load(&self) -> HashMap<AlertIdentity, bool> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No trigger state file, starting empty");
                return HashMap::new();
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to read trigger state file, starting empty"
                );
                return HashMap::new();
            }
        };

        match serde_json::from_str::<BTreeMap<String, bool>>(&raw) {
            Ok(map) => {
                info!(
                    path = %self.path.display(),
                    entries = map.len(),
                    "Loaded trigger state"
                );
                map.into_iter()
                    .map(|(id, active)| (AlertIdentity::from_stored(id), active))
                    .collect()
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Corrupt trigger state file, starting empty"
                );
                HashMap::new()
            }
        }
    }

    /// Overwrite the full persisted representation.
    ///
    /// Entries are written sorted so the file is byte-stable for a given
    /// state. No temp-file-and-rename: a crash mid-write can corrupt the
    /// file, which `load` then treats as empty (documented behavior).
    pub fn save(&self, flags: &HashMap<AlertIdentity, bool>) -> Result<(), StateError> {
        let sorted: BTreeMap<&str, bool> = flags
            .iter()
            .map(|(id, active)| (id.as_str(), *active))
            .collect();
        let body = serde_json::to_string_pretty(&sorted).map_err(|e| StateError::Write {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })?;
        std::fs::write(&self.path, body).map_err(|e| StateError::Write {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })
    }
}

/// In-memory per-identity alert state, seeded from the trigger store.
///
/// Entries are created lazily on first observation and never evicted; an
/// identity that stops appearing simply stops being updated.
#[derive(Debug)]
pub struct AlertTable {
    states: HashMap<AlertIdentity, AlertState>,
    store: TriggerStateStore,
}

impl AlertTable {
    /// Load durable flags and seed the table. Counters start at zero.
    pub fn open(store: TriggerStateStore) -> Self {
        let states = store
            .load()
            .into_iter()
            .map(|(id, active)| (id, AlertState::restored(active)))
            .collect();
        AlertTable { states, store }
    }

    /// Apply one observation for an identity.
    pub fn step(
        &mut self,
        identity: &AlertIdentity,
        satisfied: bool,
        kind: RuleKind,
        poll_count: u32,
    ) -> Transition {
        let state = self.states.entry(identity.clone()).or_default();
        machine::step(state, satisfied, kind, poll_count)
    }

    /// Persist all durable flags after a transition.
    pub fn persist(&self) -> Result<(), StateError> {
        let flags: HashMap<AlertIdentity, bool> = self
            .states
            .iter()
            .map(|(id, state)| (id.clone(), state.active))
            .collect();
        self.store.save(&flags)
    }

    /// Current state of an identity, if it has ever been observed.
    pub fn get(&self, identity: &AlertIdentity) -> Option<AlertState> {
        self.states.get(identity).copied()
    }

    /// Number of identities currently in the active state.
    pub fn active_count(&self) -> usize {
        self.states.values().filter(|s| s.active).count()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
