//! State store: atomic save and tolerant load.
//!
//! The state file is written to a temporary file in the same directory and
//! renamed over the canonical path, so a crash mid-write leaves either the
//! old or the new document, never a torn one.
//!
//! Loading is forward compatible (missing fields take defaults) and
//! normalizes historically malformed shapes instead of failing:
//! - keyed collections stored as a JSON object instead of a sorted list
//! - gap lists stored as bare strings
//! - file-touch maps flattened to `[path, count]` pairs

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};

use super::{CheckRecord, Gap, LoopState, WorkItem, STATE_VERSION};
use crate::error::{LoopError, Result};

/// Default state file name inside the `.valueloop` directory.
pub const STATE_FILE: &str = "state.json";

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

// ============================================================================
// Custom Serialization
// ============================================================================

/// Entities stored in a map keyed by their own identifier.
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for WorkItem {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for CheckRecord {
    fn key(&self) -> &str {
        &self.id
    }
}

/// Serialize `BTreeMap<String, V>` as a list sorted by key; accept either a
/// list or an object on the way back in.
pub(crate) mod keyed_list {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrMap<V> {
        List(Vec<V>),
        Map(BTreeMap<String, V>),
    }

    pub fn serialize<S, V>(
        map: &BTreeMap<String, V>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
        V: Serialize,
    {
        let values: Vec<&V> = map.values().collect();
        values.serialize(serializer)
    }

    pub fn deserialize<'de, D, V>(
        deserializer: D,
    ) -> std::result::Result<BTreeMap<String, V>, D::Error>
    where
        D: Deserializer<'de>,
        V: Deserialize<'de> + Keyed,
    {
        let values: Vec<V> = match ListOrMap::<V>::deserialize(deserializer)? {
            ListOrMap::List(list) => list,
            ListOrMap::Map(map) => map.into_values().collect(),
        };
        Ok(values
            .into_iter()
            .map(|v| (v.key().to_string(), v))
            .collect())
    }
}

/// Accept a `path -> count` object or a list of `[path, count]` pairs.
pub(crate) fn map_or_pairs<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum MapOrPairs {
        Map(BTreeMap<String, u32>),
        Pairs(Vec<(String, u32)>),
    }

    Ok(match MapOrPairs::deserialize(deserializer)? {
        MapOrPairs::Map(map) => map,
        MapOrPairs::Pairs(pairs) => pairs.into_iter().collect(),
    })
}

/// Accept structured gap records, bare strings, or `null`.
pub(crate) fn normalize_gaps<'de, D>(deserializer: D) -> std::result::Result<Vec<Gap>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum GapRepr {
        Structured(Gap),
        Bare(String),
    }

    let raw: Option<Vec<GapRepr>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|g| match g {
            GapRepr::Structured(gap) => gap,
            GapRepr::Bare(text) => Gap::new(text),
        })
        .collect())
}

// ============================================================================
// State Store
// ============================================================================

/// Reads and writes the persisted [`LoopState`] document.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Store backed by an explicit file path.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Store at `<project>/.valueloop/state.json`.
    #[must_use]
    pub fn for_project(project_dir: &Path) -> Self {
        Self::new(crate::config::LoopConfig::state_dir(project_dir).join(STATE_FILE))
    }

    /// Path of the canonical state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| STATE_FILE.into());
        name.push(TMP_SUFFIX);
        self.path.with_file_name(name)
    }

    /// Save the state atomically: temp file in the same directory, fsync,
    /// rename over the canonical file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or any filesystem step fails. The
    /// canonical file is untouched in that case.
    pub fn save(&self, state: &LoopState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(state)?;
        let tmp_path = self.tmp_path();

        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(json.as_bytes())?;
        tmp_file.sync_all()?;
        drop(tmp_file);

        fs::rename(&tmp_path, &self.path)?;
        debug!(
            "Saved state (iteration {}) to {}",
            state.iteration,
            self.path.display()
        );
        Ok(())
    }

    /// Load the state, returning `None` if no state file exists yet.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::CorruptState`] if the file exists but cannot be
    /// parsed.
    pub fn load(&self) -> Result<Option<LoopState>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut state: LoopState =
            serde_json::from_str(&content).map_err(|e| LoopError::CorruptState {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        normalize(&mut state);
        Ok(Some(state))
    }

    /// Load the state or start a fresh one for `unit`.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file is corrupt.
    pub fn load_or_new(&self, unit: &str) -> Result<LoopState> {
        Ok(self.load()?.unwrap_or_else(|| LoopState::new(unit)))
    }
}

/// Repair shapes that older writers may have produced.
fn normalize(state: &mut LoopState) {
    if state.version < STATE_VERSION {
        debug!("Upgrading state schema {} -> {}", state.version, STATE_VERSION);
        state.version = STATE_VERSION;
    }

    let max_seq = state.work_items.values().map(|i| i.seq).max().unwrap_or(0);
    if state.next_item_seq < max_seq {
        state.next_item_seq = max_seq;
    }

    for item in state.work_items.values_mut() {
        let mut seen = std::collections::BTreeSet::new();
        item.dependencies.retain(|d| seen.insert(d.clone()));
    }

    for item in state.work_items.values() {
        for dep in &item.dependencies {
            if !state.work_items.contains_key(dep) {
                warn!("Work item {} depends on unknown item {}", item.id, dep);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
