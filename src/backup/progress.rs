use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Status,
    VerboseStatus,
    Error,
    Summary,
    ExitError,
    #[serde(other)]
    #[default]
    Unknown,
}

/// A known field with an unexpected shape reads as its default instead of
/// failing the whole record.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// One parsed `--json` line from a backup run.
///
/// Known fields are typed; everything else the tool sends is kept in `extra`
/// so callers rendering the raw record lose nothing. Any JSON object is a
/// record: missing or mistyped known fields are simply empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    #[serde(default, deserialize_with = "lenient")]
    pub message_type: MessageType,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub percent_done: Option<f64>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub total_files: Option<u64>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub files_done: Option<u64>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub bytes_done: Option<u64>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProgressRecord {
    /// Parse one output line. Anything that is not a JSON object yields
    /// `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }

    /// Record stored when a run ends without the tool reporting it.
    pub fn exit_error(message: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::ExitError,
            percent_done: None,
            total_files: None,
            files_done: None,
            total_bytes: None,
            bytes_done: None,
            snapshot_id: None,
            message: Some(message.into()),
            extra: Map::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.message_type, MessageType::Summary | MessageType::ExitError)
    }

    /// Whole-number percentage, clamped to 0..=100.
    pub fn percent(&self) -> Option<u8> {
        self.percent_done
            .map(|p| (p * 100.0).round().clamp(0.0, 100.0) as u8)
    }
}

/// Latest progress record per drive path. Last writer wins, no history.
///
/// Cheap to clone; clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct ProgressStore {
    records: Arc<RwLock<HashMap<PathBuf, ProgressRecord>>>,
}

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, path: &Path, record: ProgressRecord) {
        self.records.write().insert(path.to_path_buf(), record);
    }

    pub fn get(&self, path: &Path) -> Option<ProgressRecord> {
        self.records.read().get(path).cloned()
    }

    pub fn clear(&self, path: &Path) -> Option<ProgressRecord> {
        self.records.write().remove(path)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}
