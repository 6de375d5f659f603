use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    EntityId,
    action_map::{ButtonToken, Primitive},
};

#[derive(Debug, thiserror::Error)]
pub enum TurnLogError {
    #[error("turn log I/O failed ({path}): {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("turn log encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnRecord {
    /// Written once at startup.
    Header {
        controlled_agent_id: EntityId,
        action_map: BTreeMap<ButtonToken, Primitive>,
    },
    /// One per validated turn: what was sent and what came back.
    Turn { observation: Value, reply: Value },
}

pub trait TurnLog: Send {
    fn record(&mut self, record: &TurnRecord) -> Result<(), TurnLogError>;
}

/// Writes one JSON object per line to `<dir>/<unix-seconds>_<model>.jsonl`.
#[derive(Debug)]
pub struct JsonlTurnLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlTurnLog {
    pub fn create(dir: &Path, model_name: &str) -> Result<Self, TurnLogError> {
        fs::create_dir_all(dir).map_err(|source| TurnLogError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        let model = model_name.replace('/', "_").replace(':', "_");
        Self::open(dir.join(format!("{stamp}_{model}.jsonl")))
    }

    /// Opens `path` for appending.
    pub fn open(path: PathBuf) -> Result<Self, TurnLogError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| TurnLogError::Io {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TurnLog for JsonlTurnLog {
    fn record(&mut self, record: &TurnRecord) -> Result<(), TurnLogError> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer
            .write_all(b"\n")
            .and_then(|()| self.writer.flush())
            .map_err(|source| TurnLogError::Io {
                path: self.path.display().to_string(),
                source,
            })
    }
}

/// Keeps records in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryTurnLog {
    records: Arc<Mutex<Vec<TurnRecord>>>,
}

impl MemoryTurnLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TurnRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl TurnLog for MemoryTurnLog {
    fn record(&mut self, record: &TurnRecord) -> Result<(), TurnLogError> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Direction;
    use serde_json::json;

    fn header() -> TurnRecord {
        TurnRecord::Header {
            controlled_agent_id: 2,
            action_map: BTreeMap::from([
                (ButtonToken::numbered(1), Primitive::Move(Direction::Down)),
                (ButtonToken::numbered(2), Primitive::OpenDoor),
            ]),
        }
    }

    #[test]
    fn writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = JsonlTurnLog::create(dir.path(), "vendor/model:free").unwrap();
        let file_name = log.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.ends_with("_vendor_model_free.jsonl"));

        log.record(&header()).unwrap();
        log.record(&TurnRecord::Turn {
            observation: json!({"current_turn": 0}),
            reply: json!({"choice": "btn1"}),
        })
        .unwrap();

        let content = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"], "header");
        assert_eq!(first["controlled_agent_id"], 2);
        assert_eq!(first["action_map"]["btn1"], json!({"move": "down"}));
        assert_eq!(first["action_map"]["btn2"], "open_door");

        let second: TurnRecord = serde_json::from_str(lines[1]).unwrap();
        assert!(matches!(second, TurnRecord::Turn { .. }));
    }

    #[test]
    fn memory_log_clones_share_records() {
        let log = MemoryTurnLog::new();
        let mut writer = log.clone();
        writer.record(&header()).unwrap();
        assert_eq!(log.records(), vec![header()]);
    }
}
