use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only writer for an assessment `events.jsonl`.
///
/// - default fields are `type`, `request_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
#[derive(Debug, Clone)]
pub struct EventWriter {
    path: PathBuf,
    request_id: String,
    lock: Arc<Mutex<()>>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, request_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            request_id: request_id.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "request_id".to_string(),
            Value::String(self.request_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
