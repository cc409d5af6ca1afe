use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

/// JSON-file store memoizing finished assessments by request digest.
///
/// Writes merge with whatever is on disk at flush time, so two processes
/// caching different keys into the same file do not clobber each other.
#[derive(Debug, Clone)]
pub struct CacheStore {
    path: PathBuf,
    entries: Option<Map<String, Value>>,
    pending_keys: Vec<String>,
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: None,
            pending_keys: Vec::new(),
        }
    }

    pub fn get(&mut self, key: &str) -> Option<Map<String, Value>> {
        self.reload();
        self.entries
            .as_ref()
            .and_then(|entries| entries.get(key))
            .and_then(Value::as_object)
            .cloned()
    }

    pub fn set(&mut self, key: &str, value: Map<String, Value>) -> anyhow::Result<()> {
        self.reload();
        let entries = self.entries.get_or_insert_with(Map::new);
        let snapshot = Value::Object(value);
        if entries.get(key) == Some(&snapshot) {
            return Ok(());
        }
        entries.insert(key.to_string(), snapshot);
        if !self.pending_keys.iter().any(|pending| pending == key) {
            self.pending_keys.push(key.to_string());
        }
        self.flush()
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        if self.pending_keys.is_empty() {
            return Ok(());
        }
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        if let Some(entries) = &self.entries {
            for key in &self.pending_keys {
                if let Some(value) = entries.get(key) {
                    on_disk.insert(key.clone(), value.clone());
                }
            }
        }
        write_json_object(&self.path, &on_disk)?;
        self.entries = Some(on_disk);
        self.pending_keys.clear();
        Ok(())
    }

    fn reload(&mut self) {
        self.entries = Some(read_json_object(&self.path).unwrap_or_default());
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}
