//! JSON-lines result sink.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use zoneflow_core::ResultSink;
use zoneflow_shared::{Result, ZoneResult, ZoneflowError};

/// Appends one JSON object per delivered zone result.
pub(crate) struct JsonlSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlSink {
    /// Create (or truncate) the output file.
    pub(crate) fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ZoneflowError::io(parent, e))?;
        }
        let file = File::create(path).map_err(|e| ZoneflowError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl ResultSink for JsonlSink {
    fn deliver(&self, result: &ZoneResult) -> Result<()> {
        let line = serde_json::to_string(result)
            .map_err(|e| ZoneflowError::validation(format!("cannot encode result: {e}")))?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{line}")
            .and_then(|_| writer.flush())
            .map_err(|e| ZoneflowError::io(&self.path, e))
    }
}
