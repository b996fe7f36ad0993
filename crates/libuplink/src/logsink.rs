use anyhow::Result;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use uplink_protocol::{LogChannel, LogRecord, SessionId};

/// Durable, ordered record of bridge events and raw subprocess output.
///
/// Two append-only JSONL files: `bridge.log` for session/bridge events and
/// `process.log` for the wrapped tool's own output. Records are flushed as
/// they arrive, so ordering on disk is arrival order per file.
pub struct LogSink {
    bridge: Mutex<LogFile>,
    process: Mutex<LogFile>,
}

struct LogFile {
    file: File,
    #[allow(dead_code)]
    path: PathBuf,
}

impl LogFile {
    fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { file, path })
    }

    fn append(&mut self, record: &LogRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        Ok(())
    }
}

impl LogSink {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            bridge: Mutex::new(LogFile::open(dir.join("bridge.log"))?),
            process: Mutex::new(LogFile::open(dir.join("process.log"))?),
        })
    }

    /// Append one record to the stream matching its channel.
    pub fn record(&self, record: &LogRecord) -> Result<()> {
        let file = match record.channel {
            LogChannel::Bridge => &self.bridge,
            LogChannel::Stdout | LogChannel::Stderr => &self.process,
        };
        let mut guard = match file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.append(record)
    }

    /// Convenience for a record stamped now.
    pub fn write(&self, session_id: &SessionId, channel: LogChannel, text: impl Into<String>) {
        let record = LogRecord {
            session_id: session_id.clone(),
            timestamp_ms: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            channel,
            text: text.into(),
        };
        if let Err(err) = self.record(&record) {
            tracing::warn!(session_id = %session_id, error = %err, "log sink write failed");
        }
    }
}
