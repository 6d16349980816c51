use super::*;

use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Captured result of one host for one sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryResult {
    pub timestamp: DateTime<Local>,
    pub command: String,
    pub output: Vec<u8>,
}

impl HistoryResult {
    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

#[derive(Serialize)]
struct ExportRecord<'a> {
    sequence: u64,
    host: &'a str,
    timestamp: String,
    command: &'a str,
    output: String,
}

type SequenceMap = BTreeMap<u64, BTreeMap<String, HistoryResult>>;

/// Durable command log plus per-sequence captured output.
///
/// The log file only ever grows; the captured output lives for the process
/// lifetime and backs the replay built-ins.
#[derive(Debug)]
pub struct HistoryStore {
    log_path: Option<PathBuf>,
    entries: Mutex<SequenceMap>,
}

impl HistoryStore {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: Some(log_path.into()),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// A store without a durable log.
    pub fn in_memory() -> Self {
        Self {
            log_path: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn log_path(&self) -> Option<&std::path::Path> {
        self.log_path.as_deref()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SequenceMap>, ConnectError> {
        self.entries
            .lock()
            .map_err(|e| ConnectError::InternalServerError(format!("history lock error: {e}")))
    }

    /// Appends `command` to the durable log and syncs it before returning.
    ///
    /// Embedded line breaks are written as `\n` and `\r` so every entry
    /// stays on one line.
    pub fn append_log(&self, command: &str) -> Result<(), ConnectError> {
        let Some(path) = self.log_path.as_ref() else {
            return Ok(());
        };
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let command = command.replace('\r', "\\r").replace('\n', "\\n");
        let line = format!("{} {}\n", Local::now().format(TIMESTAMP_FORMAT), command);
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Lines of the durable log, oldest first.
    pub fn read_log(&self) -> Result<Vec<String>, ConnectError> {
        let Some(path) = self.log_path.as_ref() else {
            return Ok(Vec::new());
        };
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(content.lines().map(str::to_string).collect()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Opens the entry of `host` under `sequence`, keeping captured output
    /// if it already exists.
    pub fn begin(&self, sequence: u64, host: &str, command: &str) -> Result<(), ConnectError> {
        let mut entries = self.lock()?;
        entries
            .entry(sequence)
            .or_default()
            .entry(host.to_string())
            .or_insert_with(|| HistoryResult {
                timestamp: Local::now(),
                command: command.to_string(),
                output: Vec::new(),
            });
        Ok(())
    }

    pub fn append_output(&self, sequence: u64, host: &str, data: &[u8]) -> Result<(), ConnectError> {
        let mut entries = self.lock()?;
        let hosts = entries.entry(sequence).or_default();
        match hosts.get_mut(host) {
            Some(result) => result.output.extend_from_slice(data),
            None => {
                hosts.insert(
                    host.to_string(),
                    HistoryResult {
                        timestamp: Local::now(),
                        command: String::new(),
                        output: data.to_vec(),
                    },
                );
            }
        }
        Ok(())
    }

    /// Recorded sequences with the command of each, ascending.
    pub fn sequences(&self) -> Result<Vec<(u64, String)>, ConnectError> {
        let entries = self.lock()?;
        Ok(entries
            .iter()
            .map(|(seq, hosts)| {
                let command = hosts
                    .values()
                    .map(|r| r.command.as_str())
                    .find(|c| !c.is_empty())
                    .unwrap_or_default();
                (*seq, command.to_string())
            })
            .collect())
    }

    /// Per-host results of `sequence`.
    pub fn output(&self, sequence: u64) -> Result<Option<BTreeMap<String, HistoryResult>>, ConnectError> {
        Ok(self.lock()?.get(&sequence).cloned())
    }

    pub fn latest_sequence(&self) -> Result<Option<u64>, ConnectError> {
        Ok(self.lock()?.keys().next_back().copied())
    }

    /// Dumps every captured result as JSONL, one host per line.
    pub fn export_jsonl(&self) -> Result<String, ConnectError> {
        let entries = self.lock()?;
        let mut lines = Vec::new();
        for (sequence, hosts) in entries.iter() {
            for (host, result) in hosts {
                let record = ExportRecord {
                    sequence: *sequence,
                    host,
                    timestamp: result.timestamp.to_rfc3339(),
                    command: &result.command,
                    output: result.output_lossy(),
                };
                let line = serde_json::to_string(&record).map_err(|e| {
                    ConnectError::InternalServerError(format!("history encode error: {e}"))
                })?;
                lines.push(line);
            }
        }
        Ok(lines.join("\n"))
    }
}

/// Copies everything written through it into a history entry.
pub(crate) struct HistoryTee {
    inner: BoxedWriter,
    history: Arc<HistoryStore>,
    sequence: u64,
    host: String,
}

impl HistoryTee {
    pub(crate) fn new(
        inner: BoxedWriter,
        history: Arc<HistoryStore>,
        sequence: u64,
        host: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            history,
            sequence,
            host: host.into(),
        }
    }
}

impl AsyncWrite for HistoryTee {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let written = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        if let Err(err) = this
            .history
            .append_output(this.sequence, &this.host, &buf[..written])
        {
            warn!("{}: {}", this.host, err);
        }
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
