use super::*;

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Mutex;

/// Presentation seam: where each host's output goes.
///
/// With `tagged` the writer marks every line with the host name; it is off
/// when only one host is targeted.
pub trait HostWriters: Send + Sync {
    fn stdout(&self, host: &str, tagged: bool) -> BoxedWriter;
    fn stderr(&self, host: &str, tagged: bool) -> BoxedWriter;
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Writes to the process stdout/stderr, prefixing lines with `[host] `.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrefixWriters;

impl HostWriters for PrefixWriters {
    fn stdout(&self, host: &str, tagged: bool) -> BoxedWriter {
        Box::new(PrefixWriter::new(Stream::Stdout, tagged.then(|| host.to_string())))
    }

    fn stderr(&self, host: &str, tagged: bool) -> BoxedWriter {
        Box::new(PrefixWriter::new(Stream::Stderr, tagged.then(|| host.to_string())))
    }
}

/// Line-buffered writer; complete lines are written under the stream lock
/// so hosts never interleave within a line.
struct PrefixWriter {
    stream: Stream,
    prefix: Option<String>,
    pending: Vec<u8>,
}

impl PrefixWriter {
    fn new(stream: Stream, host: Option<String>) -> Self {
        Self {
            stream,
            prefix: host.map(|h| format!("[{h}] ")),
            pending: Vec::new(),
        }
    }

    fn emit(&self, line: &[u8]) -> std::io::Result<()> {
        let mut out: Box<dyn Write> = match self.stream {
            Stream::Stdout => Box::new(std::io::stdout().lock()),
            Stream::Stderr => Box::new(std::io::stderr().lock()),
        };
        if let Some(prefix) = self.prefix.as_ref() {
            out.write_all(prefix.as_bytes())?;
        }
        out.write_all(line)?;
        out.flush()
    }

    fn drain_lines(&mut self) -> std::io::Result<()> {
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.emit(&line)?;
        }
        Ok(())
    }
}

impl AsyncWrite for PrefixWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        this.pending.extend_from_slice(buf);
        Poll::Ready(this.drain_lines().map(|()| buf.len()))
    }

    /// Untagged writers pass a partial line through; tagged ones hold it
    /// until the line completes.
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.prefix.is_some() || this.pending.is_empty() {
            return Poll::Ready(Ok(()));
        }
        let partial = std::mem::take(&mut this.pending);
        Poll::Ready(this.emit(&partial))
    }

    /// Writes a trailing partial line; the process stream stays open.
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.pending.is_empty() {
            return Poll::Ready(Ok(()));
        }
        this.pending.push(b'\n');
        Poll::Ready(this.drain_lines())
    }
}

type Captured = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;

/// Collects each host's output in memory, untagged.
#[derive(Debug, Default, Clone)]
pub struct MemoryWriters {
    stdout: Captured,
    stderr: Captured,
}

impl MemoryWriters {
    pub fn stdout_of(&self, host: &str) -> String {
        read_captured(&self.stdout, host)
    }

    pub fn stderr_of(&self, host: &str) -> String {
        read_captured(&self.stderr, host)
    }

    /// Hosts that wrote anything to stdout.
    pub fn hosts(&self) -> Vec<String> {
        match self.stdout.lock() {
            Ok(map) => map.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

fn read_captured(captured: &Captured, host: &str) -> String {
    match captured.lock() {
        Ok(map) => map
            .get(host)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default(),
        Err(_) => String::new(),
    }
}

impl HostWriters for MemoryWriters {
    fn stdout(&self, host: &str, _tagged: bool) -> BoxedWriter {
        Box::new(MemoryWriter {
            host: host.to_string(),
            captured: self.stdout.clone(),
        })
    }

    fn stderr(&self, host: &str, _tagged: bool) -> BoxedWriter {
        Box::new(MemoryWriter {
            host: host.to_string(),
            captured: self.stderr.clone(),
        })
    }
}

struct MemoryWriter {
    host: String,
    captured: Captured,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let mut map = self
            .captured
            .lock()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        map.entry(self.host.clone())
            .or_default()
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
