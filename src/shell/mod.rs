//! Parallel pipeline shell.
//!
//! A line typed at the prompt is parsed into statements of piped segments.
//! Remote segments run on every connected host at once, local segments
//! (prefixed with `!`) run on this machine, and built-ins such as `%out`
//! replay captured output. Output of each host is tagged with its name and
//! recorded under the line's sequence number.
//!
//! # Main Components
//!
//! - [`Shell`] - Prompt loop and one-shot entry point
//! - [`ParallelExecutor`] - Wires and runs the segments of each statement
//! - [`PipelineParser`] - Splits and classifies a line
//! - [`HistoryStore`] - Durable command log and captured output
//!
//! # Example
//!
//! ```rust,no_run
//! use rmssh::shell::{Mode, Shell};
//! use rmssh::{ConnectOptions, ConnectionFactory, Inventory, ShellConfig};
//! use std::sync::Arc;
//!
//! # async fn example(inventory: Inventory) -> Result<(), Box<dyn std::error::Error>> {
//! let factory = Arc::new(ConnectionFactory::new(inventory, ConnectOptions::default()));
//! let report = factory.connect_all(&["web1".to_string(), "web2".to_string()]).await?;
//!
//! let mut shell = Shell::from_connections(report.connected, ShellConfig::default());
//! shell.run(Mode::Interactive).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ShellConfig;
use crate::error::{ConnectError, ParseError};
use crate::session::Connection;

pub use executor::{Interrupter, LOCAL_HOST, LineOutcome, ParallelExecutor};
pub use history::{HistoryResult, HistoryStore};
pub use io::{BoxedWriter, InputReceiver, InputSender, RemoteHost, RemoteIo};
pub use output::{HostWriters, MemoryWriters, PrefixWriters};
pub use parser::{Builtin, Operator, Pipeline, PipelineParser, Segment, SegmentKind};

mod builtin;
mod executor;
mod history;
mod io;
mod output;
mod parser;

/// How [`Shell::run`] takes its input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Prompt for lines until `exit` or end of input.
    Interactive,
    /// Run one line, forwarding stdin to it, then return.
    Command(String),
}

/// Entry point over a set of connected hosts.
pub struct Shell {
    executor: ParallelExecutor,
    config: ShellConfig,
}

impl Shell {
    pub fn new(hosts: Vec<Arc<dyn RemoteHost>>, config: ShellConfig) -> Self {
        let history = Arc::new(HistoryStore::new(config.history_file.clone()));
        let executor = ParallelExecutor::new(
            hosts,
            history,
            Arc::new(PrefixWriters),
            PipelineParser::new(config.local_prefix),
        );
        Self { executor, config }
    }

    pub fn from_connections(connections: Vec<Connection>, config: ShellConfig) -> Self {
        let hosts = connections
            .into_iter()
            .map(|conn| Arc::new(conn) as Arc<dyn RemoteHost>)
            .collect();
        Self::new(hosts, config)
    }

    /// Uses a pre-built executor, e.g. with in-memory writers.
    pub fn with_executor(executor: ParallelExecutor, config: ShellConfig) -> Self {
        Self { executor, config }
    }

    pub fn executor(&self) -> &ParallelExecutor {
        &self.executor
    }

    /// Runs until `exit`, end of input, or the one-shot command finishes,
    /// then closes every host.
    ///
    /// Ctrl-C interrupts the running statement only.
    pub async fn run(&mut self, mode: Mode) -> Result<(), ConnectError> {
        let mut input = spawn_line_reader(std::io::BufReader::new(std::io::stdin()));
        let interrupter = self.executor.interrupter();
        let ctrl_c = tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                debug!("interrupt requested");
                interrupter.interrupt();
            }
        });

        let result = self.drive(mode, &mut input).await;
        drop(input);
        ctrl_c.abort();
        self.executor.close().await;
        result
    }

    async fn drive(&mut self, mode: Mode, input: &mut mpsc::Receiver<String>) -> Result<(), ConnectError> {
        match mode {
            Mode::Command(line) => {
                self.submit(&line, input).await?;
            }
            Mode::Interactive => loop {
                let mut stdout = tokio::io::stdout();
                stdout.write_all(self.config.prompt.as_bytes()).await?;
                stdout.flush().await?;

                let Some(line) = input.recv().await else {
                    debug!("end of input");
                    break;
                };
                if self.submit(&line, input).await? {
                    break;
                }
            },
        }
        Ok(())
    }

    /// Returns whether the line asked to exit.
    async fn submit(&mut self, line: &str, input: &mut mpsc::Receiver<String>) -> Result<bool, ConnectError> {
        match self.executor.execute(line, Some(input)).await {
            Ok(outcome) => Ok(outcome.exit),
            Err(err) => {
                let mut stderr = tokio::io::stderr();
                stderr.write_all(format!("parse error: {err}\n").as_bytes()).await?;
                stderr.flush().await?;
                Ok(false)
            }
        }
    }
}

/// Reads lines on a detached thread.
///
/// A blocking stdin read cannot be cancelled, so the thread is never joined
/// and runtime shutdown does not wait for it. It ends at end of input, or at
/// the next line once the receiver is dropped.
fn spawn_line_reader<R>(reader: R) -> mpsc::Receiver<String>
where
    R: std::io::BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    let spawned = std::thread::Builder::new()
        .name("rmssh-input".to_string())
        .spawn(move || {
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("stdin read error: {e}");
                        break;
                    }
                }
            }
            debug!("line reader finished");
        });
    if let Err(e) = spawned {
        warn!("cannot start line reader: {e}");
    }
    rx
}
