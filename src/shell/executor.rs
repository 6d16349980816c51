use super::*;

use super::builtin::{Control, run_builtin};
use super::history::HistoryTee;
use super::io::{PipeWriter, fan_out, input_streams};
use std::process::Stdio;
use std::sync::Mutex;
use tokio::process::Command;
use tokio::task::JoinSet;

/// Host label of locally executed segments.
pub const LOCAL_HOST: &str = "localhost";

/// Cancels whatever statement is running when called.
///
/// Every statement gets a fresh token, so an interrupt never leaks into the
/// statements that follow it.
#[derive(Debug, Clone, Default)]
pub struct Interrupter {
    current: Arc<Mutex<CancellationToken>>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        match self.current.lock() {
            Ok(token) => token.cancel(),
            Err(e) => warn!("interrupter lock error: {e}"),
        }
    }

    fn arm(&self) -> CancellationToken {
        let token = CancellationToken::new();
        match self.current.lock() {
            Ok(mut current) => *current = token.clone(),
            Err(e) => warn!("interrupter lock error: {e}"),
        }
        token
    }
}

/// Result of one submitted line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineOutcome {
    /// Sequence number consumed by the line, if any.
    pub sequence: Option<u64>,
    /// An `exit` built-in ran.
    pub exit: bool,
}

/// Runs parsed lines over a fixed set of connected hosts.
///
/// Segments of one statement run concurrently, joined by in-process pipes;
/// the next statement starts once every segment has finished.
pub struct ParallelExecutor {
    hosts: Vec<Arc<dyn RemoteHost>>,
    history: Arc<HistoryStore>,
    writers: Arc<dyn HostWriters>,
    parser: PipelineParser,
    sequence: u64,
    interrupter: Interrupter,
}

impl ParallelExecutor {
    pub fn new(
        hosts: Vec<Arc<dyn RemoteHost>>,
        history: Arc<HistoryStore>,
        writers: Arc<dyn HostWriters>,
        parser: PipelineParser,
    ) -> Self {
        Self {
            hosts,
            history,
            writers,
            parser,
            sequence: 0,
            interrupter: Interrupter::default(),
        }
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(|h| h.name())
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    /// Last sequence number handed out; 0 before the first line.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    /// Logs, parses and runs one line.
    ///
    /// Segments reading the live stream get a copy of every line received
    /// from `input` while they run. A parse error rejects the line before
    /// anything executes.
    pub async fn execute(
        &mut self,
        line: &str,
        mut input: Option<&mut mpsc::Receiver<String>>,
    ) -> Result<LineOutcome, ParseError> {
        if line.trim().is_empty() {
            return Ok(LineOutcome::default());
        }
        if let Err(err) = self.history.append_log(line) {
            warn!("history log: {err}");
        }

        let statements = self.parser.parse(line)?;
        let sequence = if statements.is_empty() || statements.iter().all(Pipeline::is_builtin_only) {
            None
        } else {
            self.sequence += 1;
            Some(self.sequence)
        };

        let line: Arc<str> = Arc::from(line);
        let mut outcome = LineOutcome {
            sequence,
            exit: false,
        };
        for pipeline in &statements {
            let control = self
                .run_statement(&line, pipeline, sequence, input.as_deref_mut())
                .await;
            if control == Control::Exit {
                outcome.exit = true;
                break;
            }
        }
        if let Some(sequence) = sequence {
            info!("sequence {sequence} finished on {} host(s)", self.hosts.len());
        }
        Ok(outcome)
    }

    /// Closes every host, logging failures.
    pub async fn close(&self) {
        for host in &self.hosts {
            if let Err(err) = host.close().await {
                warn!("{}: close failed: {err}", host.name());
            }
        }
    }

    async fn run_statement(
        &self,
        line: &Arc<str>,
        pipeline: &Pipeline,
        sequence: Option<u64>,
        mut input: Option<&mut mpsc::Receiver<String>>,
    ) -> Control {
        let cancel = self.interrupter.arm();
        let mut tasks: JoinSet<Control> = JoinSet::new();
        let mut live: Vec<InputSender> = Vec::new();
        let mut upstream: Option<InputReceiver> = None;

        for segment in &pipeline.segments {
            let pipe = (segment.operator == Operator::Pipe).then(mpsc::unbounded_channel);
            let pipe_tx = pipe.as_ref().map(|(tx, _)| tx);

            match segment.kind {
                SegmentKind::Remote => {
                    let inputs = connect_input(self.hosts.len(), upstream.take(), &mut live);
                    if self.hosts.is_empty() {
                        warn!("no connected hosts for {:?}", segment.text);
                    }
                    let tagged = self.hosts.len() > 1;
                    for (host, stdin) in self.hosts.iter().zip(inputs) {
                        let name = host.name().to_string();
                        self.begin(sequence, &name, line);
                        let io = RemoteIo {
                            stdin,
                            stdout: self.record(self.sink(pipe_tx, &name, tagged), sequence, &name),
                            stderr: self.writers.stderr(&name, tagged),
                            cancel: cancel.clone(),
                        };
                        let diagnostics = self.writers.stderr(&name, tagged);
                        let host = host.clone();
                        let command = segment.text.clone();
                        tasks.spawn(async move {
                            debug!("{name}: running {command:?}");
                            let result = host.run(&command, io).await;
                            report(&name, result, diagnostics).await;
                            Control::Continue
                        });
                    }
                }
                SegmentKind::Local => {
                    for stdin in connect_input(1, upstream.take(), &mut live) {
                        self.begin(sequence, LOCAL_HOST, line);
                        let stdout =
                            self.record(self.sink(pipe_tx, LOCAL_HOST, false), sequence, LOCAL_HOST);
                        let stderr = self.writers.stderr(LOCAL_HOST, false);
                        let diagnostics = self.writers.stderr(LOCAL_HOST, false);
                        let command = segment.text.clone();
                        let cancel = cancel.clone();
                        tasks.spawn(async move {
                            let result = run_local(&command, stdin, stdout, stderr, cancel).await;
                            report(LOCAL_HOST, result, diagnostics).await;
                            Control::Continue
                        });
                    }
                }
                SegmentKind::Builtin(builtin) => {
                    drop(upstream.take());
                    let mut out = self.sink(pipe_tx, LOCAL_HOST, false);
                    let history = self.history.clone();
                    tasks.spawn(async move {
                        let control = match run_builtin(builtin, &history, &mut out).await {
                            Ok(control) => control,
                            Err(err) => {
                                warn!("{builtin:?}: {err}");
                                Control::Continue
                            }
                        };
                        if let Err(err) = out.shutdown().await {
                            debug!("{builtin:?}: {err}");
                        }
                        control
                    });
                }
            }
            upstream = pipe.map(|(_, rx)| rx);
        }

        if input.is_none() {
            live.clear();
        }

        let mut control = Control::Continue;
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(Control::Exit)) => control = Control::Exit,
                    Some(Ok(Control::Continue)) => {}
                    Some(Err(err)) => warn!("segment task failed: {err}"),
                    None => break,
                },
                line = next_line(&mut input), if !live.is_empty() => match line {
                    Some(line) => {
                        trace!("broadcasting input to {} segment(s)", live.len());
                        let chunk = format!("{line}\n").into_bytes();
                        live.retain(|tx| tx.send(chunk.clone()).is_ok());
                    }
                    None => live.clear(),
                },
            }
        }
        control
    }

    fn begin(&self, sequence: Option<u64>, host: &str, line: &str) {
        if let Some(sequence) = sequence
            && let Err(err) = self.history.begin(sequence, host, line)
        {
            warn!("{host}: {err}");
        }
    }

    /// Output of a segment: the next segment's pipe, or the host's writer.
    fn sink(&self, pipe: Option<&InputSender>, host: &str, tagged: bool) -> BoxedWriter {
        match pipe {
            Some(tx) => Box::new(PipeWriter::new(tx.clone())),
            None => self.writers.stdout(host, tagged),
        }
    }

    fn record(&self, writer: BoxedWriter, sequence: Option<u64>, host: &str) -> BoxedWriter {
        match sequence {
            Some(sequence) => Box::new(HistoryTee::new(writer, self.history.clone(), sequence, host)),
            None => writer,
        }
    }
}

/// Input streams for `count` consumers, fed from `upstream` or, without
/// one, from the live stream.
fn connect_input(
    count: usize,
    upstream: Option<InputReceiver>,
    live: &mut Vec<InputSender>,
) -> Vec<InputReceiver> {
    if count == 0 {
        return Vec::new();
    }
    let (senders, receivers) = input_streams(count);
    match upstream {
        Some(source) => {
            tokio::spawn(fan_out(source, senders));
        }
        None => live.extend(senders),
    }
    receivers
}

async fn next_line(input: &mut Option<&mut mpsc::Receiver<String>>) -> Option<String> {
    match input {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Writes a failed or non-zero outcome to the host's stderr.
async fn report(host: &str, result: Result<Option<u32>, ConnectError>, mut diagnostics: BoxedWriter) {
    let message = match result {
        Ok(None) | Ok(Some(0)) => None,
        Ok(Some(code)) => {
            debug!("{host}: exit status {code}");
            Some(format!("exit status {code}\n"))
        }
        Err(err) => {
            warn!("{host}: {err}");
            Some(format!("error: {err}\n"))
        }
    };
    if let Some(message) = message
        && let Err(err) = diagnostics.write_all(message.as_bytes()).await
    {
        warn!("{host}: {err}");
    }
    if let Err(err) = diagnostics.shutdown().await {
        debug!("{host}: {err}");
    }
}

/// Runs `command` through `sh -c`, killing it on cancel.
async fn run_local(
    command: &str,
    mut stdin: InputReceiver,
    mut stdout: BoxedWriter,
    mut stderr: BoxedWriter,
    cancel: CancellationToken,
) -> Result<Option<u32>, ConnectError> {
    debug!("{LOCAL_HOST}: running {command:?}");
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    let (Some(mut child_in), Some(mut child_out), Some(mut child_err)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(ConnectError::InternalServerError(
            "local process stdio unavailable".to_string(),
        ));
    };

    let feeder = tokio::spawn(async move {
        while let Some(chunk) = stdin.recv().await {
            if child_in.write_all(&chunk).await.is_err() {
                break;
            }
        }
    });

    let status = tokio::select! {
        _ = cancel.cancelled() => None,
        status = async {
            let (out, err) = tokio::join!(
                tokio::io::copy(&mut child_out, &mut stdout),
                tokio::io::copy(&mut child_err, &mut stderr),
            );
            if let Err(e) = out.and(err) {
                debug!("{LOCAL_HOST}: output closed: {e}");
                if let Err(e) = child.start_kill() {
                    debug!("{LOCAL_HOST}: kill failed: {e}");
                }
            }
            child.wait().await
        } => Some(status),
    };
    feeder.abort();

    let code = match status {
        Some(status) => status?.code().map(|code| code as u32),
        None => {
            debug!("{LOCAL_HOST}: interrupted");
            if let Err(e) = child.kill().await {
                debug!("{LOCAL_HOST}: kill failed: {e}");
            }
            None
        }
    };
    stdout.shutdown().await?;
    stderr.shutdown().await?;
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-memory host: echoes `cat` input, fails on `fail`, blocks on
    /// `sleep` until cancelled, otherwise prints "<name> <command>".
    struct FakeHost {
        name: String,
        interrupted: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RemoteHost for FakeHost {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, command: &str, io: RemoteIo) -> Result<Option<u32>, ConnectError> {
            let RemoteIo {
                mut stdin,
                mut stdout,
                mut stderr,
                cancel,
            } = io;
            match command {
                "cat" => {
                    while let Some(chunk) = stdin.recv().await {
                        stdout.write_all(&chunk).await?;
                    }
                }
                "fail" => {
                    stderr.write_all(b"boom\n").await?;
                    return Ok(Some(2));
                }
                c if c.starts_with("sleep") => {
                    cancel.cancelled().await;
                    self.interrupted.fetch_add(1, Ordering::SeqCst);
                    return Ok(None);
                }
                c => {
                    stdout
                        .write_all(format!("{} {}\n", self.name, c).as_bytes())
                        .await?;
                }
            }
            stdout.shutdown().await?;
            Ok(Some(0))
        }
    }

    struct Fixture {
        executor: ParallelExecutor,
        writers: MemoryWriters,
        interrupted: Arc<AtomicUsize>,
    }

    fn fixture(names: &[&str]) -> Fixture {
        let interrupted = Arc::new(AtomicUsize::new(0));
        let hosts = names
            .iter()
            .map(|name| {
                Arc::new(FakeHost {
                    name: name.to_string(),
                    interrupted: interrupted.clone(),
                }) as Arc<dyn RemoteHost>
            })
            .collect();
        let writers = MemoryWriters::default();
        let executor = ParallelExecutor::new(
            hosts,
            Arc::new(HistoryStore::in_memory()),
            Arc::new(writers.clone()),
            PipelineParser::default(),
        );
        Fixture {
            executor,
            writers,
            interrupted,
        }
    }

    #[tokio::test]
    async fn remote_statement_records_one_entry_per_host() {
        let mut f = fixture(&["web1", "web2", "web3"]);
        let outcome = f.executor.execute("uptime", None).await.expect("execute");

        assert_eq!(outcome.sequence, Some(1));
        assert_eq!(f.executor.sequence(), 1);
        let results = f.executor.history().output(1).expect("output").expect("seq 1");
        assert_eq!(results.len(), 3);
        assert_eq!(results["web2"].output_lossy(), "web2 uptime\n");
        assert_eq!(results["web2"].command, "uptime");
        assert_eq!(f.writers.stdout_of("web3"), "web3 uptime\n");
    }

    #[tokio::test]
    async fn builtin_only_line_keeps_the_counter() {
        let mut f = fixture(&["web1"]);
        f.executor.execute("hostname", None).await.expect("execute");
        let outcome = f.executor.execute("%outlist", None).await.expect("execute");

        assert_eq!(outcome.sequence, None);
        assert_eq!(f.executor.sequence(), 1);
        assert_eq!(f.writers.stdout_of(LOCAL_HOST), "1  hostname\n");

        f.executor.execute("%out 1", None).await.expect("execute");
        assert_eq!(f.writers.stdout_of(LOCAL_HOST), "1  hostname\nweb1 hostname\n");
    }

    #[tokio::test]
    async fn rejected_line_runs_nothing() {
        let mut f = fixture(&["web1"]);
        let err = f.executor.execute("echo 'oops", None).await.expect_err("parse");
        assert_eq!(err, ParseError::UnterminatedQuote('\''));
        assert_eq!(f.executor.sequence(), 0);
        assert!(f.writers.hosts().is_empty());
    }

    #[tokio::test]
    async fn interrupt_stops_every_host() {
        let mut f = fixture(&["a", "b", "c"]);
        let interrupter = f.executor.interrupter();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            interrupter.interrupt();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(5), f.executor.execute("sleep 600", None))
            .await
            .expect("returned after interrupt")
            .expect("execute");
        assert_eq!(outcome.sequence, Some(1));
        assert_eq!(f.interrupted.load(Ordering::SeqCst), 3);

        // The next line runs under a fresh token.
        f.executor.execute("whoami", None).await.expect("execute");
        assert_eq!(f.writers.stdout_of("a"), "a whoami\n");
    }

    #[tokio::test]
    async fn interrupt_kills_local_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_file = dir.path().join("pid");
        let mut f = fixture(&["web1"]);
        let interrupter = f.executor.interrupter();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            interrupter.interrupt();
        });

        let line = format!("!echo $$ > {} && exec sleep 30", pid_file.display());
        let outcome = tokio::time::timeout(Duration::from_secs(5), f.executor.execute(&line, None))
            .await
            .expect("returned after interrupt")
            .expect("execute");
        assert_eq!(outcome.sequence, Some(1));

        let pid = std::fs::read_to_string(&pid_file).expect("pid file");
        let alive = std::process::Command::new("kill")
            .arg("-0")
            .arg(pid.trim())
            .stderr(Stdio::null())
            .status()
            .expect("kill -0");
        assert!(!alive.success(), "local process {} still running", pid.trim());
    }

    #[tokio::test]
    async fn interrupt_ends_local_source_of_remote_pipe() {
        let mut f = fixture(&["web1"]);
        let interrupter = f.executor.interrupter();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            interrupter.interrupt();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(5), f.executor.execute("!sleep 30 | cat", None))
            .await
            .expect("returned after interrupt")
            .expect("execute");
        assert_eq!(outcome.sequence, Some(1));
        assert_eq!(f.writers.stdout_of("web1"), "");

        f.executor.execute("whoami", None).await.expect("execute");
        assert_eq!(f.writers.stdout_of("web1"), "web1 whoami\n");
    }

    #[tokio::test]
    async fn statements_run_in_order() {
        let mut f = fixture(&["web1"]);
        let outcome = f.executor.execute("first; second", None).await.expect("execute");
        assert_eq!(outcome.sequence, Some(1));
        assert_eq!(f.writers.stdout_of("web1"), "web1 first\nweb1 second\n");
        let results = f.executor.history().output(1).expect("output").expect("seq 1");
        assert_eq!(results["web1"].output_lossy(), "web1 first\nweb1 second\n");
    }

    #[tokio::test]
    async fn local_output_feeds_every_host() {
        let mut f = fixture(&["web1", "web2"]);
        f.executor
            .execute("!printf 'a\\nb\\n' | cat", None)
            .await
            .expect("execute");

        assert_eq!(f.writers.stdout_of("web1"), "a\nb\n");
        assert_eq!(f.writers.stdout_of("web2"), "a\nb\n");
        let results = f.executor.history().output(1).expect("output").expect("seq 1");
        assert_eq!(results[LOCAL_HOST].output_lossy(), "a\nb\n");
    }

    #[tokio::test]
    async fn remote_output_feeds_local_command() {
        let mut f = fixture(&["web2", "web1"]);
        f.executor.execute("hostname | !sort", None).await.expect("execute");
        assert_eq!(
            f.writers.stdout_of(LOCAL_HOST),
            "web1 hostname\nweb2 hostname\n"
        );
    }

    #[tokio::test]
    async fn live_input_is_broadcast() {
        let mut f = fixture(&["web1", "web2"]);
        let (tx, mut rx) = mpsc::channel(4);
        tx.send("hello".to_string()).await.expect("send");
        drop(tx);

        f.executor.execute("cat", Some(&mut rx)).await.expect("execute");
        assert_eq!(f.writers.stdout_of("web1"), "hello\n");
        assert_eq!(f.writers.stdout_of("web2"), "hello\n");
    }

    #[tokio::test]
    async fn failures_become_diagnostics() {
        let mut f = fixture(&["web1"]);
        let outcome = f.executor.execute("fail", None).await.expect("execute");
        assert_eq!(outcome.sequence, Some(1));
        assert_eq!(f.writers.stderr_of("web1"), "boom\nexit status 2\n");

        f.executor.execute("!exit 3", None).await.expect("execute");
        assert_eq!(f.writers.stderr_of(LOCAL_HOST), "exit status 3\n");
    }

    #[tokio::test]
    async fn exit_stops_the_line() {
        let mut f = fixture(&["web1"]);
        let outcome = f.executor.execute("exit; hostname", None).await.expect("execute");
        assert!(outcome.exit);
        assert_eq!(outcome.sequence, Some(1));
        assert!(f.writers.stdout_of("web1").is_empty());
    }
}
