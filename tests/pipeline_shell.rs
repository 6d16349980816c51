use async_trait::async_trait;
use rmssh::error::ConnectError;
use rmssh::ShellConfig;
use rmssh::shell::{
    HistoryStore, MemoryWriters, ParallelExecutor, PipelineParser, RemoteHost, RemoteIo, Shell,
};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Answers every command with a canned line per host; `cat` echoes stdin.
struct CannedHost {
    name: &'static str,
}

#[async_trait]
impl RemoteHost for CannedHost {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, command: &str, mut io: RemoteIo) -> Result<Option<u32>, ConnectError> {
        if command == "cat" {
            while let Some(chunk) = io.stdin.recv().await {
                io.stdout.write_all(&chunk).await?;
            }
            io.stdout.shutdown().await?;
            return Ok(Some(0));
        }
        let reply = match command {
            "hostname" => format!("{}\n", self.name),
            "uname | tr a-z A-Z" => "LINUX\n".to_string(),
            other => format!("{}: unknown command {other}\n", self.name),
        };
        io.stdout.write_all(reply.as_bytes()).await?;
        io.stdout.shutdown().await?;
        Ok(Some(0))
    }
}

fn executor(
    names: &[&'static str],
    history: Arc<HistoryStore>,
    parser: PipelineParser,
) -> (ParallelExecutor, MemoryWriters) {
    let hosts = names
        .iter()
        .map(|name| Arc::new(CannedHost { name: *name }) as Arc<dyn RemoteHost>)
        .collect();
    let writers = MemoryWriters::default();
    let executor = ParallelExecutor::new(hosts, history, Arc::new(writers.clone()), parser);
    (executor, writers)
}

#[tokio::test]
async fn history_survives_across_sessions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("history");

    let (mut first, _) = executor(
        &["web1"],
        Arc::new(HistoryStore::new(&path)),
        PipelineParser::default(),
    );
    first.execute("hostname", None).await.expect("execute");
    first.execute("echo 'broken", None).await.expect_err("parse error");

    let (mut second, writers) = executor(
        &["web1"],
        Arc::new(HistoryStore::new(&path)),
        PipelineParser::default(),
    );
    let outcome = second.execute("%history", None).await.expect("execute");
    assert_eq!(outcome.sequence, None);

    let shown = writers.stdout_of("localhost");
    let commands: Vec<&str> = shown.lines().map(|line| &line[20..]).collect();
    assert_eq!(commands, vec!["hostname", "echo 'broken", "%history"]);
}

#[tokio::test]
async fn replay_tags_hosts_and_merged_pipes_run_remotely() {
    let history = Arc::new(HistoryStore::in_memory());
    let (mut executor, writers) = executor(&["db", "web1"], history.clone(), PipelineParser::default());

    executor.execute("uname | tr a-z A-Z", None).await.expect("execute");
    assert_eq!(writers.stdout_of("db"), "LINUX\n");
    assert_eq!(writers.stdout_of("web1"), "LINUX\n");

    executor.execute("hostname; %out 1", None).await.expect("execute");
    assert_eq!(executor.sequence(), 2);
    assert_eq!(writers.stdout_of("localhost"), "[db] LINUX\n[web1] LINUX\n");

    let exported = history.export_jsonl().expect("export");
    let records: Vec<serde_json::Value> = exported
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect();
    assert_eq!(records.len(), 4);
    assert_eq!(records[2]["sequence"], 2);
    assert_eq!(records[2]["command"], "hostname; %out 1");
    assert_eq!(records[3]["output"], "web1\n");
}

#[tokio::test]
async fn custom_local_prefix_runs_on_this_machine() {
    let (mut executor, writers) = executor(
        &["web1"],
        Arc::new(HistoryStore::in_memory()),
        PipelineParser::new('@'),
    );
    executor.execute("@echo local | cat", None).await.expect("execute");

    assert_eq!(writers.stdout_of("web1"), "local\n");
    let results = executor.history().output(1).expect("output").expect("seq 1");
    assert_eq!(results["localhost"].output_lossy(), "local\n");
}

#[tokio::test]
async fn shell_wraps_a_prebuilt_executor() {
    let (executor, _) = executor(
        &["web1", "web2"],
        Arc::new(HistoryStore::in_memory()),
        PipelineParser::default(),
    );
    let shell = Shell::with_executor(executor, ShellConfig::default());
    assert_eq!(shell.executor().hosts().collect::<Vec<_>>(), vec!["web1", "web2"]);
    assert_eq!(shell.executor().sequence(), 0);
}
