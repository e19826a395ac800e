//! # Worker Processes
//!
//! The worker seam: given a provider, a prompt and a working directory,
//! produce a stream of output chunks terminated by exactly one exit code.
//!
//! [`ProcessSpawner`] runs the provider's resolved command line as a child
//! process. Tests substitute their own [`WorkerSpawner`].

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Notify};

use crate::models::ResolvedProviders;

/// Exit code reported when a worker is killed or times out
pub const KILLED_EXIT_CODE: i32 = -1;

const EVENT_BUFFER: usize = 256;
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn provider '{provider}': {source}")]
    Spawn {
        provider: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to send prompt to provider '{provider}': {source}")]
    Stdin {
        provider: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no launch command resolved for provider '{0}'")]
    UnknownProvider(String),
    #[error("no worker providers available")]
    NoProviders,
}

/// What to run
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub agent_id: String,
    pub provider: String,
    pub prompt: String,
    pub workdir: PathBuf,
    pub max_runtime: Duration,
}

/// Streamed worker event. `Exit` is always the last one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Output(String),
    Exit(i32),
}

/// Asks a running worker to terminate. Safe to call any number of times,
/// including after the worker exited.
#[derive(Debug, Clone, Default)]
pub struct KillHandle(Arc<Notify>);

impl KillHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kill(&self) {
        self.0.notify_one();
    }

    /// Resolves once `kill` has been called
    pub async fn killed(&self) {
        self.0.notified().await
    }
}

/// A started worker
#[derive(Debug)]
pub struct WorkerHandle {
    pub events: mpsc::Receiver<WorkerEvent>,
    pub kill: KillHandle,
}

#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, request: WorkerRequest) -> Result<WorkerHandle, WorkerError>;
}

/// Runs providers as child processes
pub struct ProcessSpawner {
    providers: ResolvedProviders,
}

impl ProcessSpawner {
    pub fn new(providers: ResolvedProviders) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, request: WorkerRequest) -> Result<WorkerHandle, WorkerError> {
        let launch = self
            .providers
            .get(&request.provider)
            .ok_or_else(|| WorkerError::UnknownProvider(request.provider.clone()))?
            .clone();

        let prompt_as_arg = launch.takes_prompt_arg();
        let mut cmd = Command::new(&launch.program);
        if prompt_as_arg {
            cmd.args(launch.render_args(&request.prompt));
            cmd.stdin(Stdio::null());
        } else {
            cmd.args(&launch.args);
            cmd.stdin(Stdio::piped());
        }
        cmd.current_dir(&request.workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| WorkerError::Spawn {
            provider: request.provider.clone(),
            source,
        })?;

        tracing::debug!(
            agent_id = %request.agent_id,
            provider = %request.provider,
            pid = ?child.id(),
            "Worker spawned"
        );

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let stdout_task = child.stdout.take().map(|out| forward_lines(out, tx.clone()));
        let stderr_task = child.stderr.take().map(|err| forward_lines(err, tx.clone()));

        // Written from its own task so a worker that never reads stdin
        // cannot stall `spawn` past the timeout or kill paths below
        let stdin_task = if prompt_as_arg {
            None
        } else {
            child.stdin.take().map(|mut stdin| {
                let prompt = request.prompt.clone();
                let provider = request.provider.clone();
                tokio::spawn(async move {
                    if let Err(source) = stdin.write_all(prompt.as_bytes()).await {
                        let err = WorkerError::Stdin { provider, source };
                        tracing::debug!("{}", err);
                    }
                    // Dropping stdin closes it so the worker sees EOF
                })
            })
        };

        let kill = KillHandle::new();
        let kill_signal = kill.clone();
        let agent_id = request.agent_id.clone();
        let max_runtime = request.max_runtime;

        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => status.code().unwrap_or(KILLED_EXIT_CODE),
                    Err(e) => {
                        tracing::warn!(agent_id = %agent_id, "Failed to wait for worker: {}", e);
                        KILLED_EXIT_CODE
                    }
                },
                _ = kill_signal.killed() => {
                    tracing::debug!(agent_id = %agent_id, "Killing worker");
                    let _ = child.kill().await;
                    KILLED_EXIT_CODE
                }
                _ = tokio::time::sleep(max_runtime) => {
                    tracing::warn!(agent_id = %agent_id, ?max_runtime, "Worker exceeded max runtime, killing");
                    let _ = child.kill().await;
                    KILLED_EXIT_CODE
                }
            };

            if let Some(task) = stdin_task {
                task.abort();
            }
            for task in [stdout_task, stderr_task].into_iter().flatten() {
                let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, task).await;
            }

            let _ = tx.send(WorkerEvent::Exit(code)).await;
        });

        Ok(WorkerHandle { events: rx, kill })
    }
}

fn forward_lines<R>(reader: R, tx: mpsc::Sender<WorkerEvent>) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let chunk = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send(WorkerEvent::Output(chunk)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Worker output stream closed: {}", e);
                    break;
                }
            }
        }
    })
}


#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::{LaunchCommand, ResolvedProvider, PROMPT_PLACEHOLDER};

    fn spawner(program: &str, args: &[&str]) -> ProcessSpawner {
        ProcessSpawner::new(ResolvedProviders::new(vec![ResolvedProvider {
            id: "test".into(),
            launch: LaunchCommand::new(program, args.iter().map(|a| a.to_string()).collect()),
        }]))
    }

    fn request(prompt: &str, max_runtime: Duration) -> WorkerRequest {
        WorkerRequest {
            agent_id: "code-coder-0".into(),
            provider: "test".into(),
            prompt: prompt.into(),
            workdir: std::env::temp_dir(),
            max_runtime,
        }
    }

    async fn collect(mut handle: WorkerHandle) -> (String, Vec<i32>) {
        let mut output = String::new();
        let mut exits = Vec::new();
        while let Some(event) = handle.events.recv().await {
            match event {
                WorkerEvent::Output(chunk) => output.push_str(&chunk),
                WorkerEvent::Exit(code) => exits.push(code),
            }
        }
        (output, exits)
    }

    #[tokio::test]
    async fn test_prompt_as_argument() {
        let spawner = spawner("echo", &[PROMPT_PLACEHOLDER]);
        let handle = spawner
            .spawn(request("hello swarm", Duration::from_secs(10)))
            .await
            .unwrap();
        let (output, exits) = collect(handle).await;
        assert_eq!(output, "hello swarm\n");
        assert_eq!(exits, vec![0]);
    }

    #[tokio::test]
    async fn test_prompt_on_stdin() {
        let spawner = spawner("cat", &[]);
        let handle = spawner
            .spawn(request("from stdin", Duration::from_secs(10)))
            .await
            .unwrap();
        let (output, exits) = collect(handle).await;
        assert_eq!(output, "from stdin");
        assert_eq!(exits, vec![0]);
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let spawner = spawner("sh", &["-c", "echo oops >&2; exit 3"]);
        let handle = spawner
            .spawn(request("", Duration::from_secs(10)))
            .await
            .unwrap();
        let (output, exits) = collect(handle).await;
        assert!(output.contains("oops"));
        assert_eq!(exits, vec![3]);
    }

    #[tokio::test]
    async fn test_timeout_kills() {
        let spawner = spawner("sleep", &["30"]);
        let handle = spawner
            .spawn(request("", Duration::from_millis(100)))
            .await
            .unwrap();
        let (_, exits) = collect(handle).await;
        assert_eq!(exits, vec![KILLED_EXIT_CODE]);
    }

    #[tokio::test]
    async fn test_unread_stdin_does_not_block_timeout() {
        let spawner = spawner("sleep", &["3"]);
        let prompt = "x".repeat(1024 * 1024);
        let started = std::time::Instant::now();

        let handle = spawner
            .spawn(request(&prompt, Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        let (_, exits) = collect(handle).await;
        assert_eq!(exits, vec![KILLED_EXIT_CODE]);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_kill_reaches_worker_blocked_on_stdin() {
        let spawner = spawner("sleep", &["3"]);
        let prompt = "x".repeat(1024 * 1024);
        let started = std::time::Instant::now();

        let handle = spawner
            .spawn(request(&prompt, Duration::from_secs(60)))
            .await
            .unwrap();
        handle.kill.kill();
        let (_, exits) = collect(handle).await;
        assert_eq!(exits, vec![KILLED_EXIT_CODE]);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_kill_is_safe_after_exit() {
        let spawner = spawner("sleep", &["30"]);
        let handle = spawner
            .spawn(request("", Duration::from_secs(60)))
            .await
            .unwrap();
        let kill = handle.kill.clone();
        kill.kill();
        let (_, exits) = collect(handle).await;
        assert_eq!(exits, vec![KILLED_EXIT_CODE]);
        kill.kill();
        kill.kill();
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let spawner = spawner("/definitely/not/a/binary", &[]);
        let err = spawner
            .spawn(request("x", Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let spawner = spawner("echo", &[]);
        let mut req = request("x", Duration::from_secs(1));
        req.provider = "nobody".into();
        assert!(matches!(
            spawner.spawn(req).await.unwrap_err(),
            WorkerError::UnknownProvider(_)
        ));
    }
}
