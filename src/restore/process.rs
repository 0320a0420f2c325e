// restoretool/src/restore/process.rs
//! Runs external tools (tar, psql, rsync, migrations) on behalf of a restore.
//!
//! Output from stdout and stderr is forwarded line by line to the restore
//! log while the child runs. psql does not always reflect SQL errors in its
//! exit status, so every line is also scanned for a failure marker.

use async_trait::async_trait;
use std::io::BufRead;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::archive::open_dump;
use super::compat::ShadowRewriter;
use super::log::RestoreLogger;
use crate::errors::{RestoreError, Result};
use crate::utils::find_executable;

const STDIN_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum StdinSource {
    Null,
    /// Streams a (possibly gzipped) dump into the child, optionally rewritten
    /// to target the `restore` schema.
    DumpFile { path: PathBuf, rewrite_for_shadow: bool },
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: StdinSource,
    pub failure_marker: Option<String>,
    pub description: String,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        Self {
            description: program.clone(),
            program,
            args,
            env: Vec::new(),
            stdin: StdinSource::Null,
            failure_marker: None,
        }
    }

    /// Builds a spec from a configured `[program, args...]` list.
    pub fn from_parts(parts: &[String]) -> Result<Self> {
        let (program, args) = parts
            .split_first()
            .ok_or_else(|| RestoreError::Config("empty command".into()))?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, stdin: StdinSource) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn failure_marker(mut self, marker: impl Into<String>) -> Self {
        self.failure_marker = Some(marker.into());
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Command line for logs; environment values (passwords) are left out.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        spec: &CommandSpec,
        logger: &RestoreLogger,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Runs commands as real child processes.
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        logger: &RestoreLogger,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let program_path = find_executable(&spec.program).map_err(|e| RestoreError::Command {
            program: spec.program.clone(),
            status: "not started".into(),
            last_line: e.to_string(),
        })?;
        debug!("Running {}", spec.display());

        let mut command = Command::new(program_path);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command.stdin(match spec.stdin {
            StdinSource::Null => Stdio::null(),
            StdinSource::DumpFile { .. } => Stdio::piped(),
        });

        let mut child = command.spawn().map_err(|e| RestoreError::Command {
            program: spec.program.clone(),
            status: "not started".into(),
            last_line: e.to_string(),
        })?;

        // Forwarding loop: both pipes drain into one channel so a chatty child never blocks.
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx.clone()));
        }
        drop(line_tx);

        let feeder = match (&spec.stdin, child.stdin.take()) {
            (StdinSource::DumpFile { path, rewrite_for_shadow }, Some(stdin)) => Some(tokio::spawn(
                feed_dump(path.clone(), *rewrite_for_shadow, stdin),
            )),
            _ => None,
        };

        let mut marker_line: Option<String> = None;
        let mut last_line = String::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    if let Some(feeder) = feeder {
                        feeder.abort();
                    }
                    return Err(RestoreError::Cancelled(format!("{} was interrupted", spec.description)));
                }
                line = line_rx.recv() => match line {
                    Some(line) => {
                        logger.log(line.as_str());
                        if marker_line.is_none()
                            && spec.failure_marker.as_deref().is_some_and(|m| line.contains(m))
                        {
                            marker_line = Some(line.clone());
                        }
                        last_line = line;
                    }
                    None => break,
                },
            }
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(RestoreError::Cancelled(format!("{} was interrupted", spec.description)));
            }
            status = child.wait() => status?,
        };

        let feed_result = match feeder {
            Some(feeder) => feeder.await.map_err(|e| RestoreError::Command {
                program: spec.program.clone(),
                status: "stdin feeder panicked".into(),
                last_line: e.to_string(),
            })?,
            None => Ok(()),
        };

        if let Some(line) = marker_line {
            return Err(RestoreError::FailureMarker {
                program: spec.program.clone(),
                line,
            });
        }
        if !status.success() {
            return Err(RestoreError::Command {
                program: spec.program.clone(),
                status: status.to_string(),
                last_line,
            });
        }
        feed_result
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                // Output is not always UTF-8 (LATIN1 data, binary noise); keep reading past it.
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Stopped reading command output: {}", e);
                break;
            }
        }
    }
}

/// Streams the dump into the child's stdin; reading happens on a blocking thread.
async fn feed_dump(path: PathBuf, rewrite: bool, mut stdin: ChildStdin) -> Result<()> {
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(32);

    let reader = tokio::task::spawn_blocking(move || -> Result<()> {
        let mut dump = open_dump(&path)?;
        let mut line = Vec::new();
        let mut chunk = Vec::with_capacity(STDIN_CHUNK_BYTES);
        let mut rewriter = rewrite.then(ShadowRewriter::default);
        loop {
            line.clear();
            if dump.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            match (rewriter.as_mut(), std::str::from_utf8(&line)) {
                (Some(rewriter), Ok(text)) => chunk.extend_from_slice(rewriter.rewrite(text).as_bytes()),
                _ => chunk.extend_from_slice(&line),
            }
            if chunk.len() >= STDIN_CHUNK_BYTES {
                let full = std::mem::replace(&mut chunk, Vec::with_capacity(STDIN_CHUNK_BYTES));
                if chunk_tx.blocking_send(full).is_err() {
                    // The child stopped reading.
                    return Ok(());
                }
            }
        }
        if !chunk.is_empty() {
            let _ = chunk_tx.blocking_send(chunk);
        }
        Ok(())
    });

    while let Some(chunk) = chunk_rx.recv().await {
        if let Err(e) = stdin.write_all(&chunk).await {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                break;
            }
            return Err(e.into());
        }
    }
    drop(chunk_rx);
    // Closing stdin signals EOF to the child.
    let _ = stdin.shutdown().await;
    drop(stdin);

    reader.await.map_err(|e| RestoreError::Command {
        program: "dump reader".into(),
        status: "panicked".into(),
        last_line: e.to_string(),
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_output_is_forwarded_line_by_line() -> anyhow::Result<()> {
        let logger = RestoreLogger::new(None, None);
        SystemCommandRunner
            .run(&sh("echo one; echo two 1>&2; echo three"), &logger, &CancellationToken::new())
            .await?;

        let messages: Vec<String> = logger.lines().into_iter().map(|l| l.message).collect();
        assert_eq!(messages.len(), 3);
        for expected in ["one", "two", "three"] {
            assert!(messages.iter().any(|m| m == expected), "missing {}", expected);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_marker_fails_a_successful_exit() {
        let logger = RestoreLogger::new(None, None);
        let spec = sh("echo 'CREATE TABLE'; echo 'ERROR:  relation \"users\" already exists'; echo done; exit 0")
            .failure_marker("ERROR:");
        let result = SystemCommandRunner
            .run(&spec, &logger, &CancellationToken::new())
            .await;

        match result {
            Err(RestoreError::FailureMarker { program, line }) => {
                assert_eq!(program, "sh");
                assert!(line.contains("already exists"));
            }
            other => panic!("expected FailureMarker, got {:?}", other),
        }
        assert!(logger.contains("done"));
    }

    #[tokio::test]
    async fn test_marker_after_invalid_utf8_output_is_still_seen() {
        let logger = RestoreLogger::new(None, None);
        let spec = sh(r"printf 'ok\n\377\376\nERROR:  boom\n'; exit 0").failure_marker("ERROR:");
        let result = SystemCommandRunner
            .run(&spec, &logger, &CancellationToken::new())
            .await;

        match result {
            Err(RestoreError::FailureMarker { line, .. }) => assert_eq!(line, "ERROR:  boom"),
            other => panic!("expected FailureMarker, got {:?}", other),
        }
        let messages: Vec<String> = logger.lines().into_iter().map(|l| l.message).collect();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], "ok");
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_last_line() {
        let logger = RestoreLogger::new(None, None);
        let result = SystemCommandRunner
            .run(&sh("echo working; echo 'it broke'; exit 3"), &logger, &CancellationToken::new())
            .await;

        match result {
            Err(RestoreError::Command { last_line, .. }) => assert_eq!(last_line, "it broke"),
            other => panic!("expected Command error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_reported() {
        let logger = RestoreLogger::new(None, None);
        let spec = CommandSpec::new("definitely-not-a-real-binary-4242", vec![]);
        let result = SystemCommandRunner
            .run(&spec, &logger, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(RestoreError::Command { .. })));
    }

    #[tokio::test]
    async fn test_gzipped_dump_is_streamed_and_rewritten() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dump.sql.gz");
        let mut encoder = GzEncoder::new(std::fs::File::create(&path)?, Compression::default());
        writeln!(encoder, "CREATE TABLE public.users (id integer);")?;
        writeln!(encoder, "COPY public.users (id) FROM stdin;")?;
        writeln!(encoder, "1\tnotes live in public.notes")?;
        writeln!(encoder, "\\.")?;
        writeln!(encoder, "SELECT pg_catalog.setval('public.users_id_seq', 1, true);")?;
        encoder.finish()?;

        let logger = RestoreLogger::new(None, None);
        let spec = CommandSpec::new("cat", vec![]).stdin(StdinSource::DumpFile {
            path,
            rewrite_for_shadow: true,
        });
        SystemCommandRunner
            .run(&spec, &logger, &CancellationToken::new())
            .await?;

        assert!(logger.contains("CREATE TABLE restore.users (id integer);"));
        assert!(logger.contains("COPY restore.users (id) FROM stdin;"));
        assert!(logger.contains("1\tnotes live in public.notes"));
        assert!(logger.contains("setval('restore.users_id_seq', 1, true)"));
        assert!(!logger.contains("public.users"));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancellation_kills_the_child() {
        let logger = RestoreLogger::new(None, None);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = SystemCommandRunner.run(&sh("sleep 30"), &logger, &cancel).await;
        assert!(matches!(result, Err(RestoreError::Cancelled(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_display_leaves_out_environment() -> anyhow::Result<()> {
        let spec = CommandSpec::from_parts(&["psql".to_string(), "--dbname".to_string(), "app".to_string()])?
            .env("PGPASSWORD", "hunter2");
        assert_eq!(spec.display(), "psql --dbname app");
        assert!(CommandSpec::from_parts(&[]).is_err());
        Ok(())
    }
}
