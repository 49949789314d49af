//! External process execution with exit-code policies and output capture.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{CallSite, Error, Result};

const READ_BUFFER_SIZE: usize = 8 * 1024;
const ROOT_PLACEHOLDER: &str = "<root>";

/// Decides which exit codes count as success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitCodePolicy {
    /// Only the listed codes are accepted.
    FixedSet(Vec<i32>),
    /// Never rejects on a code; non-zero codes are recorded in the runner's
    /// [`ExitCodeSlot`] so the calling program can exit with the same status.
    Inherit,
    /// Never rejects. A signal termination is attached to
    /// [`ProcessResult::error`] instead of failing the call.
    Any,
}

impl Default for ExitCodePolicy {
    fn default() -> Self {
        ExitCodePolicy::FixedSet(vec![0])
    }
}

/// Which of the child's output streams are piped back to the runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capture {
    #[default]
    None,
    Stdout,
    Stderr,
    Both,
}

impl Capture {
    #[inline]
    pub fn stdout(self) -> bool {
        matches!(self, Capture::Stdout | Capture::Both)
    }

    #[inline]
    pub fn stderr(self) -> bool {
        matches!(self, Capture::Stderr | Capture::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => f.write_str("stdout"),
            Stream::Stderr => f.write_str("stderr"),
        }
    }
}

/// A piece of captured output, tagged with the stream it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: Stream,
    pub text: String,
}

/// Everything needed to start one external process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    capture: Capture,
    policy: ExitCodePolicy,
    wait_for_close: bool,
}

impl SpawnSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            capture: Capture::None,
            policy: ExitCodePolicy::default(),
            wait_for_close: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Adds an environment override on top of the inherited environment.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn capture(mut self, capture: Capture) -> Self {
        self.capture = capture;
        self
    }

    pub fn policy(mut self, policy: ExitCodePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// When `true` (the default) the result is produced only after every
    /// captured stream has reached EOF, not merely after the child exited.
    pub fn wait_for_close(mut self, wait: bool) -> Self {
        self.wait_for_close = wait;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn capture_mode(&self) -> Capture {
        self.capture
    }

    pub fn exit_code_policy(&self) -> &ExitCodePolicy {
        &self.policy
    }

    /// Program and arguments joined by spaces.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Outcome of one finished process. Immutable once produced.
#[derive(Debug)]
pub struct ProcessResult {
    pid: Option<u32>,
    status: Option<i32>,
    signal: Option<i32>,
    chunks: Vec<OutputChunk>,
    error: Option<Error>,
}

impl ProcessResult {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Numeric exit code, `None` when the process was killed by a signal.
    pub fn status(&self) -> Option<i32> {
        self.status
    }

    pub fn signal(&self) -> Option<i32> {
        self.signal
    }

    /// Set only under [`ExitCodePolicy::Any`] when the process was signalled.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn chunks(&self) -> &[OutputChunk] {
        &self.chunks
    }

    pub fn stdout(&self) -> String {
        self.join(Some(Stream::Stdout))
    }

    pub fn stderr(&self) -> String {
        self.join(Some(Stream::Stderr))
    }

    /// Both streams interleaved in arrival order.
    pub fn output(&self) -> String {
        self.join(None)
    }

    fn join(&self, stream: Option<Stream>) -> String {
        self.chunks
            .iter()
            .filter(|chunk| stream.map_or(true, |s| chunk.stream == s))
            .map(|chunk| chunk.text.as_str())
            .collect()
    }
}

/// Out-of-band exit status for [`ExitCodePolicy::Inherit`].
///
/// Holds the most recent non-zero code reported by an inheriting process.
#[derive(Debug, Clone, Default)]
pub struct ExitCodeSlot(Arc<AtomicI32>);

impl ExitCodeSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, code: i32) {
        if code != 0 {
            self.0.store(code, Ordering::SeqCst);
        }
    }

    pub fn get(&self) -> Option<i32> {
        match self.0.load(Ordering::SeqCst) {
            0 => None,
            code => Some(code),
        }
    }
}

/// Spawns external commands and turns their exit into a [`ProcessResult`].
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    root: Option<PathBuf>,
    exit_code: ExitCodeSlot,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Workspace root abbreviated as `<root>` in logged command lines.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn with_exit_code_slot(mut self, slot: ExitCodeSlot) -> Self {
        self.exit_code = slot;
        self
    }

    pub fn exit_code_slot(&self) -> &ExitCodeSlot {
        &self.exit_code
    }

    /// Starts the process and waits for its result.
    ///
    /// The child is started when `run` is called, so a spawn failure is
    /// reported by the returned future without any further I/O.
    #[track_caller]
    pub fn run(&self, spec: SpawnSpec) -> impl Future<Output = Result<ProcessResult>> + Send {
        let spawned = self.spawn(spec);
        async move { spawned?.wait().await }
    }

    /// Starts the process and hands back a handle to it.
    ///
    /// Must be called from within a tokio runtime.
    #[track_caller]
    pub fn spawn(&self, spec: SpawnSpec) -> Result<RunningProcess> {
        let origin = CallSite::capture();
        debug!("$ {}", self.display_command(&spec));

        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        if let Some(ref cwd) = spec.cwd {
            command.current_dir(cwd);
        }
        command.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        command.stdin(Stdio::inherit());
        // A dropped handle, e.g. an abort-fast sibling, must not leave the child running.
        command.kill_on_drop(true);
        command.stdout(if spec.capture.stdout() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });
        command.stderr(if spec.capture.stderr() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });

        let mut child = command.spawn().map_err(|source| Error::Spawn {
            command: spec.command_line(),
            source,
            origin: origin.clone(),
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        debug_assert_eq!(child.stdout.is_some(), spec.capture.stdout());
        debug_assert_eq!(child.stderr.is_some(), spec.capture.stderr());

        let mut readers = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            readers.push((Stream::Stdout, pump(pipe, Stream::Stdout, tx.clone())));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push((Stream::Stderr, pump(pipe, Stream::Stderr, tx.clone())));
        }
        drop(tx);

        Ok(RunningProcess {
            pid: child.id(),
            child,
            command: spec.command_line(),
            policy: spec.policy,
            wait_for_close: spec.wait_for_close,
            origin,
            rx,
            readers,
            exit_code: self.exit_code.clone(),
        })
    }

    fn display_command(&self, spec: &SpawnSpec) -> String {
        let line = spec.command_line();
        match self.root {
            Some(ref root) => abbreviate_root(&line, &root.to_string_lossy()),
            None => line,
        }
    }
}

/// A started child process.
///
/// There is no built-in timeout. Call [`RunningProcess::kill`] and then
/// [`RunningProcess::wait`]; the kill surfaces as a signal termination.
pub struct RunningProcess {
    pid: Option<u32>,
    child: Child,
    command: String,
    policy: ExitCodePolicy,
    wait_for_close: bool,
    origin: CallSite,
    rx: mpsc::UnboundedReceiver<OutputChunk>,
    readers: Vec<(Stream, JoinHandle<Result<u64>>)>,
    exit_code: ExitCodeSlot,
}

impl RunningProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command_line(&self) -> &str {
        &self.command
    }

    /// Sends a kill signal without waiting for the child to exit.
    pub fn kill(&mut self) -> Result<()> {
        self.child.start_kill()?;
        Ok(())
    }

    pub async fn wait(mut self) -> Result<ProcessResult> {
        let status = self.child.wait().await?;

        let mut chunks = Vec::new();
        if self.wait_for_close {
            for (stream, reader) in self.readers.drain(..) {
                reader.await.map_err(|e| Error::OutputReader {
                    stream,
                    message: e.to_string(),
                })??;
            }
            while let Some(chunk) = self.rx.recv().await {
                chunks.push(chunk);
            }
        } else {
            while let Ok(chunk) = self.rx.try_recv() {
                chunks.push(chunk);
            }
            for (_, reader) in self.readers.drain(..) {
                reader.abort();
            }
        }

        self.settle(status, chunks)
    }

    fn settle(self, status: ExitStatus, chunks: Vec<OutputChunk>) -> Result<ProcessResult> {
        let mut result = ProcessResult {
            pid: self.pid,
            status: status.code(),
            signal: exit_signal(&status),
            chunks,
            error: None,
        };

        if let Some(signal) = result.signal {
            let failure = Error::Signal {
                command: self.command,
                signal,
                origin: self.origin,
            };
            surface_output(&result);
            if self.policy == ExitCodePolicy::Any {
                result.error = Some(failure);
                return Ok(result);
            }
            return Err(failure);
        }

        if let Some(code) = result.status {
            match self.policy {
                ExitCodePolicy::FixedSet(ref codes) if !codes.contains(&code) => {
                    surface_output(&result);
                    return Err(Error::ExitCode {
                        command: self.command,
                        code,
                        origin: self.origin,
                    });
                }
                ExitCodePolicy::Inherit => self.exit_code.record(code),
                _ => {}
            }
        }

        Ok(result)
    }
}

/// Replaces `root` with `<root>` where it is a whole path prefix, i.e. where
/// it is followed by a separator, whitespace or the end of the line.
fn abbreviate_root(line: &str, root: &str) -> String {
    let root = root.trim_end_matches(MAIN_SEPARATOR);
    if root.is_empty() {
        return line.to_string();
    }

    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(idx) = rest.find(root) {
        let after = &rest[idx + root.len()..];
        let whole = after
            .chars()
            .next()
            .map_or(true, |c| c == MAIN_SEPARATOR || c.is_whitespace());
        out.push_str(&rest[..idx]);
        out.push_str(if whole { ROOT_PLACEHOLDER } else { root });
        rest = after;
    }
    out.push_str(rest);
    out
}

fn surface_output(result: &ProcessResult) {
    let output = result.output();
    let output = output.trim_end();
    if !output.is_empty() {
        error!("{}", output);
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

fn pump<R>(
    mut pipe: R,
    stream: Stream,
    tx: mpsc::UnboundedSender<OutputChunk>,
) -> JoinHandle<Result<u64>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut pending: Vec<u8> = Vec::new();
        let mut total = 0u64;

        loop {
            let n = pipe.read(&mut buf).await.map_err(|e| Error::OutputReader {
                stream,
                message: e.to_string(),
            })?;
            if n == 0 {
                break;
            }
            total += n as u64;
            pending.extend_from_slice(&buf[..n]);

            let text = take_utf8(&mut pending);
            if !text.is_empty() {
                let _ = tx.send(OutputChunk { stream, text });
            }
        }

        if !pending.is_empty() {
            let text = String::from_utf8_lossy(&pending).into_owned();
            let _ = tx.send(OutputChunk { stream, text });
        }

        Ok(total)
    })
}

/// Drains the decodable prefix of `pending`, keeping a trailing partial
/// UTF-8 sequence for the next read.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_owned();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_utf8_keeps_partial_sequence() {
        let mut pending = "ab".as_bytes().to_vec();
        pending.extend_from_slice(&"é".as_bytes()[..1]);

        assert_eq!(take_utf8(&mut pending), "ab");
        assert_eq!(pending.len(), 1);

        pending.extend_from_slice(&"é".as_bytes()[1..]);
        assert_eq!(take_utf8(&mut pending), "é");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_display_command_abbreviates_root() {
        let runner = ProcessRunner::new().with_root("/work/repo");
        let spec = SpawnSpec::new("/work/repo/node_modules/.bin/tsc").arg("-p");
        assert_eq!(
            runner.display_command(&spec),
            "<root>/node_modules/.bin/tsc -p"
        );
    }

    #[test]
    fn test_display_command_ignores_longer_sibling_path() {
        let runner = ProcessRunner::new().with_root("/work/repo/");
        let spec = SpawnSpec::new("cat")
            .arg("/work/repository/x")
            .arg("/work/repo/y")
            .arg("/work/repo");
        assert_eq!(
            runner.display_command(&spec),
            "cat /work/repository/x <root>/y <root>"
        );
    }

    #[test]
    fn test_display_command_skips_filesystem_root() {
        let runner = ProcessRunner::new().with_root("/");
        let spec = SpawnSpec::new("/bin/true");
        assert_eq!(runner.display_command(&spec), "/bin/true");
    }

    #[test]
    fn test_exit_code_slot_ignores_zero() {
        let slot = ExitCodeSlot::new();
        slot.record(0);
        assert_eq!(slot.get(), None);
        slot.record(3);
        slot.record(0);
        assert_eq!(slot.get(), Some(3));
    }
}
