//! External process execution
//!
//! Runs one invocation and exposes its diagnostic output as a lazy stream
//! of progress tokens, ending in the captured tail or a typed failure.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::command::Invocation;
use crate::error::{KillReason, RunnerError};
use crate::parser::ProgressParser;
use futures::stream::{self, BoxStream, Stream};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::ffi::OsStr;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use sysinfo::System;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bytes read from stderr per poll
pub const READ_WINDOW: usize = 32;
/// Characters kept for line parsing
pub const LINE_BUFFER_CHARS: usize = 500;
/// Characters kept for the final log
pub const LOG_BUFFER_CHARS: usize = 1000;

/// Bounded trailing text buffer. Holds at most `cap` characters; older
/// text is dropped from the front.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    buf: String,
    chars: usize,
    cap: usize,
}

impl TailBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: String::new(),
            chars: 0,
            cap,
        }
    }

    pub fn push(&mut self, c: char) {
        self.buf.push(c);
        self.chars += 1;
        self.trim();
    }

    pub fn push_str(&mut self, text: &str) {
        self.buf.push_str(text);
        self.chars += text.chars().count();
        self.trim();
    }

    fn trim(&mut self) {
        if self.chars <= self.cap {
            return;
        }
        let excess = self.chars - self.cap;
        let cut = self
            .buf
            .char_indices()
            .nth(excess)
            .map(|(idx, _)| idx)
            .unwrap_or(self.buf.len());
        self.buf.drain(..cut);
        self.chars = self.cap;
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    /// Length in characters
    pub fn len(&self) -> usize {
        self.chars
    }

    pub fn is_empty(&self) -> bool {
        self.chars == 0
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.chars = 0;
    }
}

/// Lifecycle of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Spawned,
    Streaming,
    Finished,
    Failed,
    Killed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Finished | RunState::Failed | RunState::Killed)
    }
}

/// One line of tool output
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressToken {
    pub line: String,
    /// Media seconds processed, when the line carries a timecode
    pub seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Progress(ProgressToken),
    /// Clean exit with the captured log tail
    Finished(String),
}

/// Runner limits
#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    pub soft_limit: Duration,
    pub grace: Duration,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            soft_limit: Duration::from_secs(7200),
            grace: Duration::from_secs(5),
        }
    }
}

/// Spawns invocations and streams their output
#[derive(Clone)]
pub struct ProcessRunner {
    parser: Arc<dyn ProgressParser>,
    limits: RunLimits,
}

impl ProcessRunner {
    pub fn new(parser: Arc<dyn ProgressParser>, limits: RunLimits) -> Self {
        Self { parser, limits }
    }

    pub fn limits(&self) -> RunLimits {
        self.limits
    }

    /// Spawn the process. Spawn failures are returned here; everything
    /// after surfaces through the stream.
    pub fn run(
        &self,
        invocation: &Invocation,
        cancel: CancellationToken,
    ) -> Result<RunStream, RunnerError> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| RunnerError::Spawn {
            program: invocation.program.clone(),
            source: e,
        })?;
        let pid = child.id();
        let stderr = child.stderr.take();
        let states = Arc::new(Mutex::new(vec![RunState::Spawned]));

        debug!(program = %invocation.program.display(), pid = ?pid, "Process spawned");

        let reader = OutputReader {
            child,
            stderr,
            parser: self.parser.clone(),
            carry: Vec::new(),
            line: TailBuffer::new(LINE_BUFFER_CHARS),
            log: TailBuffer::new(LOG_BUFFER_CHARS),
            pending: VecDeque::new(),
            seen_output: false,
            deadline: Instant::now() + self.limits.soft_limit,
            grace: self.limits.grace,
            cancel,
            states: states.clone(),
            done: false,
        };

        let inner = stream::unfold(reader, |mut reader| async move {
            reader.next_event().await.map(|event| (event, reader))
        });

        Ok(RunStream {
            inner: Box::pin(inner),
            states,
            pid,
        })
    }

    /// Drive an invocation to completion, handing every line to `on_line`.
    /// Returns the log tail.
    pub async fn run_to_end<F>(
        &self,
        invocation: &Invocation,
        cancel: CancellationToken,
        mut on_line: F,
    ) -> Result<String, RunnerError>
    where
        F: FnMut(&ProgressToken),
    {
        use futures::StreamExt;

        let mut run = self.run(invocation, cancel)?;
        while let Some(event) = run.next().await {
            match event? {
                RunEvent::Progress(token) => on_line(&token),
                RunEvent::Finished(tail) => return Ok(tail),
            }
        }
        Err(RunnerError::NoOutput)
    }

    /// Like [`run_to_end`](Self::run_to_end) for helper tools, which may
    /// exit cleanly without printing anything.
    pub async fn run_tool(
        &self,
        invocation: &Invocation,
        cancel: CancellationToken,
    ) -> Result<String, RunnerError> {
        match self.run_to_end(invocation, cancel, |_| {}).await {
            Err(RunnerError::NoOutput) => Ok(String::new()),
            other => other,
        }
    }
}

/// Event stream of one running process
pub struct RunStream {
    inner: BoxStream<'static, Result<RunEvent, RunnerError>>,
    states: Arc<Mutex<Vec<RunState>>>,
    pid: Option<u32>,
}

impl RunStream {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// States visited so far, in order
    pub fn states(&self) -> Vec<RunState> {
        self.states
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl Stream for RunStream {
    type Item = Result<RunEvent, RunnerError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

struct OutputReader {
    child: Child,
    stderr: Option<ChildStderr>,
    parser: Arc<dyn ProgressParser>,
    carry: Vec<u8>,
    line: TailBuffer,
    log: TailBuffer,
    pending: VecDeque<ProgressToken>,
    seen_output: bool,
    deadline: Instant,
    grace: Duration,
    cancel: CancellationToken,
    states: Arc<Mutex<Vec<RunState>>>,
    done: bool,
}

enum Step {
    Read(std::io::Result<usize>),
    Cancelled,
    TimedOut,
}

impl OutputReader {
    fn enter(&self, state: RunState) {
        let mut states = self
            .states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if states.last() != Some(&state) {
            states.push(state);
        }
    }

    async fn next_event(&mut self) -> Option<Result<RunEvent, RunnerError>> {
        let mut window = [0u8; READ_WINDOW];
        loop {
            if let Some(token) = self.pending.pop_front() {
                return Some(Ok(RunEvent::Progress(token)));
            }
            if self.done {
                return None;
            }

            let step = match self.stderr.as_mut() {
                Some(stderr) => {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => Step::Cancelled,
                        _ = tokio::time::sleep_until(self.deadline) => Step::TimedOut,
                        read = stderr.read(&mut window) => Step::Read(read),
                    }
                }
                None => Step::Read(Ok(0)),
            };

            match step {
                Step::Cancelled => return Some(Err(self.kill(KillReason::Revoked).await)),
                Step::TimedOut => return Some(Err(self.kill(KillReason::TimedOut).await)),
                Step::Read(Ok(0)) => {
                    self.flush_line();
                    if let Some(token) = self.pending.pop_front() {
                        return Some(Ok(RunEvent::Progress(token)));
                    }
                    return Some(self.finish().await);
                }
                Step::Read(Ok(n)) => {
                    self.enter(RunState::Streaming);
                    self.seen_output = true;
                    self.feed(&window[..n]);
                }
                Step::Read(Err(e)) => {
                    self.enter(RunState::Failed);
                    self.done = true;
                    self.terminate().await;
                    return Some(Err(RunnerError::Io(e)));
                }
            }
        }
    }

    fn feed(&mut self, bytes: &[u8]) {
        let text = decode_window(&mut self.carry, bytes);
        for c in text.chars() {
            self.log.push(c);
            if c == '\r' || c == '\n' {
                self.flush_line();
            } else {
                self.line.push(c);
            }
        }
    }

    fn flush_line(&mut self) {
        if self.line.is_empty() {
            return;
        }
        let line = self.line.as_str().to_string();
        let seconds = self.parser.parse(&line);
        self.pending.push_back(ProgressToken { line, seconds });
        self.line.clear();
    }

    async fn finish(&mut self) -> Result<RunEvent, RunnerError> {
        self.done = true;
        // stderr closed first, the exit status follows
        self.stderr = None;
        self.enter(RunState::Streaming);

        let status = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(self.kill(KillReason::Revoked).await),
            _ = tokio::time::sleep_until(self.deadline) => return Err(self.kill(KillReason::TimedOut).await),
            status = self.child.wait() => status,
        };

        let tail = self.log.as_str().to_string();
        match status {
            Ok(status) if status.success() && self.seen_output => {
                self.enter(RunState::Finished);
                Ok(RunEvent::Finished(tail))
            }
            Ok(status) if status.success() => {
                self.enter(RunState::Failed);
                Err(RunnerError::NoOutput)
            }
            Ok(status) => {
                self.enter(RunState::Failed);
                Err(RunnerError::EncodeFailure {
                    code: status.code(),
                    tail,
                })
            }
            Err(e) => {
                self.enter(RunState::Failed);
                Err(RunnerError::Io(e))
            }
        }
    }

    async fn kill(&mut self, reason: KillReason) -> RunnerError {
        warn!(pid = ?self.child.id(), reason = %reason, "Stopping process");
        self.enter(RunState::Streaming);
        self.done = true;
        self.stderr = None;
        self.terminate().await;
        self.enter(RunState::Killed);
        RunnerError::Killed {
            reason,
            tail: self.log.as_str().to_string(),
        }
    }

    /// SIGTERM, then SIGKILL once the grace period runs out. A process that
    /// already exited is left alone.
    async fn terminate(&mut self) {
        if let Some(pid) = self.child.id() {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid = pid, error = %e, "SIGTERM not delivered");
            }
        }
        if tokio::time::timeout(self.grace, self.child.wait()).await.is_err() {
            if let Err(e) = self.child.kill().await {
                warn!(error = %e, "Failed to kill process");
            }
        }
    }
}

/// Decode a read window, holding back a trailing partial UTF-8 sequence
fn decode_window(carry: &mut Vec<u8>, bytes: &[u8]) -> String {
    carry.extend_from_slice(bytes);
    match std::str::from_utf8(carry) {
        Ok(text) => {
            let text = text.to_string();
            carry.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let text = String::from_utf8_lossy(&carry[..valid]).into_owned();
            carry.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(carry).into_owned();
            carry.clear();
            text
        }
    }
}

#[derive(Debug, Clone)]
struct RegisteredProcess {
    cancel: CancellationToken,
    pid: Option<u32>,
}

/// Revoked task ids remembered per worker
const REVOKED_MEMORY: usize = 1024;

/// Worker-local map of task id to running process, plus the most recent
/// revocations so a revoked task delivered later is not run
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<HashMap<String, RegisteredProcess>>>,
    revoked: Arc<Mutex<VecDeque<String>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashMap<String, RegisteredProcess>) -> R) -> R {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut map)
    }

    /// Register a task and get the token that stops its processes
    pub fn register(&self, task_id: &str) -> CancellationToken {
        let cancel = CancellationToken::new();
        let entry = RegisteredProcess {
            cancel: cancel.clone(),
            pid: None,
        };
        self.with(|map| map.insert(task_id.to_string(), entry));
        cancel
    }

    pub fn set_pid(&self, task_id: &str, pid: Option<u32>) {
        self.with(|map| {
            if let Some(entry) = map.get_mut(task_id) {
                entry.pid = pid;
            }
        });
    }

    pub fn pid(&self, task_id: &str) -> Option<u32> {
        self.with(|map| map.get(task_id).and_then(|e| e.pid))
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.with(|map| map.contains_key(task_id))
    }

    /// Cancel a registered task. Returns false if this worker does not run it.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.with(|map| map.get(task_id).cloned()) {
            Some(entry) => {
                info!(task_id = %task_id, pid = ?entry.pid, "Cancelling registered process");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, task_id: &str) {
        self.with(|map| map.remove(task_id));
    }

    /// Remember a revocation, forgetting the oldest past the cap
    pub fn mark_revoked(&self, task_id: &str) {
        let mut revoked = self
            .revoked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if revoked.iter().any(|id| id == task_id) {
            return;
        }
        if revoked.len() >= REVOKED_MEMORY {
            revoked.pop_front();
        }
        revoked.push_back(task_id.to_string());
    }

    pub fn is_revoked(&self, task_id: &str) -> bool {
        self.revoked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .any(|id| id == task_id)
    }

    pub fn len(&self) -> usize {
        self.with(|map| map.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lossy<S: AsRef<OsStr>>(arg: &S) -> String {
    arg.as_ref().to_string_lossy().into_owned()
}

/// Kill every ffmpeg process whose command line mentions `working_file`.
/// Returns the number of processes signalled.
pub fn kill_by_pattern(working_file: &Path) -> Result<usize, RunnerError> {
    let needle = working_file.to_string_lossy();
    if needle.is_empty() {
        return Ok(0);
    }
    let pattern = Regex::new(&format!("ffmpeg.*{}", regex::escape(&needle)))?;

    let mut system = System::new();
    system.refresh_all();

    let mut killed = 0;
    for (pid, process) in system.processes() {
        let cmdline = process.cmd().iter().map(lossy).collect::<Vec<_>>().join(" ");
        if pattern.is_match(&cmdline) && process.kill() {
            info!(pid = %pid, "Killed process by command line match");
            killed += 1;
        }
    }
    Ok(killed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::FfmpegTimecodeParser;
    use futures::StreamExt;
    use proptest::prelude::*;

    fn runner(soft_limit: Duration) -> ProcessRunner {
        ProcessRunner::new(
            Arc::new(FfmpegTimecodeParser),
            RunLimits {
                soft_limit,
                grace: Duration::from_millis(500),
            },
        )
    }

    fn sh(script: &str) -> Invocation {
        Invocation::new("/bin/sh").arg("-c").arg(script)
    }

    #[test]
    fn test_tail_buffer_keeps_latest() {
        let mut buf = TailBuffer::new(5);
        buf.push_str("abc");
        buf.push_str("defg");
        assert_eq!(buf.as_str(), "cdefg");
        assert_eq!(buf.len(), 5);

        let mut wide = TailBuffer::new(3);
        wide.push_str("héllo wörld");
        assert_eq!(wide.as_str(), "rld");
    }

    #[test]
    fn test_decode_window_carries_partial_sequence() {
        let mut carry = Vec::new();
        let bytes = "é".as_bytes();
        assert_eq!(decode_window(&mut carry, &bytes[..1]), "");
        assert_eq!(decode_window(&mut carry, &bytes[1..]), "é");
        assert!(carry.is_empty());
    }

    proptest! {
        #[test]
        fn prop_tail_buffer_never_exceeds_cap(
            cap in 0usize..64,
            chunks in prop::collection::vec(".{0,40}", 0..30),
        ) {
            let mut buf = TailBuffer::new(cap);
            let mut all = String::new();
            for chunk in &chunks {
                buf.push_str(chunk);
                all.push_str(chunk);
                prop_assert!(buf.len() <= cap);
                prop_assert_eq!(buf.as_str().chars().count(), buf.len());
            }
            prop_assert!(all.ends_with(buf.as_str()));
        }
    }

    #[tokio::test]
    async fn test_streams_progress_then_finishes() {
        let script = "printf 'frame=1 time=00:00:01.50 bitrate=1\\rframe=2 time=00:00:03.00\\n' >&2";
        let mut run = runner(Duration::from_secs(10))
            .run(&sh(script), CancellationToken::new())
            .unwrap();

        let mut seconds = Vec::new();
        let mut tail = None;
        while let Some(event) = run.next().await {
            match event.unwrap() {
                RunEvent::Progress(token) => seconds.push(token.seconds),
                RunEvent::Finished(t) => tail = Some(t),
            }
        }

        assert_eq!(seconds, vec![Some(1.5), Some(3.0)]);
        assert!(tail.unwrap().contains("time=00:00:03.00"));
        assert_eq!(
            run.states(),
            vec![RunState::Spawned, RunState::Streaming, RunState::Finished]
        );
    }

    #[tokio::test]
    async fn test_non_zero_exit_carries_tail() {
        let script = "echo 'Invalid data found when processing input' >&2; exit 1";
        let err = runner(Duration::from_secs(10))
            .run_to_end(&sh(script), CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        match err {
            RunnerError::EncodeFailure { code, tail } => {
                assert_eq!(code, Some(1));
                assert!(tail.contains("Invalid data found"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_silent_success_is_no_output() {
        let err = runner(Duration::from_secs(10))
            .run_to_end(&sh("exit 0"), CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::NoOutput));
    }

    #[tokio::test]
    async fn test_silent_tool_succeeds() {
        let tail = runner(Duration::from_secs(10))
            .run_tool(&sh("exit 0"), CancellationToken::new())
            .await
            .unwrap();
        assert!(tail.is_empty());

        let err = runner(Duration::from_secs(10))
            .run_tool(&sh("exit 2"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::EncodeFailure { code: Some(2), .. }));
    }

    #[tokio::test]
    async fn test_tool_is_bounded_by_soft_limit() {
        let err = runner(Duration::from_millis(200))
            .run_tool(&sh("exec sleep 30"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RunnerError::Killed {
                reason: KillReason::TimedOut,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let err = runner(Duration::from_secs(1))
            .run(&Invocation::new("/nonexistent/ffmpeg"), CancellationToken::new())
            .err()
            .unwrap();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_cancel_kills_process() {
        let cancel = CancellationToken::new();
        let mut run = runner(Duration::from_secs(30))
            .run(&sh("echo started >&2; sleep 30"), cancel.clone())
            .unwrap();

        let first = run.next().await.unwrap().unwrap();
        assert!(matches!(first, RunEvent::Progress(_)));

        cancel.cancel();
        let err = run.next().await.unwrap().unwrap_err();
        match err {
            RunnerError::Killed { reason, tail } => {
                assert_eq!(reason, KillReason::Revoked);
                assert!(tail.contains("started"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(run.next().await.is_none());
        assert_eq!(run.states().last(), Some(&RunState::Killed));
    }

    #[tokio::test]
    async fn test_soft_limit_times_out() {
        let err = runner(Duration::from_millis(200))
            .run_to_end(&sh("sleep 30"), CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RunnerError::Killed {
                reason: KillReason::TimedOut,
                ..
            }
        ));
    }

    #[test]
    fn test_registry_cancel() {
        let registry = ProcessRegistry::new();
        let token = registry.register("task-1");
        registry.set_pid("task-1", Some(42));
        assert_eq!(registry.pid("task-1"), Some(42));

        assert!(registry.cancel("task-1"));
        assert!(token.is_cancelled());
        assert!(!registry.cancel("task-2"));

        registry.remove("task-1");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_revoked_memory_is_bounded() {
        let registry = ProcessRegistry::new();
        registry.mark_revoked("first");
        registry.mark_revoked("first");
        assert!(registry.is_revoked("first"));
        for i in 0..REVOKED_MEMORY {
            registry.mark_revoked(&format!("task-{}", i));
        }
        assert!(!registry.is_revoked("first"));
        assert!(registry.is_revoked(&format!("task-{}", REVOKED_MEMORY - 1)));
    }

    #[test]
    fn test_kill_by_pattern_without_match() {
        let killed = kill_by_pattern(Path::new("/tmp/no-such-encode-8f1e2d.mp4")).unwrap();
        assert_eq!(killed, 0);
    }
}
