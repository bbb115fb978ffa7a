/*!
Process supervision: one child per accepted request.

- The child leads its own process group; termination signals go to the whole group.
- stdout is pumped into a bounded channel by a reader thread. Sends block when the
  channel is full, so bytes keep their order and memory stays bounded.
- stderr is drained by a second thread and logged; it never reaches the client.
- cancel(): TERM, wait up to the grace period, then KILL and reap. Idempotent.
- Dropping an unreaped handle cancels it.
- Live process groups are tracked process-wide so shutdown can stop them all.
- Once the leader is reaped, the rest of its group gets a best-effort TERM.
*/

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::errors::GatewayError;
use crate::gateway::command::ResolvedCommand;
use crate::gateway::config::{Interpreter, SupervisorSettings};

/// Longest stderr piece logged as one line.
pub const STDERR_LINE_CAP: usize = 8 * 1024;

static LIVE_GROUPS: Lazy<Mutex<HashSet<u32>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn live_groups() -> std::sync::MutexGuard<'static, HashSet<u32>> {
    LIVE_GROUPS.lock().unwrap_or_else(|e| e.into_inner())
}

/// Process group ids of children that have not been reaped yet.
pub fn live_process_groups() -> Vec<u32> {
    live_groups().iter().copied().collect()
}

fn signal_groups(groups: &[u32], sig: Signal) {
    for &pgid in groups {
        let _ = killpg(Pid::from_raw(pgid as i32), sig);
    }
}

fn wait_for_reaps(deadline: Instant, among: &[u32]) -> Vec<u32> {
    loop {
        let left: Vec<u32> = {
            let live = live_groups();
            among.iter().copied().filter(|g| live.contains(g)).collect()
        };
        if left.is_empty() || Instant::now() >= deadline {
            return left;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Stop every live child: TERM to each group, KILL to whatever is left after `grace`.
/// Owning request threads do the reaping; this waits for them for a bounded time.
pub fn terminate_all(grace: Duration) {
    let groups = live_process_groups();
    if groups.is_empty() {
        return;
    }
    warn!(count = groups.len(), "terminating live children");
    signal_groups(&groups, Signal::SIGTERM);
    let left = wait_for_reaps(Instant::now() + grace, &groups);
    if left.is_empty() {
        return;
    }
    warn!(count = left.len(), "children ignored SIGTERM; sending SIGKILL");
    signal_groups(&left, Signal::SIGKILL);
    let _ = wait_for_reaps(Instant::now() + Duration::from_secs(1), &left);
}

/// How a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitResult {
    Success,
    /// Non-zero exit. A child killed by signal `n` reports `128 + n`.
    ProcessFailed(i32),
}

impl ExitResult {
    pub fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => ExitResult::Success,
            Some(code) => ExitResult::ProcessFailed(code),
            None => ExitResult::ProcessFailed(128 + status.signal().unwrap_or(0)),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            ExitResult::Success => 0,
            ExitResult::ProcessFailed(code) => *code,
        }
    }
}

/// A live (or just-exited) child owned by exactly one request.
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    request_id: String,
    output: Option<Receiver<Vec<u8>>>,
    status: Option<ExitStatus>,
    cancelled: bool,
    grace_period: Duration,
}

/// Launch the interpreter for `command`.
pub fn start(
    interpreter: &Interpreter,
    command: &ResolvedCommand,
    settings: &SupervisorSettings,
    request_id: &str,
) -> Result<ProcessHandle, GatewayError> {
    let mut cmd = Command::new(&interpreter.program);
    cmd.arg(&interpreter.entry_point);
    cmd.args(command.argv());
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| GatewayError::Spawn {
        program: interpreter.program.clone(),
        source,
    })?;
    let pid = child.id();
    live_groups().insert(pid);
    debug!(request_id, pid, operation = %command.operation(), "spawned child");

    let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(settings.channel_capacity.max(1));
    if let Some(so) = child.stdout.take() {
        let chunk = settings.read_chunk.max(1);
        std::thread::spawn(move || pump_stdout(so, tx, chunk));
    }
    if let Some(se) = child.stderr.take() {
        let rid = request_id.to_string();
        std::thread::spawn(move || {
            for_each_stderr_line(se, STDERR_LINE_CAP, |text| {
                warn!(request_id = %rid, pid, "child stderr: {}", text);
            })
        });
    }

    Ok(ProcessHandle {
        child,
        pid,
        request_id: request_id.to_string(),
        output: Some(rx),
        status: None,
        cancelled: false,
        grace_period: settings.grace_period,
    })
}

fn pump_stdout(mut so: ChildStdout, tx: SyncSender<Vec<u8>>, chunk: usize) {
    let mut buf = vec![0u8; chunk];
    loop {
        match so.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                // Receiver gone: the request is over, stop reading.
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

/// Feed `src` to `emit` line by line. Lines longer than `cap` bytes arrive in pieces.
fn for_each_stderr_line<R: Read, F: FnMut(&str)>(src: R, cap: usize, mut emit: F) {
    let mut reader = BufReader::new(src);
    let mut line = Vec::with_capacity(256);
    loop {
        line.clear();
        match (&mut reader).take(cap.max(1) as u64).read_until(b'\n', &mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if !text.is_empty() {
                    emit(text);
                }
            }
        }
    }
}

impl ProcessHandle {
    fn record_status(&mut self, st: ExitStatus) {
        self.status = Some(st);
        // Stragglers left in the group by the leader; the group may already be empty.
        let _ = killpg(Pid::from_raw(self.pid as i32), Signal::SIGTERM);
        live_groups().remove(&self.pid);
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Take the stdout channel. The bridge owns it from then on.
    pub fn take_output(&mut self) -> Option<Receiver<Vec<u8>>> {
        self.output.take()
    }

    /// True once the child has been reaped.
    pub fn is_reaped(&self) -> bool {
        self.status.is_some()
    }

    /// True if termination was requested through cancel().
    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitResult>> {
        if let Some(st) = self.status {
            return Ok(Some(ExitResult::from_status(st)));
        }
        let st = self.child.try_wait()?;
        if let Some(st) = st {
            self.record_status(st);
        }
        Ok(st.map(ExitResult::from_status))
    }

    pub fn wait_timeout(&mut self, timeout: Duration) -> std::io::Result<Option<ExitResult>> {
        if let Some(st) = self.status {
            return Ok(Some(ExitResult::from_status(st)));
        }
        let st = self.child.wait_timeout(timeout)?;
        if let Some(st) = st {
            self.record_status(st);
        }
        Ok(st.map(ExitResult::from_status))
    }

    /// Block until the child exits.
    pub fn wait(&mut self) -> std::io::Result<ExitResult> {
        if let Some(st) = self.status {
            return Ok(ExitResult::from_status(st));
        }
        let st = self.child.wait()?;
        self.record_status(st);
        Ok(ExitResult::from_status(st))
    }

    /// Terminate the child: TERM to the group, KILL after the grace period, then reap.
    /// A no-op once the child has been reaped.
    pub fn cancel(&mut self) {
        if self.status.is_some() {
            return;
        }
        if let Ok(Some(st)) = self.child.try_wait() {
            self.record_status(st);
            return;
        }
        self.cancelled = true;
        let pgid = Pid::from_raw(self.pid as i32);
        debug!(request_id = %self.request_id, pid = self.pid, "sending SIGTERM to child group");
        let _ = killpg(pgid, Signal::SIGTERM);

        match self.child.wait_timeout(self.grace_period) {
            Ok(Some(st)) => {
                self.record_status(st);
                return;
            }
            Ok(None) => {
                warn!(
                    request_id = %self.request_id,
                    pid = self.pid,
                    grace_ms = self.grace_period.as_millis() as u64,
                    "child ignored SIGTERM; sending SIGKILL"
                );
            }
            Err(e) => {
                warn!(request_id = %self.request_id, pid = self.pid, "wait after SIGTERM failed: {e}");
            }
        }
        let _ = killpg(pgid, Signal::SIGKILL);
        // Fall back to the leader alone if the group is already gone.
        let _ = self.child.kill();
        match self.child.wait() {
            Ok(st) => self.record_status(st),
            Err(e) => {
                warn!(request_id = %self.request_id, pid = self.pid, "reap after SIGKILL failed: {e}");
                live_groups().remove(&self.pid);
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.status.is_none() {
            self.cancel();
        }
    }
}
