/*!
Streaming response bridge.

Relays child stdout to the client as HTTP/1.1 chunks while racing three signals: the
next output chunk, child termination and client cancellation. Whichever wins decides
the single terminal state of the response.

Wire contract:
- The 200 prelude is deferred until the first chunk (or until the child exits cleanly).
- Exit 0: last chunk with `X-Exit-Code: 0`.
- Exit != 0 after bytes were sent: last chunk with `X-Exit-Code: <code>` and `X-Error`.
- Exit != 0 before any byte: `502` JSON error instead of a stream.
- Cancellation: child is cancelled, nothing else is written.
*/

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::GatewayError;
use crate::gateway::http;
use crate::gateway::supervisor::{ExitResult, ProcessHandle};

/// Request-scoped cancellation flag, set when the client goes away.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        CancelSignal::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Transport-facing state of one streamed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    ClosedSuccess,
    ClosedError(i32),
    Aborted,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamState::Open)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Open => "open",
            StreamState::ClosedSuccess => "closed-success",
            StreamState::ClosedError(_) => "closed-error",
            StreamState::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeOptions {
    /// Upper bound on how long a cancellation can go unnoticed.
    pub poll_interval: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        BridgeOptions {
            poll_interval: crate::gateway::config::DEFAULT_POLL_INTERVAL,
        }
    }
}

/// What happened on the wire, for the request log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub state: StreamState,
    pub exit_code: Option<i32>,
    pub bytes: usize,
    pub chunks: usize,
}

struct Bridge<'a, W: Write> {
    out: &'a mut W,
    request_id: &'a str,
    state: StreamState,
    prelude_sent: bool,
    exit_code: Option<i32>,
    bytes: usize,
    chunks: usize,
}

impl<'a, W: Write> Bridge<'a, W> {
    fn transition(&mut self, next: StreamState) {
        debug_assert!(!self.state.is_terminal(), "stream already {:?}", self.state);
        debug_assert!(next.is_terminal());
        if !self.state.is_terminal() {
            self.state = next;
        }
    }

    fn ensure_prelude(&mut self) -> std::io::Result<()> {
        if !self.prelude_sent {
            http::respond_chunked_prelude(self.out, self.request_id)?;
            self.prelude_sent = true;
        }
        Ok(())
    }

    fn abort(&mut self, handle: &mut ProcessHandle, cancel: &CancelSignal, why: &str) {
        cancel.cancel();
        warn!(request_id = self.request_id, pid = handle.pid(), "client gone ({why}); cancelling child");
        handle.cancel();
        self.exit_code = handle.try_wait().ok().flatten().map(|r| r.code());
        self.transition(StreamState::Aborted);
    }

    fn forward(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.ensure_prelude()?;
        http::respond_chunked_write_chunk(self.out, chunk)?;
        self.bytes = self.bytes.saturating_add(chunk.len());
        self.chunks = self.chunks.saturating_add(1);
        Ok(())
    }

    fn finish(&mut self, result: ExitResult) {
        self.exit_code = Some(result.code());
        let written = match result {
            ExitResult::Success => self
                .ensure_prelude()
                .and_then(|_| http::respond_chunked_trailer(self.out, 0, None)),
            ExitResult::ProcessFailed(code) => {
                let msg = GatewayError::ProcessFailed(code).client_message();
                if self.prelude_sent {
                    http::respond_chunked_trailer(self.out, code, Some(&msg))
                } else {
                    http::respond_json_error(
                        self.out,
                        GatewayError::ProcessFailed(code).status_line(),
                        Some(self.request_id),
                        &msg,
                    )
                }
            }
        };
        match written {
            Ok(()) => self.transition(match result {
                ExitResult::Success => StreamState::ClosedSuccess,
                ExitResult::ProcessFailed(code) => StreamState::ClosedError(code),
            }),
            Err(e) => {
                debug!(request_id = self.request_id, "final write failed: {e}");
                self.transition(StreamState::Aborted);
            }
        }
    }
}

/// Drive one response to its terminal state. The child is reaped before this returns.
pub fn relay<W: Write>(
    out: &mut W,
    handle: &mut ProcessHandle,
    cancel: &CancelSignal,
    opts: &BridgeOptions,
    request_id: &str,
) -> RelayOutcome {
    let mut bridge = Bridge {
        out,
        request_id,
        state: StreamState::Open,
        prelude_sent: false,
        exit_code: None,
        bytes: 0,
        chunks: 0,
    };
    let poll = opts.poll_interval.max(Duration::from_millis(1));

    // Phase 1: stream stdout until EOF.
    if let Some(rx) = handle.take_output() {
        loop {
            if cancel.is_cancelled() {
                bridge.abort(handle, cancel, "disconnect");
                break;
            }
            match rx.recv_timeout(poll) {
                Ok(chunk) => {
                    if let Err(e) = bridge.forward(&chunk) {
                        bridge.abort(handle, cancel, &format!("write failed: {}", e.kind()));
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    // Phase 2: stdout closed; wait for exit unless the client leaves first.
    while !bridge.state.is_terminal() {
        if cancel.is_cancelled() {
            bridge.abort(handle, cancel, "disconnect");
            break;
        }
        match handle.wait_timeout(poll) {
            Ok(Some(result)) => bridge.finish(result),
            Ok(None) => continue,
            Err(e) => {
                warn!(request_id, pid = handle.pid(), "wait failed: {e}");
                handle.cancel();
                let result = handle
                    .try_wait()
                    .ok()
                    .flatten()
                    .unwrap_or(ExitResult::ProcessFailed(1));
                bridge.finish(result);
            }
        }
    }

    // Every path above ends with the child reaped; cancel() makes sure of it.
    handle.cancel();

    RelayOutcome {
        state: bridge.state,
        exit_code: bridge.exit_code,
        bytes: bridge.bytes,
        chunks: bridge.chunks,
    }
}
