/*!
Per-connection request handling: parse, route, validate, then hand the response over to
the streaming bridge.

No process is started unless the request is a well-formed `POST /api/cli` whose command
passes the allow-list.
*/

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsFd;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::errors::GatewayError;
use crate::gateway::bridge::{self, BridgeOptions, CancelSignal, RelayOutcome, StreamState};
use crate::gateway::command::{self, ResolvedCommand};
use crate::gateway::config::GatewayConfig;
use crate::gateway::http::{self, Endpoint, Method};
use crate::gateway::supervisor;

const LINGER_TIMEOUT: Duration = Duration::from_millis(100);
const LINGER_MAX_BYTES: usize = 64 * 1024;

/// Transport operations the handler needs beyond Read + Write.
pub trait ClientConnection: Read + Write {
    /// Start watching for the peer going away; set `cancel` when it does.
    fn watch_disconnect(&self, cancel: CancelSignal);
    /// Drop any read timeout used while the request was being read.
    fn clear_read_timeout(&self);
    fn close(&self);
}

impl ClientConnection for TcpStream {
    fn watch_disconnect(&self, cancel: CancelSignal) {
        let watched = match self.try_clone() {
            Ok(s) => s,
            Err(e) => {
                warn!("cannot watch for disconnect: {e}");
                return;
            }
        };
        std::thread::spawn(move || {
            let mut reader = &watched;
            let mut buf = [0u8; 512];
            loop {
                match reader.read(&mut buf) {
                    // Half-close: the client may still be reading the response.
                    Ok(0) => break,
                    // Bytes after the request body are ignored.
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => {
                        cancel.cancel();
                        return;
                    }
                }
            }
            if wait_for_hangup(&watched, &cancel) {
                cancel.cancel();
            }
        });
    }

    fn clear_read_timeout(&self) {
        let _ = self.set_read_timeout(None);
    }

    fn close(&self) {
        let _ = self.shutdown(Shutdown::Write);
        // Unread request bytes would turn the close into a reset and eat the response.
        let _ = self.set_read_timeout(Some(LINGER_TIMEOUT));
        let mut sink = [0u8; 1024];
        let mut drained = 0usize;
        let mut reader: &TcpStream = self;
        while drained < LINGER_MAX_BYTES {
            match reader.read(&mut sink) {
                Ok(0) | Err(_) => break,
                Ok(n) => drained += n,
            }
        }
        let _ = self.shutdown(Shutdown::Both);
    }
}

const HANGUP_POLL: u16 = 200;

/// After the peer's FIN, only a reset or error ends the connection. Returns true on hangup,
/// false once `cancel` is already set.
fn wait_for_hangup(stream: &TcpStream, cancel: &CancelSignal) -> bool {
    let gone = PollFlags::POLLHUP | PollFlags::POLLERR;
    while !cancel.is_cancelled() {
        // POLLHUP and POLLERR are reported without being requested.
        let mut fds = [PollFd::new(stream.as_fd(), PollFlags::empty())];
        match poll(&mut fds, PollTimeout::from(HANGUP_POLL)) {
            Ok(0) => continue,
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                if revents.intersects(gone | PollFlags::POLLNVAL) {
                    return true;
                }
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!("disconnect watch failed: {e}");
                return false;
            }
        }
    }
    false
}

/// Shared, read-only state for every connection.
#[derive(Debug, Clone)]
pub struct GatewayCtx {
    pub config: GatewayConfig,
}

impl GatewayCtx {
    pub fn new(config: GatewayConfig) -> Self {
        GatewayCtx { config }
    }
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    #[serde(default)]
    command: Option<String>,
}

/// 32 hex chars from the OS RNG; falls back to time and pid if the RNG is unavailable.
pub fn new_request_id() -> String {
    let mut bytes = [0u8; 16];
    if getrandom::getrandom(&mut bytes).is_err() {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let v = now ^ ((std::process::id() as u128) << 64);
        bytes = v.to_be_bytes();
    }
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn reject<S: Write>(stream: &mut S, request_id: &str, err: &GatewayError) {
    debug!(request_id, "rejecting request: {err}");
    let _ = http::respond_json_error(
        stream,
        err.status_line(),
        Some(request_id),
        &err.client_message(),
    );
}

/// Validate the body of a `POST /api/cli` request into a runnable command.
pub fn parse_command(body: &[u8], config: &GatewayConfig) -> Result<ResolvedCommand, GatewayError> {
    let req: CommandRequest = serde_json::from_slice(body)
        .map_err(|_| GatewayError::BadRequest("Invalid request body".to_string()))?;
    let raw = req.command.unwrap_or_default();
    Ok(command::resolve_with(&raw, &config.limits)?)
}

/// Handle one accepted connection end to end.
pub fn handle_connection<S: ClientConnection>(ctx: &GatewayCtx, stream: &mut S) {
    let started = Instant::now();
    let request_id = new_request_id();
    let rid = request_id.as_str();

    let req = match http::read_http_request(stream) {
        Ok(r) => r,
        Err(e) => {
            match e.kind() {
                io::ErrorKind::InvalidInput => {
                    let _ = http::respond_json_error(
                        stream,
                        "431 Request Header Fields Too Large",
                        Some(rid),
                        "Request headers too large",
                    );
                }
                // Peer left before sending anything useful.
                io::ErrorKind::UnexpectedEof => {}
                _ => {
                    let _ = http::respond_json_error(
                        stream,
                        "400 Bad Request",
                        Some(rid),
                        "Bad request",
                    );
                }
            }
            debug!(request_id = rid, "unreadable request: {e}");
            stream.close();
            return;
        }
    };

    match (http::classify_endpoint(&req.path_lc), &req.method) {
        (Some(Endpoint::Health), Method::Get) => {
            let _ = http::respond_json(stream, "200 OK", Some(rid), br#"{"status":"ok"}"#);
        }
        (Some(Endpoint::Cli), Method::Post) => {
            handle_cli(ctx, stream, &req.body, rid, started);
        }
        (Some(_), _) => {
            let _ = http::respond_json_error(
                stream,
                "405 Method Not Allowed",
                Some(rid),
                "Method not allowed",
            );
        }
        (None, _) => {
            let _ = http::respond_json_error(stream, "404 Not Found", Some(rid), "Not found");
        }
    }
    stream.close();
}

fn handle_cli<S: ClientConnection>(
    ctx: &GatewayCtx,
    stream: &mut S,
    body: &[u8],
    rid: &str,
    started: Instant,
) {
    let cfg = &ctx.config;
    let command = match parse_command(body, cfg) {
        Ok(c) => c,
        Err(e) => {
            info!(request_id = rid, status = 400, "rejected: {e}");
            reject(stream, rid, &e);
            return;
        }
    };

    let mut handle = match supervisor::start(&cfg.interpreter, &command, &cfg.supervisor, rid) {
        Ok(h) => h,
        Err(e) => {
            error!(request_id = rid, operation = %command.operation(), "{e}");
            reject(stream, rid, &e);
            return;
        }
    };

    stream.clear_read_timeout();
    let cancel = CancelSignal::new();
    stream.watch_disconnect(cancel.clone());

    let opts = BridgeOptions {
        poll_interval: cfg.poll_interval,
    };
    let RelayOutcome {
        state,
        exit_code,
        bytes,
        chunks,
    } = bridge::relay(stream, &mut handle, &cancel, &opts, rid);

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let exit = exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string());
    match state {
        StreamState::Aborted => warn!(
            request_id = rid,
            operation = %command.operation(),
            pid = handle.pid(),
            state = state.as_str(),
            exit = %exit,
            bytes,
            chunks,
            elapsed_ms,
            "request aborted"
        ),
        _ => info!(
            request_id = rid,
            operation = %command.operation(),
            pid = handle.pid(),
            state = state.as_str(),
            exit = %exit,
            bytes,
            chunks,
            elapsed_ms,
            "request finished"
        ),
    }
}
