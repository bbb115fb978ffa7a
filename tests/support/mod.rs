/*!
Test support helpers shared across integration tests.

- stub_interpreter(dir, body): `/bin/sh` plus a script written into `dir`
- start_gateway(interp): gateway on an ephemeral loopback port with short timings
- post_command / send_raw: raw HTTP/1.1 over TCP, response parsed (chunked bodies decoded)
- wait_until / pid_alive: polling helpers for process assertions
- abort_connection(stream): close with a reset
*/

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::time::{Duration, Instant};

use pai_gateway::{gateway_start, GatewayConfig, GatewayServer, Interpreter, SupervisorSettings};

/// Write `body` as the entry point script and run it with `/bin/sh`.
#[allow(dead_code)]
pub fn stub_interpreter(dir: &Path, body: &str) -> Interpreter {
    let script = dir.join("pai.sh");
    std::fs::write(&script, body).expect("write stub entry point");
    Interpreter::new("/bin/sh", script)
}

#[allow(dead_code)]
pub fn test_config(interpreter: Interpreter) -> GatewayConfig {
    GatewayConfig {
        bind: SocketAddr::from(([127, 0, 0, 1], 0)),
        interpreter,
        supervisor: SupervisorSettings {
            grace_period: Duration::from_millis(500),
            ..SupervisorSettings::default()
        },
        read_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(20),
        ..GatewayConfig::default()
    }
}

#[allow(dead_code)]
pub fn start_gateway(interpreter: Interpreter) -> GatewayServer {
    gateway_start(test_config(interpreter)).expect("start gateway")
}

/// A parsed response. `body` is de-chunked when the response was chunked.
#[derive(Debug, Default)]
pub struct RawResponse {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
    pub trailers: Vec<(String, String)>,
    pub chunked: bool,
    /// False when a chunked body ended without its terminal chunk.
    pub complete: bool,
}

#[allow(dead_code)]
impl RawResponse {
    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|l| {
            let (k, v) = l.split_once(':')?;
            k.trim()
                .eq_ignore_ascii_case(name)
                .then(|| v.trim().to_string())
        })
    }

    pub fn trailer(&self, name: &str) -> Option<&str> {
        self.trailers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn find_crlfcrlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Parse a complete response as read until EOF.
#[allow(dead_code)]
pub fn parse_response(raw: &[u8]) -> RawResponse {
    let Some(hend) = find_crlfcrlf(raw) else {
        return RawResponse {
            head: String::from_utf8_lossy(raw).into_owned(),
            ..RawResponse::default()
        };
    };
    let head = String::from_utf8_lossy(&raw[..hend]).into_owned();
    let status = head
        .lines()
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let mut resp = RawResponse {
        status,
        head,
        ..RawResponse::default()
    };
    let chunked = resp
        .header("transfer-encoding")
        .map(|v| v.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false);
    if !chunked {
        resp.body = raw[hend..].to_vec();
        resp.complete = true;
        return resp;
    }
    resp.chunked = true;
    let mut rest = &raw[hend..];
    loop {
        let Some(nl) = rest.windows(2).position(|w| w == b"\r\n") else {
            return resp;
        };
        let size_line = String::from_utf8_lossy(&rest[..nl]).into_owned();
        let Ok(size) = usize::from_str_radix(size_line.split(';').next().unwrap_or("").trim(), 16)
        else {
            return resp;
        };
        rest = &rest[nl + 2..];
        if size == 0 {
            for line in String::from_utf8_lossy(rest).split("\r\n") {
                if let Some((k, v)) = line.split_once(':') {
                    resp.trailers.push((k.trim().to_string(), v.trim().to_string()));
                }
            }
            resp.complete = true;
            return resp;
        }
        if rest.len() < size + 2 {
            resp.body.extend_from_slice(&rest[..size.min(rest.len())]);
            return resp;
        }
        resp.body.extend_from_slice(&rest[..size]);
        rest = &rest[size + 2..];
    }
}

/// Send `request` verbatim and read the response until the server closes.
#[allow(dead_code)]
pub fn send_raw(addr: SocketAddr, request: &[u8]) -> RawResponse {
    let mut stream = TcpStream::connect(addr).expect("connect failed");
    stream
        .set_read_timeout(Some(Duration::from_secs(20)))
        .expect("read timeout");
    stream.write_all(request).expect("write failed");
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf);
    parse_response(&buf)
}

#[allow(dead_code)]
pub fn post_json(addr: SocketAddr, body: &str) -> RawResponse {
    let req = format!(
        "POST /api/cli HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    send_raw(addr, req.as_bytes())
}

/// POST `{"command": command}`.
#[allow(dead_code)]
pub fn post_command(addr: SocketAddr, command: &str) -> RawResponse {
    let body = serde_json::json!({ "command": command }).to_string();
    post_json(addr, &body)
}

#[allow(dead_code)]
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut f: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if f() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[allow(dead_code)]
pub fn pid_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

/// Read a pid written by a stub script, waiting for it to appear.
#[allow(dead_code)]
pub fn read_pid_file(path: &Path) -> i32 {
    let mut pid = None;
    wait_until(Duration::from_secs(5), || {
        pid = std::fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok());
        pid.is_some()
    });
    pid.expect("pid file written by stub")
}

/// Like [`pid_alive`], but a zombie awaiting its reaper counts as gone (Linux `/proc`).
#[allow(dead_code)]
pub fn pid_running(pid: i32) -> bool {
    if !pid_alive(pid) {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .map(|state| state != 'Z')
            .unwrap_or(true),
        Err(_) => true,
    }
}

/// Close with a reset instead of a FIN, so the gateway sees the client as gone rather than
/// half-closed.
#[allow(dead_code)]
pub fn abort_connection(stream: TcpStream) {
    use nix::sys::socket::{setsockopt, sockopt};
    let linger = nix::libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    setsockopt(&stream, sockopt::Linger, &linger).expect("SO_LINGER");
    drop(stream);
}
