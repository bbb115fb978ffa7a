#![cfg(unix)]

mod support;

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

fn open_stream(addr: std::net::SocketAddr, command: &str) -> TcpStream {
    let body = serde_json::json!({ "command": command }).to_string();
    let req = format!(
        "POST /api/cli HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let mut s = TcpStream::connect(addr).expect("connect");
    s.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    s.write_all(req.as_bytes()).expect("write request");
    s
}

fn read_until(s: &mut TcpStream, needle: &str) -> Vec<u8> {
    let mut seen = Vec::new();
    let mut buf = [0u8; 512];
    while !String::from_utf8_lossy(&seen).contains(needle) {
        let n = s.read(&mut buf).expect("read");
        assert!(n > 0, "stream closed before {needle:?}");
        seen.extend_from_slice(&buf[..n]);
    }
    seen
}

#[test]
fn test_disconnect_mid_stream_terminates_child_and_group() {
    let td = tempfile::tempdir().expect("tmpdir");
    let pid_file = td.path().join("child.pid");
    let grand_file = td.path().join("grandchild.pid");
    let script = format!(
        "echo $$ > '{}'\nsleep 60 &\necho $! > '{}'\necho started\nwhile :; do echo tick; sleep 0.1; done\n",
        pid_file.display(),
        grand_file.display()
    );
    let mut srv = support::start_gateway(support::stub_interpreter(td.path(), &script));

    let mut s = open_stream(srv.local_addr(), "ask long running question");
    let head = read_until(&mut s, "started");
    assert!(String::from_utf8_lossy(&head).starts_with("HTTP/1.1 200 OK\r\n"));
    let child = support::read_pid_file(&pid_file);
    let grandchild = support::read_pid_file(&grand_file);
    assert!(support::pid_running(child));

    drop(s);

    assert!(
        support::wait_until(Duration::from_secs(5), || !support::pid_running(child)),
        "child {child} still running after disconnect"
    );
    assert!(
        support::wait_until(Duration::from_secs(5), || !support::pid_running(grandchild)),
        "grandchild {grandchild} survived its process group"
    );
    assert!(support::wait_until(Duration::from_secs(5), || srv
        .active_connections()
        == 0));
    srv.stop();
}

#[test]
fn test_disconnect_escalates_when_child_ignores_term() {
    let td = tempfile::tempdir().expect("tmpdir");
    let pid_file = td.path().join("child.pid");
    let script = format!(
        "trap '' TERM\necho $$ > '{}'\necho started\nwhile :; do sleep 0.1; done\n",
        pid_file.display()
    );
    let mut srv = support::start_gateway(support::stub_interpreter(td.path(), &script));

    let mut s = open_stream(srv.local_addr(), "run_agent stubborn");
    read_until(&mut s, "started");
    let child = support::read_pid_file(&pid_file);
    support::abort_connection(s);

    // 500ms grace in the test config, then SIGKILL.
    assert!(
        support::wait_until(Duration::from_secs(5), || !support::pid_running(child)),
        "child {child} survived SIGKILL escalation"
    );
    srv.stop();
}

#[test]
fn test_disconnect_before_output_stops_silent_child() {
    let td = tempfile::tempdir().expect("tmpdir");
    let pid_file = td.path().join("child.pid");
    let script = format!("echo $$ > '{}'\nexec sleep 60\n", pid_file.display());
    let mut srv = support::start_gateway(support::stub_interpreter(td.path(), &script));

    let s = open_stream(srv.local_addr(), "ask quiet");
    let child = support::read_pid_file(&pid_file);
    assert!(support::pid_running(child));
    support::abort_connection(s);

    assert!(
        support::wait_until(Duration::from_secs(5), || !support::pid_running(child)),
        "silent child {child} still running after disconnect"
    );
    srv.stop();
}

#[test]
fn test_other_requests_unaffected_by_a_disconnect() {
    let td = tempfile::tempdir().expect("tmpdir");
    let script = "if [ \"$4\" = slow ]; then echo started; exec sleep 60; fi\necho fast-done\n";
    let mut srv = support::start_gateway(support::stub_interpreter(td.path(), script));
    let addr = srv.local_addr();

    let mut slow = open_stream(addr, "ask slow");
    read_until(&mut slow, "started");

    let resp = support::post_command(addr, "ask fast");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body_text(), "fast-done\n");
    assert_eq!(resp.trailer("X-Exit-Code"), Some("0"));

    support::abort_connection(slow);
    assert!(support::wait_until(Duration::from_secs(5), || srv
        .active_connections()
        == 0));
    srv.stop();
}

#[test]
fn test_half_closed_client_still_gets_full_response() {
    let td = tempfile::tempdir().expect("tmpdir");
    let mut srv = support::start_gateway(support::stub_interpreter(
        td.path(),
        "sleep 0.3\necho answer\n",
    ));

    let mut s = open_stream(srv.local_addr(), "ask q");
    s.shutdown(Shutdown::Write).expect("half-close");
    let mut raw = Vec::new();
    s.read_to_end(&mut raw).expect("read response");

    let resp = support::parse_response(&raw);
    assert_eq!(resp.status, 200);
    assert!(resp.complete, "stream aborted: {:?}", String::from_utf8_lossy(&raw));
    assert_eq!(resp.body_text(), "answer\n");
    assert_eq!(resp.trailer("X-Exit-Code"), Some("0"));
    srv.stop();
}
