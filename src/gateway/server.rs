/*!
TCP listener and accept loop.

Non-blocking accept with a shared running flag; one thread per accepted connection. A
counter caps concurrent connections; the excess gets a 503 without its request being read.
*/

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::gateway::config::GatewayConfig;
use crate::gateway::handler::{handle_connection, new_request_id, ClientConnection, GatewayCtx};
use crate::gateway::http;
use crate::gateway::supervisor;

const ACCEPT_IDLE: Duration = Duration::from_millis(50);

/// A running gateway. Dropping it does not stop the accept loop; call [`GatewayServer::stop`].
#[derive(Debug)]
pub struct GatewayServer {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl GatewayServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Full URL of the command endpoint.
    pub fn url(&self) -> String {
        format!("http://{}/api/cli", self.addr)
    }

    /// Connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop accepting and wait for the accept loop to exit. In-flight requests finish on
    /// their own threads.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }

    /// Stop accepting, then terminate every live child: TERM, and KILL after `grace`.
    pub fn shutdown(&mut self, grace: Duration) {
        self.stop();
        supervisor::terminate_all(grace);
    }

    /// Block until the accept loop exits.
    pub fn join(mut self) {
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

/// Decrements the active counter when the connection thread ends, panics included.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bind `config.bind` and start serving in a background thread.
pub fn gateway_start(config: GatewayConfig) -> io::Result<GatewayServer> {
    let listener = TcpListener::bind(config.bind)
        .map_err(|e| io::Error::new(e.kind(), format!("bind {} failed: {e}", config.bind)))?;
    let addr = listener.local_addr()?;
    listener.set_nonblocking(true)?;

    let running = Arc::new(AtomicBool::new(true));
    let active = Arc::new(AtomicUsize::new(0));
    let running_cl = running.clone();
    let active_cl = active.clone();
    let ctx = Arc::new(GatewayCtx::new(config));

    let handle = std::thread::Builder::new()
        .name("pai-gateway-accept".to_string())
        .spawn(move || {
            info!(%addr, "gateway listening");
            accept_loop(listener, ctx, running_cl, active_cl);
            info!(%addr, "gateway stopped");
        })?;

    Ok(GatewayServer {
        addr,
        running,
        active,
        handle: Some(handle),
    })
}

fn accept_loop(
    listener: TcpListener,
    ctx: Arc<GatewayCtx>,
    running: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
) {
    let max = ctx.config.max_connections.max(1);
    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                if e.kind() != io::ErrorKind::WouldBlock {
                    warn!("accept error: {e}");
                }
                std::thread::sleep(ACCEPT_IDLE);
                continue;
            }
        };
        let _ = stream.set_nonblocking(false);
        let _ = stream.set_read_timeout(Some(ctx.config.read_timeout));
        let _ = stream.set_write_timeout(None);
        let _ = stream.set_nodelay(true);

        if active.fetch_add(1, Ordering::SeqCst) >= max {
            active.fetch_sub(1, Ordering::SeqCst);
            warn!(%peer, max, "connection limit reached");
            refuse_busy(stream);
            continue;
        }
        let guard = ActiveGuard(active.clone());
        let ctx_cl = ctx.clone();
        let spawned = std::thread::Builder::new()
            .name("pai-gateway-conn".to_string())
            .spawn(move || {
                let _guard = guard;
                debug!(%peer, "connection accepted");
                let mut s = stream;
                handle_connection(&ctx_cl, &mut s);
            });
        if let Err(e) = spawned {
            // The closure (and its guard) was dropped with the failed spawn.
            warn!(%peer, "cannot spawn connection thread: {e}");
        }
    }
}

fn refuse_busy(mut stream: TcpStream) {
    let rid = new_request_id();
    let _ = http::respond_json_error(
        &mut stream,
        "503 Service Unavailable",
        Some(&rid),
        "Too many concurrent requests",
    );
    stream.close();
}
