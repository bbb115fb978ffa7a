/*!
Gateway settings. The binary builds these from CLI flags and environment; tests build
them directly.
*/

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::GatewayError;
use crate::gateway::command::CommandLimits;

pub const DEFAULT_BIND: &str = "127.0.0.1:8787";
pub const DEFAULT_INTERPRETER: &str = "python3";
pub const DEFAULT_ENTRY_POINT: &str = "pai/pai.py";
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;
pub const DEFAULT_READ_CHUNK: usize = 8 * 1024;
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The executable the gateway runs for every request: interpreter plus entry point.
/// Fixed at startup; nothing from a request ever changes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreter {
    pub program: PathBuf,
    pub entry_point: PathBuf,
}

impl Interpreter {
    pub fn new(program: impl Into<PathBuf>, entry_point: impl Into<PathBuf>) -> Self {
        Interpreter {
            program: program.into(),
            entry_point: entry_point.into(),
        }
    }

    /// Resolve `program` via PATH when it is a bare name and absolutize `entry_point`
    /// against `cwd`. The entry point must exist.
    pub fn resolve(program: &Path, entry_point: &Path, cwd: &Path) -> Result<Self, GatewayError> {
        let program = if program.components().count() == 1 && !program.is_absolute() {
            which::which(program).map_err(|e| {
                GatewayError::Config(format!(
                    "interpreter '{}' not found in PATH: {e}",
                    program.display()
                ))
            })?
        } else {
            program.to_path_buf()
        };
        let entry_point = if entry_point.is_absolute() {
            entry_point.to_path_buf()
        } else {
            cwd.join(entry_point)
        };
        if !entry_point.is_file() {
            return Err(GatewayError::Config(format!(
                "entry point '{}' does not exist",
                entry_point.display()
            )));
        }
        Ok(Interpreter {
            program,
            entry_point,
        })
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Interpreter::new(DEFAULT_INTERPRETER, DEFAULT_ENTRY_POINT)
    }
}

/// Per-request supervision knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Wait after SIGTERM before escalating to SIGKILL.
    pub grace_period: Duration,
    /// Bounded stdout channel capacity, in chunks.
    pub channel_capacity: usize,
    /// Max bytes per stdout read.
    pub read_chunk: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        SupervisorSettings {
            grace_period: DEFAULT_GRACE_PERIOD,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    pub interpreter: Interpreter,
    pub supervisor: SupervisorSettings,
    pub limits: CommandLimits,
    /// Applies while the request is being read; streaming has no timeout.
    pub read_timeout: Duration,
    pub max_connections: usize,
    /// How often the bridge re-checks cancellation while waiting.
    pub poll_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], 8787)),
            interpreter: Interpreter::default(),
            supervisor: SupervisorSettings::default(),
            limits: CommandLimits::default(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bind_matches_constant() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.bind.to_string(), DEFAULT_BIND);
        assert_eq!(cfg.supervisor.grace_period, Duration::from_secs(3));
        assert_eq!(cfg.interpreter.entry_point, PathBuf::from("pai/pai.py"));
    }

    #[test]
    fn test_resolve_absolutizes_entry_point() {
        let td = tempfile::tempdir().expect("tmpdir");
        std::fs::create_dir_all(td.path().join("pai")).expect("mkdir");
        std::fs::write(td.path().join("pai/pai.py"), "").expect("write");
        let interp = Interpreter::resolve(
            Path::new("/bin/sh"),
            Path::new(DEFAULT_ENTRY_POINT),
            td.path(),
        )
        .expect("resolve");
        assert_eq!(interp.program, PathBuf::from("/bin/sh"));
        assert_eq!(interp.entry_point, td.path().join("pai/pai.py"));
    }

    #[test]
    fn test_resolve_rejects_missing_entry_point() {
        let td = tempfile::tempdir().expect("tmpdir");
        let err = Interpreter::resolve(Path::new("/bin/sh"), Path::new("nope.py"), td.path())
            .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_resolve_rejects_unknown_interpreter() {
        let td = tempfile::tempdir().expect("tmpdir");
        std::fs::write(td.path().join("e.py"), "").expect("write");
        let err = Interpreter::resolve(
            Path::new("definitely-not-an-interpreter-xyz"),
            Path::new("e.py"),
            td.path(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not found in PATH"));
    }
}
