//! pai-gateway: an HTTP front door that runs allow-listed PAI commands in a supervised
//! interpreter process and streams the process's stdout back while it runs.
//!
//! Unix only: children run in their own process group and are stopped with signals.

#[cfg(not(unix))]
compile_error!("pai-gateway supports Unix hosts only");

pub mod errors;
pub mod gateway;
pub mod logging;
pub mod shutdown;

pub use errors::{exit_code_for_gateway_error, exit_code_for_io_error, GatewayError};
pub use gateway::{
    gateway_start, handle_connection, relay, resolve, resolve_with, start, BridgeOptions,
    CancelSignal, ClientConnection, CommandLimits, ExitResult, GatewayConfig, GatewayCtx,
    GatewayServer, Interpreter, Operation, ProcessHandle, RelayOutcome, ResolvedCommand,
    StreamState, SupervisorSettings, ValidationError,
};
