/*!
The command gateway: allow-list, process supervision, streaming bridge, HTTP handling and
the listener that ties them together.

Request flow:
- `server` accepts a connection and hands it to `handler`.
- `handler` parses the request and resolves the command through `command`.
- `supervisor` launches the child; `bridge` relays its stdout until exit or disconnect.
*/

pub mod bridge;
pub mod command;
pub mod config;
pub mod handler;
pub mod http;
pub mod server;
pub mod supervisor;

pub use bridge::{relay, BridgeOptions, CancelSignal, RelayOutcome, StreamState};
pub use command::{resolve, resolve_with, CommandLimits, Operation, ResolvedCommand, ValidationError};
pub use config::{GatewayConfig, Interpreter, SupervisorSettings};
pub use handler::{handle_connection, ClientConnection, GatewayCtx};
pub use server::{gateway_start, GatewayServer};
pub use supervisor::{start, ExitResult, ProcessHandle};
