//! Error mapping guide:
//! - Client-side problems (validation, malformed HTTP/JSON) map to 400 and never start a process.
//! - Spawn and internal I/O failures map to 500 before any streamed byte is sent.
//! - A non-zero child exit is `ProcessFailed`; how it reaches the client depends on whether
//!   the stream has already started (502 vs. chunked trailer).
//! - Process exit codes for the binary keep the io::Error mapping: 127 for NotFound, 1 otherwise.
use std::io;
use std::path::PathBuf;

use crate::gateway::command::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    BadRequest(String),

    #[error("Failed to start process: {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Process exited with code {0}")]
    ProcessFailed(i32),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl GatewayError {
    /// HTTP status line used when the error is reported as a JSON response.
    pub fn status_line(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) | GatewayError::BadRequest(_) => "400 Bad Request",
            GatewayError::ProcessFailed(_) => "502 Bad Gateway",
            GatewayError::Spawn { .. } | GatewayError::Config(_) | GatewayError::Io(_) => {
                "500 Internal Server Error"
            }
        }
    }

    /// Message placed in the `{"error": ...}` body.
    pub fn client_message(&self) -> String {
        match self {
            // Internal I/O details stay in the server log.
            GatewayError::Io(_) | GatewayError::Config(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Map an io::Error to a process exit code:
/// - 127 for NotFound (command not found)
/// - 1 for all other errors
pub fn exit_code_for_io_error(e: &io::Error) -> u8 {
    if e.kind() == io::ErrorKind::NotFound {
        127
    } else {
        1
    }
}

/// Convert GatewayError to a process exit code for the binary.
pub fn exit_code_for_gateway_error(e: &GatewayError) -> u8 {
    match e {
        GatewayError::Config(_) => 2,
        GatewayError::Io(ioe) => exit_code_for_io_error(ioe),
        GatewayError::Spawn { source, .. } => exit_code_for_io_error(source),
        _ => 1,
    }
}
