use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use pai_gateway::{
    CommandLimits, GatewayConfig, GatewayError, Interpreter, SupervisorSettings,
};

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| format!("invalid duration '{s}': {e}"))
}

fn parse_positive(s: &str) -> Result<usize, String> {
    match s.trim().parse::<usize>() {
        Ok(0) => Err("must be greater than zero".to_string()),
        Ok(v) => Ok(v),
        Err(e) => Err(format!("invalid number '{s}': {e}")),
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "pai-gateway",
    version,
    about = "Serve POST /api/cli: run allow-listed PAI commands in a supervised interpreter and stream stdout back.",
    after_long_help = "Examples:\n  pai-gateway --bind 0.0.0.0:8787\n  pai-gateway --interpreter /usr/bin/python3 --entry-point pai/pai.py -v\n  PAI_GATEWAY_GRACE_PERIOD=5s pai-gateway\n\n"
)]
pub(crate) struct Cli {
    /// Address to listen on
    #[arg(long, env = "PAI_GATEWAY_BIND", default_value = pai_gateway::gateway::config::DEFAULT_BIND)]
    pub(crate) bind: SocketAddr,

    /// Interpreter executable (bare names are looked up in PATH)
    #[arg(long, env = "PAI_GATEWAY_INTERPRETER", default_value = pai_gateway::gateway::config::DEFAULT_INTERPRETER)]
    pub(crate) interpreter: PathBuf,

    /// Entry point script passed as the interpreter's first argument
    #[arg(long = "entry-point", env = "PAI_GATEWAY_ENTRY_POINT", default_value = pai_gateway::gateway::config::DEFAULT_ENTRY_POINT)]
    pub(crate) entry_point: PathBuf,

    /// Wait after SIGTERM before SIGKILL on client disconnect (e.g. 3s, 500ms)
    #[arg(long = "grace-period", env = "PAI_GATEWAY_GRACE_PERIOD", default_value = "3s", value_parser = parse_duration)]
    pub(crate) grace_period: Duration,

    /// Time allowed for a client to send its request
    #[arg(long = "read-timeout", env = "PAI_GATEWAY_READ_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub(crate) read_timeout: Duration,

    /// Buffered stdout chunks per request before the child is back-pressured
    #[arg(long = "channel-capacity", env = "PAI_GATEWAY_CHANNEL_CAPACITY", default_value_t = pai_gateway::gateway::config::DEFAULT_CHANNEL_CAPACITY, value_parser = parse_positive)]
    pub(crate) channel_capacity: usize,

    /// Concurrent connections served; the excess gets 503
    #[arg(long = "max-connections", env = "PAI_GATEWAY_MAX_CONNECTIONS", default_value_t = pai_gateway::gateway::config::DEFAULT_MAX_CONNECTIONS, value_parser = parse_positive)]
    pub(crate) max_connections: usize,

    /// Maximum argument tokens after the command
    #[arg(long = "max-args", env = "PAI_GATEWAY_MAX_ARGS", default_value_t = pai_gateway::gateway::command::DEFAULT_MAX_ARGS)]
    pub(crate) max_args: usize,

    /// Maximum bytes per argument token
    #[arg(long = "max-arg-len", env = "PAI_GATEWAY_MAX_ARG_LEN", default_value_t = pai_gateway::gateway::command::DEFAULT_MAX_ARG_LEN, value_parser = parse_positive)]
    pub(crate) max_arg_len: usize,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,
}

impl Cli {
    /// Resolve paths against `cwd` and build the library configuration.
    pub(crate) fn to_config(&self, cwd: &Path) -> Result<GatewayConfig, GatewayError> {
        let interpreter = Interpreter::resolve(&self.interpreter, &self.entry_point, cwd)?;
        Ok(GatewayConfig {
            bind: self.bind,
            interpreter,
            supervisor: SupervisorSettings {
                grace_period: self.grace_period,
                channel_capacity: self.channel_capacity,
                ..SupervisorSettings::default()
            },
            limits: CommandLimits {
                max_args: self.max_args,
                max_arg_len: self.max_arg_len,
            },
            read_timeout: self.read_timeout,
            max_connections: self.max_connections,
            ..GatewayConfig::default()
        })
    }
}
