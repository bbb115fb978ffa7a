use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use pai_gateway::{
    exit_code_for_gateway_error, exit_code_for_io_error, gateway_start, logging, shutdown,
};

mod cli;

use cli::Cli;

fn main() -> ExitCode {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::logging_init(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            let code = if let Some(ge) = e.downcast_ref::<pai_gateway::GatewayError>() {
                exit_code_for_gateway_error(ge)
            } else if let Some(ioe) = e.downcast_ref::<std::io::Error>() {
                exit_code_for_io_error(ioe)
            } else {
                1
            };
            ExitCode::from(code)
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        build = env!("PAI_GATEWAY_BUILD_DATE"),
        target = env!("PAI_GATEWAY_BUILD_TARGET"),
        profile = env!("PAI_GATEWAY_BUILD_PROFILE"),
        rustc = env!("PAI_GATEWAY_BUILD_RUSTC"),
        "pai-gateway starting"
    );

    if let Err(e) = shutdown::install_signal_handlers() {
        warn!("cannot install signal handlers: {e}");
    }

    let cwd = std::env::current_dir()?;
    let config = cli.to_config(&cwd)?;
    info!(
        interpreter = %config.interpreter.program.display(),
        entry_point = %config.interpreter.entry_point.display(),
        grace_ms = config.supervisor.grace_period.as_millis() as u64,
        max_connections = config.max_connections,
        "configuration resolved"
    );

    let grace = config.supervisor.grace_period;
    let mut server = gateway_start(config)?;
    info!(url = %server.url(), "serving");

    shutdown::wait_for_shutdown(Duration::from_millis(100));
    match shutdown::received_signal() {
        Some(sig) => info!(signal = %sig, "shutdown requested"),
        None => info!("shutdown requested"),
    }
    server.shutdown(grace);
    info!("pai-gateway stopped");
    Ok(())
}
