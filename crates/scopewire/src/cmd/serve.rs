use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use scopewire::{Daemon, DaemonOptions};

use crate::cmd::ServeArgs;
use crate::exit::{daemon_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_endpoints, OutputFormat};

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.endpoints.resolve()?;
    let daemon = Daemon::start(
        &config,
        DaemonOptions {
            demo: args.demo,
            ..DaemonOptions::default()
        },
    )
    .map_err(|err| daemon_error("daemon start failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    print_endpoints(daemon.endpoints(), format);
    daemon.run_until(&running);
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
