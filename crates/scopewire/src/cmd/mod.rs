use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use scopewire::config::Service;
use scopewire::ScopeConfig;
use scopewire_rpc::RpcClient;

use crate::exit::{config_error, rpc_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod describe;
pub mod interrupt;
pub mod serve;
pub mod version;
pub mod watch;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon until Ctrl-C.
    Serve(ServeArgs),
    /// Call one command and print its reply.
    Call(CallArgs),
    /// List the daemon's commands.
    Describe(DescribeArgs),
    /// Print property updates.
    Watch(WatchArgs),
    /// Abort the call the daemon is running.
    Interrupt(InterruptArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Call(args) => call::run(args, format),
        Command::Describe(args) => describe::run(args, format),
        Command::Watch(args) => watch::run(args, format),
        Command::Interrupt(args) => interrupt::run(args),
        Command::Version(args) => version::run(args),
    }
}

/// Where the daemon is, for commands that serve or connect.
#[derive(Args, Debug, Default, Clone)]
pub struct EndpointArgs {
    /// JSON config file.
    #[arg(long, value_name = "PATH", env = "SCOPED_CONFIG")]
    pub config: Option<PathBuf>,
    /// Host for TCP endpoints (overrides the config file).
    #[arg(long, value_name = "HOST")]
    pub host: Option<String>,
    /// Use Unix sockets in this directory (overrides the config file).
    #[arg(long, value_name = "DIR")]
    pub socket_dir: Option<PathBuf>,
}

impl EndpointArgs {
    pub fn resolve(&self) -> CliResult<ScopeConfig> {
        let mut config =
            ScopeConfig::load_or_default(self.config.as_deref()).map_err(config_error)?;
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(dir) = &self.socket_dir {
            config.socket_dir = Some(dir.clone());
        }
        Ok(config)
    }
}

/// RPC client for the daemon described by `config`, with its interrupt
/// channel attached.
pub fn connect(config: &ScopeConfig, timeout: Option<Duration>) -> CliResult<RpcClient> {
    let rpc = config.endpoint(Service::Rpc);
    let interrupt = config.endpoint(Service::Interrupt);
    let mut client = RpcClient::connect(&rpc, Some(&interrupt))
        .map_err(|err| rpc_error(&format!("connect to {rpc} failed"), err))?;
    client.set_timeout(timeout);
    Ok(client)
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub endpoints: EndpointArgs,
    /// Mount the simulated camera and echo device.
    #[arg(long)]
    pub demo: bool,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Dotted command path, e.g. `camera.acquire_image`.
    pub path: String,
    /// Positional arguments as a JSON array.
    #[arg(long, value_name = "JSON")]
    pub args: Option<String>,
    /// Keyword arguments as a JSON object.
    #[arg(long, value_name = "JSON")]
    pub kwargs: Option<String>,
    /// Treat the result as an array and fetch it (shared memory when local).
    #[arg(long)]
    pub fetch: bool,
    /// With --fetch, always ask for packed bytes.
    #[arg(long, requires = "fetch")]
    pub remote: bool,
    /// Reply timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "30s")]
    pub timeout: String,
    #[command(flatten)]
    pub endpoints: EndpointArgs,
}

#[derive(Args, Debug)]
pub struct DescribeArgs {
    /// Only commands under this dotted prefix.
    #[arg(long)]
    pub prefix: Option<String>,
    #[command(flatten)]
    pub endpoints: EndpointArgs,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Dotted prefix to watch (repeatable). Default: everything.
    #[arg(long = "prefix", value_name = "PREFIX")]
    pub prefixes: Vec<String>,
    /// Exit after N updates.
    #[arg(long)]
    pub count: Option<usize>,
    /// Ask the daemon to resend current values after subscribing.
    #[arg(long)]
    pub snapshot: bool,
    #[command(flatten)]
    pub endpoints: EndpointArgs,
}

#[derive(Args, Debug)]
pub struct InterruptArgs {
    /// Abort only this call id. Default: whatever is running.
    #[arg(long)]
    pub call_id: Option<String>,
    #[command(flatten)]
    pub endpoints: EndpointArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `5s`, `500ms`, `2m` or plain seconds.
pub fn parse_duration(text: &str) -> CliResult<Duration> {
    let text = text.trim();
    let invalid = || CliError::new(USAGE, format!("invalid duration '{text}'"));
    let (number, unit) = match text.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(split) => text.split_at(split),
        None => (text, "s"),
    };
    let value: f64 = number.parse().map_err(|_| invalid())?;
    let seconds = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        _ => return Err(invalid()),
    };
    Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5h").is_err());
    }
}
