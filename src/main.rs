mod config;
mod error;
mod io;
mod logging;
mod protocol;
mod scenario;
mod session;

#[cfg(test)]
mod test_utils;

use clap::Parser;
use config::{ProbeConfig, SERVER_BIN_ENV, SERVER_CONFIG_ENV, resolve_server_path};
use error::ConfigError;
use io::StdioClient;
use logging::{LogConfig, init_logging};
use session::ProtocolSession;

use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// CLI arguments for the MCP probe
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server executable (overrides GIRT_BIN env var, defaults to ~/.cargo/bin/girt)
    #[arg(long, value_name = "PATH")]
    server: Option<PathBuf>,

    /// Server config file, passed as `--config <FILE>` (overrides GIRT_CONFIG env var, defaults to girt.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Tool specification JSON to request through the gateway tool; handshake only if omitted
    #[arg(long, value_name = "FILE")]
    spec: Option<PathBuf>,

    /// Name of the tool capability requests go through
    #[arg(long, value_name = "NAME", default_value = scenario::DEFAULT_GATEWAY_TOOL)]
    gateway_tool: String,

    /// Wait this long after launching the server before the first message
    #[arg(long, value_name = "MS", default_value_t = 0)]
    startup_delay_ms: u64,

    /// Timeout for the tools/call request
    #[arg(long, value_name = "SECS", default_value_t = config::DEFAULT_CALL_TIMEOUT_SECS)]
    call_timeout_secs: u64,

    /// Log filter for the server, set as GIRT_LOG in its environment
    #[arg(long, value_name = "FILTER")]
    child_log: Option<String>,

    /// Extra environment for the server (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides PROBE_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Additional arguments passed to the server
    #[arg(last = true, value_name = "SERVER_ARGS")]
    server_args: Vec<String>,
}

/// Build the probe configuration from CLI args and environment
fn build_config(args: Args) -> Result<ProbeConfig, ConfigError> {
    // Priority: CLI arg > env var > default
    let server = resolve_server_path(
        args.server,
        std::env::var(SERVER_BIN_ENV).ok(),
        std::env::var("HOME").ok(),
    )?;
    let server_config = args
        .config
        .or_else(|| std::env::var(SERVER_CONFIG_ENV).ok().map(PathBuf::from));

    let mut config = ProbeConfig::new(server)
        .with_server_config(server_config)
        .with_server_args(args.server_args)
        .with_child_log(args.child_log)
        .with_spec(args.spec)
        .with_gateway_tool(args.gateway_tool)
        .with_startup_delay(Duration::from_millis(args.startup_delay_ms))
        .with_call_timeout(Duration::from_secs(args.call_timeout_secs));
    for pair in &args.env {
        config = config.with_env_pair(pair)?;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging with configuration from env vars and CLI args
    let log_config =
        LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());

    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let config = match build_config(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    // Read the tool spec before launching anything
    let request = match config.capability_request() {
        Ok(request) => request,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    info!("Launching server: {}", config.server.display());
    let mut client = StdioClient::new(config.client_config());
    if let Err(e) = client.start().await {
        eprintln!("{e}");
        std::process::exit(1);
    }

    if !config.startup_delay.is_zero() {
        tokio::time::sleep(config.startup_delay).await;
    }

    let mut session = ProtocolSession::new(client, config.session_config());
    let outcome = scenario::run(&mut session, request.as_ref()).await;

    // The child is stopped on every path before anything is printed
    let mut client = session.into_transport();
    let status = client.stop().await;
    info!("Server stopped with status {:?}", status);

    match outcome {
        Ok(report) => print!("{report}"),
        Err(e) => {
            eprintln!("Probe failed: {e}");
            let tail = client.stderr_tail(config.stderr_tail_lines);
            if tail.is_empty() {
                warn!("Server wrote nothing to stderr");
            } else {
                eprintln!("--- server stderr (last {} lines) ---", tail.len());
                for line in tail {
                    eprintln!("{line}");
                }
            }
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("mcp-probe").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_defaults() {
        let args = parse(&["--server", "/bin/girt"]);
        assert_eq!(args.gateway_tool, "request_capability");
        assert_eq!(args.call_timeout_secs, 360);
        assert!(args.spec.is_none());

        let config = build_config(args).unwrap();
        assert_eq!(config.server, PathBuf::from("/bin/girt"));
        assert!(config.startup_delay.is_zero());
    }

    #[test]
    fn test_cli_full_invocation() {
        let args = parse(&[
            "--server",
            "/bin/girt",
            "--config",
            "girt.toml",
            "--spec",
            "add.json",
            "--startup-delay-ms",
            "500",
            "--call-timeout-secs",
            "600",
            "--child-log",
            "girt=info",
            "--env",
            "A=1",
            "--env",
            "B=2",
            "--",
            "--serve",
        ]);
        let config = build_config(args).unwrap();

        assert_eq!(config.server_config, PathBuf::from("girt.toml"));
        assert_eq!(config.spec_path, Some(PathBuf::from("add.json")));
        assert_eq!(config.startup_delay, Duration::from_millis(500));
        assert_eq!(config.call_timeout, Duration::from_secs(600));
        assert_eq!(
            config.process_spec().args,
            vec!["--config", "girt.toml", "--serve"]
        );
        assert_eq!(config.env.len(), 3);
    }

    #[test]
    fn test_cli_rejects_bad_values() {
        let bad_env = parse(&["--server", "/bin/girt", "--env", "NOVALUE"]);
        assert_eq!(
            build_config(bad_env),
            Err(ConfigError::InvalidEnvPair("NOVALUE".to_string()))
        );

        let zero = parse(&["--server", "/bin/girt", "--call-timeout-secs", "0"]);
        assert_eq!(
            build_config(zero),
            Err(ConfigError::ZeroTimeout { name: "tools/call" })
        );
    }
}
