//! `sbw-broker`: start the SBW broker for this user, or stop the running one.

use clap::Parser;
use sbw_broker::bootstrap::{self, ExitStatus};
use sbw_broker::{BrokerConfig, HostAccessTable, PortRange, SbwError, SbwPaths};
use std::process::exit;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sbw-broker", version)]
#[command(about = "Message broker for SBW modules")]
struct Args {
    /// Shut down the running broker and exit
    #[arg(long)]
    shutdown: bool,

    /// Use the session key already on disk instead of generating one
    #[arg(long)]
    reuse_key: bool,

    /// Admit modules from other hosts
    #[arg(long)]
    remote: bool,

    /// Accepted for compatibility; broker-to-broker links are not supported
    #[arg(long)]
    no_remote: bool,

    /// Accept remote modules matching this address pattern (e.g. 10.0.0.*)
    #[arg(long, value_name = "PATTERN")]
    accept: Vec<String>,

    /// Deny remote modules matching this address pattern
    #[arg(long, value_name = "PATTERN")]
    deny: Vec<String>,

    /// Ports to try for module connections
    #[arg(long, value_name = "LOW-HIGH")]
    module_ports: Option<PortRange>,

    /// Accepted for compatibility; broker-to-broker links are not supported
    #[arg(long, value_name = "LOW-HIGH")]
    broker_ports: Option<PortRange>,
}

fn main() {
    // ---
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let status = if err.use_stderr() {
                ExitStatus::BadArgument
            } else {
                ExitStatus::Normal
            };
            let _ = err.print();
            exit(status.code());
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(false)
        .init();

    let config = match build_config(&args) {
        Ok(config) => config,
        Err((status, err)) => fail(status, &err),
    };

    if let Err(err) = bootstrap::run(config, args.shutdown) {
        fail(err.status, &err.error);
    }
}

fn build_config(args: &Args) -> Result<BrokerConfig, (ExitStatus, SbwError)> {
    // ---
    let paths = SbwPaths::from_env().map_err(|err| (ExitStatus::CannotLoadKey, err))?;
    let config = BrokerConfig::from_paths(paths).map_err(|err| (ExitStatus::BadArgument, err))?;
    apply_args(config, args).map_err(|err| (ExitStatus::BadArgument, err))
}

/// Layer the command line over the configured defaults.
///
/// Without `--accept` only loopback is admitted, even with `--remote`.
fn apply_args(mut config: BrokerConfig, args: &Args) -> Result<BrokerConfig, SbwError> {
    // ---
    if let Some(ports) = args.module_ports {
        config = config.with_module_ports(ports);
    }
    if let Some(ports) = args.broker_ports {
        config = config.with_broker_ports(ports);
    }
    if args.remote {
        config = config.with_allow_remote_modules(true);
    }
    if args.no_remote {
        config = config.with_no_remote(true);
    }

    let mut access = HostAccessTable::local_only();
    for pattern in &args.accept {
        access.accept_address(pattern)?;
    }
    for pattern in &args.deny {
        access.deny_address(pattern)?;
    }

    Ok(config.with_access(access).with_reuse_key(args.reuse_key))
}

fn fail(status: ExitStatus, err: &SbwError) -> ! {
    // ---
    let detail = err.detail();
    if detail.is_empty() || detail == err.to_string() {
        eprintln!("sbw-broker: {err}");
    } else {
        eprintln!("sbw-broker: {err} ({detail})");
    }
    exit(status.code());
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn configured(argv: &[&str]) -> BrokerConfig {
        // ---
        let args = Args::try_parse_from(argv).unwrap();
        apply_args(BrokerConfig::new(SbwPaths::with_user_dir("/tmp/sbw-test")), &args).unwrap()
    }

    #[test]
    fn test_remote_without_accept_stays_local() {
        // ---
        let config = configured(&["sbw-broker", "--remote"]);
        assert!(config.allow_remote_modules);
        assert!(config.access.is_permitted("127.0.0.1"));
        assert!(!config.access.is_permitted("192.168.1.1"));
        assert!(!config.access.is_permitted("8.8.8.8"));
    }

    #[test]
    fn test_accept_and_deny_patterns() {
        // ---
        let config = configured(&[
            "sbw-broker",
            "--remote",
            "--accept",
            "10.0.0.*",
            "--deny",
            "10.0.0.5",
        ]);
        assert!(config.access.is_permitted("10.0.0.6"));
        assert!(!config.access.is_permitted("10.0.0.5"));
        assert!(!config.access.is_permitted("192.168.1.1"));
    }

    #[test]
    fn test_bad_pattern_is_an_error() {
        // ---
        let args = Args::try_parse_from(["sbw-broker", "--accept", "10.0.0"]).unwrap();
        let config = BrokerConfig::new(SbwPaths::with_user_dir("/tmp/sbw-test"));
        assert!(matches!(apply_args(config, &args), Err(SbwError::Config(_))));
    }

    #[test]
    fn test_port_ranges_parse() {
        // ---
        let config = configured(&["sbw-broker", "--module-ports", "2000-2010"]);
        assert_eq!(config.module_ports, PortRange { low: 2000, high: 2010 });
        assert!(Args::try_parse_from(["sbw-broker", "--module-ports", "9-1"]).is_err());
    }
}
