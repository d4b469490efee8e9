//! Discovery browser.
//!
//! Probes the LAN for tree servers and prints every system as it appears,
//! changes, or goes away.
//!
//! # Usage
//!
//! ```sh
//! treelink-discover --signature 'mixer-*' --interval-ms 500
//! treelink-discover --unicast 10.0.0.5:7770 --no-multicast
//! treelink-discover --config discovery.toml --duration-secs 10
//! ```
//!
//! Ctrl+C terminates the process; the client's `Drop` stops the reactor.

use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::{Rc, Weak};
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;
use treelink::discovery::{DiscoveryClient, DiscoveryError, DiscoveryQuery, DiscoveryTarget, SystemInfo};
use treelink::{CallbackMechanism, ConfigError, DiscoveryConfig, init_tracing_with};

/// Upper bound on one wait, so `--duration-secs` is honoured promptly.
const MAX_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

struct Options {
    config: DiscoveryConfig,
    signature: String,
    duration: Option<Duration>,
}

struct Printer;

impl DiscoveryTarget for Printer {
    fn discovery_update(&self, system: &str, info: Option<&SystemInfo>) {
        let Some(info) = info else {
            println!("- {system}");
            return;
        };
        println!("+ {system} ({} peer(s))", info.peers.len());
        for peer in info.peers() {
            let tcp = peer
                .tcp_endpoint()
                .map_or_else(|| "-".to_owned(), |ep| ep.to_string());
            println!(
                "    peer {} from {} via {} tcp {}",
                peer.peer_id, peer.source, peer.interface, tcp
            );
        }
    }

    fn computer_is_about_to_sleep(&self) {
        eprintln!("treelink-discover: sleeping");
    }

    fn computer_just_woke_up(&self) {
        eprintln!("treelink-discover: woke up");
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("treelink-discover: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    init_tracing_with("treelink=info");

    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;

    eprintln!(
        "treelink-discover: probing for {:?} every {:?} ({} destination(s))",
        options.signature,
        options.config.ping_interval,
        options.config.probe_destinations().len()
    );

    let mechanism = Rc::new(CallbackMechanism::new()?);
    let client = DiscoveryClient::new(&mechanism);
    let printer = Rc::new(Printer);
    let target: Weak<dyn DiscoveryTarget> = Rc::downgrade(&printer) as Weak<dyn DiscoveryTarget>;
    client.add_target(target);

    let outcome = client.start(options.config, DiscoveryQuery::new(&options.signature))?;
    eprintln!("treelink-discover: {outcome:?}");

    let deadline = options.duration.map(|d| Instant::now() + d);
    loop {
        let timeout = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                (deadline - now).min(MAX_WAIT)
            }
            None => MAX_WAIT,
        };
        mechanism.wait(Some(timeout));
        mechanism.dispatch_callbacks();
    }

    client.stop();
    // Deliver the final removals.
    mechanism.dispatch_callbacks();
    eprintln!("treelink-discover: stopped");
    Ok(())
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, CliError> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| CliError::Usage(format!("missing value for {flag}")))
}

fn parse<T: std::str::FromStr>(raw: &str, flag: &str) -> Result<T, CliError>
where
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| CliError::Usage(format!("bad value for {flag}: {e}")))
}

/// Parses command line arguments. A `--config` file is loaded first; flags
/// override it regardless of their position.
fn parse_args(args: &[String]) -> Result<Options, CliError> {
    let mut config_path: Option<String> = None;
    let mut signature = "*".to_owned();
    let mut group: Option<Ipv4Addr> = None;
    let mut port: Option<u16> = None;
    let mut interval_ms: Option<u64> = None;
    let mut unicast: Vec<SocketAddr> = Vec::new();
    let mut no_multicast = false;
    let mut duration: Option<Duration> = None;

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--config" | "-c" => {
                i += 1;
                config_path = Some(value(args, i, flag)?.to_owned());
            }
            "--signature" | "-s" => {
                i += 1;
                value(args, i, flag)?.clone_into(&mut signature);
            }
            "--group" | "-g" => {
                i += 1;
                group = Some(parse(value(args, i, flag)?, flag)?);
            }
            "--port" | "-p" => {
                i += 1;
                port = Some(parse(value(args, i, flag)?, flag)?);
            }
            "--interval-ms" | "-i" => {
                i += 1;
                interval_ms = Some(parse(value(args, i, flag)?, flag)?);
            }
            "--unicast" | "-u" => {
                i += 1;
                unicast.push(parse(value(args, i, flag)?, flag)?);
            }
            "--no-multicast" => no_multicast = true,
            "--duration-secs" | "-d" => {
                i += 1;
                duration = Some(Duration::from_secs(parse(value(args, i, flag)?, flag)?));
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => return Err(CliError::Usage(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }

    let mut config = match config_path {
        Some(path) => DiscoveryConfig::from_toml_str(&fs::read_to_string(path)?)?,
        None => DiscoveryConfig::default(),
    };
    if let Some(group) = group {
        config.group = group;
    }
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(ms) = interval_ms {
        config.ping_interval = Duration::from_millis(ms);
    }
    config.unicast_targets.extend(unicast);
    if no_multicast {
        config.multicast = false;
    }
    config.validate()?;

    Ok(Options {
        config,
        signature,
        duration,
    })
}

fn print_usage() {
    eprintln!(
        r"treelink-discover - browse tree servers on the local network

USAGE:
    treelink-discover [OPTIONS]

OPTIONS:
    -c, --config <FILE>         Discovery config (TOML)
    -s, --signature <PATTERN>   Server signature wildcard [default: *]
    -g, --group <ADDR>          Multicast group
    -p, --port <PORT>           Discovery UDP port
    -i, --interval-ms <MS>      Probe interval
    -u, --unicast <ADDR:PORT>   Extra unicast probe target (repeatable)
        --no-multicast          Probe unicast targets only
    -d, --duration-secs <SECS>  Exit after this long
    -h, --help                  Print help"
    );
}
