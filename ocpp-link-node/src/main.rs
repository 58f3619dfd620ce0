//! OCPP Link Node - CLI for the OCPP-J roles
//!
//! # Usage
//!
//! ```bash
//! # Central system on 0.0.0.0:9002, announced over mDNS
//! ocpp-link-node central --mdns
//!
//! # Relay on 0.0.0.0:9000 in front of a central system
//! ocpp-link-node relay --upstream ws://192.168.1.20:9002
//!
//! # Charging station, discovering the central system over mDNS
//! ocpp-link-node station --id CP001
//!
//! # Charging station with a fixed address
//! ocpp-link-node station --id CP001 --address 192.168.1.20
//!
//! # Convert a heartbeat RTT log to CSV
//! ocpp-link-node export-csv rtt_ocpp_messages.txt rtt.csv
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use ocpp_link::config::{CALL_TIMEOUT, CSMS_PORT, RELAY_CALL_TIMEOUT, RELAY_PORT};
use ocpp_link::{
    export_csv, CentralSystem, CentralSystemConfig, ChargingStation, MdnsDiscovery, Relay,
    RelayConfig, RttLog, RttSummary, StationConfig,
};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// OCPP-J charging station, central system and relay
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a charging station
    Station {
        /// Charging station id
        #[arg(short, long, default_value = "CP001")]
        id: String,

        /// Central system host; discovered over mDNS when omitted
        #[arg(short, long)]
        address: Option<String>,

        /// Central system port
        #[arg(short, long, default_value_t = CSMS_PORT)]
        port: u16,

        /// Vendor name
        #[arg(long, default_value = "INESCTEC")]
        vendor: String,

        /// Model name (defaults to "Wallbox <id>")
        #[arg(long)]
        model: Option<String>,

        /// Heartbeat RTT log
        #[arg(long, default_value = "rtt_ocpp_messages.txt")]
        report: PathBuf,

        /// Seconds to wait for a call result
        #[arg(long, default_value_t = CALL_TIMEOUT.as_secs())]
        call_timeout: u64,
    },

    /// Run a central system
    Central {
        /// Listen address
        #[arg(short, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], CSMS_PORT)))]
        bind: SocketAddr,

        /// Heartbeat interval handed out in BootNotification responses, in seconds
        #[arg(long, default_value = "10")]
        heartbeat_interval: u64,

        /// Announce the central system over mDNS
        #[arg(long)]
        mdns: bool,
    },

    /// Run a relay between stations and a central system
    Relay {
        /// Listen address
        #[arg(short, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], RELAY_PORT)))]
        bind: SocketAddr,

        /// Central system base URL; the station id is appended
        #[arg(short, long, default_value = "ws://localhost:9002")]
        upstream: String,

        /// Seconds a relayed call may take, including the wait for the
        /// central system; keep it below the stations' own call timeout
        #[arg(long, default_value_t = RELAY_CALL_TIMEOUT.as_secs())]
        call_timeout: u64,
    },

    /// Convert a heartbeat RTT log to CSV
    ExportCsv {
        /// RTT log written by a station
        input: PathBuf,

        /// CSV file to write
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(log_filter(&args.log_level, rust_log.as_deref()))
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Station {
            id,
            address,
            port,
            vendor,
            model,
            report,
            call_timeout,
        } => {
            let model = model.unwrap_or_else(|| format!("Wallbox {}", id));
            banner(
                "Charging Station",
                &[
                    ("Station", id.clone()),
                    ("Central", address.clone().unwrap_or_else(|| "mDNS".into())),
                    ("Port", port.to_string()),
                    ("Model", format!("{} {}", vendor, model)),
                    ("Report", report.display().to_string()),
                ],
            );

            let mut config = StationConfig::new(id)
                .with_port(port)
                .with_vendor(vendor, model)
                .with_report_path(report)
                .with_call_timeout(Duration::from_secs(call_timeout));
            if let Some(address) = address {
                config = config.with_address(address);
            }

            info!("Starting charging station...");
            let station = ChargingStation::new(config, MdnsDiscovery::new()?);
            station.run().await;
        }

        Command::Central {
            bind,
            heartbeat_interval,
            mdns,
        } => {
            banner(
                "Central System",
                &[
                    ("Listen", bind.to_string()),
                    ("Heartbeat", format!("{}s", heartbeat_interval)),
                    ("mDNS", if mdns { "on" } else { "off" }.to_string()),
                ],
            );

            let mut config = CentralSystemConfig::default()
                .with_bind(bind)
                .with_heartbeat_interval(Duration::from_secs(heartbeat_interval));
            if mdns {
                config = config.with_mdns();
            }

            info!("Starting central system...");
            CentralSystem::new(config).run().await?;
        }

        Command::Relay {
            bind,
            upstream,
            call_timeout,
        } => {
            banner(
                "Relay",
                &[
                    ("Listen", bind.to_string()),
                    ("Upstream", upstream.clone()),
                ],
            );

            let config = RelayConfig::default()
                .with_bind(bind)
                .with_upstream(upstream)
                .with_call_timeout(Duration::from_secs(call_timeout));

            info!("Starting relay...");
            Relay::new(config).run().await?;
        }

        Command::ExportCsv { input, output } => {
            let rows = export_csv(&input, &output)?;
            println!("Wrote {} rows to {}", rows, output.display());

            let samples = RttLog::new(&input).read_all()?;
            if let Some(summary) = RttSummary::from_samples(&samples) {
                println!("{}", summary);
            }
        }
    }

    Ok(())
}

fn parse_level(log_level: &str) -> LevelFilter {
    match log_level {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

/// RUST_LOG directives when set, otherwise `--log-level` for everything
fn log_filter(log_level: &str, rust_log: Option<&str>) -> EnvFilter {
    match rust_log.map(str::trim).filter(|directives| !directives.is_empty()) {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::default().add_directive(parse_level(log_level).into()),
    }
}

fn banner(role: &str, rows: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║  OCPP Link - {:<48} ║", role);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (label, value) in rows {
        println!("║  {:<9} {:<49} ║", format!("{}:", label), truncate(value, 49));
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_flag_sets_filter() {
        assert_eq!(log_filter("debug", None).max_level_hint(), Some(LevelFilter::DEBUG));
        assert_eq!(log_filter("error", None).max_level_hint(), Some(LevelFilter::ERROR));
        assert_eq!(log_filter("loud", None).max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn test_rust_log_overrides_flag() {
        assert_eq!(
            log_filter("debug", Some("warn")).max_level_hint(),
            Some(LevelFilter::WARN)
        );
        assert_eq!(
            log_filter("info", Some("ocpp_link=trace")).max_level_hint(),
            Some(LevelFilter::TRACE)
        );
        // Blank RUST_LOG falls back to the flag
        assert_eq!(
            log_filter("warn", Some("  ")).max_level_hint(),
            Some(LevelFilter::WARN)
        );
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 6), "abc...");
    }
}
