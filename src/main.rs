//! did_reader - reads UDS data identifiers over CAN and annotates their CSV templates

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use ecu_did_reader::{
    ReaderError,
    bus::CanBus,
    config::ReaderConfig,
    hardware::{self, InterfaceKind},
    session::{ReadSession, RunReport},
    uds::DataIdentifier,
};

#[derive(Parser, Debug)]
#[command(version, about = "Reads UDS data identifiers from ECUs over CAN")]
struct Args {
    /// TOML configuration file. Built in defaults are used for anything it leaves out
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (Off=0, Error=1, Warn=2, Info=3, Debug=4, Trace=5)
    #[arg(short, long, default_value_t = 3)]
    log_level: u8,

    /// CAN adapter type (slcan, socketcan, virtual)
    #[arg(short, long)]
    interface: Option<InterfaceKind>,

    /// Serial port or network interface of the adapter
    #[arg(long)]
    channel: Option<String>,

    /// CAN bit rate
    #[arg(short, long)]
    bitrate: Option<u32>,

    /// Data identifier to read, in hex (repeatable). Replaces the configured list
    #[arg(short, long = "did", value_parser = parse_did)]
    dids: Vec<DataIdentifier>,

    /// Template directory
    #[arg(long)]
    format_dir: Option<PathBuf>,

    /// Output directory
    #[arg(long)]
    result_dir: Option<PathBuf>,

    /// Response timeout in milliseconds
    #[arg(short, long)]
    timeout_ms: Option<u64>,
}

fn parse_did(s: &str) -> Result<DataIdentifier, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    DataIdentifier::from_str_radix(digits, 16).map_err(|e| format!("invalid DID '{s}': {e}"))
}

trait ToLogLevelFilter {
    fn to_log_level_filter(self) -> log::LevelFilter;
}

impl ToLogLevelFilter for u8 {
    fn to_log_level_filter(self) -> log::LevelFilter {
        match self {
            0 => log::LevelFilter::Off,
            1 => log::LevelFilter::Error,
            2 => log::LevelFilter::Warn,
            3 => log::LevelFilter::Info,
            4 => log::LevelFilter::Debug,
            5 => log::LevelFilter::Trace,
            _ => log::LevelFilter::Warn,
        }
    }
}

fn load_config(args: &Args) -> Result<ReaderConfig, ReaderError> {
    let mut cfg = match &args.config {
        Some(path) => ReaderConfig::load(path)?,
        None => ReaderConfig::default(),
    };
    if let Some(i) = args.interface {
        cfg.bus.interface = i;
    }
    if let Some(c) = &args.channel {
        cfg.bus.channel = c.clone();
    }
    if let Some(b) = args.bitrate {
        cfg.bus.bitrate = b;
    }
    if !args.dids.is_empty() {
        cfg.dids = args.dids.clone();
    }
    if let Some(d) = &args.format_dir {
        cfg.templates.format_dir = d.clone();
    }
    if let Some(d) = &args.result_dir {
        cfg.templates.result_dir = d.clone();
    }
    if let Some(t) = args.timeout_ms {
        cfg.timing.response_timeout_ms = t;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn run(cfg: &ReaderConfig) -> Result<RunReport, ReaderError> {
    let device = hardware::open_device(&cfg.bus)?;
    let bus = CanBus::open(device, cfg.bus.bitrate, cfg.uses_extended_ids())?;
    let report = ReadSession::new(&bus, cfg).run(&cfg.plans, &cfg.dids);
    if let Err(e) = bus.shutdown() {
        log::warn!("Bus shutdown failed: {e}");
    }
    Ok(report)
}

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level.to_log_level_filter())
        .parse_default_env()
        .format_timestamp_millis()
        .format_target(false)
        .init();

    let result = load_config(&args).and_then(|cfg| run(&cfg));
    match result {
        Ok(report) => {
            log::info!(
                "Done. {} of {} reads received data",
                report.received(),
                report.reads.len()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{e}");
            let mut source = std::error::Error::source(&e);
            while let Some(s) = source {
                log::error!("  caused by: {s}");
                source = std::error::Error::source(s);
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn did_parsing() {
        assert_eq!(parse_did("fa13"), Ok(0xFA13));
        assert_eq!(parse_did("0xFA13"), Ok(0xFA13));
        assert!(parse_did("fa13f").is_err());
        assert!(parse_did("zz").is_err());
    }

    #[test]
    fn cli_overrides_defaults() {
        let args = Args::parse_from([
            "did_reader",
            "--interface",
            "virtual",
            "--did",
            "f190",
            "--did",
            "0xF18C",
            "--timeout-ms",
            "200",
        ]);
        let cfg = load_config(&args).unwrap();
        assert_eq!(cfg.bus.interface, InterfaceKind::Virtual);
        assert_eq!(cfg.dids, vec![0xF190, 0xF18C]);
        assert_eq!(cfg.timing.response_timeout_ms, 200);
        assert_eq!(cfg.plans.len(), 3);
    }

    #[test]
    fn invalid_override_is_rejected() {
        let args = Args::parse_from(["did_reader", "--bitrate", "42"]);
        assert!(matches!(
            load_config(&args),
            Err(ReaderError::Config(_))
        ));
    }
}
