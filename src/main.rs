use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use pqbms_lib::{ble::BleTransport, client::BmsClient, report::BmsReport};
use std::{ops::Deref, panic, time::Duration};

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Read the full battery telemetry and version info, print as JSON
    Bms,
    /// Show firmware version, hardware version and manufacture date
    Version,
    /// Read the BMS internal serial number (most firmware never answers this)
    SerialNumber,
}

const fn about_text() -> &'static str {
    "PowerQueen LiFePO4 BMS command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
struct CliArgs {
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,

    /// Bluetooth device address or name (e.g., "12:34:56:78:AA:CC")
    address: String,

    #[command(subcommand)]
    command: CliCommands,

    /// Timeout waiting for each BMS response (e.g., "500ms", "4s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "4s")]
    timeout: Duration,

    /// Delay between sending multiple commands to the BMS (e.g., "100ms")
    /// (the BMS drops commands that arrive back to back)
    #[arg(value_parser = humantime::parse_duration, long, default_value = "100ms")]
    delay: Duration,

    /// Pair with the device after connecting
    #[arg(long, action)]
    pair: bool,

    /// Abort with a full error chain instead of the JSON error report
    #[arg(long, action)]
    debug: bool,
}

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!("Connecting to {}", args.address);

    let transport = BleTransport::new(&args.address, args.pair);
    let mut client = BmsClient::new(transport);
    client.set_timeout(args.timeout).set_delay(args.delay);

    match args.command {
        CliCommands::Bms => match client.read_all().await {
            Ok(data) => {
                let report = BmsReport::from_data(&data);
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report)
                        .with_context(|| "Cannot serialize report")?
                );
            }
            Err(error) => {
                if args.debug {
                    return Err(error).with_context(|| "Cannot read BMS");
                }
                let code = error.error_code();
                let report = BmsReport::from_error(&error);
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report)
                        .with_context(|| "Cannot serialize report")?
                );
                std::process::exit(code);
            }
        },
        CliCommands::Version => match client.read_version().await {
            Ok(version) => {
                println!("Firmware version: {}", version.firmware_version());
                println!("Hardware version: {}", version.hardware_version);
                println!("Manufacture date: {}", version.manufacture_date());
            }
            Err(error) => {
                if args.debug {
                    return Err(error).with_context(|| "Cannot read version");
                }
                eprintln!("Cannot read version: {error}");
                std::process::exit(error.error_code());
            }
        },
        CliCommands::SerialNumber => match client.read_serial_number().await {
            Ok(payload) => println!("Serial number payload: {}", hex::encode(payload)),
            Err(error) => {
                if args.debug {
                    return Err(error).with_context(|| "Cannot read serial number");
                }
                eprintln!(
                    "Cannot read serial number: {error} \
                     (most PowerQueen firmware does not implement this command)"
                );
                std::process::exit(error.error_code());
            }
        },
    }
    Ok(())
}
