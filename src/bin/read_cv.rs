use std::io;
use std::process::ExitCode;

use clap::Parser;
use tracing::{info, warn};

use dcc_tester::cv::{Clock, CvReadConfig, CvReader, SystemClock};
use dcc_tester::rpc::{RpcClient, DEFAULT_BAUD};
use dcc_tester::station::{CommandStation, ParamsUpdate};

/// Read a decoder CV over service-mode direct bit verify packets,
/// using current feedback for ACK detection.
#[derive(Debug, Parser)]
#[command(name = "read_cv", version)]
struct Args {
    /// Serial port of the command station (e.g. /dev/ttyACM0).
    port: String,

    /// CV number to read, 1-1024.
    #[arg(long, default_value_t = 8)]
    cv: u16,

    /// Current rise over the baseline that counts as an ACK, in mA.
    #[arg(long = "threshold", default_value_t = 40)]
    ack_threshold_ma: i64,

    /// ACK polling window after each transmission, in ms.
    #[arg(long = "window", default_value_t = 100)]
    ack_window_ms: u64,

    /// Attempts per bit before giving up on an ACK.
    #[arg(long = "repeats", default_value_t = 3)]
    repeats_per_bit: u32,

    /// Delay between queued packets in the priming sequence, in ms.
    #[arg(long = "delay", default_value_t = 10)]
    inter_packet_delay_ms: u32,

    /// Long service-mode preamble to use for the session.
    #[arg(long, default_value_t = 24)]
    preamble_bits: u32,

    /// Treat any bit without an ACK as fatal instead of reading it as 0.
    #[arg(long)]
    strict: bool,

    /// Serial baud rate.
    #[arg(long, default_value_t = DEFAULT_BAUD)]
    baud: u32,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(value) => {
            println!("CV{} = {} (0x{:02X})", args.cv, value, value);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> dcc_tester::Result<u8> {
    let rpc = RpcClient::open_serial(&args.port, args.baud)?;
    let mut station = CommandStation::new(rpc);
    info!(port = %args.port, "connected to command station");

    // The decoder needs the long service-mode preamble; remember the
    // session value so it can be put back afterwards.
    let original_preamble = station.get_params()?.preamble_bits;
    station.set_params(&ParamsUpdate {
        preamble_bits: Some(args.preamble_bits),
        ..Default::default()
    })?;

    station.start(0)?;
    let mut clock = SystemClock::new();
    clock.sleep_ms(1000);

    let config = CvReadConfig {
        cv: args.cv,
        repeats_per_bit: args.repeats_per_bit,
        inter_packet_delay_ms: args.inter_packet_delay_ms,
        ack_threshold_ma: args.ack_threshold_ma,
        ack_window_ms: args.ack_window_ms,
    };
    let mut reader = CvReader::new(&mut station, clock, config);
    let result = if args.strict { reader.read_strict() } else { reader.read() };

    // Teardown runs regardless of the read outcome.
    if let Err(e) = station.stop() {
        warn!("failed to stop command station: {e}");
    }
    if let Err(e) = station.set_params(&ParamsUpdate {
        preamble_bits: Some(original_preamble),
        ..Default::default()
    }) {
        warn!("failed to restore preamble bits: {e}");
    }

    result
}
