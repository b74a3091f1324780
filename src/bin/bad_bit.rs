use std::io;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use dcc_tester::badbit::{run_bad_bit_test, BadBitConfig, FeedbackMode};
use dcc_tester::cv::SystemClock;
use dcc_tester::rpc::{RpcClient, DEFAULT_BAUD};
use dcc_tester::station::CommandStation;

/// Run the single-bit corruption acceptance test: a clean pass must
/// stop the motor, a flip-masked stop packet must not.
#[derive(Debug, Parser)]
#[command(name = "bad_bit", version)]
struct Args {
    /// Serial port of the command station (e.g. /dev/ttyACM0).
    port: String,

    /// Locomotive address under test.
    #[arg(long, default_value_t = 3)]
    address: u8,

    /// Flip mask for the stop packet (hex with 0x prefix or decimal).
    /// 0 sweeps all 32 single-bit masks.
    #[arg(long = "mask", value_parser = parse_mask, default_value = "0")]
    flip_mask: u32,

    /// Number of test passes.
    #[arg(long, default_value_t = 10)]
    passes: u32,

    /// Settle time after the start packet, in ms.
    #[arg(long = "delay", default_value_t = 1000)]
    inter_packet_delay_ms: u64,

    /// Settle time after the stop packet, in ms.
    #[arg(long = "stop-delay", default_value_t = 1000)]
    test_stop_delay_ms: u64,

    /// A motor is in circuit: judge by current feedback instead of the
    /// IO13/IO14 driver outputs.
    #[arg(long)]
    in_circuit_motor: bool,

    /// Abort the run on the first failed pass.
    #[arg(long)]
    stop_on_failure: bool,

    /// Serial baud rate.
    #[arg(long, default_value_t = DEFAULT_BAUD)]
    baud: u32,
}

fn parse_mask(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("'{s}' is not a 32-bit mask"))
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
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> dcc_tester::Result<bool> {
    let rpc = RpcClient::open_serial(&args.port, args.baud)?;
    let mut station = CommandStation::new(rpc);
    let mut clock = SystemClock::new();
    info!(port = %args.port, "connected to command station");

    let feedback_mode = if args.in_circuit_motor {
        FeedbackMode::Current
    } else {
        FeedbackMode::MotorIo
    };
    let config = |flip_mask| BadBitConfig {
        address: args.address,
        flip_mask,
        inter_packet_delay_ms: args.inter_packet_delay_ms,
        test_stop_delay_ms: args.test_stop_delay_ms,
        feedback_mode,
    };

    let mut passed = 0u32;
    let mut failed = 0u32;

    'passes: for pass in 1..=args.passes {
        info!(pass, total = args.passes, "starting test pass");

        let masks: Vec<u32> = if args.flip_mask == 0 {
            (0..32).map(|bit| 0x8000_0000 >> bit).collect()
        } else {
            vec![args.flip_mask]
        };

        let mut pass_ok = true;
        for mask in masks {
            // The clean run must stop the motor before the corrupted
            // one is worth judging.
            let baseline = run_bad_bit_test(&mut station, &mut clock, &config(0))?;
            if !baseline.passed {
                error!(pass, readings = ?baseline.readings, "baseline run failed");
                pass_ok = false;
            } else {
                let bad = run_bad_bit_test(&mut station, &mut clock, &config(mask))?;
                if bad.passed {
                    let mask = format!("0x{mask:08X}");
                    error!(pass, %mask, "corrupted stop packet was accepted");
                    pass_ok = false;
                }
            }
            if !pass_ok {
                failed += 1;
                if args.stop_on_failure {
                    break 'passes;
                }
                continue 'passes;
            }
        }
        if pass_ok {
            passed += 1;
            info!(pass, "test pass completed");
        }
    }

    info!(passed, failed, "bad-bit run complete");
    println!("Passed: {passed}  Failed: {failed}");
    Ok(failed == 0)
}
