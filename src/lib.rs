//! # DCC Tester
//!
//! Host-side toolkit for exercising a DCC command-station tester board
//! over its line-framed JSON-RPC serial protocol. The crate builds
//! NMRA-style DCC packets, injects single-bit faults into them, drives
//! the command-station session and reads decoder CVs through
//! service-mode ACK pulses. A virtual command station with an attached
//! decoder model is included so everything can run without hardware.

pub mod badbit;
pub mod cv;
pub mod error;
pub mod fault;
pub mod packet;
pub mod rpc;
pub mod sim;
pub mod station;

pub use badbit::{run_bad_bit_test, BadBitConfig, BadBitOutcome, FeedbackMode};
pub use cv::{Clock, CvReadConfig, CvReader, SystemClock};
pub use error::{Error, Result};
pub use fault::apply_flip_mask;
pub use packet::{dcc_checksum, PacketKind};
pub use rpc::RpcClient;
pub use sim::CommandStationSim;
pub use station::{CommandStation, CommandStationParams, ParamsUpdate};
