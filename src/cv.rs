//! Service-mode CV reading via direct bit verify and current-pulse
//! ACK detection.
//!
//! For each of the 8 bits of the target CV a verify packet with
//! `bit_value = 1` is transmitted and the track current is polled for
//! an ACK pulse. An observed pulse decides the bit as 1; a silent
//! window, after bounded retries, is read as 0 (the zero polarity is
//! never probed explicitly).

use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::packet::{direct_bit_verify_packet, reset_packet};
use crate::station::CommandStation;

/// Sampling interval of the ACK polling loop.
pub const ACK_POLL_INTERVAL_MS: u64 = 2;

/// Time source and sleeper, injectable so tests can simulate time
/// instead of wall-clock sleeping.
pub trait Clock {
    /// Milliseconds since an arbitrary fixed origin.
    fn now_ms(&self) -> u64;
    fn sleep_ms(&mut self, ms: u64);
}

/// Wall-clock implementation used against real hardware.
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn sleep_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

/// Parameters of one CV read session.
#[derive(Debug, Clone)]
pub struct CvReadConfig {
    /// CV number, 1-1024.
    pub cv: u16,
    /// Attempts per bit before giving up on an ACK.
    pub repeats_per_bit: u32,
    /// Delay between queued packets during the priming sequence.
    pub inter_packet_delay_ms: u32,
    /// Current rise over the baseline that counts as an ACK.
    pub ack_threshold_ma: i64,
    /// How long to poll for an ACK after each transmission.
    pub ack_window_ms: u64,
}

/// One CV read session. Created per CV, consumed by [`read`](Self::read)
/// or [`read_strict`](Self::read_strict).
pub struct CvReader<'a, C: Read + Write, K: Clock> {
    station: &'a mut CommandStation<C>,
    clock: K,
    config: CvReadConfig,
}

impl<'a, C: Read + Write, K: Clock> CvReader<'a, C, K> {
    pub fn new(station: &'a mut CommandStation<C>, clock: K, config: CvReadConfig) -> Self {
        Self { station, clock, config }
    }

    /// Reads the CV, inferring 0 for every bit that never ACKs.
    ///
    /// Bit `b` contributes `bit << b`, so bit 0 is the least
    /// significant bit of the result. A sweep in which no bit ACKs at
    /// all fails with [`Error::NoAckDetected`]: without a single
    /// confirmed 1-bit there is no evidence a decoder answered at all.
    pub fn read(&mut self) -> Result<u8> {
        let mut value = 0u8;
        let mut any_ack = false;
        for bit_index in 0..8u8 {
            let acked = self.probe_bit(bit_index)?;
            if acked {
                value |= 1 << bit_index;
                any_ack = true;
            }
            debug!(bit_index, bit = u8::from(acked), "bit decided");
        }
        if !any_ack {
            return Err(Error::NoAckDetected {
                bit_index: 7,
                attempts: self.config.repeats_per_bit,
            });
        }
        info!(cv = self.config.cv, value, "CV read complete");
        Ok(value)
    }

    /// Reads the CV, treating any bit that exhausts its retries
    /// without an ACK as fatal for the whole session.
    ///
    /// This mirrors the historical driver exactly: once a bit stays
    /// silent, the firmware's per-bit service-mode state is assumed
    /// unreliable for the rest of the sequence.
    pub fn read_strict(&mut self) -> Result<u8> {
        let mut value = 0u8;
        for bit_index in 0..8u8 {
            if !self.probe_bit(bit_index)? {
                return Err(Error::NoAckDetected {
                    bit_index,
                    attempts: self.config.repeats_per_bit,
                });
            }
            value |= 1 << bit_index;
        }
        info!(cv = self.config.cv, value, "CV read complete");
        Ok(value)
    }

    /// Probes one bit with `bit_value = 1`, retrying up to
    /// `repeats_per_bit` times. `Ok(true)` means an ACK was seen.
    fn probe_bit(&mut self, bit_index: u8) -> Result<bool> {
        let verify = direct_bit_verify_packet(self.config.cv, bit_index, 1)?;
        for attempt in 0..self.config.repeats_per_bit {
            let baseline_ma = self.station.current_feedback_ma()?;
            if attempt == 0 {
                // Prime the decoder's service-mode state: two resets
                // and the verify packet queued together, dumped by one
                // transmission.
                let reset = reset_packet();
                self.station.load_packet(&reset, true)?;
                self.station.load_packet(&reset, false)?;
                self.station.load_packet(&verify, false)?;
                self.station.transmit_packet(3, self.config.inter_packet_delay_ms)?;
            } else {
                self.station.load_packet(&verify, true)?;
                self.station.transmit()?;
            }
            if self.detect_ack(baseline_ma)? {
                debug!(bit_index, attempt, "ACK detected");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Polls the current feedback every 2 ms until the window closes.
    /// The first sample at or above `baseline + threshold` decides the
    /// ACK; detection is edge-triggered, not averaged.
    fn detect_ack(&mut self, baseline_ma: i64) -> Result<bool> {
        let deadline = self.clock.now_ms() + self.config.ack_window_ms;
        while self.clock.now_ms() < deadline {
            let current_ma = self.station.current_feedback_ma()?;
            if current_ma >= baseline_ma + self.config.ack_threshold_ma {
                return Ok(true);
            }
            self.clock.sleep_ms(ACK_POLL_INTERVAL_MS);
        }
        Ok(false)
    }
}

/// Aggregates already-decided bits, index 0 = least significant.
pub fn bits_to_value(bits: &[u8; 8]) -> u8 {
    bits.iter()
        .enumerate()
        .fold(0, |value, (index, bit)| value | ((bit & 1) << index))
}
