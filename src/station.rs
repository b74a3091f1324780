//! Thin session wrapper over the RPC transport.
//!
//! Each operation issues exactly one RPC call and fails with
//! [`Error::Remote`] when the firmware answers `status != "ok"`.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::rpc::{expect_ok, RpcClient};

/// Session configuration of the remote firmware. The firmware owns
/// these values; this side only proposes and reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStationParams {
    #[serde(rename = "track_voltage")]
    pub track_voltage_mv: u32,
    pub preamble_bits: u32,
    #[serde(rename = "bit1_duration")]
    pub bit1_duration_us: u32,
    #[serde(rename = "bit0_duration")]
    pub bit0_duration_us: u32,
    pub bidi_enable: bool,
    pub bidi_dac: u32,
    pub trigger_first_bit: bool,
}

/// Partial parameter update; `None` fields are left untouched by the
/// firmware.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ParamsUpdate {
    #[serde(rename = "track_voltage", skip_serializing_if = "Option::is_none")]
    pub track_voltage_mv: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preamble_bits: Option<u32>,
    #[serde(rename = "bit1_duration", skip_serializing_if = "Option::is_none")]
    pub bit1_duration_us: Option<u32>,
    #[serde(rename = "bit0_duration", skip_serializing_if = "Option::is_none")]
    pub bit0_duration_us: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bidi_enable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bidi_dac: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_first_bit: Option<bool>,
}

/// Command-station session over an RPC connection.
///
/// Packet loading, transmission and overrides are only meaningful
/// while the station is running. Dropping a running session issues a
/// best-effort stop so an interrupted test run leaves the track idle.
pub struct CommandStation<C: Read + Write> {
    rpc: RpcClient<C>,
    running: bool,
}

impl<C: Read + Write> CommandStation<C> {
    pub fn new(rpc: RpcClient<C>) -> Self {
        Self { rpc, running: false }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Round-trips arbitrary params through the firmware's echo method.
    pub fn echo(&mut self, params: Value) -> Result<Value> {
        let response = expect_ok(self.rpc.call("echo", params)?)?;
        Ok(response.get("echo").cloned().unwrap_or(Value::Null))
    }

    /// Starts the command station in custom packet mode.
    pub fn start(&mut self, loop_count: u32) -> Result<()> {
        expect_ok(self.rpc.call("command_station_start", json!({ "loop": loop_count }))?)?;
        self.running = true;
        info!(loop_count, "command station started");
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        expect_ok(self.rpc.call("command_station_stop", json!({}))?)?;
        self.running = false;
        info!("command station stopped");
        Ok(())
    }

    /// Loads a custom packet into the transmit queue.
    ///
    /// `replace = true` clears any queued packets first; `false`
    /// appends, so several packets can be queued and then dumped by a
    /// single [`transmit_packet`](Self::transmit_packet) call.
    pub fn load_packet(&mut self, bytes: &[u8], replace: bool) -> Result<usize> {
        let response = expect_ok(self.rpc.call(
            "command_station_load_packet",
            json!({ "bytes": bytes, "replace": replace }),
        )?)?;
        Ok(response
            .get("length")
            .and_then(Value::as_u64)
            .unwrap_or(bytes.len() as u64) as usize)
    }

    /// Transmits the queued packets `count` times with `delay_ms`
    /// between packets.
    pub fn transmit_packet(&mut self, count: u32, delay_ms: u32) -> Result<()> {
        expect_ok(self.rpc.call(
            "command_station_transmit_packet",
            json!({ "count": count, "delay_ms": delay_ms }),
        )?)?;
        Ok(())
    }

    /// Transmits the queue once, back to back.
    pub fn transmit(&mut self) -> Result<()> {
        self.transmit_packet(1, 0)
    }

    pub fn set_params(&mut self, update: &ParamsUpdate) -> Result<()> {
        let params = serde_json::to_value(update).map_err(Error::MalformedResponse)?;
        expect_ok(self.rpc.call("command_station_params", params)?)?;
        Ok(())
    }

    pub fn get_params(&mut self) -> Result<CommandStationParams> {
        let response = expect_ok(self.rpc.call("command_station_get_params", json!({}))?)?;
        let parameters = response
            .get("parameters")
            .cloned()
            .ok_or_else(|| Error::Remote(response))?;
        serde_json::from_value(parameters).map_err(Error::MalformedResponse)
    }

    /// Sets the transient zero-bit timing override. The firmware
    /// zeroes these again when the station stops.
    pub fn set_override(&mut self, mask: u32, delta_p_us: i32, delta_n_us: i32) -> Result<()> {
        expect_ok(self.rpc.call(
            "command_station_packet_override",
            json!({
                "zerobit_override_mask": mask,
                "zerobit_deltaP": delta_p_us,
                "zerobit_deltaN": delta_n_us,
            }),
        )?)?;
        Ok(())
    }

    pub fn reset_override(&mut self) -> Result<()> {
        expect_ok(self.rpc.call("command_station_packet_reset_override", json!({}))?)?;
        Ok(())
    }

    /// Single track-current sample in milliamps.
    pub fn current_feedback_ma(&mut self) -> Result<i64> {
        let response = self.rpc.call("get_current_feedback_ma", json!({}))?;
        let response = match expect_ok(response) {
            Ok(response) => response,
            Err(Error::Remote(body)) => return Err(Error::FeedbackRead(body)),
            Err(e) => return Err(e),
        };
        response
            .get("current_ma")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::FeedbackRead(response))
    }

    /// Single track-voltage sample in millivolts.
    pub fn voltage_feedback_mv(&mut self) -> Result<i64> {
        let response = self.rpc.call("get_voltage_feedback_mv", json!({}))?;
        let response = match expect_ok(response) {
            Ok(response) => response,
            Err(Error::Remote(body)) => return Err(Error::FeedbackRead(body)),
            Err(e) => return Err(e),
        };
        response
            .get("voltage_mv")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::FeedbackRead(response))
    }

    /// Averaged track-voltage reading.
    pub fn voltage_feedback_mv_averaged(
        &mut self,
        num_samples: u32,
        sample_delay_ms: u32,
    ) -> Result<i64> {
        let response = expect_ok(self.rpc.call(
            "get_voltage_feedback_mv",
            json!({ "num_samples": num_samples, "sample_delay_ms": sample_delay_ms }),
        )?)?;
        response
            .get("voltage_mv")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::FeedbackRead(response))
    }

    /// Level of a single GPIO input pin (1-based, IOn = pin n).
    pub fn gpio_input(&mut self, pin: u32) -> Result<u8> {
        let response = expect_ok(self.rpc.call("get_gpio_input", json!({ "pin": pin }))?)?;
        response
            .get("value")
            .and_then(Value::as_u64)
            .map(|v| v as u8)
            .ok_or_else(|| Error::FeedbackRead(response))
    }

    /// All GPIO inputs as a bitfield, bit n-1 = IOn.
    pub fn gpio_inputs(&mut self) -> Result<u16> {
        let response = expect_ok(self.rpc.call("get_gpio_inputs", json!({}))?)?;
        response
            .get("value")
            .and_then(Value::as_u64)
            .map(|v| v as u16)
            .ok_or_else(|| Error::FeedbackRead(response))
    }

    pub fn set_gpio_output(&mut self, pin: u32, state: u8) -> Result<()> {
        expect_ok(self.rpc.call("set_gpio_output", json!({ "pin": pin, "state": state }))?)?;
        Ok(())
    }
}

impl<C: Read + Write> Drop for CommandStation<C> {
    fn drop(&mut self) {
        if self.running {
            // Best-effort: the track should not be left powered when a
            // test run unwinds. Failure here is only logged.
            warn!("session dropped while running, sending stop");
            let _ = self.rpc.call("command_station_stop", json!({}));
        }
    }
}
