//! Virtual DCC command station.
//!
//! Simulates the firmware's RPC surface over any line-based transport,
//! so scripts and tests run without physical hardware. The simulator is
//! stateful: it tracks the running state, session parameters, the
//! custom packet queue, GPIO levels and a simple attached-decoder model
//! that rejects checksum-corrupted packets, drives a motor from speed
//! packets and answers service-mode bit verifies with current ACK
//! pulses.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind, Read, Write};
use std::rc::Rc;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::packet::dcc_checksum;
use crate::station::CommandStationParams;

const MAX_PACKET_LEN: usize = 18;
const RUN_CURRENT_MA: i64 = 500;
const MOTOR_CURRENT_MA: i64 = 200;
const ACK_PULSE_MA: i64 = 100;
const ACK_PULSE_SAMPLES: u32 = 2;

/// IO13/IO14 mirror the motor driver outputs: both high while the
/// motor is off, at least one low while it runs.
const MOTOR_IO_MASK: u16 = (1 << 12) | (1 << 13);

fn default_params() -> CommandStationParams {
    CommandStationParams {
        track_voltage_mv: 15_000,
        preamble_bits: 17,
        bit1_duration_us: 58,
        bit0_duration_us: 100,
        bidi_enable: false,
        bidi_dac: 2048,
        trigger_first_bit: false,
    }
}

/// Decoder sitting on the simulated track.
#[derive(Debug, Clone)]
struct DecoderSim {
    address: u8,
    cvs: HashMap<u16, u8>,
    motor_speed: u8,
}

impl DecoderSim {
    fn new(address: u8) -> Self {
        Self { address, cvs: HashMap::new(), motor_speed: 0 }
    }

    fn motor_running(&self) -> bool {
        // Speed step 1 is emergency stop, so the motor only turns from
        // step 2 upward.
        self.motor_speed >= 2
    }
}

/// Stateful command-station simulator.
pub struct CommandStationSim {
    running: bool,
    loop_mode: u32,
    params: CommandStationParams,
    override_mask: u64,
    override_delta_p: i64,
    override_delta_n: i64,
    packet_queue: Vec<Vec<u8>>,
    gpio_inputs: u16,
    gpio_outputs: u16,
    voltage_mv: i64,
    ack_samples_remaining: u32,
    fail_feedback: bool,
    decoder: Option<DecoderSim>,
    method_calls: HashMap<String, u32>,
}

impl CommandStationSim {
    pub fn new() -> Self {
        Self {
            running: false,
            loop_mode: 0,
            params: default_params(),
            override_mask: 0,
            override_delta_p: 0,
            override_delta_n: 0,
            packet_queue: Vec::new(),
            gpio_inputs: MOTOR_IO_MASK,
            gpio_outputs: 0,
            voltage_mv: 15_000,
            ack_samples_remaining: 0,
            fail_feedback: false,
            decoder: None,
            method_calls: HashMap::new(),
        }
    }

    /// Puts a decoder with the given short address on the track.
    pub fn attach_decoder(&mut self, address: u8) {
        self.decoder = Some(DecoderSim::new(address));
    }

    /// Programs a CV value into the attached decoder.
    pub fn set_decoder_cv(&mut self, cv: u16, value: u8) {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.cvs.insert(cv, value);
        }
    }

    /// Makes every feedback read fail, as a shorted sense resistor
    /// would.
    pub fn set_feedback_failure(&mut self, fail: bool) {
        self.fail_feedback = fail;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn queue_len(&self) -> usize {
        self.packet_queue.len()
    }

    pub fn decoder_motor_running(&self) -> bool {
        self.decoder.as_ref().is_some_and(DecoderSim::motor_running)
    }

    pub fn override_params(&self) -> (u64, i64, i64) {
        (self.override_mask, self.override_delta_p, self.override_delta_n)
    }

    /// Number of requests seen for an RPC method.
    pub fn calls(&self, method: &str) -> u32 {
        self.method_calls.get(method).copied().unwrap_or(0)
    }

    /// Processes one request line and returns the response line
    /// (without the terminator).
    pub fn process_line(&mut self, line: &str) -> String {
        let response = match serde_json::from_str::<Value>(line) {
            Ok(request) => self.process_request(&request),
            Err(_) => json!({ "status": "error", "message": "Invalid JSON" }),
        };
        response.to_string()
    }

    /// Dispatches a parsed RPC request.
    pub fn process_request(&mut self, request: &Value) -> Value {
        let Some(method) = request.get("method").and_then(Value::as_str) else {
            return json!({ "status": "error", "message": "Malformed request" });
        };
        let params = match request.get("params") {
            None => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return json!({ "status": "error", "message": "Params must be an object" });
            }
        };

        *self.method_calls.entry(method.to_string()).or_insert(0) += 1;
        debug!(%method, "simulator request");

        match method {
            "echo" => json!({ "status": "ok", "echo": Value::Object(params) }),
            "command_station_start" => self.handle_start(&params),
            "command_station_stop" => self.handle_stop(),
            "command_station_load_packet" => self.handle_load_packet(&params),
            "command_station_transmit_packet" => self.handle_transmit_packet(&params),
            "command_station_params" => self.handle_params(&params),
            "command_station_get_params" => self.handle_get_params(),
            "command_station_packet_override" => self.handle_override(&params),
            "command_station_packet_reset_override" => self.handle_reset_override(),
            "get_current_feedback_ma" => self.handle_current_feedback(&params),
            "get_voltage_feedback_mv" => self.handle_voltage_feedback(&params),
            "get_gpio_input" => self.handle_gpio_input(&params),
            "get_gpio_inputs" => json!({ "status": "ok", "value": self.gpio_inputs() }),
            "set_gpio_output" | "configure_gpio_output" => self.handle_gpio_output(&params),
            _ => json!({ "status": "error", "message": "Unknown method" }),
        }
    }

    fn handle_start(&mut self, params: &Map<String, Value>) -> Value {
        if self.running {
            return json!({ "status": "error", "message": "Command station is already running" });
        }
        let loop_mode = match params.get("loop") {
            None => 0,
            Some(Value::Bool(b)) => u32::from(*b),
            Some(v) => match v.as_u64() {
                Some(n) => n as u32,
                None => {
                    return json!({ "status": "error", "message": "loop must be an integer" });
                }
            },
        };
        self.running = true;
        self.loop_mode = loop_mode;
        json!({ "status": "ok", "message": "Command station started", "loop": loop_mode })
    }

    fn handle_stop(&mut self) -> Value {
        if !self.running {
            return json!({ "status": "error", "message": "Command station is not running" });
        }
        self.running = false;
        self.ack_samples_remaining = 0;
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.motor_speed = 0;
        }
        self.gpio_inputs |= MOTOR_IO_MASK;
        // Override parameters live in RAM only and are zeroed on stop.
        self.override_mask = 0;
        self.override_delta_p = 0;
        self.override_delta_n = 0;
        json!({ "status": "ok", "message": "Command station stopped" })
    }

    fn handle_load_packet(&mut self, params: &Map<String, Value>) -> Value {
        let Some(bytes) = params.get("bytes").and_then(Value::as_array) else {
            return json!({ "status": "error", "message": "bytes must be an array" });
        };
        let mut packet = Vec::with_capacity(bytes.len());
        for value in bytes {
            match value.as_u64() {
                Some(b) if b <= 255 => packet.push(b as u8),
                _ => {
                    return json!({
                        "status": "error",
                        "message": "all bytes must be unsigned integers (0-255)",
                    });
                }
            }
        }
        if packet.len() > MAX_PACKET_LEN {
            return json!({ "status": "error", "message": "packet too long (max 18 bytes)" });
        }
        let replace = params.get("replace").and_then(Value::as_bool).unwrap_or(false);
        let length = packet.len();
        if replace {
            self.packet_queue.clear();
        }
        self.packet_queue.push(packet);
        json!({
            "status": "ok",
            "message": "Packet loaded successfully",
            "length": length,
            "replace": replace,
        })
    }

    fn handle_transmit_packet(&mut self, params: &Map<String, Value>) -> Value {
        if !self.running {
            return json!({ "status": "error", "message": "Command station is not running" });
        }
        let count = params.get("count").and_then(Value::as_u64).unwrap_or(1);
        let delay_ms = params.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);

        // A new transmission supersedes any ACK pulse still pending
        // from the previous one.
        self.ack_samples_remaining = 0;
        let queue = self.packet_queue.clone();
        for packet in &queue {
            self.decode_on_track(packet);
        }
        json!({ "status": "ok", "count": count, "delay_ms": delay_ms })
    }

    /// What the attached decoder makes of a transmitted packet.
    fn decode_on_track(&mut self, packet: &[u8]) {
        if packet.iter().all(|&b| b == 0) {
            // Service mode reset.
            return;
        }
        if dcc_checksum(packet) != 0 {
            debug!(?packet, "decoder rejected corrupted packet");
            return;
        }
        let Some(decoder) = self.decoder.as_mut() else {
            return;
        };
        match packet {
            // Advanced operations speed packet.
            [address, 0x3F, speed_byte, _] => {
                if *address == decoder.address || *address == 0 {
                    decoder.motor_speed = speed_byte & 0x7F;
                    let running = decoder.motor_running();
                    if running {
                        self.gpio_inputs &= !MOTOR_IO_MASK;
                    } else {
                        self.gpio_inputs |= MOTOR_IO_MASK;
                    }
                }
            }
            // Service mode direct bit verify.
            [instruction, addr_low, data, _]
                if (instruction & 0xFC) == 0x7C && (data & 0xE0) == 0xE0 =>
            {
                let cv = (u16::from(instruction & 0x03) << 8 | u16::from(*addr_low)) + 1;
                let bit_value = (data >> 3) & 0x01;
                let bit_index = data & 0x07;
                let actual = decoder.cvs.get(&cv).copied().unwrap_or(0);
                if (actual >> bit_index) & 0x01 == bit_value {
                    self.ack_samples_remaining = ACK_PULSE_SAMPLES;
                }
            }
            _ => {}
        }
    }

    fn handle_params(&mut self, params: &Map<String, Value>) -> Value {
        for (key, value) in params {
            let updated = match key.as_str() {
                "bidi_enable" => set_bool(&mut self.params.bidi_enable, value),
                "trigger_first_bit" => set_bool(&mut self.params.trigger_first_bit, value),
                "track_voltage" => set_u32(&mut self.params.track_voltage_mv, value),
                "preamble_bits" => set_u32(&mut self.params.preamble_bits, value),
                "bit1_duration" => set_u32(&mut self.params.bit1_duration_us, value),
                "bit0_duration" => set_u32(&mut self.params.bit0_duration_us, value),
                "bidi_dac" => set_u32(&mut self.params.bidi_dac, value),
                _ => continue,
            };
            if !updated {
                let expected = match key.as_str() {
                    "bidi_enable" | "trigger_first_bit" => "a boolean",
                    _ => "a positive integer",
                };
                return json!({ "status": "error", "message": format!("{key} must be {expected}") });
            }
        }
        json!({ "status": "ok", "message": "Command station parameters updated" })
    }

    fn handle_get_params(&self) -> Value {
        let mut parameters = match serde_json::to_value(&self.params) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        parameters.insert(
            "zerobit_override_mask".into(),
            json!(format!("0x{:016X}", self.override_mask)),
        );
        parameters.insert("zerobit_deltaP".into(), json!(self.override_delta_p));
        parameters.insert("zerobit_deltaN".into(), json!(self.override_delta_n));
        json!({ "status": "ok", "parameters": parameters })
    }

    fn handle_override(&mut self, params: &Map<String, Value>) -> Value {
        if let Some(value) = params.get("zerobit_override_mask") {
            let mask = match value {
                Value::String(s) => {
                    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
                }
                other => other.as_u64(),
            };
            match mask {
                Some(mask) => self.override_mask = mask,
                None => {
                    return json!({
                        "status": "error",
                        "message": "zerobit_override_mask must be an integer or hex string",
                    });
                }
            }
        }
        if let Some(delta) = params.get("zerobit_deltaP").and_then(Value::as_i64) {
            self.override_delta_p = delta;
        }
        if let Some(delta) = params.get("zerobit_deltaN").and_then(Value::as_i64) {
            self.override_delta_n = delta;
        }
        json!({ "status": "ok", "message": "Packet override parameters updated" })
    }

    fn handle_reset_override(&mut self) -> Value {
        self.override_mask = 0;
        self.override_delta_p = 0;
        self.override_delta_n = 0;
        json!({ "status": "ok", "message": "Packet override parameters reset to 0" })
    }

    fn current_ma(&mut self) -> i64 {
        let mut current = 0;
        if self.running {
            current += RUN_CURRENT_MA;
            if self.decoder_motor_running() {
                current += MOTOR_CURRENT_MA;
            }
            if self.ack_samples_remaining > 0 {
                self.ack_samples_remaining -= 1;
                current += ACK_PULSE_MA;
            }
        }
        current
    }

    fn handle_current_feedback(&mut self, params: &Map<String, Value>) -> Value {
        if self.fail_feedback {
            return json!({ "status": "error", "message": "ADC read failed" });
        }
        match validate_sampling(params) {
            Ok(Some((num_samples, sample_delay_ms))) => json!({
                "status": "ok",
                "current_ma": self.current_ma(),
                "averaged": true,
                "num_samples": num_samples,
                "sample_delay_ms": sample_delay_ms,
            }),
            Ok(None) => json!({ "status": "ok", "current_ma": self.current_ma() }),
            Err(message) => json!({ "status": "error", "message": message }),
        }
    }

    fn handle_voltage_feedback(&mut self, params: &Map<String, Value>) -> Value {
        if self.fail_feedback {
            return json!({ "status": "error", "message": "ADC read failed" });
        }
        match validate_sampling(params) {
            Ok(Some((num_samples, sample_delay_ms))) => json!({
                "status": "ok",
                "voltage_mv": self.voltage_mv,
                "averaged": true,
                "num_samples": num_samples,
                "sample_delay_ms": sample_delay_ms,
            }),
            Ok(None) => json!({ "status": "ok", "voltage_mv": self.voltage_mv }),
            Err(message) => json!({ "status": "error", "message": message }),
        }
    }

    fn gpio_inputs(&self) -> u16 {
        self.gpio_inputs
    }

    fn handle_gpio_input(&self, params: &Map<String, Value>) -> Value {
        let Some(pin) = params.get("pin").and_then(Value::as_u64) else {
            return json!({ "status": "error", "message": "pin must be an integer" });
        };
        if pin == 0 || pin > 16 {
            return json!({ "status": "error", "message": "pin must be between 1 and 16" });
        }
        let value = (self.gpio_inputs >> (pin - 1)) & 0x01;
        json!({ "status": "ok", "value": value })
    }

    fn handle_gpio_output(&mut self, params: &Map<String, Value>) -> Value {
        let Some(pin) = params.get("pin").and_then(Value::as_u64) else {
            return json!({ "status": "error", "message": "pin must be an integer" });
        };
        if pin == 0 || pin > 16 {
            return json!({ "status": "error", "message": "pin must be between 1 and 16" });
        }
        let Some(state) = params.get("state").and_then(Value::as_u64) else {
            return json!({ "status": "error", "message": "state must be 0 or 1" });
        };
        if state > 1 {
            return json!({ "status": "error", "message": "state must be 0 or 1" });
        }
        if state == 1 {
            self.gpio_outputs |= 1 << (pin - 1);
        } else {
            self.gpio_outputs &= !(1 << (pin - 1));
        }
        json!({ "status": "ok" })
    }
}

impl Default for CommandStationSim {
    fn default() -> Self {
        Self::new()
    }
}

fn set_bool(slot: &mut bool, value: &Value) -> bool {
    match value.as_bool() {
        Some(b) => {
            *slot = b;
            true
        }
        None => false,
    }
}

fn set_u32(slot: &mut u32, value: &Value) -> bool {
    match value.as_u64() {
        Some(n) if n <= u64::from(u32::MAX) => {
            *slot = n as u32;
            true
        }
        _ => false,
    }
}

type Sampling = Option<(u64, u64)>;

fn validate_sampling(params: &Map<String, Value>) -> std::result::Result<Sampling, String> {
    let num_samples = params.get("num_samples").and_then(Value::as_u64);
    let sample_delay_ms = params.get("sample_delay_ms").and_then(Value::as_u64);
    match (num_samples, sample_delay_ms) {
        (Some(n), Some(d)) => {
            if !(1..=16).contains(&n) {
                return Err("num_samples must be between 1 and 16".into());
            }
            if d > 1000 {
                return Err("sample_delay_ms must be between 0 and 1000".into());
            }
            Ok(Some((n, d)))
        }
        _ => Ok(None),
    }
}

/// Shared handle to a simulator, usable from a [`SimLink`] and a test
/// at the same time.
pub type SimHandle = Rc<RefCell<CommandStationSim>>;

/// In-memory byte-stream connection backed by a simulator.
///
/// Writes accumulate until a full LF-terminated request line arrives;
/// the response bytes are then queued for subsequent reads. Reading
/// with nothing pending behaves like a serial timeout.
pub struct SimLink {
    sim: SimHandle,
    inbuf: Vec<u8>,
    outbuf: VecDeque<u8>,
}

impl SimLink {
    pub fn new(sim: CommandStationSim) -> Self {
        Self::shared(Rc::new(RefCell::new(sim)))
    }

    pub fn shared(sim: SimHandle) -> Self {
        Self { sim, inbuf: Vec::new(), outbuf: VecDeque::new() }
    }

    pub fn handle(&self) -> SimHandle {
        Rc::clone(&self.sim)
    }

    fn pump(&mut self) {
        while let Some(pos) = self.inbuf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.inbuf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let response = self.sim.borrow_mut().process_line(line);
            self.outbuf.extend(response.as_bytes());
            self.outbuf.extend(b"\r\n");
        }
    }
}

impl Write for SimLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inbuf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.pump();
        Ok(())
    }
}

impl Read for SimLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.pump();
        match self.outbuf.pop_front() {
            Some(b) => {
                buf[0] = b;
                Ok(1)
            }
            None => Err(io::Error::new(ErrorKind::TimedOut, "no pending response")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::apply_flip_mask;
    use crate::packet::{direct_bit_verify_packet, speed_packet, stop_packet};

    fn start(sim: &mut CommandStationSim) {
        let response = sim.process_request(&json!({
            "method": "command_station_start", "params": {"loop": 0}
        }));
        assert_eq!(response["status"], "ok");
    }

    #[test]
    fn echo_returns_the_params() {
        let mut sim = CommandStationSim::new();
        let response = sim.process_request(&json!({
            "method": "echo", "params": {"hello": "world"}
        }));
        assert_eq!(response["status"], "ok");
        assert_eq!(response["echo"]["hello"], "world");
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut sim = CommandStationSim::new();
        start(&mut sim);
        let response = sim.process_request(&json!({
            "method": "command_station_start", "params": {"loop": 0}
        }));
        assert_eq!(response["status"], "error");
    }

    #[test]
    fn stop_when_idle_is_rejected() {
        let mut sim = CommandStationSim::new();
        let response = sim.process_request(&json!({
            "method": "command_station_stop", "params": {}
        }));
        assert_eq!(response["status"], "error");
    }

    #[test]
    fn stop_zeroes_the_override_params() {
        let mut sim = CommandStationSim::new();
        start(&mut sim);
        sim.process_request(&json!({
            "method": "command_station_packet_override",
            "params": {"zerobit_override_mask": 4, "zerobit_deltaP": 6, "zerobit_deltaN": -6}
        }));
        assert_eq!(sim.override_params(), (4, 6, -6));
        sim.process_request(&json!({ "method": "command_station_stop", "params": {} }));
        assert_eq!(sim.override_params(), (0, 0, 0));
    }

    #[test]
    fn load_packet_replace_and_append() {
        let mut sim = CommandStationSim::new();
        let load = |sim: &mut CommandStationSim, replace: bool| {
            sim.process_request(&json!({
                "method": "command_station_load_packet",
                "params": {"bytes": [0, 0, 0], "replace": replace}
            }))
        };
        load(&mut sim, true);
        load(&mut sim, false);
        load(&mut sim, false);
        assert_eq!(sim.queue_len(), 3);
        let response = load(&mut sim, true);
        assert_eq!(sim.queue_len(), 1);
        assert_eq!(response["length"], 3);
    }

    #[test]
    fn load_packet_validates_bytes() {
        let mut sim = CommandStationSim::new();
        let response = sim.process_request(&json!({
            "method": "command_station_load_packet",
            "params": {"bytes": [0, 256, 0]}
        }));
        assert_eq!(response["status"], "error");
        let response = sim.process_request(&json!({
            "method": "command_station_load_packet",
            "params": {"bytes": vec![0u8; 19]}
        }));
        assert_eq!(response["status"], "error");
        let response = sim.process_request(&json!({
            "method": "command_station_load_packet",
            "params": {"bytes": "nope"}
        }));
        assert_eq!(response["status"], "error");
    }

    #[test]
    fn params_update_and_readback() {
        let mut sim = CommandStationSim::new();
        let response = sim.process_request(&json!({
            "method": "command_station_params",
            "params": {"preamble_bits": 24, "bidi_enable": true}
        }));
        assert_eq!(response["status"], "ok");
        let response = sim.process_request(&json!({
            "method": "command_station_get_params", "params": {}
        }));
        assert_eq!(response["parameters"]["preamble_bits"], 24);
        assert_eq!(response["parameters"]["bidi_enable"], true);
        assert_eq!(response["parameters"]["track_voltage"], 15_000);
        assert_eq!(response["parameters"]["zerobit_override_mask"], "0x0000000000000000");
    }

    #[test]
    fn params_type_errors_are_reported() {
        let mut sim = CommandStationSim::new();
        let response = sim.process_request(&json!({
            "method": "command_station_params",
            "params": {"bidi_enable": 1}
        }));
        assert_eq!(response["status"], "error");
        let response = sim.process_request(&json!({
            "method": "command_station_params",
            "params": {"preamble_bits": true}
        }));
        assert_eq!(response["status"], "error");
    }

    #[test]
    fn voltage_feedback_sampling_is_validated() {
        let mut sim = CommandStationSim::new();
        let response = sim.process_request(&json!({
            "method": "get_voltage_feedback_mv",
            "params": {"num_samples": 17, "sample_delay_ms": 1}
        }));
        assert_eq!(response["status"], "error");
        let response = sim.process_request(&json!({
            "method": "get_voltage_feedback_mv",
            "params": {"num_samples": 4, "sample_delay_ms": 2}
        }));
        assert_eq!(response["status"], "ok");
        assert_eq!(response["averaged"], true);
        let response = sim.process_request(&json!({
            "method": "get_voltage_feedback_mv", "params": {}
        }));
        assert_eq!(response["voltage_mv"], 15_000);
    }

    #[test]
    fn unknown_method_and_malformed_requests() {
        let mut sim = CommandStationSim::new();
        let response = sim.process_request(&json!({ "method": "no_such_method", "params": {} }));
        assert_eq!(response["message"], "Unknown method");
        let response = sim.process_request(&json!({ "params": {} }));
        assert_eq!(response["message"], "Malformed request");
        let response = sim.process_request(&json!({ "method": "echo", "params": [1, 2] }));
        assert_eq!(response["message"], "Params must be an object");
        assert_eq!(sim.process_line("{broken"), json!({
            "status": "error", "message": "Invalid JSON"
        }).to_string());
    }

    #[test]
    fn motor_follows_valid_speed_packets() {
        let mut sim = CommandStationSim::new();
        sim.attach_decoder(3);
        start(&mut sim);

        let transmit = |sim: &mut CommandStationSim, packet: &[u8]| {
            sim.process_request(&json!({
                "method": "command_station_load_packet",
                "params": {"bytes": packet, "replace": true}
            }));
            sim.process_request(&json!({
                "method": "command_station_transmit_packet", "params": {"delay_ms": 0}
            }));
        };

        transmit(&mut sim, &speed_packet(3, 64, false).unwrap());
        assert!(sim.decoder_motor_running());
        assert_eq!(sim.gpio_inputs() & MOTOR_IO_MASK, 0);

        transmit(&mut sim, &stop_packet(3).unwrap());
        assert!(!sim.decoder_motor_running());
        assert_eq!(sim.gpio_inputs() & MOTOR_IO_MASK, MOTOR_IO_MASK);
    }

    #[test]
    fn decoder_ignores_packets_for_other_addresses() {
        let mut sim = CommandStationSim::new();
        sim.attach_decoder(3);
        start(&mut sim);
        sim.process_request(&json!({
            "method": "command_station_load_packet",
            "params": {"bytes": speed_packet(9, 64, false).unwrap(), "replace": true}
        }));
        sim.process_request(&json!({
            "method": "command_station_transmit_packet", "params": {"delay_ms": 0}
        }));
        assert!(!sim.decoder_motor_running());
    }

    #[test]
    fn corrupted_stop_packet_is_rejected_by_the_decoder() {
        let mut sim = CommandStationSim::new();
        sim.attach_decoder(3);
        start(&mut sim);

        let transmit = |sim: &mut CommandStationSim, packet: &[u8]| {
            sim.process_request(&json!({
                "method": "command_station_load_packet",
                "params": {"bytes": packet, "replace": true}
            }));
            sim.process_request(&json!({
                "method": "command_station_transmit_packet", "params": {"delay_ms": 0}
            }));
        };

        transmit(&mut sim, &speed_packet(3, 64, false).unwrap());
        assert!(sim.decoder_motor_running());

        // Any single flipped bit breaks the checksum; the decoder must
        // keep running.
        let bad_stop = apply_flip_mask(&stop_packet(3).unwrap(), 0x0000_0001);
        transmit(&mut sim, &bad_stop);
        assert!(sim.decoder_motor_running());

        transmit(&mut sim, &stop_packet(3).unwrap());
        assert!(!sim.decoder_motor_running());
    }

    #[test]
    fn matching_bit_verify_produces_an_ack_pulse() {
        let mut sim = CommandStationSim::new();
        sim.attach_decoder(3);
        sim.set_decoder_cv(8, 0x08);
        start(&mut sim);

        let current = |sim: &mut CommandStationSim| {
            sim.process_request(&json!({ "method": "get_current_feedback_ma", "params": {} }))
                ["current_ma"]
                .as_i64()
                .unwrap()
        };

        let baseline = current(&mut sim);
        sim.process_request(&json!({
            "method": "command_station_load_packet",
            "params": {"bytes": direct_bit_verify_packet(8, 3, 1).unwrap(), "replace": true}
        }));
        sim.process_request(&json!({
            "method": "command_station_transmit_packet", "params": {"delay_ms": 0}
        }));
        assert!(current(&mut sim) >= baseline + ACK_PULSE_MA);
        // Pulse decays after a couple of samples.
        let _ = current(&mut sim);
        assert_eq!(current(&mut sim), baseline);
    }

    #[test]
    fn mismatched_bit_verify_stays_silent() {
        let mut sim = CommandStationSim::new();
        sim.attach_decoder(3);
        sim.set_decoder_cv(8, 0x08);
        start(&mut sim);
        sim.process_request(&json!({
            "method": "command_station_load_packet",
            "params": {"bytes": direct_bit_verify_packet(8, 2, 1).unwrap(), "replace": true}
        }));
        sim.process_request(&json!({
            "method": "command_station_transmit_packet", "params": {"delay_ms": 0}
        }));
        let response = sim.process_request(&json!({
            "method": "get_current_feedback_ma", "params": {}
        }));
        assert_eq!(response["current_ma"], RUN_CURRENT_MA);
    }

    #[test]
    fn gpio_input_and_output_round_trip() {
        let mut sim = CommandStationSim::new();
        let response = sim.process_request(&json!({
            "method": "get_gpio_input", "params": {"pin": 13}
        }));
        assert_eq!(response["value"], 1);
        let response = sim.process_request(&json!({
            "method": "get_gpio_input", "params": {"pin": 17}
        }));
        assert_eq!(response["status"], "error");
        let response = sim.process_request(&json!({
            "method": "set_gpio_output", "params": {"pin": 2, "state": 1}
        }));
        assert_eq!(response["status"], "ok");
        let response = sim.process_request(&json!({
            "method": "configure_gpio_output", "params": {"pin": 2, "state": 0}
        }));
        assert_eq!(response["status"], "ok");
    }

    #[test]
    fn sim_link_frames_requests_and_responses() {
        let mut link = SimLink::new(CommandStationSim::new());
        link.write_all(b"{\"method\":\"echo\",\"params\":{\"n\":7}}\r\n").unwrap();
        link.flush().unwrap();
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match link.read(&mut byte) {
                Ok(_) if byte[0] == b'\n' => break,
                Ok(_) => buf.push(byte[0]),
                Err(e) => panic!("unexpected read error: {e}"),
            }
        }
        let response: Value = serde_json::from_str(String::from_utf8_lossy(&buf).trim()).unwrap();
        assert_eq!(response["echo"]["n"], 7);
    }
}
