//! DCC packet construction.
//!
//! Every packet ends with an XOR checksum byte, so the XOR over a
//! complete packet (checksum included) is always zero. Builders are
//! pure: they validate their inputs and return bytes, nothing more.

use crate::error::{Error, Result};

/// XOR of all input bytes. Identity element is 0.
pub fn dcc_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// The packet kinds this tester knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Advanced operations speed packet (128 speed-step mode).
    /// Speed byte: bit 7 = direction (1 = forward), bits 6..0 = speed.
    Speed { address: u8, speed: u8, forward: bool },
    /// Speed packet with speed byte 0x81 (forward bit + magnitude 1).
    /// Address 0 is the broadcast address.
    EmergencyStop { address: u8 },
    /// Function Group 1 packet. `mask` bits 0..=3 map to F1..F4.
    FunctionGroup1 { address: u8, mask: u8 },
    /// Basic accessory decoder packet (NMRA S-9.2.1).
    BasicAccessory { address: u16, aux: u8, activate: bool },
    /// Service mode direct bit verify: 0b011111AA, data 0b1110DBBB.
    DirectBitVerify { cv: u16, bit_index: u8, bit_value: u8 },
    /// Service mode reset packet, fixed three zero bytes.
    ServiceModeReset,
}

impl PacketKind {
    /// Validates the field ranges and encodes the packet bytes,
    /// checksum included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match *self {
            PacketKind::Speed { address, speed, forward } => {
                if address > 127 {
                    return Err(Error::InvalidParameter(format!(
                        "address must be 0-127 for short addresses, got {address}"
                    )));
                }
                if speed > 127 {
                    return Err(Error::InvalidParameter(format!(
                        "speed must be 0-127, got {speed}"
                    )));
                }
                let speed_byte = if forward { 0x80 | speed } else { speed };
                Ok(with_checksum(&[address, 0x3F, speed_byte]))
            }
            PacketKind::EmergencyStop { address } => {
                if address > 127 {
                    return Err(Error::InvalidParameter(format!(
                        "address must be 0-127 (0 = broadcast), got {address}"
                    )));
                }
                Ok(with_checksum(&[address, 0x3F, 0x81]))
            }
            PacketKind::FunctionGroup1 { address, mask } => {
                if address == 0 || address > 127 {
                    return Err(Error::InvalidParameter(format!(
                        "address must be 1-127 for short addresses, got {address}"
                    )));
                }
                if mask > 0x0F {
                    return Err(Error::InvalidParameter(format!(
                        "function mask must only use bits F1-F4, got 0x{mask:02X}"
                    )));
                }
                Ok(with_checksum(&[address, 0x80 | mask]))
            }
            PacketKind::BasicAccessory { address, aux, activate } => {
                if address == 0 || address > 511 {
                    return Err(Error::InvalidParameter(format!(
                        "address must be 1-511 for basic accessory packets, got {address}"
                    )));
                }
                if aux == 0 || aux > 4 {
                    return Err(Error::InvalidParameter(format!(
                        "aux_number must be 1-4, got {aux}"
                    )));
                }
                // Byte 1: 10AAAAAA (A0-A5)
                // Byte 2: 1AAACDDD (A6-A8, C = activate, DDD = output)
                let addr = address - 1;
                let output = aux - 1;
                let byte1 = 0x80 | (addr & 0x3F) as u8;
                let byte2 = 0x80
                    | (((addr >> 6) & 0x07) as u8) << 4
                    | u8::from(activate) << 3
                    | (output & 0x07);
                Ok(with_checksum(&[byte1, byte2]))
            }
            PacketKind::DirectBitVerify { cv, bit_index, bit_value } => {
                if cv == 0 || cv > 1024 {
                    return Err(Error::InvalidParameter(format!(
                        "cv_number must be 1-1024, got {cv}"
                    )));
                }
                if bit_index > 7 {
                    return Err(Error::InvalidParameter(format!(
                        "bit_index must be 0-7, got {bit_index}"
                    )));
                }
                if bit_value > 1 {
                    return Err(Error::InvalidParameter(format!(
                        "bit_value must be 0 or 1, got {bit_value}"
                    )));
                }
                let cv_addr = cv - 1;
                let instruction = 0x7C | ((cv_addr >> 8) & 0x03) as u8;
                let addr_low = (cv_addr & 0xFF) as u8;
                let data = 0xE0 | (bit_value << 3) | bit_index;
                Ok(with_checksum(&[instruction, addr_low, data]))
            }
            PacketKind::ServiceModeReset => Ok(vec![0x00, 0x00, 0x00]),
        }
    }
}

fn with_checksum(body: &[u8]) -> Vec<u8> {
    let mut packet = body.to_vec();
    packet.push(dcc_checksum(body));
    packet
}

/// Speed packet for a short-address locomotive.
pub fn speed_packet(address: u8, speed: u8, forward: bool) -> Result<Vec<u8>> {
    PacketKind::Speed { address, speed, forward }.encode()
}

/// Address-directed stop: speed 0, forward.
pub fn stop_packet(address: u8) -> Result<Vec<u8>> {
    speed_packet(address, 0, true)
}

/// Emergency stop packet; address 0 broadcasts to all decoders.
pub fn emergency_stop_packet(address: u8) -> Result<Vec<u8>> {
    PacketKind::EmergencyStop { address }.encode()
}

/// Function Group 1 packet turning a single function (F1-F4) on.
pub fn function_on_packet(address: u8, function_number: u8) -> Result<Vec<u8>> {
    if function_number == 0 || function_number > 4 {
        return Err(Error::InvalidParameter(format!(
            "function_number must be 1-4 (F1-F4), got {function_number}"
        )));
    }
    PacketKind::FunctionGroup1 { address, mask: 1 << (function_number - 1) }.encode()
}

/// Function Group 1 packet with all of F1-F4 off.
pub fn function_off_packet(address: u8) -> Result<Vec<u8>> {
    PacketKind::FunctionGroup1 { address, mask: 0 }.encode()
}

/// Aux ON packet for a basic accessory decoder output.
pub fn aux_on_packet(address: u16, aux_number: u8) -> Result<Vec<u8>> {
    PacketKind::BasicAccessory { address, aux: aux_number, activate: true }.encode()
}

/// Aux OFF packet for a basic accessory decoder output.
pub fn aux_off_packet(address: u16, aux_number: u8) -> Result<Vec<u8>> {
    PacketKind::BasicAccessory { address, aux: aux_number, activate: false }.encode()
}

/// Service mode direct bit verify packet.
pub fn direct_bit_verify_packet(cv: u16, bit_index: u8, bit_value: u8) -> Result<Vec<u8>> {
    PacketKind::DirectBitVerify { cv, bit_index, bit_value }.encode()
}

/// Service mode reset packet.
pub fn reset_packet() -> Vec<u8> {
    vec![0x00, 0x00, 0x00]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_empty_slice_is_zero() {
        assert_eq!(dcc_checksum(&[]), 0);
    }

    #[test]
    fn every_built_packet_xors_to_zero() {
        let packets = vec![
            speed_packet(3, 64, false).unwrap(),
            speed_packet(127, 127, true).unwrap(),
            emergency_stop_packet(0).unwrap(),
            function_on_packet(10, 2).unwrap(),
            function_off_packet(10).unwrap(),
            aux_on_packet(1, 1).unwrap(),
            aux_off_packet(511, 4).unwrap(),
            direct_bit_verify_packet(8, 3, 1).unwrap(),
            direct_bit_verify_packet(1024, 7, 0).unwrap(),
            reset_packet(),
        ];
        for packet in packets {
            assert_eq!(dcc_checksum(&packet), 0, "packet {packet:02X?}");
        }
    }

    #[test]
    fn speed_packet_exact_bytes() {
        let packet = speed_packet(3, 64, false).unwrap();
        assert_eq!(packet, vec![0x03, 0x3F, 0x40, 0x7C]);
    }

    #[test]
    fn forward_speed_sets_direction_bit() {
        let packet = speed_packet(3, 64, true).unwrap();
        assert_eq!(packet[2], 0xC0);
    }

    #[test]
    fn emergency_stop_exact_bytes() {
        let packet = emergency_stop_packet(3).unwrap();
        assert_eq!(packet, vec![0x03, 0x3F, 0x81, 0xBD]);
    }

    #[test]
    fn accessory_packet_exact_bytes() {
        let packet = aux_on_packet(1, 1).unwrap();
        assert_eq!(packet, vec![0x80, 0x88, 0x08]);
    }

    #[test]
    fn accessory_packet_encodes_high_address_bits() {
        // Address 65 -> addr 64 -> A0-A5 = 0, A6-A8 = 1
        let packet = aux_off_packet(65, 2).unwrap();
        assert_eq!(packet[0], 0x80);
        assert_eq!(packet[1], 0x80 | 0x10 | 0x01);
    }

    #[test]
    fn function_packet_exact_bytes() {
        let packet = function_on_packet(5, 3).unwrap();
        assert_eq!(packet, vec![0x05, 0x84, 0x81]);
        let packet = function_off_packet(5).unwrap();
        assert_eq!(packet, vec![0x05, 0x80, 0x85]);
    }

    #[test]
    fn direct_bit_verify_exact_bytes() {
        // CV 8, bit 3, value 1: instruction 0x7C, addr 0x07, data 0xEB
        let packet = direct_bit_verify_packet(8, 3, 1).unwrap();
        assert_eq!(packet[0], 0x7C);
        assert_eq!(packet[1], 0x07);
        assert_eq!(packet[2], 0xE0 | (1 << 3) | 3);
    }

    #[test]
    fn direct_bit_verify_high_cv_uses_address_bits() {
        // CV 1024 -> cv_addr 1023 = 0x3FF
        let packet = direct_bit_verify_packet(1024, 0, 0).unwrap();
        assert_eq!(packet[0], 0x7C | 0x03);
        assert_eq!(packet[1], 0xFF);
    }

    #[test]
    fn reset_packet_is_three_zero_bytes() {
        assert_eq!(reset_packet(), vec![0x00, 0x00, 0x00]);
    }

    #[test]
    fn aux_number_bounds_are_enforced() {
        assert!(matches!(aux_on_packet(1, 0), Err(Error::InvalidParameter(_))));
        assert!(matches!(aux_on_packet(1, 5), Err(Error::InvalidParameter(_))));
        for aux in 1..=4 {
            assert!(aux_on_packet(1, aux).is_ok());
        }
    }

    #[test]
    fn accessory_address_bounds_are_enforced() {
        assert!(matches!(aux_on_packet(0, 1), Err(Error::InvalidParameter(_))));
        assert!(matches!(aux_on_packet(512, 1), Err(Error::InvalidParameter(_))));
        assert!(aux_on_packet(511, 1).is_ok());
    }

    #[test]
    fn cv_number_bounds_are_enforced() {
        assert!(matches!(
            direct_bit_verify_packet(0, 0, 1),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            direct_bit_verify_packet(1025, 0, 1),
            Err(Error::InvalidParameter(_))
        ));
        assert!(direct_bit_verify_packet(1, 0, 1).is_ok());
        assert!(direct_bit_verify_packet(1024, 0, 1).is_ok());
    }

    #[test]
    fn bit_verify_field_bounds_are_enforced() {
        assert!(matches!(
            direct_bit_verify_packet(8, 8, 1),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            direct_bit_verify_packet(8, 0, 2),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn speed_and_function_bounds_are_enforced() {
        assert!(matches!(speed_packet(128, 0, true), Err(Error::InvalidParameter(_))));
        assert!(matches!(speed_packet(3, 128, true), Err(Error::InvalidParameter(_))));
        assert!(matches!(function_on_packet(0, 1), Err(Error::InvalidParameter(_))));
        assert!(matches!(function_on_packet(3, 5), Err(Error::InvalidParameter(_))));
    }
}
