//! Wire codec for the TC66 USB-C power meter.
//!
//! The meter answers an ASCII command with a single 192-byte frame encrypted
//! with AES-256 in ECB mode under a fixed key. Fields are little-endian u32
//! values at fixed offsets, scaled by per-field divisors. The bit layout and
//! decryption semantics are a strict contract with the device firmware.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, KeyInit};
use aes::Aes256;
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// Poll command; the device expects CRLF termination.
pub const READ_COMMAND: &[u8] = b"getva\r\n";

/// Fixed response size in bytes (12 AES blocks).
pub const FRAME_LEN: usize = 192;

/// Device firmware key, shared by every TC66 unit.
const FRAME_KEY: [u8; 32] = [
    0x58, 0x21, 0xfa, 0x56, 0x01, 0xb2, 0xf0, 0x26, //
    0x87, 0xff, 0x12, 0x04, 0x62, 0x2a, 0x4f, 0xb0, //
    0x86, 0xf4, 0x02, 0x60, 0x81, 0x6f, 0x9a, 0x0b, //
    0xa7, 0xf1, 0x06, 0x61, 0x9a, 0xb8, 0x72, 0x88, //
];

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("short frame: expected {FRAME_LEN} bytes, got {0}")]
    ShortFrame(usize),
}

/// One decoded measurement frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterFrame {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub resistance: f64,
    pub accumulated_current: f64,
    pub accumulated_power: f64,
    pub temperature: f64,
    pub data_plus: f64,
    pub data_minus: f64,
}

/// Decrypt and decode a raw 192-byte response.
pub fn decode_frame(data: &[u8]) -> Result<MeterFrame, FrameError> {
    if data.len() < FRAME_LEN {
        return Err(FrameError::ShortFrame(data.len()));
    }

    let mut plain = [0u8; FRAME_LEN];
    plain.copy_from_slice(&data[..FRAME_LEN]);
    let cipher = Aes256::new(GenericArray::from_slice(&FRAME_KEY));
    for block in plain.chunks_exact_mut(16) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }

    // Offset 88 carries the temperature sign: 1 means below zero.
    let temperature_sign = if field(&plain, 88, 1.0) == 1.0 { -1.0 } else { 1.0 };

    Ok(MeterFrame {
        voltage: field(&plain, 48, 10_000.0),
        current: field(&plain, 52, 100_000.0),
        power: field(&plain, 56, 10_000.0),
        resistance: field(&plain, 68, 10.0),
        accumulated_current: field(&plain, 72, 1.0),
        accumulated_power: field(&plain, 76, 1.0),
        temperature: field(&plain, 92, 1.0) * temperature_sign,
        data_plus: field(&plain, 96, 100.0),
        data_minus: field(&plain, 100, 100.0),
    })
}

fn field(plain: &[u8], offset: usize, divisor: f64) -> f64 {
    LittleEndian::read_u32(&plain[offset..offset + 4]) as f64 / divisor
}
