//! USB packet-trace decoder used when diagnosing board firmware.
//!
//! Input is a raw byte capture of packets laid back to back with no framing.
//! Packet boundaries come from the PID: handshakes are one byte, tokens and
//! SOF are three, and data packets run until the running CRC16 matches the
//! USB residue. Anything that does not decode is reported as garbage and the
//! decoder resynchronises on the next byte that passes the PID self-check.
//! Output is purely informational.

use core::fmt;

use thiserror::Error;
use winnow::binary::le_u16;
use winnow::prelude::*;
use winnow::token::any;

const CRC16_POLY_REFLECTED: u16 = 0xA001;
const CRC16_RESIDUE: u16 = 0x800D;

const fn crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut index = 0;
    while index < 256 {
        let mut crc = index as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC16_POLY_REFLECTED
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[index] = crc;
        index += 1;
    }
    table
}

static CRC16_TABLE: [u16; 256] = crc16_table();

/// Advances a reflected CRC16 register by one byte.
#[must_use]
pub fn crc16_update(register: u16, byte: u8) -> u16 {
    (register >> 8) ^ CRC16_TABLE[usize::from(register.to_le_bytes()[0] ^ byte)]
}

/// CRC16 as transmitted after a USB data payload (complemented, sent LSB first).
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    !data.iter().fold(0xFFFF, |register, &byte| crc16_update(register, byte))
}

/// `true` once a register fed with payload and CRC reaches the USB residue.
#[must_use]
pub const fn crc16_residue_ok(register: u16) -> bool {
    register.reverse_bits() == CRC16_RESIDUE
}

/// Packet identifiers, keyed by their 4-bit type field.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PacketId {
    Reserved,
    Out,
    In,
    Sof,
    Setup,
    Data0,
    Data1,
    Data2,
    MData,
    Ack,
    Nak,
    Stall,
    Nyet,
    PreErr,
    Split,
    Ping,
}

/// How a packet's extent is determined.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PacketClass {
    Handshake,
    Token,
    StartOfFrame,
    Data,
    Special,
}

impl PacketId {
    /// Decodes a PID byte, rejecting bytes whose high nibble is not the
    /// complement of the low nibble.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        if byte & 0x0F != !(byte >> 4) & 0x0F {
            return None;
        }
        Some(Self::from_nibble(byte & 0x0F))
    }

    const fn from_nibble(nibble: u8) -> Self {
        match nibble {
            0x1 => Self::Out,
            0x9 => Self::In,
            0x5 => Self::Sof,
            0xD => Self::Setup,
            0x3 => Self::Data0,
            0xB => Self::Data1,
            0x7 => Self::Data2,
            0xF => Self::MData,
            0x2 => Self::Ack,
            0xA => Self::Nak,
            0xE => Self::Stall,
            0x6 => Self::Nyet,
            0xC => Self::PreErr,
            0x8 => Self::Split,
            0x4 => Self::Ping,
            _ => Self::Reserved,
        }
    }

    #[must_use]
    pub const fn class(self) -> PacketClass {
        match self {
            Self::Ack | Self::Nak | Self::Stall | Self::Nyet => PacketClass::Handshake,
            Self::Out | Self::In | Self::Setup | Self::Ping => PacketClass::Token,
            Self::Sof => PacketClass::StartOfFrame,
            Self::Data0 | Self::Data1 | Self::Data2 | Self::MData => PacketClass::Data,
            Self::Reserved | Self::PreErr | Self::Split => PacketClass::Special,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Reserved => "RESERVED",
            Self::Out => "OUT",
            Self::In => "IN",
            Self::Sof => "SOF",
            Self::Setup => "SETUP",
            Self::Data0 => "DATA0",
            Self::Data1 => "DATA1",
            Self::Data2 => "DATA2",
            Self::MData => "MDATA",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Stall => "STALL",
            Self::Nyet => "NYET",
            Self::PreErr => "PRE/ERR",
            Self::Split => "SPLIT",
            Self::Ping => "PING",
        }
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One decoded unit of the trace.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Frame {
    Handshake(PacketId),
    Token {
        kind: PacketId,
        address: u8,
        endpoint: u8,
        crc5: u8,
    },
    StartOfFrame {
        frame: u16,
        crc5: u8,
    },
    Data {
        kind: PacketId,
        payload: Vec<u8>,
    },
    /// PID with one trailing byte and no further decoding.
    Special {
        pid: PacketId,
        byte: u8,
    },
    /// Bytes skipped while resynchronising.
    Garbage(Vec<u8>),
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Handshake(pid) => write!(f, "{pid}"),
            Frame::Token {
                kind,
                address,
                endpoint,
                crc5,
            } => write!(f, "{kind} addr={address} ep={endpoint} crc5=0x{crc5:02x}"),
            Frame::StartOfFrame { frame, crc5 } => write!(f, "SOF frame={frame} crc5=0x{crc5:02x}"),
            Frame::Data { kind, payload } => {
                write!(f, "{kind} [{}]", payload.len())?;
                write_hex(f, payload)
            }
            Frame::Special { pid, byte } => write!(f, "{pid} 0x{byte:02x}"),
            Frame::Garbage(bytes) => {
                write!(f, "?? [{}]", bytes.len())?;
                write_hex(f, bytes)
            }
        }
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for byte in bytes {
        write!(f, " {byte:02x}")?;
    }
    Ok(())
}

fn token_word(input: &mut &[u8]) -> winnow::Result<u16> {
    le_u16.parse_next(input)
}

fn special_byte(input: &mut &[u8]) -> winnow::Result<u8> {
    any.parse_next(input)
}

/// Iterator over the frames in a captured trace.
pub struct TraceDecoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TraceDecoder<'a> {
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Collects bytes from `start` up to (not including) the next valid PID.
    fn resync(&mut self, start: usize) -> Frame {
        let end = self.data[start + 1..]
            .iter()
            .position(|&byte| PacketId::from_byte(byte).is_some())
            .map_or(self.data.len(), |offset| start + 1 + offset);
        self.pos = end;
        Frame::Garbage(self.data[start..end].to_vec())
    }

    /// Ends a data packet at the first position where the CRC residue holds.
    fn data_end(&self, body_start: usize) -> Option<usize> {
        let mut register = 0xFFFF;
        for (offset, &byte) in self.data[body_start..].iter().enumerate() {
            register = crc16_update(register, byte);
            if offset >= 1 && crc16_residue_ok(register) {
                return Some(body_start + offset + 1);
            }
        }
        None
    }
}

impl Iterator for TraceDecoder<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        let start = self.pos;
        let &pid_byte = self.data.get(start)?;
        let Some(pid) = PacketId::from_byte(pid_byte) else {
            return Some(self.resync(start));
        };
        let mut body = &self.data[start + 1..];

        let frame = match pid.class() {
            PacketClass::Handshake => {
                self.pos = start + 1;
                Frame::Handshake(pid)
            }
            PacketClass::Token | PacketClass::StartOfFrame => {
                let Ok(word) = token_word(&mut body) else {
                    return Some(self.resync(start));
                };
                self.pos = start + 3;
                let crc5 = (word >> 11) as u8;
                if pid == PacketId::Sof {
                    Frame::StartOfFrame {
                        frame: word & 0x07FF,
                        crc5,
                    }
                } else {
                    Frame::Token {
                        kind: pid,
                        address: (word & 0x7F) as u8,
                        endpoint: ((word >> 7) & 0x0F) as u8,
                        crc5,
                    }
                }
            }
            PacketClass::Data => {
                let Some(end) = self.data_end(start + 1) else {
                    return Some(self.resync(start));
                };
                self.pos = end;
                Frame::Data {
                    kind: pid,
                    payload: self.data[start + 1..end - 2].to_vec(),
                }
            }
            PacketClass::Special => {
                let Ok(byte) = special_byte(&mut body) else {
                    return Some(self.resync(start));
                };
                self.pos = start + 2;
                Frame::Special { pid, byte }
            }
        };
        Some(frame)
    }
}

/// Rejected text capture.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum HexCaptureError {
    #[error("invalid hex byte {token:?} at token {position}")]
    InvalidByte { token: String, position: usize },
}

/// Parses a whitespace-separated hex capture (`d2 69 00 10 ...`).
/// An optional `0x` prefix on each byte is accepted.
///
/// # Errors
///
/// Returns [`HexCaptureError::InvalidByte`] for the first token that is not
/// a single hex byte.
pub fn parse_hex_capture(text: &str) -> Result<Vec<u8>, HexCaptureError> {
    text.split_whitespace()
        .enumerate()
        .map(|(position, token)| {
            let digits = token
                .strip_prefix("0x")
                .or_else(|| token.strip_prefix("0X"))
                .unwrap_or(token);
            u8::from_str_radix(digits, 16).map_err(|_| HexCaptureError::InvalidByte {
                token: token.to_string(),
                position,
            })
        })
        .collect()
}
