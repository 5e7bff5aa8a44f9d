//! Board operations expressed as vendor control requests.
//!
//! [`DeviceClient`] is a thin request/response mapping for the single-shot
//! operations (mode, LEDs, status, scratch pad, raw flash pages) and owns the
//! chunking logic that turns arbitrary flash ranges into 256-byte page
//! transfers staged through the scratch pad.

use core::fmt;

use log::{debug, trace};
use thiserror::Error;

use crate::telemetry::{StatusDecodeError, StatusSample, TimestampMicros};
use crate::transport::{Request, Transport, TransportError};

/// Flash program/read granularity.
pub const PAGE_SIZE: u32 = 256;
/// Flash erase granularity.
pub const SECTOR_SIZE: u32 = 4096;
/// Large erase granularity.
pub const BLOCK_SIZE: u32 = 65536;
/// Size of the on-board staging buffer.
pub const SCRATCH_PAD_SIZE: usize = 256;

/// Image dimensions accepted by [`DeviceClient::send_image_32x32`].
pub const IMAGE_SIDE: usize = 32;
pub const IMAGE_PIXELS: usize = IMAGE_SIDE * IMAGE_SIDE;

const PAGE_BYTES: usize = PAGE_SIZE as usize;
const IMAGE_ROW_OPCODE: u8 = 0x01;

/// Power/SPI routing modes understood by the board firmware.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum DeviceMode {
    Off = 0,
    /// Current-limited input supply, regulators disabled.
    SoftOn = 1,
    On = 2,
    /// Board powered with the flash SPI bus routed to the tester.
    FlashSpi = 3,
    /// Flash released and the FPGA allowed to configure itself.
    FpgaActive = 4,
}

impl DeviceMode {
    #[must_use]
    pub const fn value(self) -> u16 {
        self as u16
    }

    #[must_use]
    pub const fn from_value(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Off),
            1 => Some(Self::SoftOn),
            2 => Some(Self::On),
            3 => Some(Self::FlashSpi),
            4 => Some(Self::FpgaActive),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Errors surfaced by [`DeviceClient`].
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ProtocolError {
    /// Caller passed an address not aligned to the operation's granularity.
    #[error("address 0x{address:08x} is not aligned to {alignment} bytes")]
    InvalidAlignment { address: u32, alignment: u32 },
    /// Page, sector or block index does not fit the 16-bit request value.
    #[error("flash address 0x{address:08x} is out of range")]
    AddressOutOfRange { address: u32 },
    /// Scratch pad access past the end of the staging buffer.
    #[error("scratch pad access of {length} bytes at offset {offset} overflows the pad")]
    ScratchOverflow { offset: usize, length: usize },
    /// The board rejected the operation.
    #[error("{operation} unsuccessful (reply byte {reply:#04x})")]
    Unsuccessful { operation: &'static str, reply: u8 },
    #[error("{request} returned {actual} bytes, expected {expected}")]
    ShortReply {
        request: Request,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ProtocolError {
    /// `true` for precondition violations by the caller, which are never
    /// worth retrying.
    #[must_use]
    pub const fn is_caller_bug(&self) -> bool {
        matches!(
            self,
            Self::InvalidAlignment { .. }
                | Self::AddressOutOfRange { .. }
                | Self::ScratchOverflow { .. }
        )
    }

    /// `true` when the error came from the transport layer.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Protocol client wrapping an exclusively owned transport.
pub struct DeviceClient<T> {
    transport: T,
}

impl<T> DeviceClient<T>
where
    T: Transport,
{
    pub const fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Drops the board into its USB bootloader.
    pub fn reprogram(&mut self) -> Result<(), ProtocolError> {
        self.transport.request_out(Request::Reprogram, 0, 0, &[])?;
        Ok(())
    }

    /// Reads and decodes one status sample.
    pub fn read_status(
        &mut self,
        captured_at: TimestampMicros,
    ) -> Result<StatusSample, ProtocolError> {
        let expected = StatusSample::RAW_LEN;
        let reply = self
            .transport
            .request_in(Request::ReadStatus, 0, 0, expected as u16)?;
        StatusSample::decode(&reply, captured_at).map_err(|err| match err {
            StatusDecodeError::Truncated { expected, actual } => ProtocolError::ShortReply {
                request: Request::ReadStatus,
                expected,
                actual,
            },
        })
    }

    /// Switches the board mode; the firmware acknowledges with a single `1`.
    pub fn set_mode(&mut self, mode: DeviceMode) -> Result<(), ProtocolError> {
        debug!("set mode {mode}");
        let reply = self
            .transport
            .request_in(Request::SetMode, mode.value(), 0, 1)?;
        expect_ack(Request::SetMode, "set mode", &reply)
    }

    pub fn set_led(&mut self, green: bool, red: bool) -> Result<(), ProtocolError> {
        let value = u16::from(green) | (u16::from(red) << 1);
        self.transport.request_out(Request::SetLed, value, 0, &[])?;
        Ok(())
    }

    /// Copies `data` into the scratch pad starting at `offset`.
    pub fn write_scratch(&mut self, data: &[u8], offset: usize) -> Result<(), ProtocolError> {
        let offset_value = scratch_offset(offset, data.len())?;
        self.transport
            .request_out(Request::ScratchPad, offset_value, 0, data)?;
        Ok(())
    }

    pub fn read_scratch(&mut self, length: usize, offset: usize) -> Result<Vec<u8>, ProtocolError> {
        let offset_value = scratch_offset(offset, length)?;
        let reply =
            self.transport
                .request_in(Request::ScratchPad, offset_value, 0, length as u16)?;
        exact_reply(Request::ScratchPad, reply, length)
    }

    /// Fills the scratch pad with the flash erased value (0xFF).
    pub fn clear_scratch_ff(&mut self) -> Result<(), ProtocolError> {
        self.transport
            .request_out(Request::ClearScratchPad, 0, 0, &[])?;
        Ok(())
    }

    /// Exchanges `input` over the flash SPI bus and returns the bytes clocked back.
    pub fn flash_spi(&mut self, input: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        self.spi_exchange(Request::SpiFlash, input)
    }

    /// Exchanges `input` over the FPGA SPI bus and returns the bytes clocked back.
    pub fn fpga_spi(&mut self, input: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        self.spi_exchange(Request::SpiFpga, input)
    }

    fn spi_exchange(&mut self, request: Request, input: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        self.write_scratch(input, 0)?;
        let reply = self
            .transport
            .request_in(request, 0, 0, input.len() as u16)?;
        exact_reply(request, reply, input.len())
    }

    /// Reads the flash JEDEC identifier (manufacturer in the low byte).
    pub fn flash_read_id(&mut self) -> Result<u32, ProtocolError> {
        let reply = self.transport.request_in(Request::FlashReadId, 0, 0, 4)?;
        let reply = exact_reply(Request::FlashReadId, reply, 4)?;
        Ok(u32::from_le_bytes([reply[0], reply[1], reply[2], reply[3]]))
    }

    pub fn flash_erase_sector(&mut self, address: u32) -> Result<(), ProtocolError> {
        let index = granule_index(address, SECTOR_SIZE)?;
        let reply = self
            .transport
            .request_in(Request::FlashEraseSector, index, 0, 1)?;
        expect_ack(Request::FlashEraseSector, "flash erase sector", &reply)
    }

    pub fn flash_erase_block(&mut self, address: u32) -> Result<(), ProtocolError> {
        let index = granule_index(address, BLOCK_SIZE)?;
        let reply = self
            .transport
            .request_in(Request::FlashEraseBlock, index, 0, 1)?;
        expect_ack(Request::FlashEraseBlock, "flash erase block", &reply)
    }

    /// Programs the 256 bytes currently staged in the scratch pad.
    pub fn flash_program_256(&mut self, address: u32) -> Result<(), ProtocolError> {
        let index = granule_index(address, PAGE_SIZE)?;
        let reply = self
            .transport
            .request_in(Request::FlashProgram, index, 0, 1)?;
        expect_ack(Request::FlashProgram, "flash program", &reply)
    }

    /// Reads up to one page directly from flash, bypassing the scratch pad.
    pub fn flash_read_raw_256(
        &mut self,
        address: u32,
        length: usize,
    ) -> Result<Vec<u8>, ProtocolError> {
        let index = granule_index(address, PAGE_SIZE)?;
        if length > PAGE_BYTES {
            return Err(ProtocolError::ScratchOverflow { offset: 0, length });
        }
        let reply = self
            .transport
            .request_in(Request::FlashRead, index, 0, length as u16)?;
        exact_reply(Request::FlashRead, reply, length)
    }

    /// Erases every sector touched by `[address, address + length)`, once each,
    /// in ascending order.
    pub fn flash_erase_region(&mut self, address: u32, length: usize) -> Result<(), ProtocolError> {
        let Some((start, end)) = span(address, length)? else {
            return Ok(());
        };
        let first = start / SECTOR_SIZE;
        let last = (end - 1) / SECTOR_SIZE;
        debug!(
            "erasing sectors {first}..={last} for 0x{start:06x}+{length}",
        );
        for sector in first..=last {
            self.flash_erase_sector(sector * SECTOR_SIZE)?;
        }
        Ok(())
    }

    /// Reads an arbitrary range, one page transfer at a time.
    pub fn flash_read(&mut self, address: u32, length: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut output = Vec::with_capacity(length);
        let Some((start, end)) = span(address, length)? else {
            return Ok(output);
        };

        for page in start / PAGE_SIZE..=(end - 1) / PAGE_SIZE {
            let page_start = page * PAGE_SIZE;
            let lo = start.max(page_start);
            let hi = end.min(page_start + PAGE_SIZE);
            let count = (hi - page_start) as usize;
            let data = self.flash_read_raw_256(page_start, count)?;
            output.extend_from_slice(&data[(lo - page_start) as usize..count]);
        }
        trace!("read {} bytes from 0x{start:06x}", output.len());
        Ok(output)
    }

    /// Writes an arbitrary range. Partially covered pages are staged over an
    /// erased (0xFF) scratch pad so uncovered bytes in the page stay blank.
    ///
    /// The target region is expected to have been erased first.
    pub fn flash_write(&mut self, address: u32, data: &[u8]) -> Result<(), ProtocolError> {
        let Some((start, end)) = span(address, data.len())? else {
            return Ok(());
        };

        for page in start / PAGE_SIZE..=(end - 1) / PAGE_SIZE {
            let page_start = page * PAGE_SIZE;
            let lo = start.max(page_start);
            let hi = end.min(page_start + PAGE_SIZE);
            let chunk = &data[(lo - start) as usize..(hi - start) as usize];

            if chunk.len() == PAGE_BYTES {
                self.write_scratch(chunk, 0)?;
            } else {
                self.clear_scratch_ff()?;
                self.write_scratch(chunk, (lo - page_start) as usize)?;
            }
            self.flash_program_256(page_start)?;
        }
        debug!("programmed {} bytes at 0x{start:06x}", data.len());
        Ok(())
    }

    /// Streams a 32x32 image to one display component, one FPGA SPI frame per row.
    ///
    /// Each frame is `[0x01, component, row]` followed by the row's pixels as
    /// red, green, blue bytes taken from bits 16..24, 8..16 and 0..8.
    pub fn send_image_32x32(
        &mut self,
        component: u8,
        image: &[u32; IMAGE_PIXELS],
    ) -> Result<(), ProtocolError> {
        let mut frame = Vec::with_capacity(3 + IMAGE_SIDE * 3);
        for (row, pixels) in image.chunks_exact(IMAGE_SIDE).enumerate() {
            frame.clear();
            frame.extend_from_slice(&[IMAGE_ROW_OPCODE, component, row as u8]);
            for &pixel in pixels {
                let [_, r, g, b] = pixel.to_be_bytes();
                frame.extend_from_slice(&[r, g, b]);
            }
            self.fpga_spi(&frame)?;
        }
        Ok(())
    }
}

fn expect_ack(request: Request, operation: &'static str, reply: &[u8]) -> Result<(), ProtocolError> {
    match reply.first() {
        Some(1) => Ok(()),
        Some(&other) => Err(ProtocolError::Unsuccessful {
            operation,
            reply: other,
        }),
        None => Err(ProtocolError::ShortReply {
            request,
            expected: 1,
            actual: 0,
        }),
    }
}

fn exact_reply(request: Request, reply: Vec<u8>, expected: usize) -> Result<Vec<u8>, ProtocolError> {
    if reply.len() < expected {
        return Err(ProtocolError::ShortReply {
            request,
            expected,
            actual: reply.len(),
        });
    }
    let mut reply = reply;
    reply.truncate(expected);
    Ok(reply)
}

fn granule_index(address: u32, alignment: u32) -> Result<u16, ProtocolError> {
    if address % alignment != 0 {
        return Err(ProtocolError::InvalidAlignment { address, alignment });
    }
    u16::try_from(address / alignment).map_err(|_| ProtocolError::AddressOutOfRange { address })
}

fn scratch_offset(offset: usize, length: usize) -> Result<u16, ProtocolError> {
    match offset.checked_add(length) {
        Some(end) if end <= SCRATCH_PAD_SIZE => Ok(offset as u16),
        _ => Err(ProtocolError::ScratchOverflow { offset, length }),
    }
}

/// Half-open byte range for a request, or `None` when it is empty.
fn span(address: u32, length: usize) -> Result<Option<(u32, u32)>, ProtocolError> {
    if length == 0 {
        return Ok(None);
    }
    u32::try_from(length)
        .ok()
        .and_then(|length| address.checked_add(length))
        .map(|end| Some((address, end)))
        .ok_or(ProtocolError::AddressOutOfRange { address })
}
