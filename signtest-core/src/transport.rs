//! Point-to-point request/response seam between the protocol client and the
//! physical (or simulated) test board.
//!
//! The board firmware exposes a handful of vendor control requests. Each one
//! carries a 16-bit value, a 16-bit index and a variable-length data stage.
//! Implementations are synchronous and are not assumed to be safe for
//! concurrent calls; the state machine owns its transport exclusively.

use core::fmt;

use thiserror::Error;

/// Vendor request codes understood by the board firmware.
///
/// The numeric values are a compatibility contract with the firmware and must
/// not change.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Request {
    Reprogram = 0x02,
    ReadStatus = 0x10,
    SetMode = 0x11,
    SetLed = 0x12,
    ScratchPad = 0x18,
    /// Fills the scratch pad with 0xFF.
    ClearScratchPad = 0x19,
    SpiFlash = 0x1A,
    SpiFpga = 0x1B,
    FlashEraseSector = 0x20,
    FlashEraseBlock = 0x21,
    FlashRead = 0x22,
    FlashProgram = 0x23,
    FlashReadId = 0x24,
    /// CRC32 over a 64 KiB block. Reserved: the firmware does not implement it.
    FlashCrc32 = 0x28,
}

impl Request {
    /// Raw `bRequest` byte placed in the setup packet.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Decodes a raw request byte.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x02 => Some(Self::Reprogram),
            0x10 => Some(Self::ReadStatus),
            0x11 => Some(Self::SetMode),
            0x12 => Some(Self::SetLed),
            0x18 => Some(Self::ScratchPad),
            0x19 => Some(Self::ClearScratchPad),
            0x1A => Some(Self::SpiFlash),
            0x1B => Some(Self::SpiFpga),
            0x20 => Some(Self::FlashEraseSector),
            0x21 => Some(Self::FlashEraseBlock),
            0x22 => Some(Self::FlashRead),
            0x23 => Some(Self::FlashProgram),
            0x24 => Some(Self::FlashReadId),
            0x28 => Some(Self::FlashCrc32),
            _ => None,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}(0x{:02x})", self.code())
    }
}

/// Failures raised by the transport itself, independent of what the board
/// replied.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum TransportError {
    /// The device handle is stale or the board has been unplugged.
    #[error("device disconnected")]
    Disconnected,
    #[error("transfer timed out")]
    Timeout,
    /// The device stalled the control pipe (unknown or rejected request).
    #[error("control pipe stalled")]
    Stalled,
    #[error("transport I/O failure: {0}")]
    Io(String),
}

/// Abstract control-transfer channel to a test board.
pub trait Transport {
    /// Issues a device-to-host request and returns the data stage.
    ///
    /// The returned buffer may be shorter than `length` when the device sends
    /// a short reply; callers validate the size they need.
    fn request_in(
        &mut self,
        request: Request,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError>;

    /// Issues a host-to-device request with an optional data stage.
    fn request_out(
        &mut self,
        request: Request,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), TransportError>;
}

impl<T> Transport for &mut T
where
    T: Transport + ?Sized,
{
    fn request_in(
        &mut self,
        request: Request,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        (**self).request_in(request, value, index, length)
    }

    fn request_out(
        &mut self,
        request: Request,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        (**self).request_out(request, value, index, data)
    }
}

impl<T> Transport for Box<T>
where
    T: Transport + ?Sized,
{
    fn request_in(
        &mut self,
        request: Request,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        (**self).request_in(request, value, index, length)
    }

    fn request_out(
        &mut self,
        request: Request,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        (**self).request_out(request, value, index, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_codes_match_firmware_map() {
        let fixtures = [
            (Request::Reprogram, 0x02),
            (Request::ReadStatus, 0x10),
            (Request::SetMode, 0x11),
            (Request::SetLed, 0x12),
            (Request::ScratchPad, 0x18),
            (Request::ClearScratchPad, 0x19),
            (Request::SpiFlash, 0x1A),
            (Request::SpiFpga, 0x1B),
            (Request::FlashEraseSector, 0x20),
            (Request::FlashEraseBlock, 0x21),
            (Request::FlashRead, 0x22),
            (Request::FlashProgram, 0x23),
            (Request::FlashReadId, 0x24),
            (Request::FlashCrc32, 0x28),
        ];

        for (request, code) in fixtures {
            assert_eq!(request.code(), code);
            assert_eq!(Request::from_code(code), Some(request));
        }
    }

    #[test]
    fn unknown_request_code_is_rejected() {
        assert_eq!(Request::from_code(0x00), None);
        assert_eq!(Request::from_code(0x41), None);
    }
}
