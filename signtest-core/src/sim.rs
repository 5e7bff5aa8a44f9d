//! In-process model of the test board firmware.
//!
//! [`SimulatedBoard`] answers the same vendor requests as the real board: it
//! tracks the device-under-test presence, derives rail voltages from the
//! current mode, keeps a NOR flash image that programming can only clear bits
//! in, and records LED changes and FPGA SPI frames. The handle is cheap to
//! clone; every clone shares the same board so tests can hand one to the
//! state machine and keep another for injecting faults and inspecting state.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use log::trace;

use crate::protocol::{BLOCK_SIZE, DeviceMode, PAGE_SIZE, SCRATCH_PAD_SIZE, SECTOR_SIZE};
use crate::telemetry::StatusSample;
use crate::transport::{Request, Transport, TransportError};

/// Default simulated flash capacity.
pub const SIM_FLASH_SIZE: usize = 1 << 20;

/// JEDEC id reported by the simulated flash (8 Mbit serial NOR).
pub const SIM_FLASH_ID: u32 = 0x0014_40EF;

const SPI_READ_JEDEC_ID: u8 = 0x9F;

/// Input rail reading while the supply is current limited.
pub const SIM_SOFT_ON_VIN: f32 = 4.8;
pub const SIM_VIN: f32 = 5.0;

/// Direction of a logged control transfer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    In,
    Out,
}

/// One control transfer seen by the board.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RequestRecord {
    pub request: Request,
    pub direction: Direction,
    pub value: u16,
    pub index: u16,
    /// Requested length for IN transfers, data length for OUT transfers.
    pub length: usize,
}

struct BoardState {
    connected: bool,
    sense1: bool,
    sense2: bool,
    button: bool,
    power_fault: bool,
    mode: DeviceMode,
    leds: (bool, bool),
    reprogram_requested: bool,
    flash: Vec<u8>,
    scratch: [u8; SCRATCH_PAD_SIZE],
    fpga_frames: Vec<Vec<u8>>,
    failing: HashSet<Request>,
    rejecting: HashSet<Request>,
    log: Vec<RequestRecord>,
}

impl BoardState {
    fn new(flash_size: usize) -> Self {
        Self {
            connected: true,
            sense1: false,
            sense2: false,
            button: false,
            power_fault: false,
            mode: DeviceMode::Off,
            leds: (false, false),
            reprogram_requested: false,
            flash: vec![0xFF; flash_size],
            scratch: [0xFF; SCRATCH_PAD_SIZE],
            fpga_frames: Vec::new(),
            failing: HashSet::new(),
            rejecting: HashSet::new(),
            log: Vec::new(),
        }
    }

    fn inserted(&self) -> bool {
        self.sense1 && self.sense2
    }

    fn powered(&self) -> bool {
        self.inserted()
            && matches!(
                self.mode,
                DeviceMode::On | DeviceMode::FlashSpi | DeviceMode::FpgaActive
            )
    }

    fn status(&self) -> [u8; StatusSample::RAW_LEN] {
        let (vin, v3v3, v1v2) = match self.mode {
            _ if !self.inserted() => (0.0, 0.0, 0.0),
            DeviceMode::Off => (0.0, 0.0, 0.0),
            DeviceMode::SoftOn => (SIM_SOFT_ON_VIN, 0.0, 0.0),
            _ if self.power_fault => (SIM_VIN, 3.3 * 0.8, 1.2 * 0.8),
            _ => (SIM_VIN, 3.3, 1.2),
        };
        StatusSample::encode(vin, v3v3, v1v2, self.sense1, self.sense2, self.button)
    }

    /// Reply byte for acknowledged requests; `0` once when a rejection is armed.
    fn ack(&mut self, request: Request, ok: bool) -> Vec<u8> {
        let rejected = self.rejecting.remove(&request);
        vec![u8::from(ok && !rejected)]
    }

    fn flash_range(&self, start: usize, len: usize) -> Result<core::ops::Range<usize>, TransportError> {
        let end = start + len;
        if end > self.flash.len() {
            return Err(TransportError::Stalled);
        }
        Ok(start..end)
    }

    fn erase(&mut self, index: u16, granule: u32) -> Result<Vec<u8>, TransportError> {
        let request = if granule == SECTOR_SIZE {
            Request::FlashEraseSector
        } else {
            Request::FlashEraseBlock
        };
        let ok = self.mode == DeviceMode::FlashSpi;
        if ok {
            let range = self.flash_range(usize::from(index) * granule as usize, granule as usize)?;
            self.flash[range].fill(0xFF);
        }
        Ok(self.ack(request, ok))
    }

    fn handle_in(&mut self, request: Request, value: u16, length: u16) -> Result<Vec<u8>, TransportError> {
        let length = usize::from(length);
        match request {
            Request::ReadStatus => Ok(self.status().to_vec()),
            Request::SetMode => {
                let Some(mode) = DeviceMode::from_value(value) else {
                    return Ok(self.ack(request, false));
                };
                let ok = mode != DeviceMode::FpgaActive || self.powered();
                if ok {
                    self.mode = mode;
                }
                Ok(self.ack(request, ok))
            }
            Request::ScratchPad => {
                let offset = usize::from(value);
                self.scratch
                    .get(offset..offset + length)
                    .map(<[u8]>::to_vec)
                    .ok_or(TransportError::Stalled)
            }
            Request::SpiFlash => {
                let mut reply = vec![0xFF; length];
                if self.mode == DeviceMode::FlashSpi && self.scratch[0] == SPI_READ_JEDEC_ID {
                    for (slot, byte) in reply.iter_mut().skip(1).zip(SIM_FLASH_ID.to_le_bytes()) {
                        *slot = byte;
                    }
                }
                Ok(reply)
            }
            Request::SpiFpga => {
                let frame = self.scratch.get(..length).ok_or(TransportError::Stalled)?;
                if self.mode == DeviceMode::FpgaActive {
                    self.fpga_frames.push(frame.to_vec());
                }
                Ok(vec![0xFF; length])
            }
            Request::FlashEraseSector => self.erase(value, SECTOR_SIZE),
            Request::FlashEraseBlock => self.erase(value, BLOCK_SIZE),
            Request::FlashProgram => {
                let ok = self.mode == DeviceMode::FlashSpi;
                if ok {
                    let range = self.flash_range(usize::from(value) * PAGE_SIZE as usize, PAGE_SIZE as usize)?;
                    for (cell, staged) in self.flash[range].iter_mut().zip(self.scratch) {
                        *cell &= staged;
                    }
                }
                Ok(self.ack(request, ok))
            }
            Request::FlashRead => {
                let range = self.flash_range(usize::from(value) * PAGE_SIZE as usize, length)?;
                Ok(self.flash[range].to_vec())
            }
            Request::FlashReadId => Ok(SIM_FLASH_ID.to_le_bytes().to_vec()),
            Request::Reprogram
            | Request::SetLed
            | Request::ClearScratchPad
            | Request::FlashCrc32 => Err(TransportError::Stalled),
        }
    }

    fn handle_out(&mut self, request: Request, value: u16, data: &[u8]) -> Result<(), TransportError> {
        match request {
            Request::Reprogram => {
                self.reprogram_requested = true;
                Ok(())
            }
            Request::SetLed => {
                self.leds = (value & 1 != 0, value & 2 != 0);
                Ok(())
            }
            Request::ScratchPad => {
                let offset = usize::from(value);
                let slot = self
                    .scratch
                    .get_mut(offset..offset + data.len())
                    .ok_or(TransportError::Stalled)?;
                slot.copy_from_slice(data);
                Ok(())
            }
            Request::ClearScratchPad => {
                self.scratch.fill(0xFF);
                Ok(())
            }
            _ => Err(TransportError::Stalled),
        }
    }
}

/// Shared handle to a simulated test board.
#[derive(Clone)]
pub struct SimulatedBoard {
    state: Rc<RefCell<BoardState>>,
}

impl SimulatedBoard {
    /// Creates a connected board with no device inserted and erased flash.
    #[must_use]
    pub fn new() -> Self {
        Self::with_flash_size(SIM_FLASH_SIZE)
    }

    #[must_use]
    pub fn with_flash_size(bytes: usize) -> Self {
        Self {
            state: Rc::new(RefCell::new(BoardState::new(bytes))),
        }
    }

    /// Seats a device under test (both sense pins asserted).
    pub fn insert(&self) {
        self.set_sense(true, true);
    }

    /// Removes the device under test; its rails collapse immediately.
    pub fn remove(&self) {
        self.set_sense(false, false);
    }

    pub fn set_sense(&self, sense1: bool, sense2: bool) {
        let mut state = self.state.borrow_mut();
        state.sense1 = sense1;
        state.sense2 = sense2;
    }

    #[must_use]
    pub fn is_inserted(&self) -> bool {
        self.state.borrow().inserted()
    }

    pub fn set_button(&self, pressed: bool) {
        self.state.borrow_mut().button = pressed;
    }

    /// Holds the regulated rails 20 % low while powered.
    pub fn set_power_fault(&self, fault: bool) {
        self.state.borrow_mut().power_fault = fault;
    }

    /// Makes every request fail as if the cable had been pulled.
    pub fn disconnect(&self) {
        self.state.borrow_mut().connected = false;
    }

    pub fn reconnect(&self) {
        self.state.borrow_mut().connected = true;
    }

    /// Stalls every `request` until [`SimulatedBoard::clear_faults`].
    pub fn fail_request(&self, request: Request) {
        self.state.borrow_mut().failing.insert(request);
    }

    /// Replies `0` to the next acknowledged `request`.
    pub fn reject_next(&self, request: Request) {
        self.state.borrow_mut().rejecting.insert(request);
    }

    pub fn clear_faults(&self) {
        let mut state = self.state.borrow_mut();
        state.failing.clear();
        state.rejecting.clear();
        state.connected = true;
    }

    #[must_use]
    pub fn mode(&self) -> DeviceMode {
        self.state.borrow().mode
    }

    /// Current `(green, red)` LED state.
    #[must_use]
    pub fn leds(&self) -> (bool, bool) {
        self.state.borrow().leds
    }

    #[must_use]
    pub fn reprogram_requested(&self) -> bool {
        self.state.borrow().reprogram_requested
    }

    /// Writes bytes straight into the flash array, bypassing the protocol.
    pub fn load_flash(&self, address: usize, data: &[u8]) {
        self.state.borrow_mut().flash[address..address + data.len()].copy_from_slice(data);
    }

    #[must_use]
    pub fn flash_slice(&self, address: usize, length: usize) -> Vec<u8> {
        self.state.borrow().flash[address..address + length].to_vec()
    }

    /// Frames received on the FPGA SPI bus while the FPGA was active.
    #[must_use]
    pub fn fpga_frames(&self) -> Vec<Vec<u8>> {
        self.state.borrow().fpga_frames.clone()
    }

    #[must_use]
    pub fn requests(&self) -> Vec<RequestRecord> {
        self.state.borrow().log.clone()
    }

    /// Number of logged transfers for `request`.
    #[must_use]
    pub fn count(&self, request: Request) -> usize {
        self.state
            .borrow()
            .log
            .iter()
            .filter(|record| record.request == request)
            .count()
    }

    pub fn clear_log(&self) {
        let mut state = self.state.borrow_mut();
        state.log.clear();
        state.fpga_frames.clear();
    }

    fn admit(
        state: &mut BoardState,
        request: Request,
        direction: Direction,
        value: u16,
        index: u16,
        length: usize,
    ) -> Result<(), TransportError> {
        state.log.push(RequestRecord {
            request,
            direction,
            value,
            index,
            length,
        });
        trace!("sim {direction:?} {request} value={value:#06x} len={length}");
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        if state.failing.contains(&request) {
            return Err(TransportError::Stalled);
        }
        Ok(())
    }
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimulatedBoard {
    fn request_in(
        &mut self,
        request: Request,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.borrow_mut();
        Self::admit(&mut state, request, Direction::In, value, index, usize::from(length))?;
        state.handle_in(request, value, length)
    }

    fn request_out(
        &mut self,
        request: Request,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        Self::admit(&mut state, request, Direction::Out, value, index, data.len())?;
        state.handle_out(request, value, data)
    }
}
