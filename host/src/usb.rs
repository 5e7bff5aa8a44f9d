//! libusb-backed [`Transport`] for the physical test board.
//!
//! All board operations are vendor control requests addressed to the device.
//! The handle is opened lazily and dropped whenever a transfer reports that
//! the device went away, so the next request re-opens whatever board is
//! plugged in by then.

use std::time::Duration;

use log::{info, warn};
use rusb::{Context, DeviceHandle, Direction, Recipient, RequestType, UsbContext};
use signtest_core::transport::{Request, Transport, TransportError};
use thiserror::Error;

/// Default test board vendor id.
pub const SIGNTEST_VID: u16 = 0x544C;
/// Default test board product id.
pub const SIGNTEST_PID: u16 = 0x4C7F;

pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum UsbError {
    #[error("failed to initialise libusb: {0}")]
    Init(#[from] rusb::Error),
}

pub struct UsbTransport {
    context: Context,
    vid: u16,
    pid: u16,
    timeout: Duration,
    handle: Option<DeviceHandle<Context>>,
}

impl UsbTransport {
    /// Creates a transport for `vid:pid`. No device is opened yet.
    ///
    /// # Errors
    ///
    /// Fails when libusb cannot be initialised.
    pub fn new(vid: u16, pid: u16, timeout: Duration) -> Result<Self, UsbError> {
        Ok(Self {
            context: Context::new()?,
            vid,
            pid,
            timeout,
            handle: None,
        })
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Opens the board if no handle is held.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Disconnected`] when no matching device is present.
    pub fn connect(&mut self) -> Result<&DeviceHandle<Context>, TransportError> {
        if self.handle.is_none() {
            let handle = self
                .context
                .open_device_with_vid_pid(self.vid, self.pid)
                .ok_or(TransportError::Disconnected)?;
            info!("opened test board {:04x}:{:04x}", self.vid, self.pid);
            self.handle = Some(handle);
        }
        self.handle.as_ref().ok_or(TransportError::Disconnected)
    }

    fn transfer<R>(
        &mut self,
        request: Request,
        op: impl FnOnce(&DeviceHandle<Context>, Duration) -> rusb::Result<R>,
    ) -> Result<R, TransportError> {
        let timeout = self.timeout;
        let handle = self.connect()?;
        op(handle, timeout).map_err(|err| {
            let mapped = map_error(err);
            if matches!(mapped, TransportError::Disconnected | TransportError::Io(_)) {
                warn!("{request} failed ({err}); dropping device handle");
                self.handle = None;
            }
            mapped
        })
    }
}

fn map_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::NoDevice | rusb::Error::NotFound => TransportError::Disconnected,
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::Pipe => TransportError::Stalled,
        other => TransportError::Io(other.to_string()),
    }
}

impl Transport for UsbTransport {
    fn request_in(
        &mut self,
        request: Request,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        let request_type = rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device);
        let mut buf = vec![0u8; usize::from(length)];
        let read = self.transfer(request, |handle, timeout| {
            handle.read_control(request_type, request.code(), value, index, &mut buf, timeout)
        })?;
        buf.truncate(read);
        Ok(buf)
    }

    fn request_out(
        &mut self,
        request: Request,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let request_type = rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
        self.transfer(request, |handle, timeout| {
            handle.write_control(request_type, request.code(), value, index, data, timeout)
        })?;
        Ok(())
    }
}
