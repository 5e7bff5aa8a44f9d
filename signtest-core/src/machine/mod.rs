//! Bring-up state machine for the sign controller board.
//!
//! Each tick samples the board status, runs the current state's action and
//! then applies the device-loss override: once "neither sense pin" has held
//! for twice the debounce run, the machine powers the board off and returns
//! to [`TestState::WaitForDevice`] whatever it was doing. That includes
//! flash programming and FPGA boot, so a bouncing connector can abort a
//! program cycle part way through; the next insertion re-checks flash and
//! reprograms.
//!
//! Any error escaping a state action is handled by [`BringupMachine::tick`]:
//! log, fault LED, pause, then a full reset with history cleared.

pub mod clock;
pub mod console;

use core::fmt;

use log::{debug, error, info, warn};

use crate::bitstream::BitstreamLoader;
use crate::config::BringupConfig;
use crate::pattern::smoke_test_pattern;
use crate::protocol::{DeviceClient, DeviceMode, ProtocolError};
use crate::telemetry::{StatusHistory, StatusSample};
use crate::transport::Transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use console::{HELP_TEXT, OperatorCommand, OperatorConsole};

/// Length of the flash prefix compared before a full verify.
pub const QUICK_CHECK_LEN: usize = 128;

/// Display component addressed by the smoke test.
pub const SMOKE_TEST_COMPONENT: u8 = 0;

const HEX_DUMP_ROW: usize = 16;

/// Nodes of the bring-up sequence.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TestState {
    WaitForDevice,
    SoftOn,
    PowerOn,
    CheckFlash,
    ProgramFpga,
    BootFpga,
    TestFpga,
    WaitDeviceLeave,
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of one guarded tick.
#[derive(Clone, Debug, PartialEq)]
pub enum TickOutcome {
    Steady(TestState),
    Transitioned { from: TestState, to: TestState },
    /// The tick failed; the machine has already been reset.
    Faulted(ProtocolError),
}

/// Why [`BringupMachine::run`] returned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RunExit {
    Exit,
    /// The test board was sent to its bootloader.
    Reprogram,
}

pub struct BringupMachine<T, C> {
    device: DeviceClient<T>,
    clock: C,
    config: BringupConfig,
    history: StatusHistory,
    bitstream: Option<BitstreamLoader>,
    state: TestState,
    status_line: String,
}

impl<T, C> BringupMachine<T, C>
where
    T: Transport,
    C: Clock,
{
    /// Creates a machine in [`TestState::WaitForDevice`] with no bitstream,
    /// which skips flash verification.
    pub fn new(transport: T, clock: C, config: BringupConfig) -> Self {
        Self {
            device: DeviceClient::new(transport),
            clock,
            config,
            history: StatusHistory::new(),
            bitstream: None,
            state: TestState::WaitForDevice,
            status_line: String::new(),
        }
    }

    #[must_use]
    pub fn with_bitstream(mut self, loader: BitstreamLoader) -> Self {
        self.bitstream = Some(loader);
        self
    }

    pub fn state(&self) -> TestState {
        self.state
    }

    pub fn history(&self) -> &StatusHistory {
        &self.history
    }

    pub fn config(&self) -> &BringupConfig {
        &self.config
    }

    pub fn bitstream(&self) -> Option<&BitstreamLoader> {
        self.bitstream.as_ref()
    }

    pub fn device(&self) -> &DeviceClient<T> {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut DeviceClient<T> {
        &mut self.device
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Latest status line: decoded sample plus the current state or activity.
    pub fn status_line(&self) -> &str {
        &self.status_line
    }

    /// Powers the board off (best effort), drops the history and restarts
    /// the sequence.
    pub fn reset(&mut self) {
        if let Err(err) = self.device.set_mode(DeviceMode::Off) {
            warn!("power off during reset failed: {err}");
        }
        self.history.clear();
        self.state = TestState::WaitForDevice;
    }

    /// One guarded iteration. Errors are logged and followed by a fault LED,
    /// a pause and a full reset.
    pub fn tick(&mut self) -> TickOutcome {
        let from = self.state;
        match self.try_tick() {
            Ok(to) if to == from => TickOutcome::Steady(to),
            Ok(to) => TickOutcome::Transitioned { from, to },
            Err(err) => {
                self.recover(&err);
                TickOutcome::Faulted(err)
            }
        }
    }

    /// One unguarded iteration: sample, act, override. Returns the new state.
    ///
    /// # Errors
    ///
    /// Propagates the first protocol error raised by the sample or the
    /// state action. The machine is left in the state it was in.
    pub fn try_tick(&mut self) -> Result<TestState, ProtocolError> {
        let current = self.state;
        let sample = self.sample()?;
        self.status_line = format!("{sample} {current}");

        let mut next = self.step(current, &sample)?;

        if current != TestState::WaitForDevice
            && self
                .history
                .is_stable(StatusSample::device_gone, self.config.device_loss_run())
        {
            warn!("unexpected device loss in {current}");
            next = TestState::WaitForDevice;
            self.device.set_mode(DeviceMode::Off)?;
        }

        if next != current {
            info!("state change {current} => {next}");
            self.state = next;
        }
        Ok(next)
    }

    /// Poll loop: tick, show status, handle at most one key, sleep.
    ///
    /// # Errors
    ///
    /// Only the bootloader request issued for [`OperatorCommand::Reprogram`]
    /// can fail the loop; tick errors are recovered internally.
    pub fn run<O>(&mut self, console: &mut O) -> Result<RunExit, ProtocolError>
    where
        O: OperatorConsole + ?Sized,
    {
        info!("bring-up loop started; press '?' for help");
        loop {
            self.tick();
            console.show_status(&self.status_line);

            if let Some(command) = console.poll_command() {
                if let Some(exit) = self.handle_command(command, console)? {
                    return Ok(exit);
                }
            }

            self.clock.sleep(self.config.tick_interval);
        }
    }

    /// Applies one operator command. Returns `Some` when the loop should end.
    ///
    /// # Errors
    ///
    /// Fails only when the reprogram request itself fails.
    pub fn handle_command<O>(
        &mut self,
        command: OperatorCommand,
        console: &mut O,
    ) -> Result<Option<RunExit>, ProtocolError>
    where
        O: OperatorConsole + ?Sized,
    {
        match command {
            OperatorCommand::Help => info!("{HELP_TEXT}"),
            OperatorCommand::Exit => {
                info!("'x' pressed, exiting");
                self.reset();
                return Ok(Some(RunExit::Exit));
            }
            OperatorCommand::Reprogram => {
                info!("'r' pressed, putting test board into reprogramming mode");
                self.reset();
                self.device.reprogram()?;
                return Ok(Some(RunExit::Reprogram));
            }
            OperatorCommand::Reset => {
                info!("<space> pressed, resetting test state");
                self.reset();
            }
            OperatorCommand::RestartFpga => {
                info!("'f' pressed, restarting FPGA");
                if let Err(err) = self.device.set_mode(DeviceMode::FpgaActive) {
                    error!("FPGA restart failed: {err}");
                }
            }
            OperatorCommand::PowerCycle => self.power_cycle(console),
            OperatorCommand::Other(key) => debug!("ignoring key {key:?}"),
        }
        Ok(None)
    }

    /// Manual stress loop: board on with the FPGA started for one half-period,
    /// off for the next, until any key arrives. Always ends in a reset.
    pub fn power_cycle<O>(&mut self, console: &mut O)
    where
        O: OperatorConsole + ?Sized,
    {
        info!("entering power-cycle loop; press any key to leave");
        if let Err(err) = self.cycle_until_key(console) {
            error!("power-cycle loop aborted: {err}");
        }
        info!("leaving power-cycle loop");
        self.reset();
    }

    fn cycle_until_key<O>(&mut self, console: &mut O) -> Result<(), ProtocolError>
    where
        O: OperatorConsole + ?Sized,
    {
        let half = self.config.stress_half_period;
        let mut count = 0;
        let mut label = "";
        loop {
            if count == 0 {
                label = "Power On";
                self.device.set_led(true, false)?;
                self.device.set_mode(DeviceMode::On)?;
                if let Err(err) = self.device.set_mode(DeviceMode::FpgaActive) {
                    debug!("FPGA did not start during power cycle: {err}");
                }
            }
            if count == half {
                label = "Power Off";
                self.device.set_led(false, false)?;
                self.device.set_mode(DeviceMode::Off)?;
            }
            count += 1;
            if count == half * 2 {
                count = 0;
            }

            let sample = self.sample()?;
            self.status_line = format!("{sample} {label}");
            console.show_status(&self.status_line);

            if console.poll_command().is_some() {
                return Ok(());
            }
            self.clock.sleep(self.config.tick_interval);
        }
    }

    fn recover(&mut self, err: &ProtocolError) {
        error!("tick failed in {}: {err:?}", self.state);
        if let Err(led_err) = self.device.set_led(false, true) {
            debug!("fault LED not set: {led_err}");
        }
        self.clock.sleep(self.config.fault_pause);
        info!("restarting");
        self.reset();
    }

    fn sample(&mut self) -> Result<StatusSample, ProtocolError> {
        let sample = self.device.read_status(self.clock.now())?;
        self.history.push(sample);
        Ok(sample)
    }

    fn stable(&self, predicate: fn(&StatusSample) -> bool) -> bool {
        self.history.is_stable(predicate, self.config.stable_run)
    }

    fn step(&mut self, state: TestState, sample: &StatusSample) -> Result<TestState, ProtocolError> {
        match state {
            TestState::WaitForDevice => {
                self.device.set_led(false, false)?;
                if self.stable(StatusSample::both_sensed) {
                    self.device.set_mode(DeviceMode::SoftOn)?;
                    return Ok(TestState::SoftOn);
                }
                Ok(state)
            }
            TestState::SoftOn => {
                if self.stable(StatusSample::soft_on_ok) {
                    self.device.set_mode(DeviceMode::On)?;
                    return Ok(TestState::PowerOn);
                }
                Ok(state)
            }
            TestState::PowerOn => {
                if self.stable(StatusSample::power_ok) {
                    return Ok(TestState::CheckFlash);
                }
                Ok(state)
            }
            TestState::CheckFlash => self.check_flash(),
            TestState::ProgramFpga => self.program_fpga(),
            TestState::BootFpga => self.boot_fpga(),
            TestState::TestFpga => {
                self.clock.sleep(self.config.boot_settle);
                info!("sending test image");
                self.device
                    .send_image_32x32(SMOKE_TEST_COMPONENT, &smoke_test_pattern())?;
                Ok(TestState::WaitDeviceLeave)
            }
            TestState::WaitDeviceLeave => {
                let mut next = state;
                if self.stable(StatusSample::device_gone) {
                    self.device.set_mode(DeviceMode::Off)?;
                    next = TestState::WaitForDevice;
                }
                if sample.button {
                    info!("button pressed, restarting process");
                    next = TestState::WaitForDevice;
                }
                Ok(next)
            }
        }
    }

    fn check_flash(&mut self) -> Result<TestState, ProtocolError> {
        self.device.set_mode(DeviceMode::FlashSpi)?;
        let flash_id = self.device.flash_read_id()?;
        info!("flash id {flash_id:08x}");

        if let Some(loader) = self.bitstream.as_mut() {
            loader.check_for_update();
        }
        let Some(expected) = self.bitstream.as_ref().and_then(BitstreamLoader::payload) else {
            info!("no bitstream loaded, skipping flash contents check");
            return Ok(TestState::BootFpga);
        };

        let quick_len = expected.len().min(QUICK_CHECK_LEN);
        let prefix = self.device.flash_read(0, quick_len)?;
        if prefix != expected[..quick_len] {
            info!("quick check shows the FPGA image needs reprogramming");
            log_hex_dump(0, &prefix);
            return Ok(TestState::ProgramFpga);
        }

        info!("checking full FPGA image ({} bytes)", expected.len());
        let contents = self.device.flash_read(0, expected.len())?;
        if contents != expected {
            info!("full check shows the FPGA image needs reprogramming");
            return Ok(TestState::ProgramFpga);
        }

        info!("FPGA image is current");
        Ok(TestState::BootFpga)
    }

    fn program_fpga(&mut self) -> Result<TestState, ProtocolError> {
        let Some(image) = self.bitstream.as_ref().and_then(BitstreamLoader::payload) else {
            warn!("no bitstream to program, booting existing flash contents");
            return Ok(TestState::BootFpga);
        };

        info!("erasing flash for {} bytes", image.len());
        self.device.flash_erase_region(0, image.len())?;
        info!("programming flash");
        self.device.flash_write(0, image)?;
        Ok(TestState::BootFpga)
    }

    fn boot_fpga(&mut self) -> Result<TestState, ProtocolError> {
        let booted = self
            .device
            .set_mode(DeviceMode::FpgaActive)
            .and_then(|()| self.device.set_led(true, false));

        match booted {
            Ok(()) => {
                info!("FPGA booted");
                Ok(TestState::TestFpga)
            }
            Err(err) => {
                error!("FPGA failed to boot: {err}");
                self.device.set_led(false, true)?;
                Ok(TestState::WaitDeviceLeave)
            }
        }
    }
}

/// Logs `data` as 16-byte rows of hex and printable ASCII.
fn log_hex_dump(address: usize, data: &[u8]) {
    for line in hex_dump_lines(address, data) {
        info!("{line}");
    }
}

fn hex_dump_lines(address: usize, data: &[u8]) -> impl Iterator<Item = String> + '_ {
    data.chunks(HEX_DUMP_ROW).enumerate().map(move |(row, bytes)| {
        let hex: Vec<String> = bytes.iter().map(|byte| format!("{byte:02x}")).collect();
        let ascii: String = bytes
            .iter()
            .map(|&byte| if byte.is_ascii_graphic() || byte == b' ' { char::from(byte) } else { '.' })
            .collect();
        format!(
            "{:08x}: {:<width$} {ascii}",
            address + row * HEX_DUMP_ROW,
            hex.join(" "),
            width = HEX_DUMP_ROW * 3 - 1,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedBoard;

    #[test]
    fn hex_dump_pads_short_rows() {
        let data: Vec<u8> = (b'A'..=b'R').collect();
        let lines: Vec<_> = hex_dump_lines(0x20, &data).collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000020: 41 42"));
        assert!(lines[0].ends_with(" ABCDEFGHIJKLMNOP"));
        assert_eq!(lines[1], format!("00000030: 51 52{} QR", " ".repeat(42)));
    }

    #[test]
    fn wait_for_device_keeps_leds_off() {
        let board = SimulatedBoard::new();
        let mut machine = BringupMachine::new(board.clone(), ManualClock::new(), BringupConfig::new());

        assert_eq!(machine.tick(), TickOutcome::Steady(TestState::WaitForDevice));
        assert_eq!(board.leds(), (false, false));
        assert!(machine.status_line().ends_with("WaitForDevice"));
    }

    #[test]
    fn fault_lights_red_and_pauses() {
        let board = SimulatedBoard::new();
        let clock = ManualClock::new();
        let mut machine = BringupMachine::new(board.clone(), clock.clone(), BringupConfig::new());

        board.fail_request(crate::transport::Request::ReadStatus);
        let outcome = machine.tick();

        assert!(matches!(outcome, TickOutcome::Faulted(ProtocolError::Transport(_))));
        assert_eq!(board.leds(), (false, true));
        assert_eq!(clock.elapsed(), BringupConfig::new().fault_pause);
        assert_eq!(machine.state(), TestState::WaitForDevice);
    }
}
