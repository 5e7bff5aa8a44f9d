mod usb;

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use signtest_core::cli::BringupArgs;
use signtest_core::machine::{BringupMachine, HELP_TEXT, RunExit, SystemClock};
use signtest_core::terminal::{TerminalConsole, init_logging};

use usb::{DEFAULT_TIMEOUT_MS, SIGNTEST_PID, SIGNTEST_VID, UsbTransport};

const DEVICE_POLL: Duration = Duration::from_millis(500);

/// Bring-up controller for sign boards on the USB test fixture.
#[derive(Parser)]
#[command(name = "signtest", version)]
struct Cli {
    #[command(flatten)]
    bringup: BringupArgs,

    /// Test board USB vendor id (hex).
    #[arg(long, value_parser = parse_hex_u16, default_value = "544c")]
    vid: u16,

    /// Test board USB product id (hex).
    #[arg(long, value_parser = parse_hex_u16, default_value = "4c7f")]
    pid: u16,

    /// Control transfer timeout, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    usb_timeout_ms: u64,
}

fn parse_hex_u16(text: &str) -> Result<u16, String> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u16::from_str_radix(digits, 16).map_err(|err| format!("invalid hex id {text:?}: {err}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config = cli.bringup.config().context("invalid timing options")?;
    let mut transport = UsbTransport::new(
        cli.vid,
        cli.pid,
        Duration::from_millis(cli.usb_timeout_ms),
    )?;

    if transport.connect().is_err() {
        warn!(
            "no test board at {:04x}:{:04x}, waiting",
            cli.vid, cli.pid
        );
        while transport.connect().is_err() {
            thread::sleep(DEVICE_POLL);
        }
    }
    if (cli.vid, cli.pid) != (SIGNTEST_VID, SIGNTEST_PID) {
        info!("using non-default ids {:04x}:{:04x}", cli.vid, cli.pid);
    }

    let mut machine = BringupMachine::new(transport, SystemClock::new(), config);
    match cli.bringup.loader() {
        Some(loader) => machine = machine.with_bitstream(loader),
        None => info!("no bitstream given, flash verification disabled"),
    }

    let mut console = TerminalConsole::new().context("signtest needs an interactive terminal")?;
    info!("{HELP_TEXT}");

    match machine.run(&mut console)? {
        RunExit::Exit => info!("exiting"),
        RunExit::Reprogram => info!("test board is now in its bootloader"),
    }
    Ok(())
}
