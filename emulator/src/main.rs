mod bench;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use signtest_core::cli::BringupArgs;
use signtest_core::machine::{BringupMachine, HELP_TEXT, SystemClock};
use signtest_core::sim::{SIM_FLASH_SIZE, SimulatedBoard};
use signtest_core::terminal::{TerminalConsole, init_logging};

use bench::{BENCH_HELP, BenchConsole};

/// Runs the bring-up state machine against a simulated test board.
#[derive(Parser)]
#[command(name = "signtest-emulator", version)]
struct Cli {
    #[command(flatten)]
    bringup: BringupArgs,

    /// Start with a board already seated.
    #[arg(long)]
    inserted: bool,

    /// Simulated flash size in bytes.
    #[arg(long, default_value_t = SIM_FLASH_SIZE)]
    flash_size: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config = cli.bringup.config().context("invalid timing options")?;
    let board = SimulatedBoard::with_flash_size(cli.flash_size);
    if cli.inserted {
        board.insert();
    }

    let mut machine = BringupMachine::new(board.clone(), SystemClock::new(), config);
    if let Some(loader) = cli.bringup.loader() {
        machine = machine.with_bitstream(loader);
    }

    let terminal = TerminalConsole::new().context("emulator needs an interactive terminal")?;
    let mut console = BenchConsole::new(terminal, board);
    info!("Sign test emulator ready. {HELP_TEXT}");
    info!("{BENCH_HELP}");

    let exit = machine.run(&mut console)?;
    info!("session closed ({exit:?})");
    Ok(())
}
