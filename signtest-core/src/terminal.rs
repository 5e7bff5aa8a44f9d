//! Raw-mode terminal console and log formatting for the interactive binaries.
//!
//! Keys are read without waiting for Enter, and the status line is redrawn
//! in place on stderr. Log records clear that line first and end with
//! `\r\n`, since raw mode does not translate bare newlines.

use std::io::{self, Write};
use std::time::Duration;

use crossterm::cursor::MoveToColumn;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::queue;
use crossterm::style::Print;
use crossterm::terminal::{self, Clear, ClearType};
use log::warn;

use crate::machine::{OperatorCommand, OperatorConsole};

/// Installs the global logger: `info` unless `RUST_LOG` says otherwise.
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            write!(
                buf,
                "\r\x1b[2K[{} {:<5} {}] {}\r\n",
                buf.timestamp_millis(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

/// Operator console on the controlling terminal. Raw mode is held for the
/// lifetime of the value.
pub struct TerminalConsole {
    _private: (),
}

impl TerminalConsole {
    /// Switches the terminal to raw mode.
    ///
    /// # Errors
    ///
    /// Fails when stdin is not a terminal.
    pub fn new() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self { _private: () })
    }

    /// Returns the next pressed character, if one is queued. Ctrl-C maps to `x`.
    ///
    /// # Errors
    ///
    /// Propagates terminal read failures.
    pub fn poll_key(&mut self) -> io::Result<Option<char>> {
        while event::poll(Duration::ZERO)? {
            let Event::Key(KeyEvent {
                code,
                modifiers,
                kind,
                ..
            }) = event::read()?
            else {
                continue;
            };
            if kind != KeyEventKind::Press {
                continue;
            }
            match code {
                KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
                    return Ok(Some('x'));
                }
                KeyCode::Char(key) => return Ok(Some(key)),
                _ => {}
            }
        }
        Ok(None)
    }

    /// Redraws the status line in place.
    ///
    /// # Errors
    ///
    /// Propagates stderr write failures.
    pub fn write_status(&mut self, line: &str) -> io::Result<()> {
        let mut err = io::stderr().lock();
        queue!(err, MoveToColumn(0), Print(line), Clear(ClearType::UntilNewLine))?;
        err.flush()
    }
}

impl Drop for TerminalConsole {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        eprintln!();
    }
}

impl OperatorConsole for TerminalConsole {
    fn poll_command(&mut self) -> Option<OperatorCommand> {
        match self.poll_key() {
            Ok(key) => key.map(OperatorCommand::from_key),
            Err(err) => {
                warn!("reading keyboard failed: {err}");
                None
            }
        }
    }

    fn show_status(&mut self, line: &str) {
        if let Err(err) = self.write_status(line) {
            warn!("status line write failed: {err}");
        }
    }
}
