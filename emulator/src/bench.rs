//! Operator console for the emulated bench.
//!
//! Wraps a key source and intercepts the keys that stand in for physical
//! actions on the simulated board; everything else is forwarded to the
//! bring-up machine as an operator command.

use log::info;
use signtest_core::machine::{OperatorCommand, OperatorConsole};
use signtest_core::sim::SimulatedBoard;
use signtest_core::terminal::TerminalConsole;
use signtest_core::transport::Request;

/// Extra keys understood only by the emulator.
pub const BENCH_HELP: &str = "bench keys: 'i' insert/remove board, 'b' press PROG button, \
'p' toggle rail fault, 'd' toggle USB disconnect, 'e' reject next FPGA boot";

/// Non-blocking source of key presses plus a status sink.
pub trait KeySource {
    fn poll_key(&mut self) -> Option<char>;
    fn show_status(&mut self, line: &str);
}

impl KeySource for TerminalConsole {
    fn poll_key(&mut self) -> Option<char> {
        match TerminalConsole::poll_key(self) {
            Ok(key) => key,
            Err(err) => {
                log::warn!("reading keyboard failed: {err}");
                None
            }
        }
    }

    fn show_status(&mut self, line: &str) {
        OperatorConsole::show_status(self, line);
    }
}

pub struct BenchConsole<K> {
    keys: K,
    board: SimulatedBoard,
    button_held: bool,
    power_fault: bool,
    disconnected: bool,
}

impl<K> BenchConsole<K>
where
    K: KeySource,
{
    pub fn new(keys: K, board: SimulatedBoard) -> Self {
        Self {
            keys,
            board,
            button_held: false,
            power_fault: false,
            disconnected: false,
        }
    }

    /// Applies a bench key. Returns `false` for keys meant for the machine.
    fn bench_action(&mut self, key: char) -> bool {
        match key.to_ascii_lowercase() {
            'i' => {
                if self.board.is_inserted() {
                    self.board.remove();
                    info!("board removed");
                } else {
                    self.board.insert();
                    info!("board inserted");
                }
            }
            'b' => {
                self.board.set_button(true);
                self.button_held = true;
                info!("PROG button pressed");
            }
            'p' => {
                self.power_fault = !self.power_fault;
                self.board.set_power_fault(self.power_fault);
                info!("rail fault {}", if self.power_fault { "on" } else { "off" });
            }
            'd' => {
                self.disconnected = !self.disconnected;
                if self.disconnected {
                    self.board.disconnect();
                    info!("USB cable pulled");
                } else {
                    self.board.reconnect();
                    info!("USB cable reconnected");
                }
            }
            'e' => {
                self.board.reject_next(Request::SetMode);
                info!("next mode change will be rejected");
            }
            _ => return false,
        }
        true
    }
}

impl<K> OperatorConsole for BenchConsole<K>
where
    K: KeySource,
{
    fn poll_command(&mut self) -> Option<OperatorCommand> {
        // The button is held for exactly one tick.
        if self.button_held {
            self.board.set_button(false);
            self.button_held = false;
        }

        let key = self.keys.poll_key()?;
        if self.bench_action(key) {
            return None;
        }
        Some(OperatorCommand::from_key(key))
    }

    fn show_status(&mut self, line: &str) {
        self.keys.show_status(line);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    struct ScriptedKeys {
        keys: VecDeque<char>,
        statuses: Vec<String>,
    }

    impl KeySource for ScriptedKeys {
        fn poll_key(&mut self) -> Option<char> {
            self.keys.pop_front()
        }

        fn show_status(&mut self, line: &str) {
            self.statuses.push(line.to_string());
        }
    }

    fn console(keys: &str) -> (SimulatedBoard, BenchConsole<ScriptedKeys>) {
        let board = SimulatedBoard::new();
        let keys = ScriptedKeys {
            keys: keys.chars().collect(),
            statuses: Vec::new(),
        };
        (board.clone(), BenchConsole::new(keys, board))
    }

    #[test]
    fn insertion_key_toggles_board() {
        let (board, mut console) = console("iI");
        assert_eq!(console.poll_command(), None);
        assert!(board.is_inserted());
        assert_eq!(console.poll_command(), None);
        assert!(!board.is_inserted());
    }

    #[test]
    fn button_is_released_on_next_poll() {
        use signtest_core::transport::Transport;

        let (mut board, mut console) = console("b");
        let status = |board: &mut SimulatedBoard| {
            let raw = board.request_in(Request::ReadStatus, 0, 0, 7).unwrap();
            raw[6] & 0b100 != 0
        };

        console.poll_command();
        assert!(status(&mut board));
        console.poll_command();
        assert!(!status(&mut board));
    }

    #[test]
    fn machine_keys_pass_through() {
        let (_board, mut console) = console("x c");
        assert_eq!(console.poll_command(), Some(OperatorCommand::Exit));
        assert_eq!(console.poll_command(), Some(OperatorCommand::Reset));
        assert_eq!(console.poll_command(), Some(OperatorCommand::PowerCycle));
        assert_eq!(console.poll_command(), None);
    }

    #[test]
    fn status_lines_reach_the_key_source() {
        let (_board, mut console) = console("");
        console.show_status("VIN:0.00V idle");
        assert_eq!(console.keys.statuses, vec!["VIN:0.00V idle".to_string()]);
    }
}
