//! Operator key commands and the console seam the run loop polls.

/// Interactive single-key commands accepted while the loop runs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OperatorCommand {
    /// `?` or `h`
    Help,
    /// `x`: power off and leave the loop.
    Exit,
    /// `r`: power off, put the test board into its bootloader and leave.
    Reprogram,
    /// space: restart the bring-up sequence.
    Reset,
    /// `f`: re-enter `FpgaActive`, which restarts the FPGA.
    RestartFpga,
    /// `c`: power-cycle stress loop until another key arrives.
    PowerCycle,
    /// Any other key. Ignored by the main loop, but leaves the stress loop.
    Other(char),
}

impl OperatorCommand {
    /// Maps a key press to a command, ignoring case.
    #[must_use]
    pub fn from_key(key: char) -> Self {
        match key.to_ascii_lowercase() {
            '?' | 'h' => Self::Help,
            'x' => Self::Exit,
            'r' => Self::Reprogram,
            ' ' => Self::Reset,
            'f' => Self::RestartFpga,
            'c' => Self::PowerCycle,
            other => Self::Other(other),
        }
    }
}

/// Key summary printed for [`OperatorCommand::Help`].
pub const HELP_TEXT: &str = "keys: 'x' exit, 'r' reprogram test board, <space> restart current board, \
'f' restart FPGA, 'c' power-cycle stress loop, '?' help";

/// Operator-facing terminal.
pub trait OperatorConsole {
    /// Returns the next pending command without blocking.
    fn poll_command(&mut self) -> Option<OperatorCommand>;

    /// Replaces the continuously updated status line.
    fn show_status(&mut self, line: &str);
}

impl<C> OperatorConsole for &mut C
where
    C: OperatorConsole + ?Sized,
{
    fn poll_command(&mut self) -> Option<OperatorCommand> {
        (**self).poll_command()
    }

    fn show_status(&mut self, line: &str) {
        (**self).show_status(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_map_case_insensitively() {
        assert_eq!(OperatorCommand::from_key('?'), OperatorCommand::Help);
        assert_eq!(OperatorCommand::from_key('H'), OperatorCommand::Help);
        assert_eq!(OperatorCommand::from_key('X'), OperatorCommand::Exit);
        assert_eq!(OperatorCommand::from_key('r'), OperatorCommand::Reprogram);
        assert_eq!(OperatorCommand::from_key(' '), OperatorCommand::Reset);
        assert_eq!(OperatorCommand::from_key('F'), OperatorCommand::RestartFpga);
        assert_eq!(OperatorCommand::from_key('c'), OperatorCommand::PowerCycle);
        assert_eq!(OperatorCommand::from_key('Q'), OperatorCommand::Other('q'));
    }
}
