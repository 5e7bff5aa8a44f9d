// Shared logic for the sign test board bring-up tooling.
//
// The host CLI and the emulator both drive the same state machine through the
// `Transport` seam; only the optional `cli` and `terminal` modules
// (feature `cli`) know about argument parsing and the console.

pub mod bitstream;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod machine;
pub mod pattern;
pub mod protocol;
pub mod sim;
pub mod telemetry;
#[cfg(feature = "cli")]
pub mod terminal;
pub mod trace;
pub mod transport;
