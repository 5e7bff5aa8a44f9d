use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use signtest_core::trace::{Frame, TraceDecoder, parse_hex_capture};

/// Prints a captured USB packet trace one frame per line.
#[derive(Parser)]
#[command(name = "decode-trace", version)]
struct Cli {
    /// Capture file: raw bytes, or hex text with `--hex`.
    capture: PathBuf,

    /// Read the capture as whitespace-separated hex bytes.
    #[arg(long)]
    hex: bool,

    /// Hide resynchronisation noise.
    #[arg(long)]
    skip_garbage: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let data = if cli.hex {
        let text = fs::read_to_string(&cli.capture)
            .with_context(|| format!("reading {}", cli.capture.display()))?;
        parse_hex_capture(&text)?
    } else {
        fs::read(&cli.capture).with_context(|| format!("reading {}", cli.capture.display()))?
    };

    let mut out = io::stdout().lock();
    let mut garbage = 0usize;
    for frame in TraceDecoder::new(&data) {
        if let Frame::Garbage(bytes) = &frame {
            garbage += bytes.len();
            if cli.skip_garbage {
                continue;
            }
        }
        writeln!(out, "{frame}")?;
    }
    if garbage > 0 {
        eprintln!("{garbage} of {} bytes did not decode", data.len());
    }
    Ok(())
}
