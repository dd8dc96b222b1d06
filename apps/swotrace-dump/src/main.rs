//! Drives the `swotrace` pipeline over a captured file of raw SWO bytes and
//! prints each emitted [`frame::AnnotatedFrame`] to stdout.
//!
//! There is no embedded timing information in a raw byte capture (unlike a
//! live logic-analyzer feed), so this binary assigns each byte a synthetic
//! monotonically increasing `(start_time, end_time)` pair, one tick per
//! byte. That is purely a CLI-demo clock, not a claim about real SWO bit
//! timing.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use frame::ByteEvent;
use itm::DecodeStyle;
use log::{info, LevelFilter};
use simplelog::{ColorChoice, Config as LogConfig, TermLogger, TerminalMode};
use swotrace::{Config, Pipeline};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DecodeStyleArg {
    All,
    Port,
    Console,
    Instrumentation,
}

impl From<DecodeStyleArg> for DecodeStyle {
    fn from(a: DecodeStyleArg) -> Self {
        match a {
            DecodeStyleArg::All => DecodeStyle::All,
            DecodeStyleArg::Port => DecodeStyle::Port,
            DecodeStyleArg::Console => DecodeStyle::Console,
            DecodeStyleArg::Instrumentation => DecodeStyle::Instrumentation,
        }
    }
}

/// Decode a captured ARM CoreSight SWO byte stream into annotated trace frames.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// File of raw captured trace bytes. Reads stdin when omitted.
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// What the ITM/DWT parser surfaces, and how.
    #[arg(long, value_enum, default_value_t = DecodeStyleArg::All)]
    decode_style: DecodeStyleArg,

    /// Effective stimulus port (0..255) for Port/Console/Instrumentation decode styles.
    #[arg(long, default_value_t = 0)]
    port: u8,

    /// TPIU logical stream carrying the ITM/DWT traffic. 0 bypasses TPIU deframing entirely.
    #[arg(long, default_value_t = 0)]
    tpiu_stream: u8,

    /// TPIU startup byte skew (0..15), for captures that begin mid-frame.
    #[arg(long, default_value_t = 0)]
    tpiu_offset: u8,

    /// Increase log verbosity. Repeat for more (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn level_filter(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn read_input(path: Option<&PathBuf>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    match path {
        Some(p) => {
            File::open(p)?.read_to_end(&mut buf)?;
        }
        None => {
            io::stdin().lock().read_to_end(&mut buf)?;
        }
    }
    Ok(buf)
}

fn run(args: Args) -> Result<(), String> {
    let _ = TermLogger::init(
        level_filter(args.verbose),
        LogConfig::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );

    let bytes = read_input(args.input.as_ref()).map_err(|e| format!("reading input: {e}"))?;
    info!("decoding {} captured bytes", bytes.len());

    let mut config = Config::new(args.decode_style.into(), args.port);
    if args.tpiu_stream != 0 {
        config = config.with_tpiu(args.tpiu_stream, args.tpiu_offset);
    }
    let mut pipeline = Pipeline::new(config).map_err(|e| e.to_string())?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for (i, &data) in bytes.iter().enumerate() {
        let t = i as u64;
        let ev = ByteEvent::new(t, t + 1, data);
        for annotated in pipeline.push(ev) {
            writeln!(out, "{}", annotated).map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("swotrace-dump: {e}");
            ExitCode::FAILURE
        }
    }
}
