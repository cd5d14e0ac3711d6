//! Headless machine runner.
//!
//! Loads the ROM images, builds the machine, and runs it for a while,
//! reporting effective throughput. The windowed front-end lives outside
//! this workspace; this binary exists for smoke-testing ROMs and timing.

use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use emu_6502::{TraceEntry, TraceSink};
use emu_uk101::{Uk101, Uk101Config};

struct CliArgs {
    monitor_path: Option<PathBuf>,
    basic_path: Option<PathBuf>,
    ram_kb: usize,
    mhz: f64,
    seconds: u64,
    trace: bool,
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        monitor_path: None,
        basic_path: None,
        ram_kb: 8,
        mhz: 1.0,
        seconds: 5,
        trace: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--monitor" => {
                i += 1;
                cli.monitor_path = args.get(i).map(PathBuf::from);
            }
            "--basic" => {
                i += 1;
                cli.basic_path = args.get(i).map(PathBuf::from);
            }
            "--ram" => {
                i += 1;
                if let Some(s) = args.get(i) {
                    cli.ram_kb = s.parse().unwrap_or(8);
                }
            }
            "--mhz" => {
                i += 1;
                if let Some(s) = args.get(i) {
                    cli.mhz = s.parse().unwrap_or(1.0);
                }
            }
            "--seconds" => {
                i += 1;
                if let Some(s) = args.get(i) {
                    cli.seconds = s.parse().unwrap_or(5);
                }
            }
            "--trace" => {
                cli.trace = true;
            }
            "--help" | "-h" => {
                eprintln!("Usage: emu-uk101 [OPTIONS]");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --monitor <file>   Monitor ROM image (2 KB, required)");
                eprintln!("  --basic <file>     BASIC ROM image (8 KB)");
                eprintln!("  --ram <kb>         RAM size in KB [default: 8]");
                eprintln!("  --mhz <rate>       CPU clock in MHz, 0 = flat out [default: 1.0]");
                eprintln!("  --seconds <n>      How long to run [default: 5]");
                eprintln!("  --trace            Print executed instructions to stderr");
                process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                process::exit(1);
            }
        }
        i += 1;
    }

    cli
}

fn load_rom(path: &Path, name: &str, expected_size: usize) -> Vec<u8> {
    match std::fs::read(path) {
        Ok(data) => {
            if data.len() != expected_size {
                eprintln!(
                    "{name} ROM at {} is {} bytes, expected {expected_size}",
                    path.display(),
                    data.len()
                );
                process::exit(1);
            }
            data
        }
        Err(e) => {
            eprintln!("Cannot read {name} ROM at {}: {e}", path.display());
            process::exit(1);
        }
    }
}

/// Trace sink that prints one line per instruction to stderr.
struct StderrTrace;

impl TraceSink for StderrTrace {
    fn record(&mut self, entry: &TraceEntry) {
        eprintln!(
            "{:04X}  {:02X} {:02X} {:02X}  A={:02X} X={:02X} Y={:02X} S={:02X} P={:02X}",
            entry.pc,
            entry.opcode,
            entry.operands[0],
            entry.operands[1],
            entry.a,
            entry.x,
            entry.y,
            entry.s,
            entry.p.0,
        );
    }
}

fn main() {
    env_logger::init();
    let cli = parse_args();

    let Some(monitor_path) = cli.monitor_path else {
        eprintln!("A monitor ROM is required (--monitor <file>)");
        process::exit(1);
    };

    let config = Uk101Config {
        monitor_rom: load_rom(&monitor_path, "Monitor", emu_uk101::MONITOR_SIZE),
        basic_rom: cli
            .basic_path
            .map(|p| load_rom(&p, "BASIC", emu_uk101::BASIC_SIZE)),
        ram_size: cli.ram_kb * 1024,
        clock_mhz: cli.mhz,
        ..Uk101Config::default()
    };

    let mut machine = match Uk101::new(&config) {
        Ok(machine) => machine,
        Err(e) => {
            eprintln!("Cannot build machine: {e}");
            process::exit(1);
        }
    };

    if cli.trace {
        machine
            .set_trace_sink(Box::new(StderrTrace))
            .expect("machine is not running yet");
        machine.control().set_trace_enabled(true);
    }

    if let Err(e) = machine.start() {
        eprintln!("Cannot start machine: {e}");
        process::exit(1);
    }

    for _ in 0..cli.seconds {
        std::thread::sleep(Duration::from_secs(1));
        let ips = machine.control().instructions_per_second();
        println!("{ips:.0} instructions/second");
    }

    machine.stop();
}
