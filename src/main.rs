use std::io::Read;
use std::process::ExitCode;

use clap::{ArgAction, Parser};

use periphsim::device::{BoardConfig, Device};
use periphsim::memory::FlatMemory;

/// Assemble a board from a TOML description and run its steps.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Board description (`-` for stdin)
    #[arg(value_parser)]
    config: clio::Input,

    /// More log output (repeat for trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Print the non-zero parts of memory when done
    #[arg(long)]
    dump: bool,
}

fn dump(mem: &FlatMemory) -> Result<(), String> {
    let data = mem.read_buf(mem.base(), mem.size())?;
    for (i, row) in data.chunks(16).enumerate() {
        if row.iter().all(|b| *b == 0) {
            continue;
        }
        let hex: Vec<String> = row.iter().map(|b| format!("{b:02x}")).collect();
        println!("{:08x}: {}", mem.base() as usize + 16 * i, hex.join(" "));
    }
    Ok(())
}

fn run(mut args: Args) -> Result<(), String> {
    let mut text = String::new();
    args.config
        .read_to_string(&mut text)
        .map_err(|e| format!("Could not read board description ({e})"))?;

    let cfg = BoardConfig::parse(&text)?;
    let mut dev = Device::from_config(&cfg)?;
    dev.run(&cfg.steps)?;
    log::info!("{} steps completed", cfg.steps.len());

    if args.dump {
        if let Some(mem) = dev.memory() {
            dump(mem)?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
