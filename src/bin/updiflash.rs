use std::process;

use clap::{Args, Parser, Subcommand};
use log::{debug, LevelFilter};
use updiflash::{
    cli::{self, exit_code, ConnectArgs, MemoryArgs},
    logging::initialize_logger,
    targets::MemoryKind,
};

/// Main CLI parser.
#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, propagate_version = true, version)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check connectivity by reading the device signature
    Ping(ConnectArgs),
    /// Read device memory to the console or to a HEX file
    Read(MemoryCommandArgs),
    /// Write literal bytes or a HEX file to the device
    Write(WriteArgs),
    /// Chip-erase the device, or erase a single region
    Erase(EraseArgs),
    /// Compare device memory against literal bytes or a HEX file
    Verify(MemoryCommandArgs),
    /// Pulse reset and let the device run
    Reset(ConnectArgs),
}

#[derive(Debug, Args)]
#[non_exhaustive]
struct MemoryCommandArgs {
    /// Connection configuration
    #[clap(flatten)]
    connect_args: ConnectArgs,
    /// Memory selection
    #[clap(flatten)]
    memory: MemoryArgs,
}

#[derive(Debug, Args)]
#[non_exhaustive]
struct WriteArgs {
    /// Connection configuration
    #[clap(flatten)]
    connect_args: ConnectArgs,
    /// Memory selection
    #[clap(flatten)]
    memory: MemoryArgs,
    /// Chip-erase before writing
    #[arg(long)]
    erase: bool,
    /// Read back and compare after writing
    #[arg(long)]
    verify: bool,
}

#[derive(Debug, Args)]
#[non_exhaustive]
struct EraseArgs {
    /// Connection configuration
    #[clap(flatten)]
    connect_args: ConnectArgs,
    /// Region to erase; the whole chip when omitted
    #[arg(short = 'm', long, value_parser = cli::clap_enum_variants!(MemoryKind))]
    memory: Option<MemoryKind>,
}

fn main() {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    let cli = Cli::parse();
    debug!("{:#?}", cli.subcommand);

    let result = match cli.subcommand {
        Commands::Ping(args) => cli::ping(&args),
        Commands::Read(args) => cli::read(&args.connect_args, &args.memory),
        Commands::Write(args) => cli::write(&args.connect_args, &args.memory, args.erase, args.verify),
        Commands::Erase(args) => cli::erase(&args.connect_args, args.memory),
        Commands::Verify(args) => cli::verify(&args.connect_args, &args.memory),
        Commands::Reset(args) => cli::reset(&args),
    };

    if let Err(err) = result {
        let code = exit_code(&err);
        eprintln!("{:?}", miette::Report::new(err));
        process::exit(code);
    }
}
