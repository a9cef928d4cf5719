use clap::{Parser, Subcommand};

mod client;
mod echo;

/// WebSocket client/server CLI tool for real-time communication
///
/// Supports inline comments using // for documenting messages and formats.
/// Comments can be searched with ctrl+r in history.
///
/// Examples:
///   {"type": "ping"} // Heartbeat
///
#[derive(Parser)]
#[command(author, version)]
struct Cli {
    /// Print debug logs of handshakes, keepalives and disconnects.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Client(client::Cmd),
    Echo(echo::Cmd),
}

fn main() {
    let args = Cli::parse();

    let level = if args.verbose {
        log::Level::Debug
    } else {
        log::Level::Warn
    };
    if let Err(err) = simple_logger::init_with_level(level) {
        eprintln!("unable to initialize logging: {err}");
    }

    let res = match args.command {
        Commands::Client(cmd) => client::run(cmd),
        Commands::Echo(cmd) => echo::run(cmd),
    };
    if let Err(err) = res {
        eprintln!("{:?}", err);
    }
}
