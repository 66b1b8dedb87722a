use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};

mod avss_cmd;
mod session;
mod transceiver_cmd;

/// Host tooling for Anura vibration sensing nodes and transceivers.
#[derive(Parser, Debug)]
#[command(name = "anura", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Anura Vibration Sensing Service (AVSS) commands.
    #[command(subcommand)]
    Avss(avss_cmd::AvssCommand),

    /// Transceiver commands.
    #[command(subcommand)]
    Transceiver(transceiver_cmd::TransceiverCommand),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity.tracing_level_filter())
        .with_target(false)
        .init();

    let result = match cli.command {
        Command::Avss(command) => avss_cmd::run(command).await,
        Command::Transceiver(command) => transceiver_cmd::run(command).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
