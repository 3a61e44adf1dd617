#![forbid(unsafe_code)]

mod cli;
mod commands;
mod reload;
mod shutdown;
mod startup;

use anyhow::Result;

use cli::Command;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::parse();
    let output = cli.output;

    match cli.command {
        Some(Command::Version) => {
            println!("natd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }

        Some(Command::Check) => commands::cmd_check(&cli.config, output),

        Some(Command::Replay { ref file, sessions }) => {
            commands::cmd_replay(&cli.config, file, sessions, output)
        }

        Some(Command::Run) | None => startup::run(&cli).await,
    }
}
