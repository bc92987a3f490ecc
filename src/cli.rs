//! CLI subcommand definitions.
//!
//! - `start` (default) -- run the gateway
//! - `version` -- print build/version info

use clap::{Parser, Subcommand};

/// Multi-tenant MP messenger gateway.
#[derive(Parser, Debug)]
#[command(
    name = "mpgate",
    version = env!("CARGO_PKG_VERSION"),
    about = "mpgate — multi-tenant MP messenger gateway"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the gateway (default when no subcommand is given).
    Start,

    /// Print version information.
    Version,
}

pub fn handle_version() {
    println!("mpgate {}", env!("CARGO_PKG_VERSION"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_none() {
        let cli = Cli::parse_from(["mpgate"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_start_subcommand_parses() {
        let cli = Cli::parse_from(["mpgate", "start"]);
        assert!(matches!(cli.command, Some(Command::Start)));
    }
}
