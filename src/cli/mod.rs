use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod server;

#[derive(Parser)]
#[command(name = "volnbd")]
#[command(author, version, about = "Authenticated NBD gateway for control-plane attached volumes", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a default configuration file
    Init {
        #[arg(default_value = "volnbd.toml")]
        path: PathBuf,
    },
    /// Run the NBD gateway server
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
