use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "slotsync", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, value_name = "FILE")]
    pub config_path: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect, subscribe and print live availability
    Watch {
        /// Provider identifier
        #[arg(short, long)]
        provider: String,

        /// Service identifier
        #[arg(short, long)]
        service: String,

        /// Day to watch (YYYY-MM-DD)
        #[arg(short, long)]
        date: NaiveDate,

        /// Override the configured server URL
        #[arg(long)]
        url: Option<String>,

        /// Claim this slot (HH:MM) once the first snapshot arrives
        #[arg(long, value_name = "HH:MM")]
        select: Option<String>,
    },

    /// Generate sample configuration
    ConfigSample {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}
