//! Command-line argument parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Send files to nearby devices.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Network interface to advertise and scan on (overrides config)
    #[arg(short, long, global = true)]
    pub interface: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Advertise this device and accept incoming files
    Receive {
        /// Directory received files are written to (overrides config)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Name shown to nearby devices (overrides config)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Scan for nearby devices and list them
    Peers {
        /// Seconds to scan for
        #[arg(short, long, default_value_t = 5)]
        wait: u64,
    },

    /// Send a file to a nearby device
    Send {
        /// Device name, full id, or id prefix
        peer: String,

        /// File to send
        file: PathBuf,

        /// Seconds to wait for the device to be discovered
        #[arg(short, long, default_value_t = 10)]
        wait: u64,
    },
}
