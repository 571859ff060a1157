use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::session::LATEST;

#[derive(Parser, Debug)]
#[command(name = "fcosctl", about = "Fast Fedora CoreOS configuration development tool")]
pub struct Cli {
    /// Path to settings file (defaults to ~/.config/fcosctl/settings.toml)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Runs a config using qemu-kvm in an ephemeral virtual machine
    Run {
        /// Butane config to compile and boot
        config: PathBuf,

        /// Image version to use as base. Use `latest` to run the most recent
        #[arg(long, default_value = LATEST)]
        version: String,
    },

    /// Manage FCOS images
    Image {
        #[command(subcommand)]
        action: ImageCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ImageCommand {
    /// List available images
    List,

    /// Download FCOS images
    Pull {
        /// Stream to pull from. Must be one of stable, testing or next
        #[arg(long, default_value = "stable")]
        stream: String,
    },

    /// Delete FCOS images
    Delete {
        /// Version to delete
        #[arg(long)]
        version: String,
    },
}
