use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use htc_core::LinkMode;

#[derive(Parser, Debug)]
#[command(
    name = "htc",
    version,
    about = "Content-addressed cache and materializer for reproducible conda/pip environments"
)]
pub struct HtcCli {
    #[arg(
        long,
        global = true,
        default_value = "cli",
        help = "Client kind owning the space (e.g. an IDE or a CI agent)"
    )]
    pub controller: String,
    #[arg(long, global = true, default_value = "user", help = "Space name within the controller")]
    pub space: String,
    #[arg(short, long, global = true, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)")]
    pub verbose: u8,
    #[arg(long, global = true, help = "Replace locks with no-ops (test scenarios only)")]
    pub lockless: bool,
    #[arg(long = "no-build", global = true, help = "Never invoke the builder; a cache miss is an error")]
    pub no_build: bool,
    #[arg(long = "liveonly", global = true, help = "Skip the template copy after a successful build")]
    pub liveonly: bool,
    #[arg(long, global = true, help = "Explicit solver binary instead of resolving micromamba from PATH")]
    pub solver: Option<PathBuf>,
    #[arg(long = "channel-alias", global = true, help = "Channel alias passed to the solver")]
    pub channel_alias: Option<String>,
    #[arg(long = "pypi-url", global = true, help = "Index url passed to the installer")]
    pub pypi_url: Option<String>,
    #[arg(long = "pypi-trusted-host", global = true, help = "Trusted host passed to the installer")]
    pub pypi_trusted_host: Option<String>,
    #[command(subcommand)]
    pub command: CommandCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandCli {
    /// Materialize and inspect environments.
    Env(EnvArgs),
    /// Operate on the shared hololib (catalogs and object library).
    Lib(LibArgs),
    /// Aggregate the stats journal and report lock health.
    Stats {
        #[arg(long, default_value_t = 12, help = "Trailing window in days")]
        days: u64,
    },
}

#[derive(Args, Debug)]
pub struct EnvArgs {
    #[command(subcommand)]
    pub command: EnvCommand,
}

#[derive(Subcommand, Debug)]
pub enum EnvCommand {
    /// Materialize the environment described by one or more conda.yaml files.
    New {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long, help = "Rebuild even when a pristine space exists")]
        force: bool,
        #[arg(long = "link-mode", value_enum, default_value = "copy")]
        link_mode: LinkModeCli,
    },
    /// Print the 16-hex blueprint for the merged descriptors.
    Hash {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// List live spaces.
    List,
    /// Tear down spaces and templates whose blueprint starts with a prefix.
    Remove { prefix: String },
}

#[derive(Args, Debug)]
pub struct LibArgs {
    #[command(subcommand)]
    pub command: LibCommand,
}

#[derive(Subcommand, Debug)]
pub enum LibCommand {
    /// List catalogs with their ages.
    Catalogs,
    /// Garbage-collect library objects unreachable from any catalog.
    Sweep,
    /// Re-digest every object; reclaim corruption and invalidate affected
    /// catalogs.
    Check,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum LinkModeCli {
    Copy,
    Hardlink,
    Symlink,
}

impl From<LinkModeCli> for LinkMode {
    fn from(mode: LinkModeCli) -> Self {
        match mode {
            LinkModeCli::Copy => LinkMode::Copy,
            LinkModeCli::Hardlink => LinkMode::Hardlink,
            LinkModeCli::Symlink => LinkMode::Symlink,
        }
    }
}
