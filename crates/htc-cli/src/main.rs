use clap::Parser;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

use htc_core::{Context, Flags};

mod cli;
mod dispatch;

use cli::HtcCli;

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = HtcCli::parse();
    init_tracing(cli.verbose);

    let ctx = build_context(&cli).map_err(|err| eyre!("{err:?}"))?;
    dispatch::dispatch(&ctx, &cli.command).map_err(|err| eyre!("{err:?}"))
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("HTC_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_context(cli: &HtcCli) -> anyhow::Result<Context> {
    let mut ctx = Context::detect(&cli.controller, &cli.space)?;
    ctx.flags = Flags {
        no_build: cli.no_build,
        lockless: cli.lockless,
        live_only: cli.liveonly,
        stage_only: false,
        shared_holotree: false,
    };
    ctx.settings.solver_bin = cli.solver.clone();
    ctx.settings.channel_alias = cli.channel_alias.clone();
    ctx.settings.pypi_url = cli.pypi_url.clone();
    ctx.settings.pypi_trusted_host = cli.pypi_trusted_host.clone();
    Ok(ctx)
}
