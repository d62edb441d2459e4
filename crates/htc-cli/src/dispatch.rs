use std::path::PathBuf;

use anyhow::Result;

use htc_core::{
    aggregate, list_spaces, locker, new_environment, remove_spaces, CatalogStore, Context,
    Journal, Library, LinkMode,
};
use htc_domain::compose_final_blueprint;

use crate::cli::{CommandCli, EnvCommand, LibCommand};

pub fn dispatch(ctx: &Context, command: &CommandCli) -> Result<()> {
    match command {
        CommandCli::Env(env) => match &env.command {
            EnvCommand::New {
                files,
                force,
                link_mode,
            } => env_new(ctx, files, *force, (*link_mode).into()),
            EnvCommand::Hash { files } => env_hash(files),
            EnvCommand::List => env_list(ctx),
            EnvCommand::Remove { prefix } => env_remove(ctx, prefix),
        },
        CommandCli::Lib(lib) => match &lib.command {
            LibCommand::Catalogs => lib_catalogs(ctx),
            LibCommand::Sweep => lib_sweep(ctx),
            LibCommand::Check => lib_check(ctx),
        },
        CommandCli::Stats { days } => stats(ctx, *days),
    }
}

fn env_new(ctx: &Context, files: &[PathBuf], force: bool, mode: LinkMode) -> Result<()> {
    let outcome = new_environment(ctx, files, force, mode)?;
    println!(
        "{}  {}  ({})",
        outcome.blueprint,
        outcome.path.display(),
        outcome.outcome.as_str()
    );
    Ok(())
}

fn env_hash(files: &[PathBuf]) -> Result<()> {
    let (_, blueprint) = compose_final_blueprint(files)?;
    println!("{blueprint}");
    Ok(())
}

fn env_list(ctx: &Context) -> Result<()> {
    let spaces = list_spaces(ctx)?;
    if spaces.is_empty() {
        println!("no spaces");
        return Ok(());
    }
    for space in spaces {
        let last_used = space
            .last_used
            .and_then(|when| when.elapsed().ok())
            .map(|age| format!("{}d ago", age.as_secs() / 86_400))
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{}  {}  last used {}  {}",
            space.blueprint,
            space.space_id,
            last_used,
            space.path.display()
        );
    }
    Ok(())
}

fn env_remove(ctx: &Context, prefix: &str) -> Result<()> {
    ctx.ensure_layout()?;
    let library = Library::new(ctx)?;
    let removed = remove_spaces(ctx, &library, prefix)?;
    println!("removed {removed} spaces matching {prefix:?}");
    Ok(())
}

fn lib_catalogs(ctx: &Context) -> Result<()> {
    ctx.ensure_layout()?;
    let catalogs = CatalogStore::new(ctx)?;
    let rows = catalogs.list()?;
    if rows.is_empty() {
        println!("no catalogs");
        return Ok(());
    }
    for row in rows {
        println!(
            "{}  {}/{}  {} files  age {}d  idle {}d",
            row.blueprint, row.platform, row.arch, row.files, row.age_days, row.idle_days
        );
    }
    Ok(())
}

fn lib_sweep(ctx: &Context) -> Result<()> {
    ctx.ensure_layout()?;
    let library = Library::new(ctx)?;
    let catalogs = CatalogStore::new(ctx)?;
    let summary = library.sweep(&catalogs)?;
    println!("kept {} objects, removed {}", summary.kept, summary.removed);
    Ok(())
}

fn lib_check(ctx: &Context) -> Result<()> {
    ctx.ensure_layout()?;
    let library = Library::new(ctx)?;
    let catalogs = CatalogStore::new(ctx)?;
    let summary = library.check(&catalogs)?;
    println!(
        "checked {} objects, {} corrupted, {} catalogs invalidated",
        summary.checked,
        summary.corrupted.len(),
        summary.invalidated.len()
    );
    for blueprint in &summary.invalidated {
        println!("invalidated {blueprint}");
    }
    Ok(())
}

fn stats(ctx: &Context, days: u64) -> Result<()> {
    ctx.ensure_layout()?;
    let events = Journal::new(ctx).read_all()?;
    let summary = aggregate(&events, days);
    println!(
        "last {}d: {} requests, {} merges, {} hits, {} dirty, {} misses, {} failures",
        summary.window_days,
        summary.requests,
        summary.merges,
        summary.hits,
        summary.dirty,
        summary.misses,
        summary.failures
    );
    let markers = locker::list_markers(ctx)?;
    for marker in markers {
        let status = match marker.status {
            locker::MarkerStatus::Pending => "pending",
            locker::MarkerStatus::Stale => "stale(?)",
        };
        println!("lock {}: {}", status, marker.path.display());
    }
    Ok(())
}
