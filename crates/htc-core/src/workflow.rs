use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, warn};

use htc_domain::compose_final_blueprint;

use crate::builder::Builder;
use crate::catalog::CatalogStore;
use crate::context::Context;
use crate::error::HoloError;
use crate::fsops;
use crate::journal::{Journal, JournalEvent, Outcome, KIND_ENV_FAILURE, KIND_ENV_MERGE};
use crate::library::Library;
use crate::space::{LinkMode, Materializer};

/// Result of a materialize request: which space to use and how the cache
/// satisfied it.
#[derive(Debug)]
pub struct EnvironmentOutcome {
    pub blueprint: String,
    pub path: PathBuf,
    pub outcome: Outcome,
}

/// Top-level workflow: compose the blueprint from descriptor files,
/// consult the catalog, build on a miss, and restore the caller's space.
///
/// # Errors
///
/// Returns descriptor parse/merge failures, `HoloError::NoBuild` on a
/// miss with builds disabled, and build or restore failures; every
/// failure is journaled before it is returned.
pub fn new_environment(
    ctx: &Context,
    files: &[impl AsRef<Path>],
    force: bool,
    mode: LinkMode,
) -> Result<EnvironmentOutcome> {
    ctx.ensure_layout()?;
    let merged = files.len() > 1;
    let (descriptor, blueprint) = compose_final_blueprint(files)?;
    let blueprint = blueprint.as_str().to_string();
    debug!(%blueprint, merged, "environment requested");

    let library = Library::new(ctx)?;
    let catalogs = CatalogStore::new(ctx)?;
    let journal = Journal::new(ctx);

    // A catalog whose objects no longer all resolve is a miss: drop it so
    // the build below repairs the cache.
    let mut have_catalog = false;
    if let Some(catalog) = catalogs.lookup(&blueprint)? {
        if catalog.object_hashes().all(|hash| library.has(hash)) {
            have_catalog = true;
        } else {
            warn!(%blueprint, "catalog references missing objects; invalidating");
            catalogs.remove(&blueprint)?;
            library.remove_users_of(&blueprint)?;
        }
    }

    let mut built = false;
    if force || !have_catalog {
        if ctx.flags.no_build {
            let err = HoloError::NoBuild {
                blueprint: blueprint.clone(),
            };
            record_failure(&journal, ctx, &blueprint, merged);
            return Err(err.into());
        }
        let builder = Builder::new(ctx, &library, &catalogs);
        if let Err(err) = builder.build(&descriptor, &blueprint, force) {
            record_failure(&journal, ctx, &blueprint, merged);
            return Err(err);
        }
        built = true;
        if force {
            fsops::rename_and_remove(&ctx.space_dir(&blueprint))?;
        }
    }

    let materializer = Materializer::new(ctx, &library, &catalogs, &journal);
    match materializer.restore(&blueprint, mode, built) {
        Ok(restored) => {
            if merged {
                record_merge(&journal, ctx, &blueprint, restored.outcome);
            }
            Ok(EnvironmentOutcome {
                blueprint,
                path: restored.path,
                outcome: restored.outcome,
            })
        }
        Err(err) => {
            record_failure(&journal, ctx, &blueprint, merged);
            Err(err)
        }
    }
}

fn record_failure(journal: &Journal, ctx: &Context, blueprint: &str, merged: bool) {
    let event = JournalEvent {
        timestamp: crate::timestamp_secs(),
        kind: KIND_ENV_FAILURE.to_string(),
        blueprint: blueprint.to_string(),
        space: ctx.space.clone(),
        controller: ctx.controller.clone(),
        duration_ms: 0,
        outcome: Outcome::Failure,
    };
    if let Err(err) = journal.append(&event) {
        warn!(%err, "failed to journal environment failure");
    }
    if merged {
        record_merge(journal, ctx, blueprint, Outcome::Failure);
    }
}

/// Annotate the request with a merge marker when more than one descriptor
/// file was folded into the blueprint.
fn record_merge(journal: &Journal, ctx: &Context, blueprint: &str, outcome: Outcome) {
    let event = JournalEvent {
        timestamp: crate::timestamp_secs(),
        kind: KIND_ENV_MERGE.to_string(),
        blueprint: blueprint.to_string(),
        space: ctx.space.clone(),
        controller: ctx.controller.clone(),
        duration_ms: 0,
        outcome,
    };
    if let Err(err) = journal.append(&event) {
        warn!(%err, "failed to journal merge marker");
    }
}
