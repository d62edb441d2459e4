use std::env;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Write as _};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{anyhow, bail, Context as _, Result};
use tracing::{debug, warn};

use htc_domain::Descriptor;

use crate::catalog::{Catalog, CatalogStore};
use crate::context::Context;
use crate::error::HoloError;
use crate::fsops;
use crate::hasher;
use crate::library::Library;
use crate::locker;

const SOLVER_BIN: &str = "micromamba";
const INSTALLER_BIN: &str = "pip";
const DEFAULT_REPODATA_TTL: &str = "57600";
const FORCED_REPODATA_TTL: &str = "0";
const ACTIVATION_FILE: &str = "htc_activate.json";

/// Latched corruption signals scanned from the solver's combined output.
/// Each flag sticks once seen; the verdict is evaluated only at EOF.
#[derive(Debug, Default)]
pub struct InstallObserver {
    safety_error: bool,
    pkgs: bool,
    corrupted: bool,
}

impl InstallObserver {
    pub fn observe(&mut self, line: &str) {
        let lower = line.to_lowercase();
        if lower.contains("safetyerror:") {
            self.safety_error = true;
        }
        if lower.contains("pkgs") {
            self.pkgs = true;
        }
        if lower.contains("appears to be corrupted") {
            self.corrupted = true;
        }
    }

    /// True only when all three signals fired somewhere in the stream.
    #[must_use]
    pub fn unsafe_environment(&self) -> bool {
        self.safety_error && self.pkgs && self.corrupted
    }
}

struct Plan {
    file: Mutex<File>,
    started: Instant,
}

impl Plan {
    fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create plan file {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
            started: Instant::now(),
        })
    }

    fn section(&self, title: &str) {
        let elapsed = self.started.elapsed().as_secs_f32();
        self.line(&format!("\n---  {title} @{elapsed:.1}s  ---\n"));
    }

    fn line(&self, text: &str) {
        let mut file = self.file.lock().expect("plan writer poisoned");
        let _ = writeln!(file, "{text}");
    }
}

/// Drives the external solver and installer for a cache miss and promotes
/// the staged result into catalog, library, and template.
pub struct Builder<'a> {
    ctx: &'a Context,
    library: &'a Library,
    catalogs: &'a CatalogStore,
}

impl<'a> Builder<'a> {
    pub fn new(ctx: &'a Context, library: &'a Library, catalogs: &'a CatalogStore) -> Self {
        Self {
            ctx,
            library,
            catalogs,
        }
    }

    /// Build the environment for a blueprint. The first failed attempt is
    /// retried once with verbose output and forced repodata revalidation,
    /// unless the failure was fatal or the caller forced the build.
    ///
    /// # Errors
    ///
    /// Returns `HoloError::SolverUnsafe` when the corruption detector
    /// fires, `HoloError::SolverFailed` (after the retry) on solver exit
    /// failures, or the underlying error of any other failed stage.
    pub fn build(&self, descriptor: &Descriptor, blueprint: &str, force: bool) -> Result<()> {
        let _lock = locker::acquire(self.ctx, &self.ctx.build_lock(), None)?;
        fsops::ensure_dir(&self.ctx.temp_dir())?;
        let staging = self.ctx.temp_dir().join(format!("stage_{blueprint}"));

        let ttl = if force { FORCED_REPODATA_TTL } else { DEFAULT_REPODATA_TTL };
        match self.attempt(descriptor, blueprint, &staging, ttl, force) {
            Ok(()) => Ok(()),
            Err(err) => {
                let fatal = err
                    .downcast_ref::<HoloError>()
                    .is_some_and(HoloError::is_fatal);
                if fatal || force {
                    return Err(err);
                }
                warn!(%blueprint, %err, "first build attempt failed; retrying with debug and forced revalidation");
                self.attempt(descriptor, blueprint, &staging, FORCED_REPODATA_TTL, true)
            }
        }
    }

    fn attempt(
        &self,
        descriptor: &Descriptor,
        blueprint: &str,
        staging: &Path,
        ttl: &str,
        verbose: bool,
    ) -> Result<()> {
        fsops::rename_and_remove(staging)?;

        let plan_path = plan_path(staging);
        let plan = Plan::create(&plan_path)?;
        plan.line(&format!(
            "---  installation plan {blueprint} [htc {}]  ---",
            env!("CARGO_PKG_VERSION")
        ));
        plan.section("plan blueprint");
        plan.line(&descriptor.canonical_yaml());

        let conda_yaml = self.ctx.temp_dir().join(format!("conda_{blueprint}.yaml"));
        fsops::atomic_write(&conda_yaml, descriptor.as_pure_conda().canonical_yaml().as_bytes())?;

        plan.section("solver plan");
        self.run_solver(&plan, &conda_yaml, staging, ttl, verbose)?;
        let _ = fs::remove_file(&conda_yaml);

        plan.section("pip plan");
        let requirements = descriptor.as_pip_requirements();
        if requirements.is_empty() {
            plan.line("(pip install phase skipped -- no pip dependencies)");
            debug!(%blueprint, "pip install phase skipped");
        } else {
            let requirements_path = self
                .ctx
                .temp_dir()
                .join(format!("require_{blueprint}.txt"));
            fsops::atomic_write(&requirements_path, requirements.as_bytes())?;
            let result = self.run_installer(&plan, staging, &requirements_path, verbose);
            let _ = fs::remove_file(&requirements_path);
            result?;
        }

        plan.section("post install plan");
        for script in &descriptor.post_install {
            let argv = shlex::split(script)
                .ok_or_else(|| anyhow!("cannot parse post-install script {script:?}"))?;
            if argv.is_empty() {
                continue;
            }
            plan.line(&format!("$ {script}"));
            self.run_in_env(&plan, staging, &argv)
                .with_context(|| format!("post-install script {script:?} failed"))?;
        }

        plan.section("activation plan");
        self.capture_activation(&plan, staging);

        plan.section("promotion plan");
        let catalog = self.promote(staging, blueprint)?;
        plan.line(&format!(
            "promoted {} entries for blueprint {blueprint}",
            catalog.entries.len()
        ));
        plan.section("installation plan complete");
        drop(plan);
        let final_plan = self.catalogs.plan_for(blueprint);
        if fs::rename(&plan_path, &final_plan).is_err() {
            let _ = fs::copy(&plan_path, &final_plan);
            let _ = fs::remove_file(&plan_path);
        }
        Ok(())
    }

    fn solver_binary(&self) -> Result<PathBuf> {
        if let Some(bin) = &self.ctx.settings.solver_bin {
            return Ok(bin.clone());
        }
        which::which(SOLVER_BIN)
            .with_context(|| format!("cannot find {SOLVER_BIN} on PATH"))
    }

    fn run_solver(
        &self,
        plan: &Plan,
        conda_yaml: &Path,
        target: &Path,
        ttl: &str,
        verbose: bool,
    ) -> Result<()> {
        let bin = self.solver_binary()?;
        let mut command = Command::new(&bin);
        command.args(solver_args(self.ctx, conda_yaml, target, ttl, verbose));
        command
            .env("MAMBA_ROOT_PREFIX", self.ctx.home())
            .env("TEMP", self.ctx.temp_dir())
            .env("TMP", self.ctx.temp_dir());

        let mut observer = InstallObserver::default();
        let status = run_teed(command, plan, &mut observer)
            .with_context(|| format!("failed to run solver {}", bin.display()))?;
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            fsops::rename_and_remove(target)?;
            return Err(HoloError::SolverFailed { code }.into());
        }
        if observer.unsafe_environment() {
            warn!("solver output matched all corruption signals; staged environment is unsafe");
            fsops::rename_and_remove(target)?;
            return Err(HoloError::SolverUnsafe {
                pkgs_dir: self.ctx.pkgs_dir(),
            }
            .into());
        }
        Ok(())
    }

    fn run_installer(
        &self,
        plan: &Plan,
        target: &Path,
        requirements: &Path,
        verbose: bool,
    ) -> Result<()> {
        let mut argv: Vec<String> = vec![
            INSTALLER_BIN.to_string(),
            "install".to_string(),
            "--isolated".to_string(),
            "--no-color".to_string(),
            "--disable-pip-version-check".to_string(),
            "--prefer-binary".to_string(),
            "--cache-dir".to_string(),
            self.ctx.pip_cache().display().to_string(),
            "--find-links".to_string(),
            self.ctx.wheel_cache().display().to_string(),
            "--requirement".to_string(),
            requirements.display().to_string(),
        ];
        if let Some(url) = &self.ctx.settings.pypi_url {
            argv.push("--index-url".to_string());
            argv.push(url.clone());
        }
        if let Some(host) = &self.ctx.settings.pypi_trusted_host {
            argv.push("--trusted-host".to_string());
            argv.push(host.clone());
        }
        if verbose {
            argv.push("--verbose".to_string());
        }
        self.run_in_env(plan, target, &argv)
            .context("pip install phase failed")
    }

    /// Run a command with the staged environment's bin directory prepended
    /// to PATH, teeing output into the plan.
    fn run_in_env(&self, plan: &Plan, target: &Path, argv: &[String]) -> Result<()> {
        let bin_dir = target.join("bin");
        let mut search: Vec<PathBuf> = vec![bin_dir.clone()];
        if let Some(path) = env::var_os("PATH") {
            search.extend(env::split_paths(&path));
        }
        let joined = env::join_paths(&search).context("unsplittable PATH")?;
        let program = which::which_in(&argv[0], Some(&joined), target)
            .with_context(|| format!("cannot find command {:?} in environment", argv[0]))?;

        plan.line(&format!("command {argv:?} at {}", target.display()));
        let mut command = Command::new(program);
        command.args(&argv[1..]).env("PATH", &joined);
        let mut observer = InstallObserver::default();
        let status = run_teed(command, plan, &mut observer)
            .with_context(|| format!("failed to run {:?}", argv[0]))?;
        if !status.success() {
            bail!("{:?} exited with {}", argv[0], status);
        }
        Ok(())
    }

    /// Invoke the configured activator and persist whatever variable map
    /// it prints. Activation problems never fail the build.
    fn capture_activation(&self, plan: &Plan, target: &Path) {
        let Some(activator) = self.ctx.settings.activator.clone() else {
            plan.line("(no activator configured)");
            return;
        };
        match self.run_activator(target, &activator) {
            Ok(map) => {
                plan.line(&format!("captured {} activation variables", map.len()));
                let payload = serde_json::to_string_pretty(&map).unwrap_or_default();
                if let Err(err) = fsops::atomic_write(&target.join(ACTIVATION_FILE), payload.as_bytes())
                {
                    warn!(%err, "failed to persist activation map");
                }
            }
            Err(err) => {
                plan.line(&format!("activation failure: {err}"));
                warn!(%err, "activation capture failed");
            }
        }
    }

    fn run_activator(
        &self,
        target: &Path,
        argv: &[String],
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        let bin_dir = target.join("bin");
        let mut search: Vec<PathBuf> = vec![bin_dir];
        if let Some(path) = env::var_os("PATH") {
            search.extend(env::split_paths(&path));
        }
        let joined = env::join_paths(&search).context("unsplittable PATH")?;
        let program = which::which_in(&argv[0], Some(&joined), target)
            .with_context(|| format!("cannot find activator {:?}", argv[0]))?;
        let output = Command::new(program)
            .args(&argv[1..])
            .env("PATH", &joined)
            .output()
            .with_context(|| format!("failed to run activator {:?}", argv[0]))?;
        if !output.status.success() {
            bail!("activator exited with {}", output.status);
        }
        let value: serde_json::Value =
            serde_json::from_slice(&output.stdout).context("activator output is not JSON")?;
        match value {
            serde_json::Value::Object(map) => Ok(map),
            _ => bail!("activator output is not a JSON object"),
        }
    }

    /// Walk the staged tree in canonical order, ingest every regular file
    /// into the library, publish the catalog, and keep the staged tree as
    /// the blueprint's template. File modes are normalized to the
    /// read-only form the library enforces, so catalog, template, and
    /// restored spaces all digest identically.
    ///
    /// # Errors
    ///
    /// Returns an error when the walk, a library ingestion, the catalog
    /// publication, or the template promotion fails.
    pub fn promote(&self, staging: &Path, blueprint: &str) -> Result<Catalog> {
        let mut entries = hasher::collect_tree_entries(self.ctx, staging)?;
        for entry in &mut entries {
            if entry.kind != crate::hasher::EntryKind::File {
                continue;
            }
            let staged = staging.join(&entry.rel_path);
            let executable = entry.mode & 0o111 != 0;
            self.library.store(&staged, &entry.digest)?;
            fsops::set_readonly(&staged, executable)?;
            entry.mode = if executable { 0o555 } else { 0o444 };
        }
        let catalog = Catalog::new(self.ctx, blueprint, entries);
        self.catalogs.write(&catalog, self.library)?;

        let digest = catalog.digest();
        if self.ctx.flags.live_only {
            fsops::rename_and_remove(staging)?;
        } else {
            let template = self.ctx.template_for(blueprint);
            fsops::rename_and_remove(&template)?;
            fsops::ensure_dir(&self.ctx.template_dir())?;
            fs::rename(staging, &template).with_context(|| {
                format!("failed to promote staged tree into {}", template.display())
            })?;
            if !self.ctx.flags.stage_only {
                hasher::meta_save(&template, &digest)?;
            }
        }
        debug!(%blueprint, "build promoted");
        Ok(catalog)
    }
}

fn plan_path(staging: &Path) -> PathBuf {
    let mut os = staging.as_os_str().to_os_string();
    os.push(".plan");
    PathBuf::from(os)
}

/// Solver argv per the subprocess contract.
fn solver_args(
    ctx: &Context,
    conda_yaml: &Path,
    target: &Path,
    ttl: &str,
    verbose: bool,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "create".into(),
        "--always-copy".into(),
        "--no-rc".into(),
        "--safety-checks".into(),
        "enabled".into(),
        "--extra-safety-checks".into(),
        "--retry-clean-cache".into(),
        "--strict-channel-priority".into(),
        "--repodata-ttl".into(),
        ttl.into(),
        "-y".into(),
        "-f".into(),
        conda_yaml.as_os_str().to_os_string(),
        "-p".into(),
        target.as_os_str().to_os_string(),
    ];
    let alias = ctx
        .settings
        .channel_alias
        .as_ref()
        .or(ctx.settings.conda_url.as_ref());
    if let Some(alias) = alias {
        args.push("--channel-alias".into());
        args.push(alias.into());
    }
    if !ctx.settings.verify_ssl {
        args.push("--ssl-verify".into());
        args.push("false".into());
    }
    if verbose {
        args.push("--verbose".into());
    }
    args
}

/// Run a child process, feeding every combined output line to both the
/// plan file and the corruption observer. Flags are latched across the
/// entire stream; nothing short-circuits mid-stream.
fn run_teed(
    mut command: Command,
    plan: &Plan,
    observer: &mut InstallObserver,
) -> Result<std::process::ExitStatus> {
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = command.spawn()?;
    let stdout = child.stdout.take().context("child stdout unavailable")?;
    let stderr = child.stderr.take().context("child stderr unavailable")?;

    let observed = Mutex::new(observer);
    std::thread::scope(|scope| {
        let tee = |stream: Box<dyn Read + Send>| {
            let reader = BufReader::new(stream);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                observed
                    .lock()
                    .expect("observer poisoned")
                    .observe(&line);
                plan.line(&line);
            }
        };
        scope.spawn(move || tee(Box::new(stdout)));
        scope.spawn(move || tee(Box::new(stderr)));
    });
    Ok(child.wait()?)
}
