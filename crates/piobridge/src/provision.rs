use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Context;
use piobridge_core::StageStatus;

use crate::{
    config::BootstrapConfig,
    download::{ArtifactSource, find_file},
    error::{BootstrapError, Result},
    paths::CorePaths,
    python::PythonPrompt,
    runner::{CommandRunner, CommandSpec},
    state::{StateStore, upgrade_due},
    support::{format_error_chain, now_unix_ms},
    version::{CoreVersion, version_from_output},
};

pub const CORE_PACKAGE: &str = "platformio";
pub const DEVELOP_CORE_URL: &str = "https://github.com/platformio/platformio/archive/develop.zip";

/// Shared "use the managed environment" switch.
///
/// Clones share one flag; the stage turns it on when the system core is too
/// old so the next install provisions the managed one.
#[derive(Debug, Clone, Default)]
pub struct CoreMode(Arc<AtomicBool>);

impl CoreMode {
    pub fn new(builtin: bool) -> Self {
        Self(Arc::new(AtomicBool::new(builtin)))
    }

    pub fn is_builtin(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set_builtin(&self, builtin: bool) {
        self.0.store(builtin, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct ProvisioningParams {
    pub core_mode: CoreMode,
    pub min_core_version: CoreVersion,
    pub use_development_core: bool,
    pub python_prompt: Arc<dyn PythonPrompt>,
    pub ide_version: Option<String>,
    pub max_python_prompts: u32,
    pub virtualenv_url: String,
    pub conda_python: String,
    pub windows_python_version: String,
}

impl ProvisioningParams {
    pub fn from_config(
        cfg: &BootstrapConfig,
        python_prompt: Arc<dyn PythonPrompt>,
    ) -> anyhow::Result<Self> {
        let min_core_version = cfg
            .min_core_version
            .parse::<CoreVersion>()
            .context("min_core_version")?;
        Ok(Self {
            core_mode: CoreMode::new(cfg.use_builtin_core),
            min_core_version,
            use_development_core: cfg.use_development_core,
            python_prompt,
            ide_version: cfg.ide_version.clone(),
            max_python_prompts: cfg.max_python_prompts,
            virtualenv_url: cfg.virtualenv_url.clone(),
            conda_python: cfg.conda_python.clone(),
            windows_python_version: cfg.windows_python_version.clone(),
        })
    }
}

/// Provisioning stage for PlatformIO Core.
///
/// `check` verifies an existing core; `install` builds the managed
/// environment through a chain of fallbacks. Both take `&mut self`, so one
/// stage never runs two installs at once.
pub struct CoreStage {
    pub(crate) params: ProvisioningParams,
    pub(crate) paths: CorePaths,
    pub(crate) runner: Arc<dyn CommandRunner>,
    pub(crate) artifacts: Arc<dyn ArtifactSource>,
    state: StateStore,
    status: StageStatus,
    clock: fn() -> u64,
}

impl CoreStage {
    pub fn new(
        params: ProvisioningParams,
        paths: CorePaths,
        runner: Arc<dyn CommandRunner>,
        artifacts: Arc<dyn ArtifactSource>,
    ) -> Self {
        let state = StateStore::new(paths.state_file.clone());
        Self {
            params,
            paths,
            runner,
            artifacts,
            state,
            status: StageStatus::Pending,
            clock: now_unix_ms,
        }
    }

    /// Replaces the wall clock used for upgrade scheduling.
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &'static str {
        "PlatformIO Core"
    }

    pub fn status(&self) -> StageStatus {
        self.status
    }

    pub fn paths(&self) -> &CorePaths {
        &self.paths
    }

    pub fn core_mode(&self) -> &CoreMode {
        &self.params.core_mode
    }

    fn core_command<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        CommandSpec::new(self.paths.core_program(self.params.core_mode.is_builtin())).args(args)
    }

    /// Verifies the installed core and returns its version.
    pub async fn check(&mut self) -> Result<CoreVersion> {
        if self.params.core_mode.is_builtin() {
            if !self.paths.env_bin_dir.is_dir() {
                return Err(BootstrapError::EnvironmentMissing(
                    self.paths.env_bin_dir.clone(),
                ));
            }
            if let Err(e) = self.auto_upgrade().await {
                tracing::warn!(error = %format_error_chain(&e), "auto-upgrade of PlatformIO Core");
            }
        }

        let raw = self.core_version().await?;
        let required = self.params.min_core_version;
        match CoreVersion::parse(&raw) {
            Some(found) if found.satisfies(&required) => {
                self.status = StageStatus::Succeeded;
                tracing::info!(version = %raw, "found PlatformIO Core");
                Ok(found)
            }
            _ => {
                self.params.core_mode.set_builtin(true);
                Err(BootstrapError::IncompatibleVersion {
                    found: raw,
                    required: required.to_string(),
                })
            }
        }
    }

    async fn core_version(&self) -> Result<String> {
        let stdout = self
            .runner
            .run(&self.core_command(["--version"]))
            .await
            .into_result("PIO Core")
            .map_err(|e| BootstrapError::CoreUnavailable(format_error_chain(&e)))?;
        version_from_output(&stdout)
            .map(str::to_string)
            .ok_or_else(|| {
                BootstrapError::CoreUnavailable(format!(
                    "unexpected version output: {}",
                    stdout.trim()
                ))
            })
    }

    async fn auto_upgrade(&self) -> anyhow::Result<()> {
        let mut state = self.state.load();
        let now = (self.clock)();
        let ide_version = self.params.ide_version.as_deref();

        if upgrade_due(&state, now, ide_version) {
            state.last_checked_at_unix_ms = state.last_checked_at_unix_ms.max(now);
            for args in [&["upgrade"][..], &["update", "--core-packages"][..]] {
                let cmd = self.core_command(args);
                let out = self.runner.run(&cmd).await;
                if !out.success() {
                    tracing::warn!(
                        command = %cmd.display(),
                        stdout = %out.stdout.trim(),
                        stderr = %out.stderr.trim(),
                        "core upgrade step failed"
                    );
                }
            }
        }

        state.last_ide_version = ide_version.map(str::to_string);
        self.state.save(&state)
    }

    /// Creates the managed environment and installs the core into it.
    pub async fn install(&mut self) -> Result<()> {
        if self.status == StageStatus::Succeeded {
            return Ok(());
        }
        if !self.params.core_mode.is_builtin() {
            self.status = StageStatus::Succeeded;
            return Ok(());
        }
        self.status = StageStatus::Installing;
        tracing::info!(env = %self.paths.env_dir.display(), "installing PlatformIO Core");

        self.clean_env_dir();

        if let Err(e) = self.create_environment().await {
            self.status = StageStatus::Failed;
            return Err(e);
        }
        if let Err(e) = self.install_core_package().await {
            self.status = StageStatus::Failed;
            return Err(e);
        }

        self.status = StageStatus::Succeeded;
        tracing::info!("PlatformIO Core installed");
        Ok(())
    }

    /// `check`, falling back to `install` and a second `check`.
    pub async fn ensure(&mut self) -> Result<CoreVersion> {
        match self.check().await {
            Ok(v) => return Ok(v),
            Err(e) => tracing::info!(error = %e, "PlatformIO Core check failed, installing"),
        }
        self.install().await?;
        self.check().await
    }

    fn clean_env_dir(&self) {
        let env_dir = &self.paths.env_dir;
        if !env_dir.is_dir() {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(env_dir) {
            tracing::warn!(path = %env_dir.display(), error = %e, "remove virtual environment");
        }
    }

    async fn create_environment(&mut self) -> Result<()> {
        if self.conda_installed().await {
            match self.create_with_conda().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(error = %format_error_chain(&e), "conda environment failed, falling back to virtualenv");
                    self.clean_env_dir();
                }
            }
        }

        let Some(python) = self.where_is_python().await else {
            return Err(BootstrapError::InterpreterNotFound);
        };

        if let Err(e) = self.create_with_user_virtualenv(&python).await {
            tracing::warn!(error = %format_error_chain(&e), "user virtualenv failed, downloading virtualenv");
            self.create_with_downloaded_virtualenv(&python)
                .await
                .map_err(|e| BootstrapError::EnvironmentCreationFailed(format_error_chain(&e)))?;
        }
        Ok(())
    }

    async fn conda_installed(&self) -> bool {
        self.runner
            .run(&CommandSpec::new("conda").arg("--version"))
            .await
            .success()
    }

    async fn create_with_conda(&self) -> anyhow::Result<()> {
        self.runner
            .run(
                &CommandSpec::new("conda")
                    .args(["create", "--yes", "--quiet"])
                    .arg(format!("python={}", self.params.conda_python))
                    .arg("--prefix")
                    .arg(&self.paths.env_dir),
            )
            .await
            .into_result("Conda Virtualenv")?;
        Ok(())
    }

    async fn create_with_user_virtualenv(&self, python: &Path) -> anyhow::Result<()> {
        self.runner
            .run(
                &CommandSpec::new("virtualenv")
                    .arg("-p")
                    .arg(python)
                    .arg(&self.paths.env_dir),
            )
            .await
            .into_result("User's Virtualenv")?;
        Ok(())
    }

    async fn create_with_downloaded_virtualenv(&self, python: &Path) -> anyhow::Result<()> {
        let cache_dir = &self.paths.cache_dir;
        tokio::fs::create_dir_all(cache_dir)
            .await
            .with_context(|| format!("create {}", cache_dir.display()))?;

        let url = &self.params.virtualenv_url;
        let file_name = url
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .unwrap_or("virtualenv.tar.gz");
        let archive = self
            .artifacts
            .fetch(url, &cache_dir.join(file_name))
            .await
            .context("download virtualenv")?;

        let scratch = tempfile::Builder::new()
            .prefix("virtualenv-")
            .tempdir_in(cache_dir)
            .context("create scratch dir")?;
        let extracted = self.artifacts.extract(&archive, scratch.path()).await?;
        let script: PathBuf = find_file(&extracted, "virtualenv.py", 6)
            .context("can not find virtualenv.py script")?;

        let out = self
            .runner
            .run(
                &CommandSpec::new(python)
                    .arg(&script)
                    .arg(&self.paths.env_dir),
            )
            .await;
        if let Err(e) = scratch.close() {
            tracing::warn!(error = %e, "remove virtualenv scratch dir");
        }
        out.into_result("Virtualenv Create")?;
        Ok(())
    }

    async fn install_core_package(&self) -> Result<()> {
        let pip = self.paths.env_bin("pip");
        let target = if self.params.use_development_core {
            DEVELOP_CORE_URL
        } else {
            CORE_PACKAGE
        };
        let args = ["install", "--no-cache-dir", "-U", target];

        let first = self
            .runner
            .run(&CommandSpec::new(&pip).args(args))
            .await
            .into_result("PIP");
        let Err(e) = first else {
            return Ok(());
        };
        // Old pip releases do not know `--no-cache-dir`.
        tracing::warn!(error = %format_error_chain(&e), "pip install failed, retrying without --no-cache-dir");
        self.runner
            .run(
                &CommandSpec::new(&pip).args(args.into_iter().filter(|a| *a != "--no-cache-dir")),
            )
            .await
            .into_result("PIP")
            .map(drop)
            .map_err(|e| BootstrapError::PackageInstallFailed(format_error_chain(&e)))
    }
}
