use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::{provision::CoreStage, runner::CommandSpec, support::format_error_chain};

/// Prints the resolved interpreter path; valid on Python 2 and 3.
const PROBE_SCRIPT: &str = "import sys; print(sys.executable)";

/// Answer of the user when no interpreter could be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    /// Look again (the user installed one meanwhile).
    Retry,
    /// Use this interpreter as is.
    CustomPath(PathBuf),
    /// Give up provisioning.
    Abort,
}

/// Asks the user how to continue when no Python interpreter was found.
#[async_trait::async_trait]
pub trait PythonPrompt: Send + Sync {
    async fn prompt(&self) -> PromptOutcome;
}

/// Non-interactive prompt that always gives up.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortPrompt;

#[async_trait::async_trait]
impl PythonPrompt for AbortPrompt {
    async fn prompt(&self) -> PromptOutcome {
        PromptOutcome::Abort
    }
}

impl CoreStage {
    /// Resolves a usable interpreter, installing one on Windows and asking
    /// the prompt when everything else fails.
    pub async fn where_is_python(&mut self) -> Option<PathBuf> {
        let rounds = self.params.max_python_prompts.max(1);
        for round in 1..=rounds {
            if let Some(python) = self.find_python_executable().await {
                tracing::info!(python = %python.display(), "found Python interpreter");
                return Some(python);
            }

            if self.paths.platform().is_windows() {
                match self.install_python_for_windows().await {
                    Ok(python) => return Some(python),
                    Err(e) => {
                        tracing::warn!(error = %format_error_chain(&e), "install Python for Windows");
                    }
                }
            }

            match self.params.python_prompt.prompt().await {
                PromptOutcome::Retry => {
                    tracing::debug!(round, "retrying interpreter lookup");
                }
                PromptOutcome::CustomPath(python) => return Some(python),
                PromptOutcome::Abort => return None,
            }
        }
        tracing::warn!(rounds, "giving up on interpreter lookup");
        None
    }

    fn python_candidates(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        if self.params.core_mode.is_builtin() {
            let env_python = self.paths.env_bin("python");
            if env_python.is_file() {
                out.push(env_python);
            }
        }
        if self.paths.platform().is_windows() {
            let local = self.paths.windows_python_dir().join("python.exe");
            if local.is_file() {
                out.push(local);
            }
            out.push(PathBuf::from("python.exe"));
        } else {
            out.extend(["python3", "python", "python2"].map(PathBuf::from));
        }
        out
    }

    async fn find_python_executable(&self) -> Option<PathBuf> {
        for candidate in self.python_candidates() {
            let out = self
                .runner
                .run(&CommandSpec::new(&candidate).args(["-c", PROBE_SCRIPT]))
                .await;
            if !out.success() {
                continue;
            }
            let reported = out.stdout.trim();
            if reported.is_empty() {
                return Some(candidate);
            }
            return Some(PathBuf::from(reported));
        }
        None
    }

    async fn install_python_for_windows(&self) -> anyhow::Result<PathBuf> {
        let version = &self.params.windows_python_version;
        let arch = if self.paths.platform().arch == "x86_64" {
            ".amd64"
        } else {
            ""
        };
        let url = format!("https://www.python.org/ftp/python/{version}/python-{version}{arch}.msi");
        let file_name = url.rsplit('/').next().unwrap_or("python.msi");
        let msi = self
            .artifacts
            .fetch(&url, &self.paths.cache_dir.join(file_name))
            .await
            .context("download Python installer")?;

        let target_dir = self.paths.windows_python_dir();
        let python = target_dir.join("python.exe");
        if !python.is_file() {
            if let Err(e) = self.install_python_from_msi(&msi, &target_dir, false).await {
                tracing::warn!(error = %format_error_chain(&e), "per-user MSI install failed, trying administrative install");
                self.install_python_from_msi(&msi, &target_dir, true).await?;
            }
        }

        self.runner
            .prepend_search_path(&[target_dir.clone(), target_dir.join("Scripts")]);

        let out = self
            .runner
            .run(&CommandSpec::new("pip").args(["install", "virtualenv"]))
            .await;
        if !out.success() {
            tracing::warn!(stderr = %out.stderr.trim(), "pip install virtualenv");
        }
        Ok(python)
    }

    async fn install_python_from_msi(
        &self,
        msi: &Path,
        target_dir: &Path,
        administrative: bool,
    ) -> anyhow::Result<()> {
        let log_file = self.paths.cache_dir.join("python-msi.log");
        let mut target_arg = std::ffi::OsString::from("TARGETDIR=");
        target_arg.push(target_dir.as_os_str());

        let out = self
            .runner
            .run(
                &CommandSpec::new("msiexec.exe")
                    .arg(if administrative { "/a" } else { "/i" })
                    .arg(msi)
                    .args(["/qn", "/li"])
                    .arg(&log_file)
                    .arg(target_arg),
            )
            .await;
        if !out.success() {
            let detail = std::fs::read_to_string(&log_file)
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(out.stderr);
            anyhow::bail!("MSI Python {}: {}", self.params.windows_python_version, detail.trim());
        }

        if !target_dir.join("python.exe").is_file() {
            anyhow::bail!(
                "could not install Python {} using MSI",
                self.params.windows_python_version
            );
        }
        Ok(())
    }
}
