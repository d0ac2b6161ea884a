use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use piobridge::{
    channel::CommandHandler,
    config::BootstrapConfig,
    download::HttpArtifacts,
    home_state::show_at_startup,
    paths::{CorePaths, HostPlatform},
    provision::{CoreStage, ProvisioningParams},
    python::{AbortPrompt, PythonPrompt},
    runner::{CommandRunner, SystemRunner},
    supervisor::{HomeSupervisor, StartOptions},
};
use serde_json::Value;

mod prompt;

#[derive(Parser, Debug)]
#[command(name = "piobridge", version, about = "Provision PlatformIO Core and run PIO Home")]
struct Cli {
    /// TOML config file (default: $PIOBRIDGE_CONFIG or <home>/piobridge.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Core home directory (default: $PLATFORMIO_HOME_DIR or ~/.platformio).
    #[arg(long, global = true)]
    home_dir: Option<PathBuf>,
    /// Never prompt; give up when no Python interpreter is found.
    #[arg(long, global = true, default_value_t = false)]
    non_interactive: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check PlatformIO Core and install it when missing or outdated.
    Provision {
        /// Rebuild the managed environment even if the check passes.
        #[arg(long, default_value_t = false)]
        reinstall: bool,
    },
    /// Provision, start PIO Home and print IDE commands until Ctrl-C.
    Home {
        /// Name the home UI uses for its "show on startup" setting.
        #[arg(long, default_value = "piobridge")]
        caller: String,
        /// Do not open the command channel.
        #[arg(long, default_value_t = false)]
        no_listen: bool,
        /// Leave the server running on exit.
        #[arg(long, default_value_t = false)]
        keep_running: bool,
    },
    /// Ask a PIO Home server to exit.
    Shutdown {
        #[arg(long)]
        port: u16,
    },
}

struct App {
    cfg: BootstrapConfig,
    paths: CorePaths,
    runner: Arc<dyn CommandRunner>,
    prompt: Arc<dyn PythonPrompt>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut cfg = BootstrapConfig::load_from(cli.config.clone())?;
    if let Some(dir) = cli.home_dir.clone() {
        cfg.home_dir = Some(dir);
    }
    let paths = CorePaths::new(cfg.home_dir(), HostPlatform::current());
    let prompt: Arc<dyn PythonPrompt> = if cli.non_interactive {
        Arc::new(AbortPrompt)
    } else {
        Arc::new(prompt::TerminalPrompt)
    };
    let app = App {
        cfg,
        paths,
        runner: Arc::new(SystemRunner::new()),
        prompt,
    };

    match cli.command.unwrap_or(Command::Home {
        caller: "piobridge".to_string(),
        no_listen: false,
        keep_running: false,
    }) {
        Command::Provision { reinstall } => {
            provision(&app, reinstall).await?;
        }
        Command::Home {
            caller,
            no_listen,
            keep_running,
        } => run_home(&app, &caller, no_listen, keep_running).await?,
        Command::Shutdown { port } => {
            let mut sup = supervisor(&app, &provision_params(&app)?).with_port(port);
            if let Some(task) = sup.shutdown() {
                task.await.context("shutdown request task")?;
            }
        }
    }

    Ok(())
}

fn provision_params(app: &App) -> anyhow::Result<ProvisioningParams> {
    ProvisioningParams::from_config(&app.cfg, app.prompt.clone())
}

fn supervisor(app: &App, params: &ProvisioningParams) -> HomeSupervisor {
    HomeSupervisor::new(
        app.runner.clone(),
        app.paths.clone(),
        params.core_mode.clone(),
        app.cfg.home.clone(),
        app.cfg.reconnect,
    )
}

async fn provision(app: &App, reinstall: bool) -> anyhow::Result<ProvisioningParams> {
    let params = provision_params(app)?;
    let mut stage = CoreStage::new(
        params.clone(),
        app.paths.clone(),
        app.runner.clone(),
        Arc::new(HttpArtifacts),
    );

    let version = if reinstall {
        params.core_mode.set_builtin(true);
        stage.install().await?;
        stage.check().await?
    } else {
        stage.ensure().await?
    };
    tracing::info!(
        %version,
        managed = params.core_mode.is_builtin(),
        "PlatformIO Core is ready"
    );
    Ok(params)
}

async fn run_home(
    app: &App,
    caller: &str,
    no_listen: bool,
    keep_running: bool,
) -> anyhow::Result<()> {
    let params = provision(app, false).await?;
    let mut sup = supervisor(app, &params);

    let on_ide_command = (!no_listen).then(|| Arc::new(print_command) as Arc<dyn CommandHandler>);
    let endpoint = sup.ensure_started(StartOptions { on_ide_command }).await?;

    if show_at_startup(&app.paths.home_state_file, caller) {
        println!("PIO Home: {}", endpoint.http_url());
    }

    tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;

    if !keep_running {
        if let Some(task) = sup.shutdown() {
            task.await.ok();
        }
    }
    Ok(())
}

fn print_command(method: &str, params: Value) -> anyhow::Result<()> {
    tracing::info!(%method, "IDE command");
    println!("{method} {params}");
    Ok(())
}
