use std::{sync::Arc, time::Duration};

use piobridge_core::{LOOPBACK_HOST, ReconnectPolicy, ServiceEndpoint};
use tokio::task::JoinHandle;
use tracing::{Instrument, info_span};

use crate::{
    channel::{CommandChannel, CommandHandler},
    config::HomeConfig,
    download::http_client,
    error::{BootstrapError, Result},
    paths::CorePaths,
    port_alloc::{find_free_port, is_port_in_use},
    provision::CoreMode,
    runner::{CommandRunner, CommandSpec},
    support::format_error_chain,
};

const SHUTDOWN_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
pub struct StartOptions {
    /// Starts a command channel once the service is up.
    pub on_ide_command: Option<Arc<dyn CommandHandler>>,
}

/// Owns one PIO Home server: its port, its process and its command channel.
pub struct HomeSupervisor {
    runner: Arc<dyn CommandRunner>,
    paths: CorePaths,
    core_mode: CoreMode,
    settings: HomeConfig,
    reconnect: ReconnectPolicy,
    /// 0 until the first `ensure_started`; never re-scanned afterwards.
    port: u16,
    channel: Option<CommandChannel>,
}

impl HomeSupervisor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        paths: CorePaths,
        core_mode: CoreMode,
        settings: HomeConfig,
        reconnect: ReconnectPolicy,
    ) -> Self {
        Self {
            runner,
            paths,
            core_mode,
            settings,
            reconnect,
            port: 0,
            channel: None,
        }
    }

    /// Adopts a server that another process started on `port`.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn endpoint(&self) -> Option<ServiceEndpoint> {
        (self.port != 0).then(|| ServiceEndpoint::loopback(self.port))
    }

    pub fn channel(&self) -> Option<&CommandChannel> {
        self.channel.as_ref()
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.probe_timeout_ms)
    }

    async fn resolve_port(&mut self) -> Result<u16> {
        if self.port != 0 {
            return Ok(self.port);
        }
        let (start, end) = (self.settings.base_port, self.settings.max_port);
        let port = find_free_port(LOOPBACK_HOST, start, end, self.probe_timeout()).await;
        if port == 0 {
            return Err(BootstrapError::PortExhausted { start, end });
        }
        tracing::debug!(port, "allocated PIO Home port");
        self.port = port;
        Ok(port)
    }

    pub async fn is_running(&self) -> bool {
        if self.port == 0 {
            return false;
        }
        is_port_in_use(LOOPBACK_HOST, self.port, self.probe_timeout()).await
    }

    /// Starts the server unless it is already listening on the resolved port.
    ///
    /// A handler in `options` opens a command channel whenever none is alive,
    /// even when the server was already running.
    pub async fn ensure_started(&mut self, options: StartOptions) -> Result<ServiceEndpoint> {
        let port = self.resolve_port().await?;
        let endpoint = ServiceEndpoint::loopback(port);

        if !self.is_running().await {
            let cmd = CommandSpec::new(self.paths.core_program(self.core_mode.is_builtin()))
                .arg("home")
                .arg("--port")
                .arg(port.to_string())
                .arg("--no-open");
            let pid = self
                .runner
                .spawn_detached(&cmd)
                .await
                .map_err(|e| BootstrapError::Spawn(format_error_chain(&e)))?;
            tracing::info!(port, pid = ?pid, "starting PIO Home server");
            self.wait_until_listening(port).await?;
            tracing::info!(url = %endpoint.http_url(), "PIO Home server is up");
        }

        if let Some(handler) = options.on_ide_command {
            let active = self.channel.as_ref().is_some_and(|c| !c.is_finished());
            if !active {
                let url = endpoint.ws_url(&self.settings.channel_path);
                self.channel = Some(CommandChannel::spawn(url, handler, self.reconnect));
            }
        }

        Ok(endpoint)
    }

    async fn wait_until_listening(&self, port: u16) -> Result<()> {
        let started = tokio::time::Instant::now();
        let timeout = Duration::from_millis(self.settings.startup_timeout_ms);
        let interval = Duration::from_millis(self.settings.poll_interval_ms);
        loop {
            if self.is_running().await {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(BootstrapError::StartupTimeout {
                    port,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Asks the server to exit and stops the command channel.
    ///
    /// The request is sent from a background task and nothing checks that the
    /// server actually went away. Returns the task handle when a request was
    /// issued.
    pub fn shutdown(&mut self) -> Option<JoinHandle<()>> {
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        let endpoint = self.endpoint()?;
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no async runtime, skipping PIO Home shutdown request");
            return None;
        };

        let url = endpoint.shutdown_url();
        let span = info_span!("home_shutdown", url = %url);
        Some(rt.spawn(
            async move {
                match http_client()
                    .get(&url)
                    .timeout(SHUTDOWN_REQUEST_TIMEOUT)
                    .send()
                    .await
                {
                    Ok(resp) => tracing::debug!(status = %resp.status(), "shutdown request sent"),
                    Err(e) => tracing::debug!(error = %e, "shutdown request failed"),
                }
            }
            .instrument(span),
        ))
    }
}
