use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use piobridge_core::{
    ReconnectPolicy,
    rpc::{Inbound, RpcRequest, parse_inbound},
};
use serde_json::Value;
use tokio::{sync::watch, task::JoinHandle};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{Instrument, info_span};

use crate::{error::BootstrapError, support::format_error_chain};

/// Receives IDE commands pushed by the home service.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, method: &str, params: Value) -> anyhow::Result<()>;
}

impl<F> CommandHandler for F
where
    F: Fn(&str, Value) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, method: &str, params: Value) -> anyhow::Result<()> {
        self(method, params)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// Websocket to the home service that keeps one `ide.listen_commands`
/// request outstanding and hands every answer to a [`CommandHandler`].
///
/// The connection runs on its own task; dropping the channel stops it.
pub struct CommandChannel {
    url: String,
    state_tx: Arc<watch::Sender<ChannelState>>,
    state_rx: watch::Receiver<ChannelState>,
    task: JoinHandle<()>,
}

impl CommandChannel {
    pub fn spawn(
        url: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
        policy: ReconnectPolicy,
    ) -> Self {
        let url = url.into();
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let state_tx = Arc::new(state_tx);

        let task = {
            let url = url.clone();
            let state_tx = state_tx.clone();
            let span = info_span!("command_channel", url = %url);
            tokio::spawn(
                async move {
                    let mut attempt = 0u32;
                    loop {
                        state_tx.send_replace(ChannelState::Connecting);
                        let res = run_once(&url, handler.as_ref(), &state_tx, &mut attempt).await;
                        state_tx.send_replace(ChannelState::Closed);
                        match res {
                            Ok(()) => tracing::info!("command channel closed"),
                            Err(e) => {
                                tracing::warn!(error = %format_error_chain(&e), "command channel disconnected");
                            }
                        }

                        attempt = attempt.saturating_add(1);
                        if !policy.allows_retry(attempt) {
                            break;
                        }
                        let delay = policy.delay_for(attempt);
                        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
                        tokio::time::sleep(delay).await;
                    }
                }
                .instrument(span),
            )
        };

        Self {
            url,
            state_tx,
            state_rx,
            task,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    /// True once the connection task has stopped for good.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn close(&self) {
        self.task.abort();
        self.state_tx.send_replace(ChannelState::Closed);
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_once(
    url: &str,
    handler: &dyn CommandHandler,
    state_tx: &watch::Sender<ChannelState>,
    attempt: &mut u32,
) -> anyhow::Result<()> {
    let (ws, _) = tokio_tungstenite::connect_async(url).await?;
    let (mut sink, mut stream) = ws.split();

    state_tx.send_replace(ChannelState::Open);
    *attempt = 0;
    tracing::info!("command channel open");

    sink.send(listen_request()).await?;

    while let Some(msg) = stream.next().await {
        match msg? {
            WsMessage::Text(text) => dispatch(text.as_str(), handler),
            WsMessage::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => dispatch(text, handler),
                Err(_) => tracing::warn!(len = bytes.len(), "non UTF-8 binary message"),
            },
            WsMessage::Close(_) => break,
            _ => continue,
        }
        sink.send(listen_request()).await?;
    }

    Ok(())
}

fn listen_request() -> WsMessage {
    WsMessage::Text(RpcRequest::listen_commands().to_json().into())
}

fn dispatch(raw: &str, handler: &dyn CommandHandler) {
    match parse_inbound(raw) {
        Ok(Inbound::Command { method, params, .. }) => {
            tracing::debug!(%method, "IDE command");
            if let Err(e) = handler.handle(&method, params) {
                tracing::warn!(%method, error = %format_error_chain(&e), "IDE command handler");
            }
        }
        Ok(Inbound::Failure { error, .. }) => {
            let err = BootstrapError::RpcApplication {
                code: error.code,
                message: error.message,
            };
            tracing::warn!(error = %err, "command channel");
        }
        Ok(Inbound::Ignored) => tracing::debug!("ignoring server-initiated message"),
        Err(e) => {
            let err = BootstrapError::from(e);
            tracing::warn!(error = %err, "command channel");
        }
    }
}
