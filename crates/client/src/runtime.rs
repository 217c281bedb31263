// Process wiring for `eventsyncd`: REST client, push channels, an optional
// chat session, and the notice mailbox, all stopped by one shutdown signal.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{CredentialProvider, EnvCredential, HttpApi};
use crate::channel::ws::WsTransportFactory;
use crate::channel::ChannelManager;
use crate::chat::{ChatSession, ChatUpdate};
use crate::config::SyncConfig;
use crate::mailbox::{MailboxHost, NoticeBus, SharedSlot, SqliteStore};

/// Environment variable holding the bearer credential.
pub const TOKEN_ENV: &str = "EVENTSYNC_TOKEN";

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Push namespace to connect. No chat session without one.
    pub namespace: Option<String>,
    /// Room to join once connected.
    pub room: Option<String>,
    /// Our user id, used to tell our own messages and typing echoes apart.
    pub user_id: String,
}

/// Run until Ctrl-C.
pub async fn run(config: SyncConfig, options: RunOptions) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received, shutting down");
        let _ = ctrl_c_tx.send(());
    });
    run_until(config, options, Arc::new(EnvCredential::new(TOKEN_ENV)), shutdown_rx).await
}

/// Run until `shutdown` fires.
pub async fn run_until(
    config: SyncConfig,
    options: RunOptions,
    credentials: Arc<dyn CredentialProvider>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let api = Arc::new(HttpApi::new(&config.api, Arc::clone(&credentials))?);

    let channels = ChannelManager::new(
        WsTransportFactory::new(&config.reconnect),
        config.namespaces.iter().cloned(),
    );

    let session_task = match &options.namespace {
        Some(namespace) => {
            let credential = credentials.credential();
            let channel = channels
                .connect(namespace, credential.as_deref())
                .with_context(|| format!("failed to connect namespace `{namespace}`"))?;
            let mut session =
                ChatSession::new(channel, Arc::clone(&api), config.chat.clone(), options.user_id.clone());
            if let Some(room) = &options.room {
                let initial = session
                    .join(room)
                    .await
                    .with_context(|| format!("failed to join room `{room}`"))?;
                info!(room_id = %room, messages = initial.len(), "room joined");
            }
            Some(spawn_session(session, shutdown.resubscribe()))
        }
        None => None,
    };

    let store_path = config
        .mailbox
        .store_path()
        .ok_or_else(|| anyhow!("no mailbox store path configured and no home directory found"))?;
    let slot = SharedSlot::new(Arc::new(SqliteStore::open(&store_path)?));
    let bus = NoticeBus::new();
    let host = MailboxHost::new(slot, bus, Arc::clone(&api), &config.mailbox);
    let mailbox_task = tokio::spawn(host.run(shutdown.resubscribe()));
    info!(store_path = %store_path.display(), "mailbox store opened");

    let _ = shutdown.recv().await;

    if let Some(task) = session_task {
        await_task(task, "chat session").await;
    }
    await_task(mailbox_task, "mailbox").await;
    channels.disconnect_all();
    info!("eventsync stopped");
    Ok(())
}

fn spawn_session(
    mut session: ChatSession<HttpApi>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                update = session.next_update() => match update {
                    Some(ChatUpdate::View) => {
                        debug!(messages = session.view().len(), "chat view updated");
                    }
                    Some(ChatUpdate::TheirTyping(typing)) => debug!(typing, "remote typing"),
                    Some(ChatUpdate::SeenSubmitted(ids)) => debug!(count = ids.len(), "seen submitted"),
                    None => {
                        warn!("chat session lost its channel");
                        break;
                    }
                },
            }
        }
        session.leave();
    })
}

async fn await_task(task: JoinHandle<()>, name: &str) {
    if let Err(error) = task.await {
        warn!(task = name, ?error, "task ended abnormally");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::StaticCredential;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> SyncConfig {
        let mut config = SyncConfig::default();
        config.api.base_url = Some("http://127.0.0.1:9/api".into());
        config.mailbox.store_path = Some(dir.path().join("mailbox.db"));
        config
    }

    #[tokio::test]
    async fn stops_on_shutdown_without_namespace() {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(run_until(
            test_config(&dir),
            RunOptions::default(),
            Arc::new(StaticCredential(None)),
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
        assert!(dir.path().join("mailbox.db").exists());
    }

    #[tokio::test]
    async fn unknown_namespace_is_an_error() {
        let dir = TempDir::new().unwrap();
        let (_tx, rx) = broadcast::channel(1);
        let options = RunOptions { namespace: Some("nowhere".into()), ..Default::default() };
        let error = run_until(test_config(&dir), options, Arc::new(StaticCredential(None)), rx)
            .await
            .unwrap_err();
        assert!(error.to_string().contains("nowhere"));
    }
}
