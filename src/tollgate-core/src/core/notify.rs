use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeprecationNotice {
    pub version: String,
    pub reason: String,
    pub sunset_date: DateTime<Utc>,
    pub recipients: Vec<String>,
    pub issued_at: DateTime<Utc>,
}

/// Delivers deprecation notices to API clients.
#[async_trait]
pub trait DeprecationNotifier: Send + Sync {
    async fn notify(&self, notice: &DeprecationNotice) -> anyhow::Result<()>;
}

/// Writes notices to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl DeprecationNotifier for LogNotifier {
    async fn notify(&self, notice: &DeprecationNotice) -> anyhow::Result<()> {
        info!(
            version = %notice.version,
            sunset = %notice.sunset_date,
            recipients = notice.recipients.len(),
            reason = %notice.reason,
            "api version deprecated"
        );
        Ok(())
    }
}

/// Forwards notices to an in-process consumer.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<DeprecationNotice>,
}

impl ChannelNotifier {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<DeprecationNotice>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl DeprecationNotifier for ChannelNotifier {
    async fn notify(&self, notice: &DeprecationNotice) -> anyhow::Result<()> {
        self.tx
            .send(notice.clone())
            .await
            .map_err(|_| anyhow::anyhow!("deprecation notice receiver dropped"))
    }
}
