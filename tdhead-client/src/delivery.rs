//! Subscriber transports.
//!
//! A [`Delivery`] is the only thing that differs between subscribers: the
//! draining loop in [`spawn_delivery`] is shared. A delivery that fails ends
//! its loop, and dropping the subscription takes it off the bus.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bus::Subscription;
use crate::errors::DeliveryError;
use crate::names::NameDirectory;
use crate::update::IncomingMessage;
use crate::web::OutboundEvent;

/// Hands one message to a consumer.
#[async_trait]
pub trait Delivery: Send + 'static {
    async fn deliver(&mut self, msg: &IncomingMessage) -> Result<(), DeliveryError>;

    /// Shown in logs.
    fn describe(&self) -> String { "delivery".into() }
}

/// Drain `subscription` into `delivery` on its own task.
///
/// The task ends when the subscription closes or a delivery fails; either
/// way the subscription is dropped and so unsubscribed.
pub fn spawn_delivery<D: Delivery>(mut subscription: Subscription, mut delivery: D) -> JoinHandle<()> {
    tokio::spawn(async move {
        let id = subscription.id();
        while let Some(msg) = subscription.recv().await {
            if let Err(e) = delivery.deliver(&msg).await {
                tracing::warn!("[tdhead] {} ({id}) failed: {e}; unsubscribing", delivery.describe());
                return;
            }
        }
        tracing::debug!("[tdhead] {} ({id}) finished", delivery.describe());
    })
}

/// Two-line human-readable form:
///
/// ```text
/// [14:02] [@ada | Engines]
/// > hello
/// ```
pub fn render(msg: &IncomingMessage, names: &NameDirectory) -> String {
    let time = chrono::DateTime::from_timestamp(msg.timestamp, 0)
        .map(|t| t.with_timezone(&chrono::Local).format("%H:%M").to_string())
        .unwrap_or_else(|| "--:--".into());
    format!(
        "[{time}] [{} | {}]\n> {}\n",
        names.sender_name(&msg.sender),
        names.chat_title(msg.chat_id),
        msg.text,
    )
}

// ─── ConsoleDelivery ──────────────────────────────────────────────────────────

/// Writes [`render`]ed messages to a terminal-like writer, optionally
/// appending them to a log file too.
pub struct ConsoleDelivery<W> {
    out:   W,
    log:   Option<File>,
    names: Arc<NameDirectory>,
}

impl ConsoleDelivery<tokio::io::Stdout> {
    pub fn stdout(names: Arc<NameDirectory>) -> Self {
        Self::new(tokio::io::stdout(), names)
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> ConsoleDelivery<W> {
    pub fn new(out: W, names: Arc<NameDirectory>) -> Self {
        Self { out, log: None, names }
    }

    /// Also append every message to `path`, creating it if needed.
    pub async fn with_log_file(mut self, path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        self.log = Some(file);
        Ok(self)
    }

    pub fn into_inner(self) -> W { self.out }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> Delivery for ConsoleDelivery<W> {
    async fn deliver(&mut self, msg: &IncomingMessage) -> Result<(), DeliveryError> {
        let text = render(msg, &self.names);
        self.out.write_all(text.as_bytes()).await?;
        self.out.write_all(b"\n").await?;
        self.out.flush().await?;
        if let Some(log) = self.log.as_mut() {
            log.write_all(text.as_bytes()).await?;
            log.flush().await?;
        }
        Ok(())
    }

    fn describe(&self) -> String { "console".into() }
}

// ─── ChannelDelivery ──────────────────────────────────────────────────────────

/// Encodes messages as web `message` events into a channel read by a socket
/// writer. A closed channel counts as a disconnected subscriber.
pub struct ChannelDelivery {
    tx:    mpsc::Sender<String>,
    names: Arc<NameDirectory>,
}

impl ChannelDelivery {
    pub fn new(tx: mpsc::Sender<String>, names: Arc<NameDirectory>) -> Self {
        Self { tx, names }
    }
}

#[async_trait]
impl Delivery for ChannelDelivery {
    async fn deliver(&mut self, msg: &IncomingMessage) -> Result<(), DeliveryError> {
        let json = OutboundEvent::message(msg, &self.names)
            .to_json()
            .map_err(|e| DeliveryError::Encode(e.to_string()))?;
        self.tx.send(json).await.map_err(|_| DeliveryError::Disconnected)
    }

    fn describe(&self) -> String { "socket".into() }
}
