//! Alerting subscriber.
//!
//! Listens to the event stream and calls an [`AlertHook`] for every durable,
//! terminal outcome that carries findings. Because a terminal record can be
//! written only once, each such record produces at most one alert.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::event::{Event, EventKind};
use crate::model::{ItemId, Status};

/// Delivery channel for findings (chat, pager, ...).
#[async_trait]
pub trait AlertHook: Send + Sync {
    async fn alert(&self, id: &ItemId, categories: &[String]) -> Result<()>;
}

/// Alert hook that only logs. Used when no channel is configured.
pub struct LogAlertHook;

#[async_trait]
impl AlertHook for LogAlertHook {
    async fn alert(&self, id: &ItemId, categories: &[String]) -> Result<()> {
        warn!(id = %id, categories = ?categories, "findings reported");
        Ok(())
    }
}

/// Categories to alert on, or `None` if the event doesn't warrant an alert.
fn alert_categories(event: &Event) -> Option<(&ItemId, Vec<String>)> {
    match &event.kind {
        EventKind::ItemCompleted {
            id,
            status: Status::Succeeded,
            findings,
            ..
        } if !findings.is_empty() => {
            Some((id, findings.iter().map(|f| f.category.clone()).collect()))
        }
        _ => None,
    }
}

async fn deliver(hook: &dyn AlertHook, event: &Event) {
    if let Some((id, categories)) = alert_categories(event) {
        if let Err(e) = hook.alert(id, &categories).await {
            error!(id = %id, error = %e, "alert delivery failed");
        }
    }
}

/// Run until the bus closes or `cancel` fires; on cancel, whatever is
/// already buffered is still delivered.
pub async fn run_alert_subscriber(
    mut rx: broadcast::Receiver<Event>,
    hook: Arc<dyn AlertHook>,
    cancel: CancellationToken,
) {
    info!("alert subscriber started");
    loop {
        tokio::select! {
            biased;
            received = rx.recv() => match received {
                Ok(event) => deliver(hook.as_ref(), &event).await,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "alert subscriber lagged; some events were not seen");
                }
                Err(RecvError::Closed) => break,
            },
            _ = cancel.cancelled() => {
                loop {
                    match rx.try_recv() {
                        Ok(event) => deliver(hook.as_ref(), &event).await,
                        Err(TryRecvError::Lagged(missed)) => {
                            warn!(missed, "alert subscriber lagged; some events were not seen");
                        }
                        Err(_) => break,
                    }
                }
                break;
            }
        }
    }
    info!("alert subscriber stopped");
}
