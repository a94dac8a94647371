//! Control channel between the main context and the interception worker.
//!
//! Every call that expects a reply is bounded by a timeout: an unresponsive
//! or missing worker yields a default result instead of blocking the caller.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::interceptor::WorkerMessage;

/// Default bound on how long to wait for a reply.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// Requests understood by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Reply with the entry count of every partition
  GetCacheStats,
  /// Delete every partition
  ClearCache,
  /// Activate a waiting worker now. No reply.
  SkipWaiting,
}

/// Replies sent back over the response port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlReply {
  Cleared { success: bool },
  Stats(BTreeMap<String, usize>),
}

/// A control message plus the port its reply goes to.
#[derive(Debug)]
pub struct ControlEnvelope {
  pub message: ControlMessage,
  pub reply: Option<oneshot::Sender<ControlReply>>,
}

/// Main-context client for the control channel.
#[derive(Debug, Clone)]
pub struct ControlChannel {
  tx: mpsc::Sender<WorkerMessage>,
  timeout: Duration,
}

impl ControlChannel {
  pub fn new(tx: mpsc::Sender<WorkerMessage>, timeout: Duration) -> Self {
    Self { tx, timeout }
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  /// Send a message and wait for its reply. `None` when the worker is gone,
  /// drops the reply port, or doesn't answer within the timeout.
  async fn request(&self, message: ControlMessage) -> Option<ControlReply> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let envelope = ControlEnvelope {
      message,
      reply: Some(reply_tx),
    };

    // Sending is inside the bound too: a full queue must not block the caller
    let exchange = async {
      self.tx.send(WorkerMessage::Control(envelope)).await.ok()?;
      reply_rx.await.ok()
    };

    match tokio::time::timeout(self.timeout, exchange).await {
      Ok(Some(reply)) => Some(reply),
      Ok(None) => {
        debug!(?message, "Worker unavailable");
        None
      }
      Err(_) => {
        warn!(?message, timeout_ms = self.timeout.as_millis() as u64, "Control request timed out");
        None
      }
    }
  }

  /// Entry count per partition; empty when the worker doesn't answer in time.
  pub async fn get_cache_stats(&self) -> BTreeMap<String, usize> {
    match self.request(ControlMessage::GetCacheStats).await {
      Some(ControlReply::Stats(stats)) => stats,
      Some(other) => {
        warn!(reply = ?other, "Unexpected reply to GET_CACHE_STATS");
        BTreeMap::new()
      }
      None => BTreeMap::new(),
    }
  }

  /// Ask the worker to delete every partition. A missing reply counts as success.
  pub async fn clear_cache(&self) -> bool {
    match self.request(ControlMessage::ClearCache).await {
      Some(ControlReply::Cleared { success }) => success,
      Some(other) => {
        warn!(reply = ?other, "Unexpected reply to CLEAR_CACHE");
        true
      }
      None => true,
    }
  }

  /// Fire-and-forget request to activate a waiting worker.
  pub fn skip_waiting(&self) {
    let envelope = ControlEnvelope {
      message: ControlMessage::SkipWaiting,
      reply: None,
    };
    if let Err(e) = self.tx.try_send(WorkerMessage::Control(envelope)) {
      debug!(error = %e, "SKIP_WAITING not delivered");
    }
  }
}
