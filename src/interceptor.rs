//! The interception worker.
//!
//! Runs on its own thread with a single-threaded runtime and shares no memory
//! with the main context: requests and control messages arrive over one queue
//! and answers go back on per-message reply ports.
//!
//! Lifecycle: *install* pre-populates the seed assets, *activate* deletes
//! obsolete partitions and takes control. Until activation, requests bypass
//! the partitions. Activation is recorded in storage, so a worker restarted
//! over the same partitions resumes control even if its reinstall fails.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheLayer, PartitionStorage, Served};
use crate::control::{ControlChannel, ControlEnvelope, ControlMessage, ControlReply};
use crate::fetch::Request;

/// Capacity of the worker's inbound queue.
const WORKER_QUEUE_CAPACITY: usize = 256;

/// How long in-flight requests and revalidations may run once shutdown starts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the worker can receive.
#[derive(Debug)]
pub enum WorkerMessage {
  Fetch {
    request: Request,
    reply: oneshot::Sender<Served>,
  },
  Control(ControlEnvelope),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Install has not completed (or failed)
  Uninstalled,
  /// Installed and waiting for SKIP_WAITING
  Installed,
  /// Controlling requests
  Activated,
}

/// Worker-side state: the cache layer plus lifecycle.
pub struct Interceptor<S: PartitionStorage> {
  layer: CacheLayer<S>,
  seeds: Vec<Url>,
  skip_waiting_on_install: bool,
  installing: bool,
  state: WorkerState,
}

impl<S: PartitionStorage + 'static> Interceptor<S> {
  pub fn new(layer: CacheLayer<S>, seeds: Vec<Url>) -> Self {
    Self {
      layer,
      seeds,
      skip_waiting_on_install: true,
      installing: false,
      state: WorkerState::Uninstalled,
    }
  }

  /// Stay in the installed state until a SKIP_WAITING message arrives.
  pub fn wait_after_install(mut self) -> Self {
    self.skip_waiting_on_install = false;
    self
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  pub fn activate(&mut self) -> Result<()> {
    let deleted = self.layer.activate()?;
    self.state = WorkerState::Activated;
    info!(
      version = self.layer.settings().namer.version(),
      obsolete = deleted.len(),
      "Interceptor activated"
    );
    Ok(())
  }

  fn try_activate(&mut self) {
    if let Err(e) = self.activate() {
      error!(error = %e, "Activation failed");
    }
  }

  /// Worker main loop. Returns when the queue closes or `shutdown` fires,
  /// after in-flight tasks have drained.
  ///
  /// Install runs inside the loop, so control messages are answered while
  /// seed assets are still loading.
  pub async fn run(mut self, mut rx: mpsc::Receiver<WorkerMessage>, shutdown: CancellationToken) {
    if self.layer.is_activated() {
      self.state = WorkerState::Activated;
      info!(version = self.layer.settings().namer.version(), "Resuming previous activation");
    }

    let layer = self.layer.clone();
    let seeds = std::mem::take(&mut self.seeds);
    let install = async move { layer.install(&seeds).await };
    tokio::pin!(install);
    self.installing = true;

    loop {
      tokio::select! {
        biased;
        _ = shutdown.cancelled() => break,
        outcome = &mut install, if self.installing => self.finish_install(outcome),
        message = rx.recv() => match message {
          Some(WorkerMessage::Fetch { request, reply }) => self.dispatch_fetch(request, reply),
          Some(WorkerMessage::Control(envelope)) => self.handle_control(envelope),
          None => break,
        },
      }
    }

    self.drain().await;
  }

  fn finish_install(&mut self, outcome: Result<usize>) {
    self.installing = false;
    match outcome {
      Ok(_) if self.state == WorkerState::Activated => debug!("Seed assets refreshed"),
      Ok(_) => {
        self.state = WorkerState::Installed;
        if self.skip_waiting_on_install {
          self.try_activate();
        } else {
          info!("Interceptor installed, waiting for SKIP_WAITING");
        }
      }
      Err(e) if self.state == WorkerState::Activated => {
        warn!(error = %e, "Reinstall failed, keeping previous activation")
      }
      Err(e) => warn!(error = %e, "Install failed, requests will bypass the cache"),
    }
  }

  async fn drain(&self) {
    let tasks = self.layer.tasks();
    tasks.close();
    if tokio::time::timeout(DRAIN_TIMEOUT, tasks.wait()).await.is_err() {
      warn!(pending = tasks.len(), "Abandoning background tasks at shutdown");
    }
    debug!("Interceptor worker exiting");
  }

  /// Each request runs on its own task so a slow network never stalls the queue.
  fn dispatch_fetch(&self, request: Request, reply: oneshot::Sender<Served>) {
    let layer = self.layer.clone();
    let controlled = self.state == WorkerState::Activated;

    self.layer.tasks().spawn(async move {
      let served = if controlled {
        layer.handle(&request).await
      } else {
        let class = layer.classify(&request);
        layer.passthrough(&request, class).await
      };
      // The caller may have given up waiting
      let _ = reply.send(served);
    });
  }

  fn handle_control(&mut self, envelope: ControlEnvelope) {
    let reply = match envelope.message {
      ControlMessage::GetCacheStats => {
        let stats = self.layer.partition_stats().unwrap_or_else(|e| {
          warn!(error = %e, "Failed to collect partition stats");
          BTreeMap::new()
        });
        Some(ControlReply::Stats(stats))
      }
      ControlMessage::ClearCache => {
        let success = match self.layer.clear_all() {
          Ok(_) => true,
          Err(e) => {
            warn!(error = %e, "Failed to clear partitions");
            false
          }
        };
        Some(ControlReply::Cleared { success })
      }
      ControlMessage::SkipWaiting => {
        match self.state {
          WorkerState::Installed => self.try_activate(),
          WorkerState::Uninstalled if self.installing => {
            debug!("SKIP_WAITING applies once install completes");
            self.skip_waiting_on_install = true;
          }
          state => debug!(?state, "SKIP_WAITING ignored"),
        }
        None
      }
    };

    if let (Some(reply), Some(port)) = (reply, envelope.reply) {
      let _ = port.send(reply);
    }
  }
}

/// Main-context handle to a running worker.
pub struct InterceptorHandle {
  tx: mpsc::Sender<WorkerMessage>,
  shutdown: CancellationToken,
  thread: Option<std::thread::JoinHandle<()>>,
}

impl InterceptorHandle {
  /// Start the worker on a dedicated thread with its own single-threaded runtime.
  pub fn spawn<S: PartitionStorage + 'static>(interceptor: Interceptor<S>) -> Result<Self> {
    let (tx, rx) = mpsc::channel(WORKER_QUEUE_CAPACITY);
    let shutdown = CancellationToken::new();
    let worker_shutdown = shutdown.clone();

    let thread = std::thread::Builder::new()
      .name("tiercache-interceptor".to_string())
      .spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
          .enable_all()
          .build()
        {
          Ok(runtime) => runtime,
          Err(e) => {
            error!(error = %e, "Failed to build interceptor runtime");
            return;
          }
        };
        runtime.block_on(interceptor.run(rx, worker_shutdown));
      })
      .map_err(|e| eyre!("Failed to spawn interceptor thread: {}", e))?;

    Ok(Self {
      tx,
      shutdown,
      thread: Some(thread),
    })
  }

  /// Send a request through the worker and wait for its response.
  pub async fn fetch(&self, request: Request) -> Result<Served> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self
      .tx
      .send(WorkerMessage::Fetch {
        request,
        reply: reply_tx,
      })
      .await
      .map_err(|_| eyre!("Interceptor is not running"))?;

    reply_rx
      .await
      .map_err(|_| eyre!("Interceptor dropped the request"))
  }

  /// A control-channel client bound to this worker.
  pub fn control(&self, timeout: Duration) -> ControlChannel {
    ControlChannel::new(self.tx.clone(), timeout)
  }

  /// Stop the worker and wait for its thread to finish.
  pub async fn shutdown(mut self) {
    self.shutdown.cancel();
    if let Some(thread) = self.thread.take() {
      match tokio::task::spawn_blocking(move || thread.join()).await {
        Ok(Ok(())) => {}
        _ => warn!("Interceptor thread did not exit cleanly"),
      }
    }
  }
}

impl Drop for InterceptorHandle {
  fn drop(&mut self) {
    self.shutdown.cancel();
  }
}
