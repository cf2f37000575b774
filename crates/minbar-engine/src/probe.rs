use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use minbar_core::errors::{MinbarError, Result};

/// Create a linked probe pair. The worker keeps the responder in its
/// select loop; `/ready` pings through the handle.
pub fn probe_pair(worker: &'static str) -> (WorkerProbe, ProbeResponder) {
    let (tx, rx) = mpsc::channel(4);
    (WorkerProbe { worker, tx }, ProbeResponder { rx })
}

/// Readiness handle for one worker.
#[derive(Clone)]
pub struct WorkerProbe {
    worker: &'static str,
    tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl WorkerProbe {
    pub fn worker(&self) -> &'static str {
        self.worker
    }

    /// Ask the worker to prove it is still looping. Fails fast when the
    /// worker has stopped, times out when it is wedged.
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(reply_tx).await.map_err(|_| {
            MinbarError::unavailable(format!("{} worker stopped", self.worker))
        })?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(MinbarError::unavailable(format!(
                "{} worker dropped the probe",
                self.worker
            ))),
            Err(_) => Err(MinbarError::Timeout(timeout)),
        }
    }
}

/// Worker-side end of the probe channel.
pub struct ProbeResponder {
    rx: mpsc::Receiver<oneshot::Sender<()>>,
}

impl ProbeResponder {
    pub async fn recv(&mut self) -> Option<oneshot::Sender<()>> {
        self.rx.recv().await
    }

    pub fn answer(reply: oneshot::Sender<()>) {
        let _ = reply.send(());
    }
}
