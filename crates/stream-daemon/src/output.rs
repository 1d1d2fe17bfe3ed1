//! Exclusive access to the audio output.
//!
//! At most one `OutputLease` exists at a time.  Asking while a lease is out
//! is denied without touching the current holder.  Dropping the lease gives
//! the output back.  Loss notifications (another app took the output, or
//! let us keep it quietly) are published on a broadcast channel, tagged with
//! the lease they were aimed at.

use parking_lot::Mutex;
use std::sync::Arc;
use stream_proto::protocol::LossKind;
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("audio output is held by lease {holder}")]
pub struct OutputDenied {
    pub holder: u64,
}

/// The output was taken away from `lease`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputLoss {
    pub lease: u64,
    pub kind: LossKind,
}

/// Collaborator the playback state machine asks for the output.
pub trait OutputResource: Send + Sync {
    fn acquire_exclusive(&self) -> Result<OutputLease, OutputDenied>;
}

#[derive(Default)]
struct ArbiterInner {
    holder: Option<u64>,
    next_id: u64,
}

#[derive(Clone)]
pub struct OutputArbiter {
    inner: Arc<Mutex<ArbiterInner>>,
    loss_tx: broadcast::Sender<OutputLoss>,
}

impl Default for OutputArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputArbiter {
    pub fn new() -> Self {
        let (loss_tx, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Mutex::new(ArbiterInner::default())),
            loss_tx,
        }
    }

    pub fn subscribe_losses(&self) -> broadcast::Receiver<OutputLoss> {
        self.loss_tx.subscribe()
    }

    pub fn is_held(&self) -> bool {
        self.inner.lock().holder.is_some()
    }

    /// Tell the current holder it lost the output.  Does nothing when the
    /// output is free.  The lease stays valid until its owner drops it.
    pub fn notify_lost(&self, kind: LossKind) -> Option<OutputLoss> {
        let lease = self.inner.lock().holder?;
        info!("output: lease {} lost ({:?})", lease, kind);
        let loss = OutputLoss { lease, kind };
        // no subscribers is fine
        let _ = self.loss_tx.send(loss);
        Some(loss)
    }
}

impl OutputResource for OutputArbiter {
    fn acquire_exclusive(&self) -> Result<OutputLease, OutputDenied> {
        let mut inner = self.inner.lock();
        if let Some(holder) = inner.holder {
            debug!("output: denied, lease {} still held", holder);
            return Err(OutputDenied { holder });
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.holder = Some(id);
        debug!("output: granted lease {}", id);
        Ok(OutputLease {
            id,
            inner: Arc::clone(&self.inner),
        })
    }
}

/// Proof of exclusive output access.  Released on drop.
pub struct OutputLease {
    id: u64,
    inner: Arc<Mutex<ArbiterInner>>,
}

impl OutputLease {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Debug for OutputLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputLease").field("id", &self.id).finish()
    }
}

impl Drop for OutputLease {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if inner.holder == Some(self.id) {
            inner.holder = None;
            debug!("output: lease {} released", self.id);
        }
    }
}
