//! Connection watchdog.
//!
//! One per play session.  Polls the shared state until the session either
//! starts playing, fails, or runs out of time.  The deadline is fixed when
//! the play request arrives, so time spent opening the decoder counts against
//! it and the poll interval only sets the granularity.

use std::sync::Arc;
use std::time::Duration;

use stream_proto::protocol::{ErrorKind, PlaybackStatus};
use stream_proto::state::StateManager;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// The session reached `Playing`.
    Started,
    /// The session ended in an error before it started.
    Failed(ErrorKind),
    /// The session was stopped before it started.
    Abandoned,
    /// A newer session replaced this one.
    Superseded,
    Cancelled,
    TimedOut,
}

pub struct Watchdog {
    state: Arc<StateManager>,
    session: u64,
    deadline: Instant,
}

impl Watchdog {
    pub fn new(state: Arc<StateManager>, session: u64, deadline: Instant) -> Self {
        Self {
            state,
            session,
            deadline,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> WatchdogOutcome {
        let deadline = self.deadline;
        loop {
            let state = self.state.get_state().await;
            if state.session != self.session {
                return WatchdogOutcome::Superseded;
            }
            match state.status {
                PlaybackStatus::Playing => return WatchdogOutcome::Started,
                PlaybackStatus::Error(kind) => return WatchdogOutcome::Failed(kind),
                PlaybackStatus::Stopped | PlaybackStatus::Idle => {
                    return WatchdogOutcome::Abandoned
                }
                PlaybackStatus::Connecting => {}
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("watchdog: session {} still connecting at deadline", self.session);
                return WatchdogOutcome::TimedOut;
            }
            let nap = POLL_INTERVAL.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return WatchdogOutcome::Cancelled,
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}
