//! The one owned `PlaybackState` instance.
//!
//! Only the playback state machine calls the mutating methods; the watchdog
//! and the client surfaces take snapshots.  The lock is held for a single
//! read or transition and never across a decoder call.

use crate::protocol::{ErrorKind, Indicator, PlaybackState, PlaybackStatus};
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct StateManager {
    state: Arc<RwLock<PlaybackState>>,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(PlaybackState::default())),
        }
    }

    pub async fn get_state(&self) -> PlaybackState {
        self.state.read().await.clone()
    }

    pub async fn status(&self) -> PlaybackStatus {
        self.state.read().await.status
    }

    /// Start a new play request: status `Connecting`, returns the new session id.
    pub async fn begin_session(&self, url: &str) -> u64 {
        let mut state = self.state.write().await;
        state.session += 1;
        state.url = Some(url.to_string());
        state.status = PlaybackStatus::Connecting;
        state.is_playing = false;
        state.rev += 1;
        state.session
    }

    pub async fn set_decoder_active(&self, active: bool) {
        let mut state = self.state.write().await;
        if state.decoder_active != active {
            state.decoder_active = active;
            state.rev += 1;
        }
    }

    /// `Connecting -> Playing`.  Returns whether an error flag was cleared.
    pub async fn set_playing(&self) -> bool {
        let mut state = self.state.write().await;
        let had_error = state.stream_error;
        state.status = PlaybackStatus::Playing;
        state.is_playing = true;
        state.stream_error = false;
        state.indicator = match &state.url {
            Some(url) => Indicator::Playing { url: url.clone() },
            None => Indicator::Hidden,
        };
        state.rev += 1;
        had_error
    }

    pub async fn set_error(&self, kind: ErrorKind) {
        let mut state = self.state.write().await;
        state.status = PlaybackStatus::Error(kind);
        state.is_playing = false;
        state.stream_error = true;
        state.rev += 1;
    }

    /// Playback halted.  `Error` and `Idle` are left as they are so the
    /// reason survives the cleanup.
    pub async fn set_stopped(&self) {
        let mut state = self.state.write().await;
        state.is_playing = false;
        if matches!(
            state.status,
            PlaybackStatus::Connecting | PlaybackStatus::Playing
        ) {
            state.status = PlaybackStatus::Stopped;
        }
        state.rev += 1;
    }

    pub async fn set_indicator(&self, indicator: Indicator) {
        let mut state = self.state.write().await;
        if state.indicator != indicator {
            state.indicator = indicator;
            state.rev += 1;
        }
    }

    /// `Stopped | Error -> Idle`.  Returns false when there was nothing to
    /// acknowledge.
    pub async fn acknowledge(&self) -> bool {
        let mut state = self.state.write().await;
        match state.status {
            PlaybackStatus::Stopped | PlaybackStatus::Error(_) => {
                state.status = PlaybackStatus::Idle;
                state.rev += 1;
                true
            }
            _ => false,
        }
    }
}
