//! The playback state machine.
//!
//! Owns the one active decoder and the output lease.  Every error path goes
//! through `stop()`, so neither is ever left behind.  A play request only
//! touches the recents table once the decoder reports the stream open.

use std::sync::Arc;

use stream_proto::config::PlaybackConfig;
use stream_proto::protocol::{ErrorKind, Indicator, PlaybackEvent, PlaybackStatus};
use stream_proto::state::StateManager;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::decoder::{Decoder, DecoderEvent, DecoderEventKind, DecoderFactory};
use crate::output::{OutputLease, OutputLoss, OutputResource};
use crate::store::SharedDatabase;
use crate::BroadcastMessage;

const ACCEPTED_SCHEMES: [&str; 2] = ["http://", "rtsp://"];

/// A play request refused before anything was touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PlayError {
    #[error("url is empty")]
    EmptyUrl,
    #[error("url must start with http:// or rtsp://")]
    InvalidScheme,
}

impl PlayError {
    pub fn kind(self) -> ErrorKind {
        match self {
            PlayError::EmptyUrl => ErrorKind::EmptyUrl,
            PlayError::InvalidScheme => ErrorKind::InvalidScheme,
        }
    }
}

/// Trim and check a URL the way the play button does.
pub fn validate_url(raw: &str) -> Result<&str, PlayError> {
    let url = raw.trim();
    if url.is_empty() {
        return Err(PlayError::EmptyUrl);
    }
    if !ACCEPTED_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
        return Err(PlayError::InvalidScheme);
    }
    Ok(url)
}

#[derive(Debug, Clone, Copy)]
pub struct PlayerSettings {
    /// Keep the indicator (offering replay) after a stop instead of hiding it.
    pub persistent_notification: bool,
    pub stop_on_timeout: bool,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self::from(&PlaybackConfig::default())
    }
}

impl From<&PlaybackConfig> for PlayerSettings {
    fn from(config: &PlaybackConfig) -> Self {
        Self {
            persistent_notification: config.persistent_notification,
            stop_on_timeout: config.stop_on_timeout,
        }
    }
}

pub struct Player {
    state: Arc<StateManager>,
    store: SharedDatabase,
    output: Arc<dyn OutputResource>,
    decoders: Arc<dyn DecoderFactory>,
    decoder_tx: mpsc::Sender<DecoderEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    settings: PlayerSettings,
    decoder: Option<Box<dyn Decoder>>,
    lease: Option<OutputLease>,
}

impl Player {
    pub fn new(
        state: Arc<StateManager>,
        store: SharedDatabase,
        output: Arc<dyn OutputResource>,
        decoders: Arc<dyn DecoderFactory>,
        decoder_tx: mpsc::Sender<DecoderEvent>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        settings: PlayerSettings,
    ) -> Self {
        Self {
            state,
            store,
            output,
            decoders,
            decoder_tx,
            broadcast_tx,
            settings,
            decoder: None,
            lease: None,
        }
    }

    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state)
    }

    fn emit(&self, event: PlaybackEvent) {
        // no subscribers is fine
        let _ = self.broadcast_tx.send(BroadcastMessage::Playback(event));
    }

    fn notify_state(&self) {
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    async fn is_current(&self, session: u64) -> bool {
        self.state.get_state().await.session == session
    }

    /// Validate, replace whatever is playing, and start opening `raw_url`.
    ///
    /// Returns the new session id once the request is accepted; resource and
    /// decoder failures after that point are reported as `Error` state and
    /// events, not as an `Err` here.
    pub async fn request_play(&mut self, raw_url: &str) -> Result<u64, PlayError> {
        let url = validate_url(raw_url)?.to_string();

        if self.decoder.is_some() || self.lease.is_some() {
            self.stop().await;
        }

        let session = self.state.begin_session(&url).await;
        info!("player: session {} connecting to {}", session, url);
        self.notify_state();

        match self.output.acquire_exclusive() {
            Ok(lease) => self.lease = Some(lease),
            Err(denied) => {
                warn!("player: output denied: {}", denied);
                self.fail(ErrorKind::ResourceDenied).await;
                return Ok(session);
            }
        }

        let mut decoder = match self.decoders.create(session, self.decoder_tx.clone()).await {
            Ok(decoder) => decoder,
            Err(e) => {
                error!("player: no decoder for session {}: {}", session, e);
                self.fail(ErrorKind::DecoderOpenFailure).await;
                return Ok(session);
            }
        };
        self.state.set_decoder_active(true).await;

        let opened = decoder.open(&url).await;
        self.decoder = Some(decoder);
        if let Err(e) = opened {
            error!("player: {}", e);
            self.fail(ErrorKind::DecoderOpenFailure).await;
        }
        Ok(session)
    }

    pub async fn on_decoder_event(&mut self, event: DecoderEvent) {
        match event.kind {
            DecoderEventKind::Opened => self.on_opened(event.session).await,
            DecoderEventKind::Error(reason) => self.on_decoder_error(event.session, &reason).await,
            DecoderEventKind::Completed => self.on_completed(event.session).await,
        }
    }

    pub async fn on_opened(&mut self, session: u64) {
        if !self.is_current(session).await || self.decoder.is_none() {
            debug!("player: stale open for session {}", session);
            return;
        }
        // a timeout that did not stop the decoder still lets a late open win
        match self.state.status().await {
            PlaybackStatus::Connecting | PlaybackStatus::Error(ErrorKind::ConnectionTimeout) => {}
            _ => {
                debug!("player: open for session {} arrived after it ended", session);
                return;
            }
        }

        let started = match self.decoder.as_mut() {
            Some(decoder) => decoder.start().await,
            None => return,
        };
        if let Err(e) = started {
            error!("player: start failed: {}", e);
            self.fail(ErrorKind::DecoderRuntimeError).await;
            return;
        }

        let cleared_error = self.state.set_playing().await;
        if cleared_error {
            self.emit(PlaybackEvent::ClearedError);
        }

        let url = self.state.get_state().await.url.unwrap_or_default();
        let recorded = self.store.lock().recents().insert(&url, None);
        if let Err(e) = recorded {
            warn!("player: could not record {} in recents: {}", url, e);
        }

        info!("player: session {} playing {}", session, url);
        self.emit(PlaybackEvent::Started { url });
        self.notify_state();
    }

    pub async fn on_decoder_error(&mut self, session: u64, reason: &str) {
        if !self.is_current(session).await || self.decoder.is_none() {
            debug!("player: stale decoder error for session {}: {}", session, reason);
            return;
        }
        let kind = match self.state.status().await {
            PlaybackStatus::Connecting => ErrorKind::DecoderOpenFailure,
            _ => ErrorKind::DecoderRuntimeError,
        };
        error!("player: decoder error in session {}: {}", session, reason);
        self.fail(kind).await;
    }

    pub async fn on_completed(&mut self, session: u64) {
        if !self.is_current(session).await || self.decoder.is_none() {
            return;
        }
        info!("player: session {} reached end of stream", session);
        self.stop().await;
    }

    /// Every loss stops playback, transient-can-duck included.  Resuming at
    /// a lower volume was never implemented.  Losses aimed at a lease we no
    /// longer hold are ignored; returns whether playback was stopped.
    pub async fn on_output_lost(&mut self, loss: OutputLoss) -> bool {
        if self.lease.as_ref().map(OutputLease::id) != Some(loss.lease) {
            debug!("player: ignoring loss for old lease {}", loss.lease);
            return false;
        }
        info!("player: output lost ({:?}), stopping", loss.kind);
        self.stop().await;
        true
    }

    /// Output came back: replay the current URL.  Returns the new session.
    pub async fn on_output_regained(&mut self) -> Option<u64> {
        let url = self.state.get_state().await.url?;
        info!("player: output regained, restarting {}", url);
        self.stop().await;
        self.request_play(&url).await.ok()
    }

    pub async fn on_becoming_noisy(&mut self) {
        info!("player: output becoming noisy, stopping");
        self.stop().await;
    }

    pub async fn on_watchdog_timeout(&mut self, session: u64) {
        let state = self.state.get_state().await;
        if state.session != session || state.status != PlaybackStatus::Connecting {
            debug!("player: ignoring timeout for session {}", session);
            return;
        }
        warn!("player: session {} never started, timing out", session);
        self.state.set_error(ErrorKind::ConnectionTimeout).await;
        if self.settings.stop_on_timeout {
            self.stop().await;
        }
        self.emit(PlaybackEvent::Error {
            kind: ErrorKind::ConnectionTimeout,
        });
        self.notify_state();
    }

    /// Halt and release everything.  Safe to call in any state.
    pub async fn stop(&mut self) {
        let status = self.state.status().await;
        let was_playing = status == PlaybackStatus::Playing
            || self.decoder.as_ref().is_some_and(|d| d.is_playing());

        if let Some(mut decoder) = self.decoder.take() {
            if was_playing {
                if let Err(e) = decoder.stop().await {
                    warn!("player: error while stopping decoder: {}", e);
                }
            }
            decoder.release().await;
            debug!("player: decoder released");
        }
        self.lease = None;
        self.state.set_decoder_active(false).await;
        self.state.set_stopped().await;

        if was_playing {
            self.emit(PlaybackEvent::Stopped);
            let url = self.state.get_state().await.url.unwrap_or_default();
            let indicator = if self.settings.persistent_notification {
                Indicator::Stopped { url }
            } else {
                Indicator::Hidden
            };
            self.state.set_indicator(indicator).await;
        }
        self.notify_state();
    }

    /// `Stopped | Error -> Idle`.  Anything still held is released first.
    pub async fn acknowledge(&mut self) {
        let settled = matches!(
            self.state.status().await,
            PlaybackStatus::Stopped | PlaybackStatus::Error(_)
        );
        if settled && (self.decoder.is_some() || self.lease.is_some()) {
            self.stop().await;
        }
        if self.state.acknowledge().await {
            self.notify_state();
        }
    }

    /// Daemon exit: stop and take the indicator down.
    pub async fn shutdown(&mut self) {
        self.stop().await;
        self.state.set_indicator(Indicator::Hidden).await;
        self.notify_state();
    }

    /// Record the failure, clean up, then tell observers.
    async fn fail(&mut self, kind: ErrorKind) {
        self.state.set_error(kind).await;
        self.stop().await;
        self.emit(PlaybackEvent::Error { kind });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert_eq!(validate_url("  http://a/stream "), Ok("http://a/stream"));
        assert_eq!(validate_url("rtsp://cam/1"), Ok("rtsp://cam/1"));
        assert_eq!(validate_url(""), Err(PlayError::EmptyUrl));
        assert_eq!(validate_url("   "), Err(PlayError::EmptyUrl));
        assert_eq!(validate_url("ftp://x"), Err(PlayError::InvalidScheme));
        assert_eq!(validate_url("https://a"), Err(PlayError::InvalidScheme));
        assert_eq!(validate_url("HTTP://a"), Err(PlayError::InvalidScheme));
    }

    #[test]
    fn test_settings_follow_config() {
        let config = PlaybackConfig {
            persistent_notification: false,
            stop_on_timeout: false,
            ..PlaybackConfig::default()
        };
        let settings = PlayerSettings::from(&config);
        assert!(!settings.persistent_notification);
        assert!(!settings.stop_on_timeout);
    }
}
