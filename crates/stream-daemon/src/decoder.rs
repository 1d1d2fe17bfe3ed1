//! The decoder collaborator the playback state machine drives.
//!
//! `open` only starts the work.  Readiness, runtime errors and the end of
//! the stream arrive later as `DecoderEvent`s tagged with the session that
//! created the decoder, so callbacks from a decoder that has already been
//! replaced can be told apart and dropped.

use async_trait::async_trait;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderEventKind {
    /// The stream is open and ready to start.
    Opened,
    Error(String),
    /// The stream ended on its own.
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderEvent {
    pub session: u64,
    pub kind: DecoderEventKind,
}

#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    #[error("decoder unavailable: {0}")]
    Unavailable(String),
    #[error("could not open {url}: {reason}")]
    Open { url: String, reason: String },
    #[error("decoder command failed: {0}")]
    Command(String),
}

#[async_trait]
pub trait Decoder: Send + Sync {
    /// Begin opening `url`.  `Ok` means the request was accepted, not that
    /// the stream is ready.
    async fn open(&mut self, url: &str) -> Result<(), DecoderError>;
    async fn start(&mut self) -> Result<(), DecoderError>;
    async fn stop(&mut self) -> Result<(), DecoderError>;
    /// Give up the decoder.  Must be safe to call more than once.
    async fn release(&mut self);
    fn is_playing(&self) -> bool;
}

/// Hands out one decoder per play session.
#[async_trait]
pub trait DecoderFactory: Send + Sync {
    async fn create(
        &self,
        session: u64,
        events: mpsc::Sender<DecoderEvent>,
    ) -> Result<Box<dyn Decoder>, DecoderError>;
}
