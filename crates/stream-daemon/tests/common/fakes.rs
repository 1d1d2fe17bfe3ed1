//! In-process stand-ins for the decoder.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use stream_daemon::decoder::{
    Decoder, DecoderError, DecoderEvent, DecoderEventKind, DecoderFactory,
};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Never calls back; the test fires events itself.
    Manual,
    /// Reports `Opened` as soon as `open` is called.
    AutoOpen,
    /// `open` returns an error.
    FailOpen,
    /// `open` takes this long and never calls back.
    SlowOpen(Duration),
    /// `create` returns an error.
    Unavailable,
}

#[derive(Default)]
pub struct Counters {
    pub created: AtomicUsize,
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
    pub released: AtomicUsize,
    pub opened_urls: Mutex<Vec<String>>,
}

impl Counters {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

pub struct FakeFactory {
    pub behaviour: Behaviour,
    pub counters: Arc<Counters>,
}

impl FakeFactory {
    pub fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn manual() -> Self {
        Self::new(Behaviour::Manual)
    }
}

#[async_trait]
impl DecoderFactory for FakeFactory {
    async fn create(
        &self,
        session: u64,
        events: mpsc::Sender<DecoderEvent>,
    ) -> Result<Box<dyn Decoder>, DecoderError> {
        if self.behaviour == Behaviour::Unavailable {
            return Err(DecoderError::Unavailable("no fake decoder today".into()));
        }
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeDecoder {
            session,
            events,
            behaviour: self.behaviour,
            counters: Arc::clone(&self.counters),
            playing: false,
            released: false,
        }))
    }
}

pub struct FakeDecoder {
    session: u64,
    events: mpsc::Sender<DecoderEvent>,
    behaviour: Behaviour,
    counters: Arc<Counters>,
    playing: bool,
    released: bool,
}

#[async_trait]
impl Decoder for FakeDecoder {
    async fn open(&mut self, url: &str) -> Result<(), DecoderError> {
        self.counters.opened_urls.lock().push(url.to_string());
        match self.behaviour {
            Behaviour::FailOpen => Err(DecoderError::Open {
                url: url.to_string(),
                reason: "connection refused".into(),
            }),
            Behaviour::AutoOpen => {
                let _ = self
                    .events
                    .send(DecoderEvent {
                        session: self.session,
                        kind: DecoderEventKind::Opened,
                    })
                    .await;
                Ok(())
            }
            Behaviour::SlowOpen(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn start(&mut self) -> Result<(), DecoderError> {
        self.counters.started.fetch_add(1, Ordering::SeqCst);
        self.playing = true;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DecoderError> {
        self.counters.stopped.fetch_add(1, Ordering::SeqCst);
        self.playing = false;
        Ok(())
    }

    async fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.playing = false;
            self.counters.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_playing(&self) -> bool {
        self.playing
    }
}
