#![allow(dead_code)]

pub mod fakes;

use std::sync::Arc;
use std::time::Duration;

use stream_daemon::core::{DaemonCore, DaemonEvent};
use stream_daemon::output::OutputArbiter;
use stream_daemon::store::{Database, SharedDatabase};
use stream_daemon::BroadcastMessage;
use stream_proto::config::Config;
use stream_proto::protocol::{Command, PlaybackEvent, PlaybackState};
use stream_proto::state::StateManager;
use tokio::sync::{broadcast, mpsc};

use fakes::FakeFactory;

/// A core plus handles on everything around it.
pub struct Harness {
    pub core: DaemonCore,
    pub state: Arc<StateManager>,
    pub store: SharedDatabase,
    pub output: OutputArbiter,
    pub factory: Arc<FakeFactory>,
    pub broadcast_rx: broadcast::Receiver<BroadcastMessage>,
    pub event_tx: mpsc::Sender<DaemonEvent>,
    pub event_rx: mpsc::Receiver<DaemonEvent>,
}

impl Harness {
    pub fn new(config: Config, factory: FakeFactory) -> Self {
        let store = Database::open_in_memory().unwrap().into_shared();
        let output = OutputArbiter::new();
        let factory = Arc::new(factory);
        let (broadcast_tx, broadcast_rx) = broadcast::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);

        let core = DaemonCore::new(
            &config,
            Arc::clone(&store),
            factory.clone(),
            output.clone(),
            broadcast_tx,
            event_tx.clone(),
        );
        let state = core.state_manager();

        Self {
            core,
            state,
            store,
            output,
            factory,
            broadcast_rx,
            event_tx,
            event_rx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(Config::default(), FakeFactory::manual())
    }

    pub async fn command(&mut self, cmd: Command) -> bool {
        self.core.handle_event(DaemonEvent::ClientCommand(cmd)).await
    }

    pub async fn play(&mut self, url: &str) {
        self.command(Command::Play { url: url.into() }).await;
    }

    pub async fn status(&self) -> stream_proto::protocol::PlaybackStatus {
        self.state.status().await
    }

    pub async fn snapshot(&self) -> PlaybackState {
        self.state.get_state().await
    }

    /// Playback events broadcast so far.
    pub fn drain_events(&mut self) -> Vec<PlaybackEvent> {
        let mut events = Vec::new();
        while let Ok(msg) = self.broadcast_rx.try_recv() {
            if let BroadcastMessage::Playback(event) = msg {
                events.push(event);
            }
        }
        events
    }

    pub fn recents_count(&self) -> usize {
        self.store.lock().recents().len().unwrap()
    }
}

/// Poll `state` until `check` holds.  Panics after five (virtual) seconds.
pub async fn wait_for<F>(state: &StateManager, check: F) -> PlaybackState
where
    F: Fn(&PlaybackState) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = state.get_state().await;
        if check(&snapshot) {
            return snapshot;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("state never matched, last seen {:?}", snapshot);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn config_with_timeout(secs: &str) -> Config {
    let mut config = Config::default();
    config.playback.connection_timeout = secs.to_string();
    config
}
