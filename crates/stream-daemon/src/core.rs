//! `DaemonCore` — the single owner of playback.
//!
//! All inputs (client commands, decoder callbacks, output loss, watchdog
//! timeouts) arrive as `DaemonEvent`s on one mpsc channel and are handled in
//! order, so the player never sees two transitions at once.
//!
//! ```text
//!   socket / http ──ClientCommand──┐
//!   decoder       ──Decoder────────┤
//!   output arbiter──OutputLost─────┼──► event_rx ──► DaemonCore ──► Player
//!   watchdog      ──WatchdogTimeout┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use stream_proto::config::Config;
use stream_proto::protocol::Command;
use stream_proto::state::StateManager;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::decoder::{DecoderEvent, DecoderFactory};
use crate::output::{OutputArbiter, OutputLoss};
use crate::player::{Player, PlayerSettings};
use crate::store::SharedDatabase;
use crate::watchdog::{Watchdog, WatchdogOutcome};
use crate::BroadcastMessage;

#[derive(Debug)]
pub enum DaemonEvent {
    /// A command from a TCP client or the HTTP API.
    ClientCommand(Command),
    /// Callback from the decoder of some session.
    Decoder(DecoderEvent),
    /// The watchdog for `session` gave up waiting.
    WatchdogTimeout { session: u64 },
    /// The output arbiter took the output away from a lease.
    OutputLost(OutputLoss),
    Shutdown,
}

struct WatchdogHandle {
    session: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct DaemonCore {
    player: Player,
    state_manager: Arc<StateManager>,
    output: OutputArbiter,
    event_tx: mpsc::Sender<DaemonEvent>,
    decoder_rx: Option<mpsc::Receiver<DecoderEvent>>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    connection_timeout: Duration,
    watchdog: Option<WatchdogHandle>,
}

impl DaemonCore {
    pub fn new(
        config: &Config,
        store: SharedDatabase,
        decoders: Arc<dyn DecoderFactory>,
        output: OutputArbiter,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<DaemonEvent>,
    ) -> Self {
        let state_manager = Arc::new(StateManager::new());
        let (decoder_tx, decoder_rx) = mpsc::channel::<DecoderEvent>(64);
        let player = Player::new(
            Arc::clone(&state_manager),
            store,
            Arc::new(output.clone()),
            decoders,
            decoder_tx,
            broadcast_tx.clone(),
            PlayerSettings::from(&config.playback),
        );
        let connection_timeout = config.playback.connection_timeout();
        info!("DaemonCore: connection timeout {:?}", connection_timeout);

        Self {
            player,
            state_manager,
            output,
            event_tx,
            decoder_rx: Some(decoder_rx),
            broadcast_tx,
            connection_timeout,
            watchdog: None,
        }
    }

    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("DaemonCore: starting event loop");
        self.spawn_forwarders();

        loop {
            let Some(evt) = event_rx.recv().await else {
                info!("DaemonCore: event channel closed, shutting down");
                break;
            };
            if !self.handle_event(evt).await {
                info!("DaemonCore: shutdown requested");
                break;
            }
        }

        self.cleanup().await;
        Ok(())
    }

    /// Feed decoder callbacks and output losses into our own event loop.
    fn spawn_forwarders(&mut self) {
        if let Some(mut decoder_rx) = self.decoder_rx.take() {
            let tx = self.event_tx.clone();
            tokio::spawn(async move {
                while let Some(evt) = decoder_rx.recv().await {
                    if tx.send(DaemonEvent::Decoder(evt)).await.is_err() {
                        break;
                    }
                }
            });
        }

        let mut loss_rx = self.output.subscribe_losses();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                match loss_rx.recv().await {
                    Ok(loss) => {
                        if tx.send(DaemonEvent::OutputLost(loss)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("DaemonCore: missed {} output loss notifications", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Handle one event.  Returns false when the loop should stop.
    pub async fn handle_event(&mut self, evt: DaemonEvent) -> bool {
        match evt {
            DaemonEvent::Shutdown => return false,
            DaemonEvent::ClientCommand(cmd) => {
                info!("DaemonCore: command {:?}", cmd);
                return self.handle_command(cmd).await;
            }
            DaemonEvent::Decoder(evt) => {
                debug!("DaemonCore: decoder event {:?}", evt);
                self.player.on_decoder_event(evt).await;
            }
            DaemonEvent::WatchdogTimeout { session } => {
                self.watchdog = None;
                self.player.on_watchdog_timeout(session).await;
            }
            DaemonEvent::OutputLost(loss) => {
                if self.player.on_output_lost(loss).await {
                    self.cancel_watchdog();
                }
            }
        }
        true
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Play { url } => {
                let requested = Instant::now();
                match self.player.request_play(&url).await {
                    Ok(session) => self.start_watchdog(session, requested),
                    Err(e) => warn!("DaemonCore: play {:?} refused: {}", url, e),
                }
            }
            Command::Stop => {
                self.cancel_watchdog();
                self.player.stop().await;
            }
            Command::Acknowledge => self.player.acknowledge().await,
            Command::GetState => {
                let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
            }
            Command::OutputLost { kind } => {
                // through the arbiter, like a real platform notification
                if self.output.notify_lost(kind).is_none() {
                    debug!("DaemonCore: output loss while not holding the output");
                }
            }
            Command::OutputRegained => {
                let requested = Instant::now();
                if let Some(session) = self.player.on_output_regained().await {
                    self.start_watchdog(session, requested);
                }
            }
            Command::BecomingNoisy => {
                self.cancel_watchdog();
                self.player.on_becoming_noisy().await;
            }
            Command::Shutdown => return false,
            // answered by the socket and http surfaces
            store_cmd @ (Command::ListEntries { .. }
            | Command::AddFavorite { .. }
            | Command::UpdateFavorite { .. }
            | Command::DeleteEntry { .. }) => {
                warn!("DaemonCore: store command {:?} reached the core, ignoring", store_cmd);
            }
        }
        true
    }

    /// Arm the watchdog for `session`, counting from when it was requested.
    fn start_watchdog(&mut self, session: u64, requested: Instant) {
        self.cancel_watchdog();

        let cancel = CancellationToken::new();
        let deadline = requested + self.connection_timeout;
        let watchdog = Watchdog::new(self.state_manager(), session, deadline);
        let token = cancel.clone();
        let tx = self.event_tx.clone();
        let task = tokio::spawn(async move {
            let outcome = watchdog.run(token).await;
            debug!("watchdog: session {} finished: {:?}", session, outcome);
            if outcome == WatchdogOutcome::TimedOut {
                let _ = tx.send(DaemonEvent::WatchdogTimeout { session }).await;
            }
        });

        self.watchdog = Some(WatchdogHandle {
            session,
            cancel,
            task,
        });
    }

    fn cancel_watchdog(&mut self) {
        if let Some(handle) = self.watchdog.take() {
            if !handle.task.is_finished() {
                debug!("DaemonCore: cancelling watchdog for session {}", handle.session);
            }
            handle.cancel.cancel();
        }
    }

    async fn cleanup(&mut self) {
        self.cancel_watchdog();
        self.player.shutdown().await;
        info!("DaemonCore: stopped");
    }
}
