pub mod core;
pub mod decoder;
pub mod entries;
pub mod http;
pub mod mpv;
pub mod output;
pub mod player;
pub mod socket;
pub mod store;
pub mod watchdog;

use stream_proto::protocol::PlaybackEvent;

/// Fan-out from the daemon to every connected client.
#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    Playback(PlaybackEvent),
    Log(String),
}
