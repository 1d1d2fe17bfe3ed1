use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    Play { url: String },
    Stop,
    /// Return from `Stopped` / `Error` to `Idle`.
    Acknowledge,
    GetState,
    /// The platform took the audio output away from us.
    OutputLost { kind: LossKind },
    /// The platform handed the audio output back.
    OutputRegained,
    /// Output route is about to become loud (e.g. headphones unplugged).
    BecomingNoisy,
    ListEntries { table: TableKind },
    AddFavorite { url: String, name: String },
    UpdateFavorite {
        id: i64,
        url: String,
        name: String,
        #[serde(default)]
        count: Option<i64>,
    },
    DeleteEntry { table: TableKind, key: EntryKey },
    Shutdown,
}

/// Messages sent from the daemon to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: daemon version + full state snapshot.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        state: PlaybackState,
    },
    State {
        data: PlaybackState,
    },
    Playback {
        event: PlaybackEvent,
    },
    /// Reply to `ListEntries` and to store mutations.
    Entries {
        table: TableKind,
        entries: Vec<Entry>,
    },
    /// A command was refused at the call boundary (bad URL, duplicate entry).
    Rejected {
        kind: ErrorKind,
        message: String,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Every failure a client can be told about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    EmptyUrl,
    InvalidScheme,
    ResourceDenied,
    DecoderOpenFailure,
    DecoderRuntimeError,
    ConnectionTimeout,
    DuplicateName,
    DuplicateUrl,
    MissingName,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ErrorKind::EmptyUrl => "url is empty",
            ErrorKind::InvalidScheme => "url must start with http:// or rtsp://",
            ErrorKind::ResourceDenied => "audio output is in use by someone else",
            ErrorKind::DecoderOpenFailure => "could not open the stream",
            ErrorKind::DecoderRuntimeError => "error while playing the stream",
            ErrorKind::ConnectionTimeout => "timed out waiting for the stream to start",
            ErrorKind::DuplicateName => "a favorite with that name already exists",
            ErrorKind::DuplicateUrl => "that url is already a favorite",
            ErrorKind::MissingName => "favorites need a name",
        };
        f.write_str(msg)
    }
}

/// Playback status as owned by the state machine.
///
/// Transitions:
///   Idle -> Connecting -> Playing -> Stopped -> Idle
///   Connecting | Playing -> Error(kind) -> Idle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Idle,
    Connecting,
    Playing,
    Stopped,
    Error(ErrorKind),
}

impl PlaybackStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, PlaybackStatus::Error(_))
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            PlaybackStatus::Error(kind) => Some(*kind),
            _ => None,
        }
    }
}

/// Events observers receive when playback changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum PlaybackEvent {
    Started { url: String },
    Stopped,
    Error { kind: ErrorKind },
    /// A previously reported error went away because a stream started.
    ClearedError,
}

/// The persistent status indicator (the "now playing" notification).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "indicator")]
pub enum Indicator {
    #[default]
    Hidden,
    Playing { url: String },
    /// Kept after stop when persistent notifications are on; offers replay.
    Stopped { url: String },
}

/// Loss of exclusive access to the audio output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LossKind {
    Permanent,
    Transient,
    /// Transient, and the platform would let us keep playing quietly.
    TransientCanDuck,
}

/// Full playback state.  `rev` is a monotonically increasing counter
/// incremented every time the state changes.  Clients can use it to detect
/// missed updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PlaybackState {
    #[serde(default)]
    pub rev: u64,
    /// Id of the most recent accepted play request.
    #[serde(default)]
    pub session: u64,
    pub status: PlaybackStatus,
    pub url: Option<String>,
    pub is_playing: bool,
    /// An error was reported and no stream has started since.
    #[serde(default)]
    pub stream_error: bool,
    /// The state machine currently holds a decoder handle.
    #[serde(default)]
    pub decoder_active: bool,
    #[serde(default)]
    pub indicator: Indicator,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Recents,
    Favorites,
}

/// Lookup / delete key for a stored entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "by", content = "value", rename_all = "lowercase")]
pub enum EntryKey {
    Id(i64),
    Url(String),
    Name(String),
}

/// One row of the recents or favorites table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entry {
    pub id: i64,
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    pub play_count: i64,
    pub last_modified: DateTime<Utc>,
}

/// Largest frame payload a peer may announce.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Payload length announced by the header at the start of `data`.
    pub fn frame_len(data: &[u8]) -> Option<usize> {
        let header: [u8; 4] = data.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(header) as usize)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}
