//! mpv as the stream decoder, driven over its JSON IPC socket.
//!
//! ```text
//!   MpvBackend (DecoderFactory)
//!         │  one idle mpv process, respawned if it dies
//!         ├── writer_task   ← MpvRequest via mpsc → socket
//!         ├── reader_task   ← JSON lines from socket
//!         │                      ├── reply (request_id) → pending oneshot
//!         │                      └── event              → translate_task
//!         └── translate_task → DecoderEvent for the session that owns the route
//! ```
//!
//! Every `create()` re-points the route at the new session.  Once mpv answers
//! the session's `loadfile` with a `playlist_entry_id`, events tagged with any
//! other entry are dropped.  Before that reply (or on an mpv too old to send
//! ids) events go to whichever session owns the route.
//!
//! Platform notes:
//! - Unix:   Unix domain sockets
//! - Windows: Named pipes  \\.\pipe\<name>
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::decoder::{Decoder, DecoderError, DecoderEvent, DecoderEventKind, DecoderFactory};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// observe_property id for `core-idle`.
const OBS_CORE_IDLE: u64 = 1;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line, newline included
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// Unsolicited mpv message (event or property change).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// Playlist entry the event is about (`start-file`, `end-file`).
    pub fn playlist_entry(&self) -> Option<u64> {
        self.raw.get("playlist_entry_id")?.as_u64()
    }

    /// Map an mpv event onto the decoder callback it stands for.
    pub fn decoder_kind(&self) -> Option<DecoderEventKind> {
        match self.event_name()? {
            "file-loaded" => Some(DecoderEventKind::Opened),
            "end-file" => {
                let reason = self
                    .raw
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                match reason {
                    "eof" => Some(DecoderEventKind::Completed),
                    "error" | "quit" => {
                        let detail = self
                            .raw
                            .get("file_error")
                            .and_then(|v| v.as_str())
                            .unwrap_or(reason);
                        Some(DecoderEventKind::Error(detail.to_string()))
                    }
                    // "stop" / "redirect" come from our own loadfile/stop
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

/// Cloneable handle to the writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    /// Returns the playlist entry mpv created, when it reports one.
    pub async fn load_stream(&self, url: &str, volume: f32) -> anyhow::Result<Option<u64>> {
        let reply = self.send(json!(["loadfile", url])).await?;
        let entry = reply["data"]["playlist_entry_id"].as_u64();
        let vol_pct = (volume * 100.0).clamp(0.0, 100.0);
        let _ = self.send(json!(["set_property", "volume", vol_pct])).await;
        Ok(entry)
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn observe_core_idle(&self) {
        match self
            .send(json!(["observe_property", OBS_CORE_IDLE, "core-idle"]))
            .await
        {
            Ok(_) => debug!("mpv: observing core-idle"),
            Err(e) => warn!("mpv: observe_property core-idle failed: {}", e),
        }
    }
}

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
    volume: f32,
}

impl MpvDriver {
    pub fn new(volume: f32) -> Self {
        Self {
            socket_name: stream_proto::platform::mpv_socket_name(),
            process: None,
            volume,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        match self.process {
            Some(ref mut child) => child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    async fn spawn_process(&mut self) -> anyhow::Result<()> {
        self.kill().await;

        info!("mpv: spawning new process");
        let mpv_binary = stream_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let vol_arg = format!(
            "--volume={}",
            (self.volume * 100.0).clamp(0.0, 100.0).round() as i64
        );

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg(stream_proto::platform::mpv_socket_arg())
            .arg("--quiet")
            .arg(vol_arg)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        self.spawn_process().await?;

        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.spawn_process().await?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(read_half, write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

async fn fail_all(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    event_tx: mpsc::Sender<MpvEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_all(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) else {
                    debug!("mpv reader: event {}", trimmed);
                    if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                        break;
                    }
                    continue;
                };

                let Some(tx) = pending.lock().await.remove(&req_id) else {
                    debug!("mpv reader: response for unknown req={}", req_id);
                    continue;
                };
                let result = if val["error"].as_str() == Some("success") {
                    Ok(val)
                } else {
                    let err = val["error"].as_str().unwrap_or("unknown error");
                    debug!("mpv reader: response req={} err={}", req_id, err);
                    Err(anyhow::anyhow!("mpv error: {}", err))
                };
                let _ = tx.send(result);
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_all(&pending, &format!("mpv IPC read error: {}", e)).await;
                break;
            }
        }
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // register before writing so the reader can always match the reply
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

/// Where translated events go: the session currently owning mpv.
struct Route {
    session: u64,
    /// Which mpv connection the session was created on.
    generation: u64,
    /// mpv playlist entry of the session's `loadfile`, once known.
    entry: Option<u64>,
    events: mpsc::Sender<DecoderEvent>,
    playing: Arc<AtomicBool>,
}

impl Route {
    fn accepts(&self, entry: Option<u64>) -> bool {
        match (self.entry, entry) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }
}

type SharedRoute = Arc<SyncMutex<Option<Route>>>;

async fn translate_task(mut rx: mpsc::Receiver<MpvEvent>, route: SharedRoute, generation: u64) {
    // file-loaded carries no entry id; it belongs to the last start-file
    let mut loading: Option<u64> = None;
    while let Some(evt) = rx.recv().await {
        if let Some((OBS_CORE_IDLE, data)) = evt.as_property_change() {
            if let Some(r) = route.lock().as_ref() {
                r.playing.store(data.as_bool() == Some(false), Ordering::Relaxed);
            }
            continue;
        }
        if evt.event_name() == Some("start-file") {
            loading = evt.playlist_entry();
            continue;
        }
        let Some(kind) = evt.decoder_kind() else {
            continue;
        };
        let entry = match kind {
            DecoderEventKind::Opened => loading,
            _ => evt.playlist_entry(),
        };
        let target = route.lock().as_ref().and_then(|r| {
            if r.accepts(entry) {
                Some((r.session, r.events.clone()))
            } else {
                debug!(
                    "mpv: dropping {:?} for entry {:?}, session {} is on {:?}",
                    kind, entry, r.session, r.entry
                );
                None
            }
        });
        if let Some((session, events)) = target {
            debug!("mpv: session {} {:?}", session, kind);
            let _ = events.send(DecoderEvent { session, kind }).await;
        }
    }
    // reader gone: mpv exited or the socket broke under a live session
    let orphan = {
        let mut route = route.lock();
        match route.as_ref() {
            Some(r) if r.generation == generation => route.take().map(|r| (r.session, r.events)),
            _ => None,
        }
    };
    if let Some((session, events)) = orphan {
        warn!("mpv: connection lost during session {}", session);
        let _ = events
            .send(DecoderEvent {
                session,
                kind: DecoderEventKind::Error("mpv connection lost".to_string()),
            })
            .await;
    }
    debug!("mpv: translate task exiting");
}

struct Connection {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    generation: u64,
}

/// `DecoderFactory` backed by one long-lived mpv process.
pub struct MpvBackend {
    conn: Mutex<Connection>,
    route: SharedRoute,
    volume: f32,
}

impl MpvBackend {
    pub fn new(volume: f32) -> Self {
        Self {
            conn: Mutex::new(Connection {
                driver: MpvDriver::new(volume),
                handle: None,
                generation: 0,
            }),
            route: Arc::new(SyncMutex::new(None)),
            volume,
        }
    }

    async fn ensure_handle(&self) -> Result<(MpvHandle, u64), DecoderError> {
        let mut conn = self.conn.lock().await;
        if conn.handle.is_some() && !conn.driver.process_alive() {
            warn!("mpv: process died, dropping handle");
            conn.handle = None;
        }
        if let Some(handle) = conn.handle.clone() {
            return Ok((handle, conn.generation));
        }

        conn.generation += 1;
        let generation = conn.generation;
        let (event_tx, event_rx) = mpsc::channel::<MpvEvent>(64);
        tokio::spawn(translate_task(event_rx, Arc::clone(&self.route), generation));

        let handle = conn
            .driver
            .spawn_and_connect(event_tx)
            .await
            .map_err(|e| DecoderError::Unavailable(e.to_string()))?;
        handle.observe_core_idle().await;
        conn.handle = Some(handle.clone());
        Ok((handle, generation))
    }

    pub async fn shutdown(&self) {
        self.route.lock().take();
        let mut conn = self.conn.lock().await;
        conn.handle = None;
        conn.driver.kill().await;
    }
}

#[async_trait]
impl DecoderFactory for MpvBackend {
    async fn create(
        &self,
        session: u64,
        events: mpsc::Sender<DecoderEvent>,
    ) -> Result<Box<dyn Decoder>, DecoderError> {
        let (handle, generation) = self.ensure_handle().await?;
        let playing = Arc::new(AtomicBool::new(false));
        *self.route.lock() = Some(Route {
            session,
            generation,
            entry: None,
            events,
            playing: Arc::clone(&playing),
        });
        Ok(Box::new(MpvDecoder {
            handle,
            session,
            route: Arc::clone(&self.route),
            playing,
            volume: self.volume,
            released: false,
        }))
    }
}

pub struct MpvDecoder {
    handle: MpvHandle,
    session: u64,
    route: SharedRoute,
    playing: Arc<AtomicBool>,
    volume: f32,
    released: bool,
}

#[async_trait]
impl Decoder for MpvDecoder {
    async fn open(&mut self, url: &str) -> Result<(), DecoderError> {
        let entry = self
            .handle
            .load_stream(url, self.volume)
            .await
            .map_err(|e| DecoderError::Open {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        if let Some(route) = self.route.lock().as_mut() {
            if route.session == self.session {
                route.entry = entry;
            }
        }
        Ok(())
    }

    async fn start(&mut self) -> Result<(), DecoderError> {
        self.handle
            .set_pause(false)
            .await
            .map_err(|e| DecoderError::Command(e.to_string()))
    }

    async fn stop(&mut self) -> Result<(), DecoderError> {
        self.playing.store(false, Ordering::Relaxed);
        self.handle
            .stop()
            .await
            .map_err(|e| DecoderError::Command(e.to_string()))
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.playing.store(false, Ordering::Relaxed);
        {
            let mut route = self.route.lock();
            if route.as_ref().map(|r| r.session) == Some(self.session) {
                *route = None;
            }
        }
        if let Err(e) = self.handle.stop().await {
            debug!("mpv: stop on release failed: {}", e);
        }
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(raw: Value) -> MpvEvent {
        MpvEvent { raw }
    }

    #[test]
    fn test_file_loaded_means_opened() {
        let evt = event(json!({"event": "file-loaded"}));
        assert_eq!(evt.decoder_kind(), Some(DecoderEventKind::Opened));
    }

    #[test]
    fn test_end_file_reasons() {
        let eof = event(json!({"event": "end-file", "reason": "eof"}));
        assert_eq!(eof.decoder_kind(), Some(DecoderEventKind::Completed));

        let err = event(json!({
            "event": "end-file",
            "reason": "error",
            "file_error": "loading failed"
        }));
        assert_eq!(
            err.decoder_kind(),
            Some(DecoderEventKind::Error("loading failed".into()))
        );

        let stop = event(json!({"event": "end-file", "reason": "stop"}));
        assert_eq!(stop.decoder_kind(), None);
    }

    #[test]
    fn test_property_change_is_not_a_callback() {
        let evt = event(json!({"event": "property-change", "id": 1, "data": false}));
        assert_eq!(evt.as_property_change().map(|(id, _)| id), Some(OBS_CORE_IDLE));
        assert_eq!(evt.decoder_kind(), None);
    }

    #[tokio::test]
    async fn test_reader_routes_replies_and_events() {
        let (client, server) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(client);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let handle = start_io_tasks(read_half, write_half, event_tx);

        let fake_mpv = tokio::spawn(async move {
            let (server_read, mut server_write) = tokio::io::split(server);
            let mut lines = BufReader::new(server_read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            let id = req["request_id"].as_u64().unwrap();
            let out = format!(
                "{}\n{}\n",
                json!({"event": "file-loaded"}),
                json!({"request_id": id, "error": "success", "data": null})
            );
            server_write.write_all(out.as_bytes()).await.unwrap();
            // keep the pipe open until the client is done
            let _ = lines.next_line().await;
        });

        handle.stop().await.unwrap();
        let evt = event_rx.recv().await.unwrap();
        assert_eq!(evt.event_name(), Some("file-loaded"));
        drop(handle);
        fake_mpv.abort();
    }

    fn route_for(session: u64, generation: u64, events: mpsc::Sender<DecoderEvent>) -> Route {
        Route {
            session,
            generation,
            entry: None,
            events,
            playing: Arc::new(AtomicBool::new(false)),
        }
    }

    #[tokio::test]
    async fn test_lost_connection_fails_live_session() {
        let route: SharedRoute = Arc::new(SyncMutex::new(None));
        let (mpv_tx, mpv_rx) = mpsc::channel(8);
        let (dec_tx, mut dec_rx) = mpsc::channel(8);
        *route.lock() = Some(route_for(4, 1, dec_tx));
        let task = tokio::spawn(translate_task(mpv_rx, Arc::clone(&route), 1));

        mpv_tx.send(event(json!({"event": "file-loaded"}))).await.unwrap();
        assert_eq!(
            dec_rx.recv().await.unwrap(),
            DecoderEvent {
                session: 4,
                kind: DecoderEventKind::Opened
            }
        );

        drop(mpv_tx);
        task.await.unwrap();
        let evt = dec_rx.recv().await.unwrap();
        assert_eq!(evt.session, 4);
        assert!(matches!(evt.kind, DecoderEventKind::Error(_)));
        assert!(route.lock().is_none());
    }

    #[tokio::test]
    async fn test_old_connection_leaves_new_route_alone() {
        let route: SharedRoute = Arc::new(SyncMutex::new(None));
        let (mpv_tx, mpv_rx) = mpsc::channel::<MpvEvent>(8);
        let (dec_tx, mut dec_rx) = mpsc::channel(8);
        *route.lock() = Some(route_for(9, 2, dec_tx));

        drop(mpv_tx);
        translate_task(mpv_rx, Arc::clone(&route), 1).await;

        assert!(dec_rx.try_recv().is_err());
        assert_eq!(route.lock().as_ref().map(|r| r.session), Some(9));
    }

    #[tokio::test]
    async fn test_events_for_an_older_entry_are_dropped() {
        let route: SharedRoute = Arc::new(SyncMutex::new(None));
        let (mpv_tx, mpv_rx) = mpsc::channel(8);
        let (dec_tx, mut dec_rx) = mpsc::channel(8);
        let mut current = route_for(5, 1, dec_tx);
        current.entry = Some(7);
        *route.lock() = Some(current);
        let task = tokio::spawn(translate_task(mpv_rx, Arc::clone(&route), 1));

        // leftovers from the previous loadfile
        for raw in [
            json!({"event": "end-file", "reason": "error", "playlist_entry_id": 6}),
            json!({"event": "start-file", "playlist_entry_id": 6}),
            json!({"event": "file-loaded"}),
        ] {
            mpv_tx.send(event(raw)).await.unwrap();
        }
        // ours
        for raw in [
            json!({"event": "start-file", "playlist_entry_id": 7}),
            json!({"event": "file-loaded"}),
            json!({"event": "end-file", "reason": "eof", "playlist_entry_id": 7}),
        ] {
            mpv_tx.send(event(raw)).await.unwrap();
        }

        assert_eq!(
            dec_rx.recv().await.unwrap(),
            DecoderEvent {
                session: 5,
                kind: DecoderEventKind::Opened
            }
        );
        assert_eq!(
            dec_rx.recv().await.unwrap(),
            DecoderEvent {
                session: 5,
                kind: DecoderEventKind::Completed
            }
        );

        route.lock().take();
        drop(mpv_tx);
        task.await.unwrap();
        assert!(dec_rx.try_recv().is_err());
    }
}
