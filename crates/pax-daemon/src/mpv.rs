/// mpv IPC driver and the `PlaybackEngine` built on top of it.
///
/// ```text
///   MpvDriver::spawn_and_connect()
///         │
///         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
///         └── reader_task   ← reads JSON lines from socket
///                                ├── response (has request_id) → matched oneshot::Sender
///                                └── unsolicited event          → dropped
/// ```
///
/// The session controller polls the engine, so mpv events are never forwarded.
/// Unix domain sockets only.
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, trace, warn};

use crate::engine::PlaybackEngine;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

const IPC_TIMEOUT_SECS: u64 = 5;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// Cloneable handle to the mpv writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
    pending: PendingMap,
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

        match tokio::time::timeout(tokio::time::Duration::from_secs(IPC_TIMEOUT_SECS), reply_rx).await {
            Ok(reply) => {
                reply.map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
            }
            Err(_) => {
                self.pending.lock().await.remove(&req_id);
                Err(anyhow::anyhow!("mpv IPC timeout for req={}", req_id))
            }
        }
    }

    pub async fn load_stream(&self, url: &str, volume: f32) -> anyhow::Result<()> {
        self.send(json!(["loadfile", url])).await?;
        let _ = self.set_volume(volume).await;
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn set_volume(&self, vol: f32) -> anyhow::Result<()> {
        let vol_pct = (vol * 100.0).clamp(0.0, 100.0);
        self.send(json!(["set_property", "volume", vol_pct])).await?;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    /// `core-idle` is false only while audio is actually being produced: it
    /// stays true while paused, while buffering and with nothing loaded.
    pub async fn core_idle(&self) -> anyhow::Result<bool> {
        let resp = self.send(json!(["get_property", "core-idle"])).await?;
        Ok(resp["data"].as_bool().unwrap_or(true))
    }

    /// Fails with "property unavailable" until the stream sends ICY metadata.
    pub async fn icy_title(&self) -> anyhow::Result<Option<String>> {
        let resp = self
            .send(json!(["get_property", "metadata/by-key/icy-title"]))
            .await?;
        Ok(resp["data"].as_str().map(str::to_string))
    }

    pub async fn quit(&self) -> anyhow::Result<()> {
        self.send(json!(["quit"])).await?;
        Ok(())
    }
}

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
    pub last_volume: f32,
}

impl MpvDriver {
    pub fn new() -> Self {
        Self {
            socket_name: pax_proto::platform::mpv_socket_name(),
            process: None,
            last_volume: 0.5,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        if let Some(ref mut child) = self.process {
            child.try_wait().ok().flatten().is_none()
        } else {
            false
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    pub async fn spawn_and_connect(&mut self) -> anyhow::Result<MpvHandle> {
        self.kill().await;

        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        info!("mpv: spawning new process");
        let mpv_binary = pax_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let vol_arg = format!(
            "--volume={}",
            (self.last_volume * 100.0).clamp(0.0, 100.0).round() as i64
        );

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg(pax_proto::platform::mpv_socket_arg())
            .arg("--quiet")
            .arg(vol_arg)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);

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
        Ok(Self::start_io_tasks(stream))
    }

    fn start_io_tasks(stream: UnixStream) -> MpvHandle {
        let (read_half, write_half) = stream.into_split();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

        tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
        tokio::spawn(reader_task(BufReader::new(read_half), pending.clone()));

        MpvHandle {
            tx: cmd_tx,
            pending,
        }
    }
}

async fn fail_all(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap)
where
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
                    trace!("mpv reader: event {}", trimmed);
                    continue;
                };

                let mut map = pending.lock().await;
                if let Some(tx) = map.remove(&req_id) {
                    let result = if val["error"].as_str() == Some("success") {
                        Ok(val)
                    } else {
                        let err = val["error"].as_str().unwrap_or("unknown error").to_string();
                        debug!("mpv reader: response req={} err={}", req_id, err);
                        Err(anyhow::anyhow!("mpv error: {}", err))
                    };
                    let _ = tx.send(result);
                } else {
                    debug!("mpv reader: response for unknown req={}", req_id);
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_all(&pending, "mpv IPC read error").await;
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
        // Register before writing so the reader can match the reply.
        pending.lock().await.insert(req.req_id, req.reply);
        trace!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
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

/// Drop placeholder titles some stations send between tracks.
fn clean_title(raw: &str) -> Option<String> {
    let t = raw.trim();
    let trivial = t.is_empty() || t.chars().all(|c| c == '-' || c.is_whitespace());
    if trivial {
        None
    } else {
        Some(t.to_string())
    }
}

/// `PlaybackEngine` backed by a single long-lived mpv process, spawned lazily
/// and respawned if it dies.
pub struct MpvEngine {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    volume: f32,
    loaded_id: Option<String>,
}

impl MpvEngine {
    pub fn new(volume: f32) -> Self {
        Self {
            driver: MpvDriver::new(),
            handle: None,
            volume: volume.clamp(0.0, 1.0),
            loaded_id: None,
        }
    }

    /// Handle to a running mpv, if there is one.  Never spawns.
    fn live_handle(&mut self) -> Option<MpvHandle> {
        if self.handle.is_some() && !self.driver.process_alive() {
            warn!("mpv: process exited");
            self.handle = None;
            self.loaded_id = None;
        }
        self.handle.clone()
    }

    async fn ensure_handle(&mut self) -> anyhow::Result<MpvHandle> {
        if let Some(h) = self.live_handle() {
            return Ok(h);
        }
        self.driver.last_volume = self.volume;
        let h = self.driver.spawn_and_connect().await?;
        self.handle = Some(h.clone());
        Ok(h)
    }
}

impl PlaybackEngine for MpvEngine {
    async fn play_stream(&mut self, id: &str, url: &str) -> bool {
        let handle = match self.ensure_handle().await {
            Ok(h) => h,
            Err(e) => {
                warn!("mpv: unavailable: {}", e);
                return false;
            }
        };
        // A paused player stays paused across loadfile.
        let _ = handle.set_pause(false).await;
        match handle.load_stream(url, self.volume).await {
            Ok(()) => {
                info!("mpv: loaded {} ({})", id, url);
                self.loaded_id = Some(id.to_string());
                true
            }
            Err(e) => {
                warn!("mpv: loadfile {} failed: {}", url, e);
                self.loaded_id = None;
                false
            }
        }
    }

    async fn pause(&mut self) {
        if let Some(h) = self.live_handle() {
            if let Err(e) = h.set_pause(true).await {
                warn!("mpv: pause failed: {}", e);
            }
        }
    }

    async fn resume(&mut self) {
        if let Some(h) = self.live_handle() {
            if let Err(e) = h.set_pause(false).await {
                warn!("mpv: resume failed: {}", e);
            }
        }
    }

    async fn stop(&mut self) {
        self.loaded_id = None;
        if let Some(h) = self.live_handle() {
            if let Err(e) = h.stop().await {
                debug!("mpv: stop failed: {}", e);
            }
        }
    }

    async fn is_playing(&mut self) -> bool {
        match self.live_handle() {
            Some(h) => matches!(h.core_idle().await, Ok(false)),
            None => false,
        }
    }

    async fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
        if let Some(h) = self.live_handle() {
            if let Err(e) = h.set_volume(volume).await {
                warn!("mpv: set volume failed: {}", e);
            }
        }
    }

    async fn current_track_title(&mut self) -> Option<String> {
        let h = self.live_handle()?;
        h.icy_title().await.ok().flatten().as_deref().and_then(clean_title)
    }

    fn current_stream_id(&self) -> Option<String> {
        self.loaded_id.clone()
    }

    async fn shutdown(&mut self) {
        if let Some(h) = self.handle.take() {
            let _ = h.quit().await;
        }
        self.driver.kill().await;
        self.loaded_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_title() {
        assert_eq!(clean_title("  Artist - Song "), Some("Artist - Song".into()));
        assert_eq!(clean_title(""), None);
        assert_eq!(clean_title(" - "), None);
        assert_eq!(clean_title("--"), None);
    }

    #[tokio::test]
    async fn test_engine_without_process_is_silent() {
        let mut engine = MpvEngine::new(1.4);
        assert_eq!(engine.volume, 1.0);
        assert!(!engine.is_playing().await);
        assert!(engine.current_track_title().await.is_none());
        assert!(engine.current_stream_id().is_none());
        // Transport calls with no mpv running are no-ops.
        engine.pause().await;
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_replies_are_matched_by_request_id() {
        let (client, server) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(client);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
        tokio::spawn(reader_task(BufReader::new(read_half), pending.clone()));
        let handle = MpvHandle {
            tx: cmd_tx,
            pending,
        };

        let server_task = tokio::spawn(async move {
            let (r, mut w) = tokio::io::split(server);
            let mut lines = BufReader::new(r).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(req["command"], json!(["get_property", "core-idle"]));
            let id = req["request_id"].as_u64().unwrap();
            // An unsolicited event first, then the reply.
            w.write_all(b"{\"event\":\"idle\"}\n").await.unwrap();
            let reply = json!({ "request_id": id, "error": "success", "data": false });
            w.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
        });

        assert!(!handle.core_idle().await.unwrap());
        server_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_request_is_forgotten() {
        let (client, server) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(client);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
        tokio::spawn(reader_task(BufReader::new(read_half), pending.clone()));
        let handle = MpvHandle {
            tx: cmd_tx,
            pending: pending.clone(),
        };

        // mpv reads the request but never answers.
        let _server_task = tokio::spawn(async move {
            let mut lines = BufReader::new(server).lines();
            while let Ok(Some(_)) = lines.next_line().await {}
        });

        let err = handle.core_idle().await.unwrap_err();
        assert!(err.to_string().contains("timeout"));
        assert!(pending.lock().await.is_empty());
    }
}
