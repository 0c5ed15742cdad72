use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check it in `Hello` and may refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame body.  Anything larger is treated as a
/// corrupt stream rather than buffered.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Messages sent from a client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd")]
pub enum Command {
    Select { station_id: String },
    Toggle,
    Stop,
    Next,
    Prev,
    Random,
    Volume { value: f32 },
    /// `duration_ms == 0` cancels a running timer.
    SleepTimer { duration_ms: u64 },
    ToggleFavorite { station_id: String },
    ToggleGroup { group_id: String },
    SetAlarm { hour: u32, minute: u32, station_id: String },
    CancelAlarm,
    ReloadCatalog,
    GetState,
}

/// Messages sent from the daemon to clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full state snapshot.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        state: SessionState,
    },
    State {
        data: SessionState,
    },
    /// Short user-facing message ("Stream not available for …").
    Toast {
        message: String,
    },
    Log {
        message: String,
    },
}

/// Last known playback state of the engine as seen by the session controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing,
    Paused,
    /// Play was requested but the engine is not audible yet.
    Buffering,
    Error,
    /// The selected station has no usable stream URL.
    NoStream,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Station {
    pub id: String,
    pub name: String,
    pub stream_url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default)]
    pub is_favorite: bool,
}

impl Station {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        stream_url: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            stream_url: stream_url.into(),
            description: description.into(),
            logo: None,
            is_favorite: false,
        }
    }

    /// A station is playable iff its URL is non-blank and uses http(s).
    pub fn is_valid_url(&self) -> bool {
        !self.stream_url.trim().is_empty()
            && (self.stream_url.starts_with("http://") || self.stream_url.starts_with("https://"))
    }
}

/// Stations sharing a base name, e.g. "News (North)" and "News (South)".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StationGroup {
    pub id: String,
    pub name: String,
    pub stations: Vec<Station>,
    #[serde(default)]
    pub logo: Option<String>,
    /// UI-only; never persisted.
    #[serde(default)]
    pub expanded: bool,
}

impl StationGroup {
    pub fn has_favorite(&self) -> bool {
        self.stations.iter().any(|s| s.is_favorite)
    }
}

/// One row of the catalog as presented to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CatalogEntry {
    Station(Station),
    Group(StationGroup),
}

impl CatalogEntry {
    pub fn id(&self) -> &str {
        match self {
            CatalogEntry::Station(s) => &s.id,
            CatalogEntry::Group(g) => &g.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CatalogEntry::Station(s) => &s.name,
            CatalogEntry::Group(g) => &g.name,
        }
    }

    pub fn is_favorite(&self) -> bool {
        match self {
            CatalogEntry::Station(s) => s.is_favorite,
            CatalogEntry::Group(g) => g.has_favorite(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SleepTimerStatus {
    pub active: bool,
    pub remaining_ms: u64,
}

/// A daily wake-up: play `station_id` at the next local hh:mm.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlarmSetting {
    pub hour: u32,
    pub minute: u32,
    pub station_id: String,
    /// Name and stream of the station when the alarm was set.  Catalog ids
    /// are positional, so a reload can point `station_id` elsewhere.
    #[serde(default)]
    pub station_name: String,
    #[serde(default)]
    pub stream_url: String,
    /// Wall-clock instant the armed one-shot fires at.
    #[serde(default)]
    pub fires_at_epoch_ms: Option<i64>,
}

/// Full observable state of the session.  `rev` increases on every change;
/// clients can use it to detect missed updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionState {
    #[serde(default)]
    pub rev: u64,
    pub catalog: Vec<CatalogEntry>,
    pub current: Option<Station>,
    pub playback: PlaybackState,
    pub volume: f32,
    pub track_title: Option<String>,
    #[serde(default)]
    pub sleep_timer: SleepTimerStatus,
    #[serde(default)]
    pub alarm: Option<AlarmSetting>,
}

impl SessionState {
    /// Catalog with groups expanded into their members, in display order.
    pub fn flat_stations(&self) -> Vec<&Station> {
        crate::catalog::flatten(&self.catalog)
    }
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    /// Frame as a 4-byte big-endian length followed by the JSON body.
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = u32::try_from(json.len())?;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Decode one frame from the front of `data`.  Returns `Ok(None)` while the
    /// frame is still incomplete, otherwise the message and the bytes consumed.
    pub fn decode(data: &[u8]) -> anyhow::Result<Option<(Self, usize)>> {
        if data.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len > MAX_FRAME_LEN {
            anyhow::bail!("frame of {} bytes exceeds limit", len);
        }
        if data.len() < 4 + len {
            return Ok(None);
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok(Some((msg, 4 + len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_url() {
        let mut s = Station::new("1", "Test", "https://example.com/a.mp3", "");
        assert!(s.is_valid_url());
        s.stream_url = "http://example.com".into();
        assert!(s.is_valid_url());
        s.stream_url = "   ".into();
        assert!(!s.is_valid_url());
        s.stream_url = "".into();
        assert!(!s.is_valid_url());
        s.stream_url = "ftp://example.com/a.mp3".into();
        assert!(!s.is_valid_url());
        s.stream_url = "example.com/http://".into();
        assert!(!s.is_valid_url());
    }

    #[test]
    fn test_command_frame() {
        let msg = Message::Command(Command::Select {
            station_id: "station_3".into(),
        });
        let encoded = msg.encode().unwrap();
        let (decoded, len) = Message::decode(&encoded).unwrap().unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(Command::Select { station_id }) => assert_eq!(station_id, "station_3"),
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_partial_frame_waits() {
        let encoded = Message::Command(Command::Toggle).encode().unwrap();
        assert!(Message::decode(&encoded[..2]).unwrap().is_none());
        assert!(Message::decode(&encoded[..encoded.len() - 1])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        assert!(Message::decode(&len).is_err());
    }

    #[test]
    fn test_hello_carries_catalog() {
        let state = SessionState {
            rev: 42,
            catalog: vec![CatalogEntry::Group(StationGroup {
                id: "group_Radio".into(),
                name: "Radio".into(),
                stations: vec![Station::new("a", "Radio (North)", "https://a", "")],
                logo: None,
                expanded: false,
            })],
            ..Default::default()
        };
        let msg = Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            daemon_rev: 42,
            state,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap().unwrap();
        match decoded {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                daemon_rev,
                state,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(daemon_rev, 42);
                assert_eq!(state.flat_stations().len(), 1);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }
}
