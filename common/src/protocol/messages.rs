//! JSON control frames exchanged with a Sendspin server.
//!
//! Every frame carries a `type` discriminator. Client-to-server and
//! server-to-client frames are separate enums so each side only ever
//! serializes what it may legally send.

use serde::{Deserialize, Serialize};

/// Role a client may assume within a playback group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Renders audio in lockstep with the group.
    Player,

    /// May issue transport and volume commands for the group.
    Controller,
}

/// Transport action carried by an outbound `cmd` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportAction {
    Play,
    Pause,
    Stop,
    Next,
    Previous,
}

/// Command tag advertised by the server in `hello_ack` / `controller` frames.
///
/// Unknown tags deserialize to [`CommandTag::Other`] so a newer server never
/// breaks an older client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTag {
    Play,
    Pause,
    Stop,
    Next,
    Previous,
    Volume,
    Mute,
    Seek,
    Other,
}

impl CommandTag {
    // ---
    fn name(self) -> &'static str {
        // ---
        match self {
            CommandTag::Play => "play",
            CommandTag::Pause => "pause",
            CommandTag::Stop => "stop",
            CommandTag::Next => "next",
            CommandTag::Previous => "previous",
            CommandTag::Volume => "volume",
            CommandTag::Mute => "mute",
            CommandTag::Seek => "seek",
            CommandTag::Other => "other",
        }
    }

    fn from_name(name: &str) -> Self {
        // ---
        match name {
            "play" => CommandTag::Play,
            "pause" => CommandTag::Pause,
            "stop" => CommandTag::Stop,
            "next" => CommandTag::Next,
            "previous" => CommandTag::Previous,
            "volume" => CommandTag::Volume,
            "mute" => CommandTag::Mute,
            "seek" => CommandTag::Seek,
            _ => CommandTag::Other,
        }
    }
}

impl Serialize for CommandTag {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // ---
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for CommandTag {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // ---
        let name = String::deserialize(deserializer)?;
        Ok(CommandTag::from_name(&name))
    }
}

/// Group playback state carried by the `stream` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing,
    Paused,
    Stopped,
}

/// Active stream parameters for this playback group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    // ---
    /// Codec name, e.g. `"pcm"`, `"opus"` or `"flac"`.
    pub codec: String,

    /// Sample rate in Hz.
    pub sample_rate: u32,

    /// Interleaved channel count.
    pub channels: u16,

    /// Bits per sample of the decoded PCM.
    pub bit_depth: u16,

    /// Current group transport state.
    pub playback_state: PlaybackState,

    /// Name of the playback group this client joined.
    pub group_name: String,
}

/// Position within the current track, sampled at a known server time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackProgress {
    // ---
    /// Position at the sampling instant, milliseconds.
    pub position_ms: i64,

    /// Track duration in milliseconds; `0` when unknown.
    pub duration_ms: i64,

    /// Playback speed in thousandths (1000 = 1.0x, 0 = frozen).
    pub speed_milli: i64,
}

/// Repeat mode reported in metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    #[default]
    Off,
    One,
    All,
}

/// Now-playing metadata for the active track.
///
/// `timestamp_server_us` is the server-domain instant at which
/// `progress.position_ms` was sampled; live positions are extrapolated via
/// [`Metadata::position_ms_at`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Metadata {
    // ---
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album_artist: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_number: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<TrackProgress>,

    #[serde(default)]
    pub repeat_mode: RepeatMode,

    #[serde(default)]
    pub shuffle_enabled: bool,

    /// Server-domain time at which `progress` was sampled, microseconds.
    #[serde(rename = "server_ts_us", default)]
    pub timestamp_server_us: i64,
}

impl Metadata {
    // ---
    /// Extrapolates the track position to `server_now_us`.
    ///
    /// Position advances at `speed_milli / 1000` realtime and is clamped to
    /// `[0, duration_ms]` when the duration is known. A zero speed freezes
    /// the position at its sampled value. Returns `None` when the metadata
    /// carries no progress at all.
    pub fn position_ms_at(&self, server_now_us: i64) -> Option<i64> {
        // ---
        let progress = self.progress.as_ref()?;

        if progress.speed_milli == 0 {
            return Some(progress.position_ms);
        }

        let elapsed_ms = (server_now_us - self.timestamp_server_us) / 1_000;
        let mut position = progress.position_ms + elapsed_ms * progress.speed_milli / 1_000;

        if progress.duration_ms > 0 {
            position = position.clamp(0, progress.duration_ms);
        }

        Some(position)
    }
}

/// Controller-role state for the playback group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerState {
    // ---
    /// Group volume, 0-100.
    pub volume: u8,

    /// Group mute flag.
    pub muted: bool,

    /// Commands the server will accept from this client.
    pub supported_commands: Vec<CommandTag>,
}

/// Frames the client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opening handshake; the server answers with `hello_ack`.
    Hello {
        client_id: String,
        client_name: String,
        roles: Vec<Role>,
    },

    /// Clock probe; `t0_us` is the client's local transmit time.
    TimeProbe { t0_us: i64 },

    /// Group transport command.
    Cmd { action: TransportAction },

    /// Set the group volume (0-100).
    GroupVolume { volume: u8 },

    /// Set the group mute flag.
    GroupMute { muted: bool },

    /// Report this player's local volume back to the server.
    LocalVolume { volume: u8 },

    /// Report this player's local mute flag back to the server.
    LocalMute { muted: bool },

    /// Keepalive answer to a server `ping`.
    Pong,
}

/// Frames the server sends to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake acceptance; may carry the active stream immediately.
    HelloAck {
        group_name: String,
        #[serde(default)]
        supported_commands: Vec<CommandTag>,
        #[serde(default)]
        stream: Option<StreamDescriptor>,
    },

    /// Answer to a `time_probe`: the echoed `t0_us` plus server
    /// receive/transmit times.
    TimeProbeResponse { t0_us: i64, s1_us: i64, s2_us: i64 },

    /// New or updated stream parameters.
    Stream {
        #[serde(flatten)]
        descriptor: StreamDescriptor,
    },

    /// Now-playing metadata.
    Metadata {
        #[serde(flatten)]
        metadata: Metadata,
    },

    /// Controller-role group state.
    Controller {
        #[serde(flatten)]
        state: ControllerState,
    },

    /// Server-commanded local volume for this player.
    PlayerVolume { volume: u8 },

    /// Server-commanded local mute for this player.
    PlayerMute { muted: bool },

    /// Keepalive; the client answers with `pong`.
    Ping,
}
