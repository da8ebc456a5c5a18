use std::env;

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,
    #[serde(default)]
    pub signaling: Signaling,
    #[serde(default)]
    pub log: Log,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            signaling: Default::default(),
            log: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IceServer {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    pub fn validate(&self) -> anyhow::Result<()> {
        for url in self.urls.iter() {
            let scheme = url.split(':').next().unwrap_or("");
            match scheme {
                "stun" | "turn" | "turns" => {}
                _ => return Err(anyhow::anyhow!("invalid ice server url: {}", url)),
            }
        }
        Ok(())
    }
}

impl From<IceServer> for RTCIceServer {
    fn from(value: IceServer) -> Self {
        RTCIceServer {
            urls: value.urls,
            username: value.username,
            credential: value.credential,
            ..Default::default()
        }
    }
}

/// Polling and liveness intervals for the signaling layer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Signaling {
    /// Discovery poll interval, both sides.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Broadcaster heartbeat interval.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Viewer connection quality sampling interval.
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
    /// A presence record older than this window no longer counts as live.
    #[serde(default = "default_presence_window_secs")]
    pub presence_window_secs: u64,
}

impl Default for Signaling {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            stats_interval_ms: default_stats_interval_ms(),
            presence_window_secs: default_presence_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

fn default_stats_interval_ms() -> u64 {
    3000
}

fn default_presence_window_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    env::var("LOG_LEVEL").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    })
}

/// Two public STUN servers plus a shared-credential TURN relay as a fallback
/// for strict NATs. Reproduced from the original deployment, connectivity
/// success depends on it.
fn default_ice_servers() -> Vec<IceServer> {
    vec![
        IceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            username: "".to_string(),
            credential: "".to_string(),
        },
        IceServer {
            urls: vec![
                "turn:openrelay.metered.ca:80".to_string(),
                "turn:openrelay.metered.ca:443".to_string(),
                "turn:openrelay.metered.ca:443?transport=tcp".to_string(),
            ],
            username: "openrelayproject".to_string(),
            credential: "openrelayproject".to_string(),
        },
    ]
}

impl Config {
    /// Reads `<path>` if given, falling back to `livelink.toml` in the working
    /// directory, then `/etc/livelink/livelink.toml`, then built-in defaults.
    pub fn load(path: Option<String>) -> Self {
        use std::fs::read_to_string;
        let result = read_to_string(path.unwrap_or("livelink.toml".to_string()))
            .or(read_to_string("/etc/livelink/livelink.toml"))
            .unwrap_or("".to_string());
        toml::from_str(result.as_str()).expect("config parse error")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for ice_server in self.ice_servers.iter() {
            ice_server
                .validate()
                .map_err(|e| anyhow::anyhow!("ice_server error : {}", e))?;
        }
        if self.signaling.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("signaling.poll_interval_ms must be > 0"));
        }
        Ok(())
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers.clone().into_iter().map(|i| i.into()).collect()
    }
}
