//! Configuration: JSON-file-or-default loading, per §6 "recognised
//! options". Grounded on `knightofdemons-a9-v720/src/config.rs`'s
//! `load`/`Default`/`save` pattern.

use std::fs;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

fn default_device_tcp_host() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_device_tcp_host")]
    pub device_tcp_host: String,
    #[serde(default = "default_device_tcp_port")]
    pub device_tcp_port: u16,
    #[serde(default = "default_device_udp_port")]
    pub device_udp_port: u16,
    #[serde(default)]
    pub aux_udp_ports: Vec<u16>,

    #[serde(default)]
    pub video_server_ip: Option<String>,
    #[serde(default = "default_video_tcp_port")]
    pub video_tcp_port: u16,
    #[serde(default = "default_video_udp_port")]
    pub video_udp_port: u16,
    #[serde(default)]
    pub try_video_list_first: bool,

    #[serde(default = "default_message_idle_timeout_s")]
    pub message_idle_timeout_s: u64,
    #[serde(default = "default_list_buffer_timeout_s")]
    pub list_buffer_timeout_s: u64,
    #[serde(default = "default_frame_chain_timeout_s")]
    pub frame_chain_timeout_s: u64,
    #[serde(default = "default_video_nego_timeout_s")]
    pub video_nego_timeout_s: u64,
    #[serde(default = "default_query_cooldown_s")]
    pub query_cooldown_s: u64,

    #[serde(default = "default_max_device_connections")]
    pub max_device_connections: usize,
}

fn default_device_tcp_port() -> u16 {
    2222
}
fn default_device_udp_port() -> u16 {
    2221
}
fn default_video_tcp_port() -> u16 {
    2222
}
fn default_video_udp_port() -> u16 {
    2221
}
fn default_message_idle_timeout_s() -> u64 {
    300
}
fn default_list_buffer_timeout_s() -> u64 {
    10
}
fn default_frame_chain_timeout_s() -> u64 {
    5
}
fn default_video_nego_timeout_s() -> u64 {
    5
}
fn default_query_cooldown_s() -> u64 {
    30
}
fn default_max_device_connections() -> usize {
    1000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_tcp_host: default_device_tcp_host(),
            device_tcp_port: default_device_tcp_port(),
            device_udp_port: default_device_udp_port(),
            aux_udp_ports: Vec::new(),
            video_server_ip: None,
            video_tcp_port: default_video_tcp_port(),
            video_udp_port: default_video_udp_port(),
            try_video_list_first: false,
            message_idle_timeout_s: default_message_idle_timeout_s(),
            list_buffer_timeout_s: default_list_buffer_timeout_s(),
            frame_chain_timeout_s: default_frame_chain_timeout_s(),
            video_nego_timeout_s: default_video_nego_timeout_s(),
            query_cooldown_s: default_query_cooldown_s(),
            max_device_connections: default_max_device_connections(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &str) -> Result<Self> {
        if let Ok(config_str) = fs::read_to_string(path) {
            let mut config: AppConfig = serde_json::from_str(&config_str)?;
            config.dedup_udp_ports();
            return Ok(config);
        }

        tracing::warn!(path, "config file not found, using default configuration");
        Ok(AppConfig::default())
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let config_str = serde_json::to_string_pretty(self)?;
        fs::write(path, config_str)?;
        Ok(())
    }

    fn dedup_udp_ports(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.aux_udp_ports.retain(|p| seen.insert(*p));
    }

    pub fn video_server_ip_octets(&self) -> Option<[u8; 4]> {
        let ip = self.video_server_ip.as_ref()?;
        let addr: std::net::Ipv4Addr = ip.parse().ok()?;
        Some(addr.octets())
    }

    pub fn duration_message_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.message_idle_timeout_s)
    }
    pub fn duration_list_buffer_timeout(&self) -> Duration {
        Duration::from_secs(self.list_buffer_timeout_s)
    }
    pub fn duration_frame_chain_timeout(&self) -> Duration {
        Duration::from_secs(self.frame_chain_timeout_s)
    }
    pub fn duration_video_nego_timeout(&self) -> Duration {
        Duration::from_secs(self.video_nego_timeout_s)
    }
    pub fn duration_query_cooldown(&self) -> Duration {
        Duration::from_secs(self.query_cooldown_s)
    }
}
