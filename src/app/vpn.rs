//! VPN 管理：把宿主交来的 TUN fd 接到本地引擎的 SOCKS 入站上。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::engine::EngineInstance;
use super::lifecycle::RunState;
use super::relay::{Relay, RelayConfig, RelayInstance};
use crate::common::error::{BridgeError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnConfig {
    #[serde(rename = "tunFd")]
    pub tun_fd: i32,
    #[serde(rename = "tunMTU", default = "default_mtu")]
    pub tun_mtu: u16,
    #[serde(rename = "socksAddr")]
    pub socks_addr: String,
    #[serde(rename = "dnsServers", default = "default_dns_servers")]
    pub dns_servers: Vec<String>,
    #[serde(rename = "fakeDNS", default)]
    pub fake_dns: bool,
    #[serde(default)]
    pub udp: bool,
    #[serde(rename = "tcpConcurrent", default)]
    pub tcp_concurrent: bool,
}

fn default_mtu() -> u16 {
    1500
}

fn default_dns_servers() -> Vec<String> {
    vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()]
}

impl VpnConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let mut config: VpnConfig = serde_json::from_str(text)?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_defaults(&mut self) {
        if self.tun_mtu == 0 {
            self.tun_mtu = default_mtu();
        }
        if self.dns_servers.is_empty() {
            self.dns_servers = default_dns_servers();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tun_fd <= 0 {
            return Err(BridgeError::InvalidConfig(format!(
                "invalid TUN file descriptor: {}",
                self.tun_fd
            )));
        }
        if self.socks_addr.is_empty() {
            return Err(BridgeError::InvalidConfig("SOCKS address is required".into()));
        }
        Ok(())
    }

    /// 转换为 relay 配置；首个 DNS 服务器缺端口时补 53
    pub fn relay_config(&self) -> RelayConfig {
        let mut relay = RelayConfig::new(self.tun_fd, self.socks_addr.clone());
        relay.mtu = self.tun_mtu;
        relay.fake_dns = self.fake_dns;
        if let Some(dns) = self.dns_servers.first() {
            relay.dns_addr = if dns.parse::<std::net::SocketAddr>().is_ok() {
                dns.clone()
            } else if dns.contains(':') {
                // 裸 IPv6
                format!("[{dns}]:53")
            } else {
                format!("{dns}:53")
            };
        }
        relay
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VpnStats {
    pub running: bool,
    #[serde(rename = "socksAddr")]
    pub socks_addr: String,
    pub mtu: u16,
    #[serde(rename = "engineRunning")]
    pub engine_running: bool,
    #[serde(rename = "bytesUp")]
    pub bytes_up: u64,
    #[serde(rename = "bytesDown")]
    pub bytes_down: u64,
}

struct VpnInner {
    state: RunState,
    config: Option<VpnConfig>,
    relay: Option<RelayInstance>,
}

pub struct VpnManager {
    engine: Arc<EngineInstance>,
    relay_backend: Arc<dyn Relay>,
    inner: Mutex<VpnInner>,
}

impl VpnManager {
    pub fn new(engine: Arc<EngineInstance>, relay_backend: Arc<dyn Relay>) -> Self {
        Self {
            engine,
            relay_backend,
            inner: Mutex::new(VpnInner {
                state: RunState::Created,
                config: None,
                relay: None,
            }),
        }
    }

    pub fn engine(&self) -> &Arc<EngineInstance> {
        &self.engine
    }

    /// relay 已自行退出时同步为 Stopped
    fn lock(&self) -> MutexGuard<'_, VpnInner> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let relay_exited = inner.state.is_running()
            && inner.relay.as_ref().is_some_and(|r| !r.is_running());
        if relay_exited {
            warn!("vpn relay exited, vpn stopped");
            inner.relay = None;
            inner.state = RunState::Stopped;
        }
        inner
    }

    pub fn is_running(&self) -> bool {
        self.lock().state.is_running()
    }

    /// 配置随启动一并提交，相当于 load + start
    pub fn start(&self, config_json: &str) -> Result<()> {
        let config = VpnConfig::from_json(config_json)?;
        let mut inner = self.lock();
        inner.state.check_load()?;

        let relay = RelayInstance::new(self.relay_backend.clone());
        relay.load_configuration(config.relay_config())?;
        relay.start()?;

        if !self.engine.is_running() {
            warn!("vpn started while engine is not running");
        }
        info!(
            fd = config.tun_fd,
            mtu = config.tun_mtu,
            socks = config.socks_addr.as_str(),
            udp = config.udp,
            "vpn started"
        );
        inner.config = Some(config);
        inner.relay = Some(relay);
        inner.state = RunState::Running;
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.state.check_running()?;
        let relay = inner
            .relay
            .take()
            .ok_or_else(|| BridgeError::Internal("running vpn without relay".into()))?;
        inner.state = RunState::Stopped;
        relay.stop()?;
        info!("vpn stopped");
        Ok(())
    }

    pub fn stats(&self) -> Result<VpnStats> {
        let inner = self.lock();
        inner.state.check_running()?;
        let (config, relay) = match (&inner.config, &inner.relay) {
            (Some(c), Some(r)) => (c, r),
            _ => return Err(BridgeError::Internal("running vpn without relay".into())),
        };
        let relay_stats = relay.stats()?;
        Ok(VpnStats {
            running: true,
            socks_addr: config.socks_addr.clone(),
            mtu: config.tun_mtu,
            engine_running: self.engine.is_running(),
            bytes_up: relay_stats.bytes_up,
            bytes_down: relay_stats.bytes_down,
        })
    }
}
