//! TUN → SOCKS 转发实例
//!
//! 设备由宿主提供的 [`Relay`] 打开；启动后在独立 runtime 的阻塞线程上循环调用
//! [`RelayDevice::forward`]，每轮检查取消信号，停止时等待设备交还后关闭。
//! 转发出错时循环自行退出，实例在下一次被访问时回收设备并转入 Stopped。

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::lifecycle::RunState;
use crate::common::error::{BridgeError, Result};

const SOCKS_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const IDLE_BACKOFF: Duration = Duration::from_millis(10);

/// 打开 TUN 设备的宿主集成
pub trait Relay: Send + Sync {
    fn open(&self, fd: i32, mtu: u16) -> Result<Box<dyn RelayDevice>>;
}

/// 已打开的 TUN 设备
pub trait RelayDevice: Send {
    fn start(&mut self, config: &RelayConfig) -> Result<()>;
    /// 转发一轮并返回本轮字节数；必须在有限时间内返回
    fn forward(&mut self) -> Result<TrafficDelta>;
    fn stop(&mut self) -> Result<()>;
}

/// 未链接网络栈时的占位实现
pub struct UnlinkedRelay;

impl Relay for UnlinkedRelay {
    fn open(&self, _fd: i32, _mtu: u16) -> Result<Box<dyn RelayDevice>> {
        Err(BridgeError::Engine("no relay backend linked".into()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficDelta {
    pub up: u64,
    pub down: u64,
}

impl TrafficDelta {
    pub fn is_empty(&self) -> bool {
        self.up == 0 && self.down == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub tun_fd: i32,
    pub socks_addr: String,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    #[serde(default = "default_dns_addr")]
    pub dns_addr: String,
    #[serde(default)]
    pub fake_dns: bool,
}

fn default_mtu() -> u16 {
    1500
}

fn default_dns_addr() -> String {
    "8.8.8.8:53".to_string()
}

impl RelayConfig {
    pub fn new(tun_fd: i32, socks_addr: impl Into<String>) -> Self {
        Self {
            tun_fd,
            socks_addr: socks_addr.into(),
            mtu: default_mtu(),
            dns_addr: default_dns_addr(),
            fake_dns: false,
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let mut config: RelayConfig = serde_json::from_str(text)?;
        config.apply_defaults();
        Ok(config)
    }

    /// 零值字段回落到默认值
    pub fn apply_defaults(&mut self) {
        if self.mtu == 0 {
            self.mtu = default_mtu();
        }
        if self.dns_addr.is_empty() {
            self.dns_addr = default_dns_addr();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tun_fd < 0 {
            return Err(BridgeError::InvalidConfig(format!(
                "invalid TUN file descriptor: {}",
                self.tun_fd
            )));
        }
        if self.socks_addr.is_empty() {
            return Err(BridgeError::InvalidConfig("SOCKS5 address is required".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct TrafficCounters {
    up: AtomicU64,
    down: AtomicU64,
}

impl TrafficCounters {
    pub fn add(&self, delta: TrafficDelta) {
        self.up.fetch_add(delta.up, Ordering::Relaxed);
        self.down.fetch_add(delta.down, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.up.load(Ordering::Relaxed),
            self.down.load(Ordering::Relaxed),
        )
    }

    pub fn reset(&self) {
        self.up.store(0, Ordering::Relaxed);
        self.down.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub running: bool,
    pub socks_addr: String,
    pub mtu: u16,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

/// 运行中的转发循环
struct Pump {
    runtime: tokio::runtime::Runtime,
    cancel: CancellationToken,
    exited: Arc<AtomicBool>,
    task: JoinHandle<Box<dyn RelayDevice>>,
}

impl Pump {
    fn runtime() -> Result<tokio::runtime::Runtime> {
        Ok(tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .thread_name("relay-pump")
            .build()?)
    }

    fn spawn(
        runtime: tokio::runtime::Runtime,
        mut device: Box<dyn RelayDevice>,
        counters: Arc<TrafficCounters>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let exited = Arc::new(AtomicBool::new(false));
        let token = cancel.clone();
        let flag = exited.clone();
        let task = runtime.spawn_blocking(move || {
            while !token.is_cancelled() {
                match device.forward() {
                    Ok(delta) if delta.is_empty() => std::thread::sleep(IDLE_BACKOFF),
                    Ok(delta) => counters.add(delta),
                    Err(e) => {
                        warn!(error = %e, "relay forward failed, pump exiting");
                        break;
                    }
                }
            }
            flag.store(true, Ordering::Release);
            device
        });
        Self {
            runtime,
            cancel,
            exited,
            task,
        }
    }

    /// 循环是否已自行退出
    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// 发出取消信号并等待设备交还
    fn finish(self) -> Result<Box<dyn RelayDevice>> {
        self.cancel.cancel();
        let device = self
            .runtime
            .block_on(self.task)
            .map_err(|e| BridgeError::Internal(format!("relay pump panicked: {e}")))?;
        self.runtime.shutdown_timeout(Duration::from_secs(1));
        Ok(device)
    }
}

struct RelayInner {
    state: RunState,
    config: Option<RelayConfig>,
    pump: Option<Pump>,
}

pub struct RelayInstance {
    relay: Arc<dyn Relay>,
    counters: Arc<TrafficCounters>,
    inner: Mutex<RelayInner>,
}

impl RelayInstance {
    pub fn new(relay: Arc<dyn Relay>) -> Self {
        Self {
            relay,
            counters: Arc::new(TrafficCounters::default()),
            inner: Mutex::new(RelayInner {
                state: RunState::Created,
                config: None,
                pump: None,
            }),
        }
    }

    /// 锁中毒时照常读取；转发循环已退出的实例在这里被回收
    fn lock(&self) -> MutexGuard<'_, RelayInner> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        reap_exited_pump(&mut inner);
        inner
    }

    pub fn state(&self) -> RunState {
        self.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn load_config(&self, text: &str) -> Result<()> {
        self.load_configuration(RelayConfig::from_json(text)?)
    }

    pub fn load_configuration(&self, mut config: RelayConfig) -> Result<()> {
        config.apply_defaults();
        let mut inner = self.lock();
        inner.state.check_load()?;
        inner.config = Some(config);
        inner.state = RunState::Configured;
        Ok(())
    }

    /// 任一步失败都保持 Configured；已打开的设备会被关闭
    pub fn start(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.state.check_start()?;
        let config = inner.config.clone().ok_or(BridgeError::NotConfigured)?;
        config.validate()?;
        check_socks_listening(&config.socks_addr)?;

        let runtime = Pump::runtime().map_err(|e| {
            warn!(error = %e, "failed to build relay runtime");
            e
        })?;
        let mut device = self.relay.open(config.tun_fd, config.mtu)?;
        if let Err(e) = device.start(&config) {
            warn!(error = %e, "relay device failed to start");
            if let Err(close_err) = device.stop() {
                debug!(error = %close_err, "closing unstarted relay device failed");
            }
            return Err(e);
        }
        let pump = Pump::spawn(runtime, device, self.counters.clone());

        info!(
            fd = config.tun_fd,
            mtu = config.mtu,
            socks = config.socks_addr.as_str(),
            "relay started"
        );
        inner.pump = Some(pump);
        inner.state = RunState::Running;
        Ok(())
    }

    /// 转发循环总会被收回；设备关闭失败时仍进入 Stopped 并返回错误
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.state.check_running()?;
        let pump = inner
            .pump
            .take()
            .ok_or_else(|| BridgeError::Internal("running relay without pump".into()))?;
        inner.state = RunState::Stopped;

        let mut device = pump.finish()?;
        device.stop()?;
        let (up, down) = self.counters.snapshot();
        info!(bytes_up = up, bytes_down = down, "relay stopped");
        Ok(())
    }

    pub fn reset_stats(&self) {
        self.counters.reset();
        debug!("relay counters reset");
    }

    pub fn stats(&self) -> Result<RelayStats> {
        let inner = self.lock();
        inner.state.check_running()?;
        let config = inner
            .config
            .as_ref()
            .ok_or_else(|| BridgeError::Internal("running relay without config".into()))?;
        let (bytes_up, bytes_down) = self.counters.snapshot();
        Ok(RelayStats {
            running: true,
            socks_addr: config.socks_addr.clone(),
            mtu: config.mtu,
            bytes_up,
            bytes_down,
        })
    }
}

impl Drop for RelayInstance {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(pump) = inner.pump.take() {
            if let Ok(mut device) = pump.finish() {
                let _ = device.stop();
            }
        }
    }
}

fn reap_exited_pump(inner: &mut RelayInner) {
    if !inner.pump.as_ref().is_some_and(Pump::has_exited) {
        return;
    }
    inner.state = RunState::Stopped;
    if let Some(pump) = inner.pump.take() {
        match pump.finish() {
            Ok(mut device) => {
                if let Err(e) = device.stop() {
                    debug!(error = %e, "closing exited relay device failed");
                }
            }
            Err(e) => warn!(error = %e, "failed to reclaim exited relay pump"),
        }
    }
    info!("relay pump exited, instance stopped");
}

/// 启动前确认 SOCKS 入站已在监听
fn check_socks_listening(addr: &str) -> Result<()> {
    let candidates = addr
        .to_socket_addrs()
        .map_err(|e| BridgeError::InvalidConfig(format!("bad SOCKS5 address '{addr}': {e}")))?;
    let mut last_err = None;
    for candidate in candidates {
        match TcpStream::connect_timeout(&candidate, SOCKS_CONNECT_TIMEOUT) {
            Ok(_) => return Ok(()),
            Err(e) => last_err = Some(e),
        }
    }
    Err(BridgeError::Transport(match last_err {
        Some(e) => format!("SOCKS5 proxy not available at {addr}: {e}"),
        None => format!("SOCKS5 address '{addr}' resolved to nothing"),
    }))
}
