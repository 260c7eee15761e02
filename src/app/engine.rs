//! 代理引擎实例
//!
//! 真正的协议引擎由宿主链接进来，这里只定义它需要满足的接口，
//! 并围绕它维护配置加载、启动、停止和统计的状态机。

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::asset_manager::AssetManager;
use super::lifecycle::RunState;
use crate::common::error::{BridgeError, Result};
use crate::config::{self, ProxyConfiguration};

/// 引擎读取数据文件目录的环境变量
pub const ASSET_LOCATION_ENV: &str = "XRAY_LOCATION_ASSET";

const UPLINK_COUNTER: &str = "inbound>>>traffic>>>uplink";
const DOWNLINK_COUNTER: &str = "inbound>>>traffic>>>downlink";

/// 代理引擎：由配置构建一个可启动的会话
pub trait Engine: Send + Sync {
    fn build(&self, config: &ProxyConfiguration) -> Result<Box<dyn EngineSession>>;
}

/// 一次构建出的引擎会话
pub trait EngineSession: Send {
    /// 阻塞到引擎就绪
    fn start(&mut self) -> Result<()>;
    /// 阻塞到引擎关闭
    fn stop(&mut self) -> Result<()>;
    /// 读取命名计数器；未启用统计时返回 `None`
    fn counter(&self, name: &str) -> Option<u64>;
}

/// 未链接任何引擎时的占位实现
pub struct UnlinkedEngine;

impl Engine for UnlinkedEngine {
    fn build(&self, _config: &ProxyConfiguration) -> Result<Box<dyn EngineSession>> {
        Err(BridgeError::Engine("no engine backend linked".into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Traffic {
    pub uplink: u64,
    pub downlink: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub running: bool,
    pub status: &'static str,
    /// 运行秒数，带小数
    pub uptime: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic: Option<Traffic>,
}

struct EngineInner {
    state: RunState,
    config: Option<ProxyConfiguration>,
    session: Option<Box<dyn EngineSession>>,
    started_at: Option<Instant>,
    assets: Option<Arc<AssetManager>>,
}

pub struct EngineInstance {
    engine: Arc<dyn Engine>,
    inner: Mutex<EngineInner>,
}

impl EngineInstance {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            inner: Mutex::new(EngineInner {
                state: RunState::Created,
                config: None,
                session: None,
                started_at: None,
                assets: None,
            }),
        }
    }

    pub fn state(&self) -> RunState {
        // 锁中毒时状态本身仍然有效
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// 加载 JSON / YAML 配置文本
    pub fn load_config(&self, text: &str) -> Result<()> {
        self.load_configuration(config::parse_config(text)?)
    }

    pub fn load_config_from_file(&self, path: impl AsRef<Path>) -> Result<()> {
        self.load_configuration(config::load_config_file(path)?)
    }

    pub fn load_configuration(&self, config: ProxyConfiguration) -> Result<()> {
        config.validate()?;
        let mut inner = self.inner.lock()?;
        inner.state.check_load()?;
        debug!(
            inbounds = config.inbounds.len(),
            outbounds = config.outbounds.len(),
            "engine config loaded"
        );
        inner.config = Some(config);
        inner.state = RunState::Configured;
        Ok(())
    }

    /// 只解析校验，不改变任何实例状态
    pub fn test_config(text: &str) -> Result<()> {
        config::parse_config(text).map(|_| ())
    }

    pub fn attach_assets(&self, assets: Arc<AssetManager>) -> Result<()> {
        let mut inner = self.inner.lock()?;
        debug!(dir = %assets.base_dir().display(), "asset manager attached");
        inner.assets = Some(assets);
        Ok(())
    }

    /// 启动失败时实例保持 Configured
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.state.check_start()?;
        let config = inner.config.as_ref().ok_or(BridgeError::NotConfigured)?;

        if let Some(assets) = inner.assets.as_ref().filter(|a| a.has_any()) {
            std::env::set_var(ASSET_LOCATION_ENV, assets.base_dir());
            debug!(dir = %assets.base_dir().display(), "asset location published");
        }

        let mut session = self.engine.build(config)?;
        if let Err(e) = session.start() {
            warn!(error = %e, "engine failed to start");
            return Err(e);
        }

        inner.session = Some(session);
        inner.started_at = Some(Instant::now());
        inner.state = RunState::Running;
        info!("engine started");
        Ok(())
    }

    /// 停止失败时会话放回，实例保持 Running
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.state.check_running()?;
        let mut session = inner
            .session
            .take()
            .ok_or_else(|| BridgeError::Internal("running engine without session".into()))?;
        if let Err(e) = session.stop() {
            warn!(error = %e, "engine failed to stop");
            inner.session = Some(session);
            return Err(e);
        }
        inner.started_at = None;
        inner.state = RunState::Stopped;
        info!("engine stopped");
        Ok(())
    }

    pub fn stats(&self) -> Result<EngineStats> {
        let inner = self.inner.lock()?;
        inner.state.check_running()?;
        let uptime = inner
            .started_at
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let traffic = inner.session.as_ref().and_then(|s| {
            let up = s.counter(UPLINK_COUNTER);
            let down = s.counter(DOWNLINK_COUNTER);
            if up.is_none() && down.is_none() {
                return None;
            }
            Some(Traffic {
                uplink: up.unwrap_or(0),
                downlink: down.unwrap_or(0),
            })
        });
        Ok(EngineStats {
            running: true,
            status: "ok",
            uptime,
            traffic,
        })
    }
}
