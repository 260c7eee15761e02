//! 句柄注册表
//!
//! 跨边界的调用方拿不到 Rust 引用，只能持有一个 64 位整数句柄。每类实例一张表，
//! 表本身由读写锁保护（查找并发、插入删除独占）；所有表共用一个单调递增计数器，
//! 不同类型的句柄永不重复，删除后的句柄也不会被复用。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use super::asset_manager::AssetManager;
use super::engine::{Engine, EngineInstance, UnlinkedEngine};
use super::relay::{Relay, RelayInstance, UnlinkedRelay};
use super::vpn::VpnManager;
use crate::common::error::{BridgeError, Result};

pub type Handle = i64;

/// 宿主链接进来的引擎与网络栈实现
#[derive(Clone)]
pub struct Backends {
    pub engine: Arc<dyn Engine>,
    pub relay: Arc<dyn Relay>,
}

impl Backends {
    pub fn new(engine: Arc<dyn Engine>, relay: Arc<dyn Relay>) -> Self {
        Self { engine, relay }
    }
}

impl Default for Backends {
    fn default() -> Self {
        Self {
            engine: Arc::new(UnlinkedEngine),
            relay: Arc::new(UnlinkedRelay),
        }
    }
}

/// 可被注册表在删除前强制停止的实例
pub trait Stoppable {
    fn is_running(&self) -> bool;
    fn stop(&self) -> Result<()>;
}

impl Stoppable for EngineInstance {
    fn is_running(&self) -> bool {
        EngineInstance::is_running(self)
    }
    fn stop(&self) -> Result<()> {
        EngineInstance::stop(self)
    }
}

impl Stoppable for RelayInstance {
    fn is_running(&self) -> bool {
        RelayInstance::is_running(self)
    }
    fn stop(&self) -> Result<()> {
        RelayInstance::stop(self)
    }
}

impl Stoppable for VpnManager {
    fn is_running(&self) -> bool {
        VpnManager::is_running(self)
    }
    fn stop(&self) -> Result<()> {
        VpnManager::stop(self)
    }
}

/// 资源管理器没有运行态，删除时无需停止
impl Stoppable for AssetManager {
    fn is_running(&self) -> bool {
        false
    }
    fn stop(&self) -> Result<()> {
        Ok(())
    }
}

pub struct HandleTable<T> {
    entries: RwLock<HashMap<Handle, Arc<T>>>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Stoppable> HandleTable<T> {
    fn insert(&self, handle: Handle, value: T) -> Result<()> {
        self.entries.write()?.insert(handle, Arc::new(value));
        Ok(())
    }

    pub fn get(&self, handle: Handle) -> Result<Arc<T>> {
        self.entries
            .read()?
            .get(&handle)
            .cloned()
            .ok_or(BridgeError::HandleNotFound(handle))
    }

    /// 持写锁完成“停止 + 移除”，期间其他查找被挡住；停止失败时保留条目
    pub fn remove(&self, handle: Handle) -> Result<()> {
        let mut entries = self.entries.write()?;
        let value = entries
            .get(&handle)
            .ok_or(BridgeError::HandleNotFound(handle))?;
        if value.is_running() {
            value.stop()?;
        }
        entries.remove(&handle);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Registry {
    backends: Backends,
    next_handle: AtomicI64,
    engines: HandleTable<EngineInstance>,
    relays: HandleTable<RelayInstance>,
    assets: HandleTable<AssetManager>,
    vpns: HandleTable<VpnManager>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(Backends::default())
    }
}

impl Registry {
    pub fn new(backends: Backends) -> Self {
        Self {
            backends,
            next_handle: AtomicI64::new(1),
            engines: HandleTable::default(),
            relays: HandleTable::default(),
            assets: HandleTable::default(),
            vpns: HandleTable::default(),
        }
    }

    fn allocate(&self) -> Handle {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    // ─── engine ───

    pub fn new_engine(&self) -> Result<Handle> {
        let handle = self.allocate();
        self.engines
            .insert(handle, EngineInstance::new(self.backends.engine.clone()))?;
        debug!(handle, "engine instance created");
        Ok(handle)
    }

    pub fn engine(&self, handle: Handle) -> Result<Arc<EngineInstance>> {
        self.engines.get(handle)
    }

    pub fn delete_engine(&self, handle: Handle) -> Result<()> {
        self.engines.remove(handle)?;
        info!(handle, "engine instance deleted");
        Ok(())
    }

    /// 把资源管理器挂到引擎上，启动时据此发布数据文件目录
    pub fn attach_assets(&self, engine: Handle, assets: Handle) -> Result<()> {
        let manager = self.assets.get(assets)?;
        self.engines.get(engine)?.attach_assets(manager)
    }

    // ─── relay ───

    pub fn new_relay(&self) -> Result<Handle> {
        let handle = self.allocate();
        self.relays
            .insert(handle, RelayInstance::new(self.backends.relay.clone()))?;
        debug!(handle, "relay instance created");
        Ok(handle)
    }

    pub fn relay(&self, handle: Handle) -> Result<Arc<RelayInstance>> {
        self.relays.get(handle)
    }

    pub fn delete_relay(&self, handle: Handle) -> Result<()> {
        self.relays.remove(handle)?;
        info!(handle, "relay instance deleted");
        Ok(())
    }

    // ─── asset manager ───

    pub fn new_asset_manager(&self, base_dir: impl Into<PathBuf>) -> Result<Handle> {
        let manager = AssetManager::new(base_dir)?;
        let handle = self.allocate();
        self.assets.insert(handle, manager)?;
        debug!(handle, "asset manager created");
        Ok(handle)
    }

    pub fn asset_manager(&self, handle: Handle) -> Result<Arc<AssetManager>> {
        self.assets.get(handle)
    }

    pub fn delete_asset_manager(&self, handle: Handle) -> Result<()> {
        self.assets.remove(handle)?;
        info!(handle, "asset manager deleted");
        Ok(())
    }

    // ─── vpn ───

    pub fn new_vpn(&self, engine: Handle) -> Result<Handle> {
        let engine = self.engines.get(engine)?;
        let handle = self.allocate();
        self.vpns
            .insert(handle, VpnManager::new(engine, self.backends.relay.clone()))?;
        debug!(handle, "vpn manager created");
        Ok(handle)
    }

    pub fn vpn(&self, handle: Handle) -> Result<Arc<VpnManager>> {
        self.vpns.get(handle)
    }

    pub fn delete_vpn(&self, handle: Handle) -> Result<()> {
        self.vpns.remove(handle)?;
        info!(handle, "vpn manager deleted");
        Ok(())
    }

    pub fn instance_count(&self) -> usize {
        self.engines.len() + self.relays.len() + self.assets.len() + self.vpns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_unique_across_tables() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::default();
        let e = reg.new_engine().unwrap();
        let r = reg.new_relay().unwrap();
        let a = reg.new_asset_manager(dir.path()).unwrap();
        let v = reg.new_vpn(e).unwrap();
        let mut all = vec![e, r, a, v];
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 4);
        assert!(all.iter().all(|h| *h > 0));
        assert_eq!(reg.instance_count(), 4);
    }

    #[test]
    fn handle_of_one_kind_is_unknown_to_another() {
        let reg = Registry::default();
        let e = reg.new_engine().unwrap();
        assert!(matches!(reg.relay(e), Err(BridgeError::HandleNotFound(h)) if h == e));
    }

    #[test]
    fn deleted_handle_is_gone_and_not_reused() {
        let reg = Registry::default();
        let first = reg.new_engine().unwrap();
        reg.delete_engine(first).unwrap();
        assert!(matches!(reg.engine(first), Err(BridgeError::HandleNotFound(_))));
        assert!(matches!(reg.delete_engine(first), Err(BridgeError::HandleNotFound(_))));
        let second = reg.new_engine().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn vpn_requires_existing_engine() {
        let reg = Registry::default();
        assert!(matches!(reg.new_vpn(999), Err(BridgeError::HandleNotFound(999))));
    }

    #[test]
    fn attach_assets_checks_both_handles() {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::default();
        let e = reg.new_engine().unwrap();
        let a = reg.new_asset_manager(dir.path()).unwrap();
        reg.attach_assets(e, a).unwrap();
        assert!(matches!(reg.attach_assets(e, 12345), Err(BridgeError::HandleNotFound(12345))));
        assert!(matches!(reg.attach_assets(12345, a), Err(BridgeError::HandleNotFound(12345))));
    }
}
