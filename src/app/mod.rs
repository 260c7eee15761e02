//! 实例生命周期：引擎、TUN 转发、VPN 与资源文件，全部经由句柄注册表对外暴露。

pub mod asset_manager;
pub mod engine;
pub mod ffi;
pub mod lifecycle;
pub mod log_callback;
pub mod registry;
pub mod relay;
pub mod vpn;

pub use asset_manager::{AssetInfo, AssetKind, AssetManager, DownloadProgress, DownloadStatus};
pub use engine::{Engine, EngineInstance, EngineSession, EngineStats};
pub use lifecycle::RunState;
pub use registry::{Backends, Handle, Registry};
pub use relay::{Relay, RelayConfig, RelayDevice, RelayInstance, RelayStats, TrafficDelta};
pub use vpn::{VpnConfig, VpnManager, VpnStats};
