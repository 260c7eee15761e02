//! 实例运行状态机
//!
//! ```text
//! Created ──load──▶ Configured ──start──▶ Running ──stop──▶ Stopped
//!                      ▲  │ load                               │
//!                      └──┘◀──────────────load─────────────────┘
//! ```

use std::fmt;

use serde::Serialize;

use crate::common::error::{BridgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Created,
    Configured,
    Running,
    Stopped,
}

impl RunState {
    pub fn is_running(self) -> bool {
        self == RunState::Running
    }

    /// 运行中不允许重新加载配置
    pub fn check_load(self) -> Result<()> {
        match self {
            RunState::Running => Err(BridgeError::AlreadyRunning),
            _ => Ok(()),
        }
    }

    pub fn check_start(self) -> Result<()> {
        match self {
            RunState::Configured => Ok(()),
            RunState::Running => Err(BridgeError::AlreadyRunning),
            RunState::Created | RunState::Stopped => Err(BridgeError::NotConfigured),
        }
    }

    /// stop / get_stats 共用
    pub fn check_running(self) -> Result<()> {
        match self {
            RunState::Running => Ok(()),
            _ => Err(BridgeError::NotRunning),
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Created => "created",
            RunState::Configured => "configured",
            RunState::Running => "running",
            RunState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_legal_everywhere_but_running() {
        assert!(RunState::Created.check_load().is_ok());
        assert!(RunState::Configured.check_load().is_ok());
        assert!(RunState::Stopped.check_load().is_ok());
        assert!(matches!(
            RunState::Running.check_load(),
            Err(BridgeError::AlreadyRunning)
        ));
    }

    #[test]
    fn start_only_from_configured() {
        assert!(RunState::Configured.check_start().is_ok());
        assert!(matches!(
            RunState::Created.check_start(),
            Err(BridgeError::NotConfigured)
        ));
        assert!(matches!(
            RunState::Stopped.check_start(),
            Err(BridgeError::NotConfigured)
        ));
        assert!(matches!(
            RunState::Running.check_start(),
            Err(BridgeError::AlreadyRunning)
        ));
    }

    #[test]
    fn stop_only_from_running() {
        assert!(RunState::Running.check_running().is_ok());
        for s in [RunState::Created, RunState::Configured, RunState::Stopped] {
            assert!(matches!(s.check_running(), Err(BridgeError::NotRunning)));
        }
    }
}
