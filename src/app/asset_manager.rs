//! GeoIP / GeoSite 数据文件管理
//!
//! 每类文件同一时刻最多一个下载任务；下载写入 `<file>.tmp`，完成后原子重命名。

use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_LENGTH, LAST_MODIFIED};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::common::error::{BridgeError, Result};

const DEFAULT_GEOIP_URL: &str =
    "https://github.com/Loyalsoldier/v2ray-rules-dat/releases/latest/download/geoip.dat";
const DEFAULT_GEOSITE_URL: &str =
    "https://github.com/Loyalsoldier/v2ray-rules-dat/releases/latest/download/geosite.dat";

/// 小于此大小的文件视为损坏
const MIN_VALID_SIZE: u64 = 1024;
const CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    GeoIp,
    GeoSite,
}

impl AssetKind {
    pub const ALL: [AssetKind; 2] = [AssetKind::GeoIp, AssetKind::GeoSite];

    pub fn as_str(self) -> &'static str {
        match self {
            AssetKind::GeoIp => "geoip",
            AssetKind::GeoSite => "geosite",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            AssetKind::GeoIp => "geoip.dat",
            AssetKind::GeoSite => "geosite.dat",
        }
    }

    pub fn default_url(self) -> &'static str {
        match self {
            AssetKind::GeoIp => DEFAULT_GEOIP_URL,
            AssetKind::GeoSite => DEFAULT_GEOSITE_URL,
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "geoip" => Ok(AssetKind::GeoIp),
            "geosite" => Ok(AssetKind::GeoSite),
            other => Err(BridgeError::InvalidConfig(format!("unknown asset type '{other}'"))),
        }
    }
}

/// 本地文件状态；文件不存在不是错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetInfo {
    #[serde(rename = "type")]
    pub kind: AssetKind,
    pub exists: bool,
    pub size: u64,
    #[serde(rename = "modTime", skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Completed,
    Failed,
}

/// 下载进度记录，每个数据块写入后回调一次
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadProgress {
    #[serde(rename = "type")]
    pub kind: AssetKind,
    /// 未知时为 0
    pub total: u64,
    pub downloaded: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
    pub status: DownloadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadProgress {
    fn new(kind: AssetKind, total: Option<u64>, downloaded: u64, status: DownloadStatus) -> Self {
        let percentage = match total {
            Some(t) if t > 0 => Some(downloaded as f64 * 100.0 / t as f64),
            _ => None,
        };
        Self {
            kind,
            total: total.unwrap_or(0),
            downloaded,
            percentage,
            status,
            error: None,
        }
    }
}

pub struct AssetManager {
    base_dir: PathBuf,
    busy: Mutex<HashSet<AssetKind>>,
    client: reqwest::blocking::Client,
}

/// 持有期间该类资源处于下载中
struct DownloadGuard<'a> {
    busy: &'a Mutex<HashSet<AssetKind>>,
    kind: AssetKind,
}

impl Drop for DownloadGuard<'_> {
    fn drop(&mut self) {
        lock_busy(self.busy).remove(&self.kind);
    }
}

impl AssetManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        // 下载体积可达数十 MB，整体不设超时，仅限制建连时间
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(None::<Duration>)
            .user_agent(concat!("xray-harmony/", env!("CARGO_PKG_VERSION")))
            .build()?;
        debug!(dir = %base_dir.display(), "asset manager created");
        Ok(Self {
            base_dir,
            busy: Mutex::new(HashSet::new()),
            client,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn path(&self, kind: AssetKind) -> PathBuf {
        self.base_dir.join(kind.file_name())
    }

    pub fn exists(&self, kind: AssetKind) -> bool {
        self.path(kind).is_file()
    }

    /// 至少有一个数据文件在盘上
    pub fn has_any(&self) -> bool {
        AssetKind::ALL.iter().any(|k| self.exists(*k))
    }

    pub fn is_downloading(&self, kind: AssetKind) -> bool {
        lock_busy(&self.busy).contains(&kind)
    }

    pub fn info(&self, kind: AssetKind) -> Result<AssetInfo> {
        let path = self.path(kind);
        let display = path.to_string_lossy().into_owned();
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(AssetInfo {
                kind,
                exists: true,
                size: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
                path: display,
            }),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(AssetInfo {
                kind,
                exists: false,
                size: 0,
                modified: None,
                path: display,
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list(&self) -> Result<Vec<AssetInfo>> {
        AssetKind::ALL.iter().map(|k| self.info(*k)).collect()
    }

    fn begin_download(&self, kind: AssetKind) -> Result<DownloadGuard<'_>> {
        if !lock_busy(&self.busy).insert(kind) {
            return Err(BridgeError::AlreadyDownloading(kind));
        }
        Ok(DownloadGuard {
            busy: &self.busy,
            kind,
        })
    }

    /// 下载数据文件（阻塞当前线程直到完成）
    ///
    /// `url` 为空时使用默认地址。失败时删除临时文件并以 `failed` 状态回调。
    pub fn download(
        &self,
        kind: AssetKind,
        url: Option<&str>,
        on_progress: &mut dyn FnMut(&DownloadProgress),
    ) -> Result<()> {
        let _guard = self.begin_download(kind)?;
        let url = url.filter(|u| !u.is_empty()).unwrap_or(kind.default_url());
        let final_path = self.path(kind);
        let tmp_path = tmp_path_for(&final_path);

        info!(kind = %kind, url, "asset download started");
        on_progress(&DownloadProgress::new(kind, None, 0, DownloadStatus::Downloading));

        let result = self
            .transfer(kind, url, &tmp_path, on_progress)
            .and_then(|(total, downloaded)| {
                std::fs::rename(&tmp_path, &final_path)?;
                Ok((total, downloaded))
            });

        match result {
            Ok((total, downloaded)) => {
                info!(kind = %kind, bytes = downloaded, "asset download completed");
                on_progress(&DownloadProgress::new(
                    kind,
                    total.or(Some(downloaded)),
                    downloaded,
                    DownloadStatus::Completed,
                ));
                Ok(())
            }
            Err(e) => {
                if let Err(rm) = std::fs::remove_file(&tmp_path) {
                    if rm.kind() != IoErrorKind::NotFound {
                        warn!(path = %tmp_path.display(), error = %rm, "failed to remove temp file");
                    }
                }
                warn!(kind = %kind, error = %e, "asset download failed");
                let mut failed = DownloadProgress::new(kind, None, 0, DownloadStatus::Failed);
                failed.error = Some(e.to_string());
                on_progress(&failed);
                Err(e)
            }
        }
    }

    /// 流式写入临时文件，返回 (总大小, 已下载字节)
    fn transfer(
        &self,
        kind: AssetKind,
        url: &str,
        tmp_path: &Path,
        on_progress: &mut dyn FnMut(&DownloadProgress),
    ) -> Result<(Option<u64>, u64)> {
        let mut response = self.client.get(url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::Transport(format!("HTTP {status} for {url}")));
        }
        let total = response.content_length();

        let mut file = File::create(tmp_path)?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut downloaded = 0u64;
        loop {
            let n = response
                .read(&mut buf)
                .map_err(|e| BridgeError::Transport(e.to_string()))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])?;
            downloaded += n as u64;
            on_progress(&DownloadProgress::new(
                kind,
                total,
                downloaded,
                DownloadStatus::Downloading,
            ));
        }
        file.flush()?;
        file.sync_all()?;

        if let Some(expected) = total {
            if expected != downloaded {
                return Err(BridgeError::Transport(format!(
                    "truncated body: expected {expected} bytes, got {downloaded}"
                )));
            }
        }
        Ok((total, downloaded))
    }

    /// 远端大小不同或远端更新时返回 true；本地不存在也返回 true
    pub fn check_update(&self, kind: AssetKind, url: Option<&str>) -> Result<bool> {
        let local = self.info(kind)?;
        if !local.exists {
            return Ok(true);
        }
        let url = url.filter(|u| !u.is_empty()).unwrap_or(kind.default_url());

        let response = self.client.head(url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::Transport(format!("HTTP {status} for {url}")));
        }
        let headers = response.headers();

        // HEAD 响应没有正文，直接读 Content-Length 头
        let remote_size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(size) = remote_size {
            if size != local.size {
                debug!(kind = %kind, local = local.size, remote = size, "asset size differs");
                return Ok(true);
            }
        }

        let remote_modified = headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|t| t.with_timezone(&Utc));
        if let (Some(remote), Some(local_time)) = (remote_modified, local.modified) {
            if remote > local_time {
                debug!(kind = %kind, %remote, local = %local_time, "remote asset is newer");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// 存在且不小于 1 KiB 视为有效，不做校验和
    pub fn verify(&self, kind: AssetKind) -> Result<bool> {
        let info = self.info(kind)?;
        Ok(info.exists && info.size >= MIN_VALID_SIZE)
    }

    /// 删除数据文件；文件本就不存在视为成功
    pub fn delete(&self, kind: AssetKind) -> Result<()> {
        if self.is_downloading(kind) {
            return Err(BridgeError::AlreadyDownloading(kind));
        }
        match std::fs::remove_file(self.path(kind)) {
            Ok(()) => {
                info!(kind = %kind, "asset deleted");
                Ok(())
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// 集合里只有标记位，锁中毒后内容仍可信
fn lock_busy(busy: &Mutex<HashSet<AssetKind>>) -> MutexGuard<'_, HashSet<AssetKind>> {
    busy.lock().unwrap_or_else(PoisonError::into_inner)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}
