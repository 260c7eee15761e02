//! FFI 层：以 C ABI 导出句柄注册表、分享链接编解码和资源管理，供宿主 NAPI / JNI 调用。
//!
//! 所有导出函数使用统一约定：
//! - 返回 i32: 0 = 成功, -1 = 未运行, -2 = 已运行, -3 = 参数错误, -4 = 内部错误,
//!   -5 = 句柄不存在, -6 = 未加载配置, -7 = 正在下载
//! - 布尔类调用返回 1 / 0，失败时返回上述负值
//! - 创建类调用返回 i64 句柄（从 1 开始），失败时返回负值
//! - 返回 *mut c_char: Rust 分配的字符串，调用方需通过 `xray_free_string` 释放；失败时为 null
//! - 每次调用都会覆盖进程级的“最后错误”，成功时清空，通过 `xray_get_last_error` 读取

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::sync::{Mutex, OnceLock};

use serde::Serialize;

use super::asset_manager::{AssetKind, DownloadProgress};
use super::engine::EngineInstance;
use super::log_callback::{self, LogCallback};
use super::registry::{Handle, Registry};
use crate::common::error::{BridgeError, Result};
use crate::config::share_link;

/// 全局注册表
static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// 进程级最后错误
static LAST_ERROR: Mutex<Option<String>> = Mutex::new(None);

/// 安装带有真实引擎后端的注册表；必须在第一次 FFI 调用之前完成。
///
/// 注册表已初始化时返回 false。
pub fn install(registry: Registry) -> bool {
    REGISTRY.set(registry).is_ok()
}

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::default)
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// 将 Rust String 转为堆分配的 C 字符串指针
fn to_c_string(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

/// 安全地从 C 字符串指针读取 &str
unsafe fn from_c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// 必填字符串参数
unsafe fn arg<'a>(ptr: *const c_char, name: &str) -> Result<&'a str> {
    from_c_str(ptr)
        .ok_or_else(|| BridgeError::InvalidConfig(format!("{name} is null or not valid UTF-8")))
}

/// 可选字符串参数：null 或空串视为缺省
unsafe fn optional_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    from_c_str(ptr).filter(|s| !s.is_empty())
}

unsafe fn asset_kind(ptr: *const c_char) -> Result<AssetKind> {
    arg(ptr, "asset type")?.parse()
}

fn set_last_error(err: Option<&BridgeError>) {
    if let Ok(mut slot) = LAST_ERROR.lock() {
        *slot = err.map(BridgeError::report);
    }
}

fn record<T>(result: Result<T>) -> Result<T> {
    match &result {
        Ok(_) => set_last_error(None),
        Err(e) => {
            tracing::debug!(code = e.kind().as_str(), error = %e, "ffi call failed");
            set_last_error(Some(e));
        }
    }
    result
}

fn status(result: Result<()>) -> i32 {
    match record(result) {
        Ok(()) => 0,
        Err(e) => e.kind().status_code(),
    }
}

fn flag(result: Result<bool>) -> i32 {
    match record(result) {
        Ok(true) => 1,
        Ok(false) => 0,
        Err(e) => e.kind().status_code(),
    }
}

fn handle_or_code(result: Result<Handle>) -> i64 {
    match record(result) {
        Ok(h) => h,
        Err(e) => e.kind().status_code() as i64,
    }
}

fn text(result: Result<String>) -> *mut c_char {
    match record(result) {
        Ok(s) => to_c_string(&s),
        Err(_) => std::ptr::null_mut(),
    }
}

fn json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

// ═══════════════════════════════════════════════════════════════════════════
// 进程级
// ═══════════════════════════════════════════════════════════════════════════

/// 获取版本号
#[no_mangle]
pub extern "C" fn xray_get_version() -> *mut c_char {
    text(Ok(format!(
        "XrayHarmony v{} (with VPN support)",
        env!("CARGO_PKG_VERSION")
    )))
}

/// 最近一次调用的错误文本（`CODE: message`），无错误时为空串
#[no_mangle]
pub extern "C" fn xray_get_last_error() -> *mut c_char {
    let message = LAST_ERROR
        .lock()
        .ok()
        .and_then(|slot| slot.clone())
        .unwrap_or_default();
    to_c_string(&message)
}

/// 释放由 Rust 分配的 C 字符串
///
/// # Safety
/// `ptr` 必须是此库分配的字符串指针，且只能释放一次
#[no_mangle]
pub unsafe extern "C" fn xray_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

/// 初始化日志（幂等），`level` 为 null 时默认 info
///
/// # Safety
/// `level` 为 null 或合法的 C 字符串指针
#[no_mangle]
pub unsafe extern "C" fn xray_init_logging(level: *const c_char) -> i32 {
    let level = optional_arg(level).unwrap_or("info");
    if !log_callback::init_logging(level) {
        tracing::debug!("global subscriber already installed");
    }
    status(Ok(()))
}

/// 注册日志回调；`cb` 为 null 等同于清除
///
/// # Safety
/// `ctx` 会原样传回回调，调用方负责其生命周期
#[no_mangle]
pub unsafe extern "C" fn xray_set_log_callback(cb: Option<LogCallback>, ctx: *mut c_void) -> i32 {
    status(match cb {
        Some(cb) => log_callback::set_callback(cb, ctx),
        None => log_callback::clear_callback(),
    })
}

/// 清除日志回调
#[no_mangle]
pub extern "C" fn xray_clear_log_callback() -> i32 {
    status(log_callback::clear_callback())
}

// ═══════════════════════════════════════════════════════════════════════════
// 分享链接
// ═══════════════════════════════════════════════════════════════════════════

/// 解析分享链接，返回服务器描述 JSON
///
/// # Safety
/// `link` 必须是合法的 C 字符串指针
#[no_mangle]
pub unsafe extern "C" fn xray_parse_share_link(link: *const c_char) -> *mut c_char {
    text(arg(link, "link").and_then(|l| share_link::parse_share_link(l)?.to_json()))
}

/// 由服务器描述 JSON 生成分享链接
///
/// # Safety
/// `descriptor_json` 必须是合法的 C 字符串指针
#[no_mangle]
pub unsafe extern "C" fn xray_generate_share_link(descriptor_json: *const c_char) -> *mut c_char {
    text(arg(descriptor_json, "descriptor").and_then(share_link::generate_share_link_json))
}

// ═══════════════════════════════════════════════════════════════════════════
// 引擎实例
// ═══════════════════════════════════════════════════════════════════════════

#[no_mangle]
pub extern "C" fn xray_new_instance() -> i64 {
    handle_or_code(registry().new_engine())
}

/// 删除实例，运行中会先停止
#[no_mangle]
pub extern "C" fn xray_delete_instance(handle: i64) -> i32 {
    status(registry().delete_engine(handle))
}

/// 加载 JSON / YAML 配置
///
/// # Safety
/// `config` 必须是合法的 C 字符串指针
#[no_mangle]
pub unsafe extern "C" fn xray_load_config(handle: i64, config: *const c_char) -> i32 {
    status(arg(config, "config").and_then(|c| registry().engine(handle)?.load_config(c)))
}

/// # Safety
/// `path` 必须是合法的 C 字符串指针
#[no_mangle]
pub unsafe extern "C" fn xray_load_config_from_file(handle: i64, path: *const c_char) -> i32 {
    status(arg(path, "path").and_then(|p| registry().engine(handle)?.load_config_from_file(p)))
}

/// 仅校验配置，不涉及任何实例
///
/// # Safety
/// `config` 必须是合法的 C 字符串指针
#[no_mangle]
pub unsafe extern "C" fn xray_test_config(config: *const c_char) -> i32 {
    status(arg(config, "config").and_then(EngineInstance::test_config))
}

#[no_mangle]
pub extern "C" fn xray_attach_assets(handle: i64, asset_handle: i64) -> i32 {
    status(registry().attach_assets(handle, asset_handle))
}

#[no_mangle]
pub extern "C" fn xray_start(handle: i64) -> i32 {
    status(registry().engine(handle).and_then(|e| e.start()))
}

#[no_mangle]
pub extern "C" fn xray_stop(handle: i64) -> i32 {
    status(registry().engine(handle).and_then(|e| e.stop()))
}

#[no_mangle]
pub extern "C" fn xray_is_running(handle: i64) -> i32 {
    flag(registry().engine(handle).map(|e| e.is_running()))
}

/// 运行统计 JSON：`{running, status, uptime, traffic?}`
#[no_mangle]
pub extern "C" fn xray_get_stats(handle: i64) -> *mut c_char {
    text(registry().engine(handle).and_then(|e| json(&e.stats()?)))
}

// ═══════════════════════════════════════════════════════════════════════════
// TUN 转发
// ═══════════════════════════════════════════════════════════════════════════

#[no_mangle]
pub extern "C" fn xray_relay_new() -> i64 {
    handle_or_code(registry().new_relay())
}

#[no_mangle]
pub extern "C" fn xray_relay_delete(handle: i64) -> i32 {
    status(registry().delete_relay(handle))
}

/// # Safety
/// `config` 必须是合法的 C 字符串指针，内容为 relay 配置 JSON
#[no_mangle]
pub unsafe extern "C" fn xray_relay_load_config(handle: i64, config: *const c_char) -> i32 {
    status(arg(config, "config").and_then(|c| registry().relay(handle)?.load_config(c)))
}

#[no_mangle]
pub extern "C" fn xray_relay_start(handle: i64) -> i32 {
    status(registry().relay(handle).and_then(|r| r.start()))
}

#[no_mangle]
pub extern "C" fn xray_relay_stop(handle: i64) -> i32 {
    status(registry().relay(handle).and_then(|r| r.stop()))
}

#[no_mangle]
pub extern "C" fn xray_relay_is_running(handle: i64) -> i32 {
    flag(registry().relay(handle).map(|r| r.is_running()))
}

#[no_mangle]
pub extern "C" fn xray_relay_get_stats(handle: i64) -> *mut c_char {
    text(registry().relay(handle).and_then(|r| json(&r.stats()?)))
}

#[no_mangle]
pub extern "C" fn xray_relay_reset_stats(handle: i64) -> i32 {
    status(registry().relay(handle).map(|r| r.reset_stats()))
}

// ═══════════════════════════════════════════════════════════════════════════
// 资源文件
// ═══════════════════════════════════════════════════════════════════════════

/// 下载进度回调，`progress` 为进度 JSON，仅在回调期间有效
pub type ProgressCallback = extern "C" fn(progress: *const c_char, ctx: *mut c_void);

/// # Safety
/// `base_dir` 必须是合法的 C 字符串指针
#[no_mangle]
pub unsafe extern "C" fn xray_asset_manager_new(base_dir: *const c_char) -> i64 {
    handle_or_code(arg(base_dir, "base_dir").and_then(|d| registry().new_asset_manager(d)))
}

#[no_mangle]
pub extern "C" fn xray_asset_manager_delete(handle: i64) -> i32 {
    status(registry().delete_asset_manager(handle))
}

/// `{type, exists, size, modTime?, path}`
///
/// # Safety
/// `kind` 必须是合法的 C 字符串指针（"geoip" / "geosite"）
#[no_mangle]
pub unsafe extern "C" fn xray_asset_get_info(handle: i64, kind: *const c_char) -> *mut c_char {
    text((|| {
        let kind = asset_kind(kind)?;
        json(&registry().asset_manager(handle)?.info(kind)?)
    })())
}

#[no_mangle]
pub extern "C" fn xray_asset_list(handle: i64) -> *mut c_char {
    text(registry().asset_manager(handle).and_then(|m| json(&m.list()?)))
}

/// 阻塞下载；`url` 为 null 或空串时使用默认地址，`cb` 可为 null
///
/// # Safety
/// `kind` 必须是合法的 C 字符串指针；`url` 为 null 或合法指针；
/// `ctx` 会原样传回回调
#[no_mangle]
pub unsafe extern "C" fn xray_asset_download(
    handle: i64,
    kind: *const c_char,
    url: *const c_char,
    cb: Option<ProgressCallback>,
    ctx: *mut c_void,
) -> i32 {
    let url = optional_arg(url);
    let mut forward = |progress: &DownloadProgress| {
        if let Some(cb) = cb {
            if let Ok(payload) = serde_json::to_string(progress) {
                if let Ok(c_payload) = CString::new(payload) {
                    cb(c_payload.as_ptr(), ctx);
                }
            }
        }
    };
    status((|| {
        let kind = asset_kind(kind)?;
        registry()
            .asset_manager(handle)?
            .download(kind, url, &mut forward)
    })())
}

/// # Safety
/// `kind` 必须是合法的 C 字符串指针；`url` 为 null 或合法指针
#[no_mangle]
pub unsafe extern "C" fn xray_asset_check_update(
    handle: i64,
    kind: *const c_char,
    url: *const c_char,
) -> i32 {
    let url = optional_arg(url);
    flag((|| {
        let kind = asset_kind(kind)?;
        registry().asset_manager(handle)?.check_update(kind, url)
    })())
}

/// # Safety
/// `kind` 必须是合法的 C 字符串指针
#[no_mangle]
pub unsafe extern "C" fn xray_asset_verify(handle: i64, kind: *const c_char) -> i32 {
    flag((|| {
        let kind = asset_kind(kind)?;
        registry().asset_manager(handle)?.verify(kind)
    })())
}

/// # Safety
/// `kind` 必须是合法的 C 字符串指针
#[no_mangle]
pub unsafe extern "C" fn xray_asset_delete(handle: i64, kind: *const c_char) -> i32 {
    status((|| {
        let kind = asset_kind(kind)?;
        registry().asset_manager(handle)?.delete(kind)
    })())
}

/// # Safety
/// `kind` 必须是合法的 C 字符串指针
#[no_mangle]
pub unsafe extern "C" fn xray_asset_is_downloading(handle: i64, kind: *const c_char) -> i32 {
    flag((|| {
        let kind = asset_kind(kind)?;
        Ok(registry().asset_manager(handle)?.is_downloading(kind))
    })())
}

// ═══════════════════════════════════════════════════════════════════════════
// VPN
// ═══════════════════════════════════════════════════════════════════════════

/// 为已有引擎实例创建 VPN 管理器
#[no_mangle]
pub extern "C" fn xray_vpn_new(engine_handle: i64) -> i64 {
    handle_or_code(registry().new_vpn(engine_handle))
}

#[no_mangle]
pub extern "C" fn xray_vpn_delete(handle: i64) -> i32 {
    status(registry().delete_vpn(handle))
}

/// # Safety
/// `config` 必须是合法的 C 字符串指针，内容为 VPN 配置 JSON
#[no_mangle]
pub unsafe extern "C" fn xray_vpn_start(handle: i64, config: *const c_char) -> i32 {
    status(arg(config, "config").and_then(|c| registry().vpn(handle)?.start(c)))
}

#[no_mangle]
pub extern "C" fn xray_vpn_stop(handle: i64) -> i32 {
    status(registry().vpn(handle).and_then(|v| v.stop()))
}

#[no_mangle]
pub extern "C" fn xray_vpn_is_running(handle: i64) -> i32 {
    flag(registry().vpn(handle).map(|v| v.is_running()))
}

#[no_mangle]
pub extern "C" fn xray_vpn_get_stats(handle: i64) -> *mut c_char {
    text(registry().vpn(handle).and_then(|v| json(&v.stats()?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 最后错误是进程级的，读它的测试需要串行
    static SERIAL: Mutex<()> = Mutex::new(());

    fn serial() -> std::sync::MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_string(ptr: *mut c_char) -> String {
        assert!(!ptr.is_null());
        let s = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap().to_string();
        unsafe { xray_free_string(ptr) };
        s
    }

    fn last_error() -> String {
        take_string(xray_get_last_error())
    }

    #[test]
    fn ffi_version() {
        let _g = serial();
        let v = take_string(xray_get_version());
        assert_eq!(
            v,
            format!("XrayHarmony v{} (with VPN support)", env!("CARGO_PKG_VERSION"))
        );
    }

    #[test]
    fn process_wide_calls_clear_last_error() {
        let _g = serial();
        let _slot = log_callback::SLOT_TEST_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        assert_eq!(xray_start(-42), -5);
        let _ = take_string(xray_get_version());
        assert_eq!(last_error(), "");

        assert_eq!(xray_start(-42), -5);
        assert_eq!(unsafe { xray_set_log_callback(None, std::ptr::null_mut()) }, 0);
        assert_eq!(last_error(), "");

        assert_eq!(xray_start(-42), -5);
        assert_eq!(xray_clear_log_callback(), 0);
        assert_eq!(last_error(), "");

        assert_eq!(xray_start(-42), -5);
        assert_eq!(unsafe { xray_init_logging(std::ptr::null()) }, 0);
        assert_eq!(last_error(), "");
    }

    #[test]
    fn free_string_null_safe() {
        unsafe { xray_free_string(std::ptr::null_mut()) };
    }

    #[test]
    fn unknown_handle_sets_last_error() {
        let _g = serial();
        assert_eq!(xray_start(-42), -5);
        assert!(last_error().starts_with("HANDLE_NOT_FOUND"));
        assert_eq!(xray_is_running(-42), -5);
        assert!(xray_get_stats(-42).is_null());
    }

    #[test]
    fn success_clears_last_error() {
        let _g = serial();
        assert_eq!(xray_stop(-1), -5);
        let h = xray_new_instance();
        assert!(h > 0);
        assert_eq!(last_error(), "");
        assert_eq!(xray_delete_instance(h), 0);
    }

    #[test]
    fn engine_lifecycle_errors() {
        let _g = serial();
        let h = xray_new_instance();
        assert_eq!(xray_start(h), -6);
        assert!(last_error().starts_with("NOT_CONFIGURED"));
        assert_eq!(xray_stop(h), -1);
        assert_eq!(xray_is_running(h), 0);

        let cfg = CString::new(
            r#"{"inbounds":[{"tag":"socks-in","protocol":"socks","port":10808}],"outbounds":[{"tag":"direct","protocol":"freedom"}]}"#,
        )
        .unwrap();
        assert_eq!(unsafe { xray_load_config(h, cfg.as_ptr()) }, 0);
        // 默认注册表没有链接引擎
        assert_eq!(xray_start(h), -4);
        assert!(last_error().starts_with("ENGINE"));
        assert_eq!(xray_is_running(h), 0);

        assert_eq!(xray_delete_instance(h), 0);
        assert_eq!(xray_stop(h), -5);
    }

    #[test]
    fn null_argument_is_invalid() {
        let _g = serial();
        let h = xray_new_instance();
        assert_eq!(unsafe { xray_load_config(h, std::ptr::null()) }, -3);
        assert!(unsafe { xray_parse_share_link(std::ptr::null()) }.is_null());
        assert_eq!(xray_delete_instance(h), 0);
    }

    #[test]
    fn test_config_reports_missing_outbound() {
        let _g = serial();
        let cfg = CString::new(r#"{"inbounds":[{"tag":"a","protocol":"socks","port":1}]}"#).unwrap();
        assert_eq!(unsafe { xray_test_config(cfg.as_ptr()) }, -3);
        assert!(last_error().starts_with("MISSING_OUTBOUND"));
    }

    #[test]
    fn share_link_round_trip_over_ffi() {
        let _g = serial();
        let link = CString::new(
            "vless://11111111-2222-3333-4444-555555555555@example.com:443?encryption=none&security=tls&type=tcp#MyServer",
        )
        .unwrap();
        let descriptor = take_string(unsafe { xray_parse_share_link(link.as_ptr()) });
        let v: serde_json::Value = serde_json::from_str(&descriptor).unwrap();
        assert_eq!(v["protocol"], "vless");
        assert_eq!(v["tls"], "tls");
        assert_eq!(v["network"], "tcp");
        assert_eq!(v["remark"], "MyServer");

        let d = CString::new(descriptor).unwrap();
        let regenerated = take_string(unsafe { xray_generate_share_link(d.as_ptr()) });
        assert!(regenerated.starts_with("vless://11111111-2222-3333-4444-555555555555@example.com:443?"));
    }

    #[test]
    fn unsupported_scheme_over_ffi() {
        let _g = serial();
        let link = CString::new("http://example.com").unwrap();
        assert!(unsafe { xray_parse_share_link(link.as_ptr()) }.is_null());
        assert!(last_error().starts_with("UNSUPPORTED_SCHEME"));
    }

    #[test]
    fn asset_manager_over_ffi() {
        let _g = serial();
        let dir = tempfile::tempdir().unwrap();
        let base = CString::new(dir.path().to_str().unwrap()).unwrap();
        let h = unsafe { xray_asset_manager_new(base.as_ptr()) };
        assert!(h > 0);

        let kind = CString::new("geoip").unwrap();
        let info = take_string(unsafe { xray_asset_get_info(h, kind.as_ptr()) });
        let v: serde_json::Value = serde_json::from_str(&info).unwrap();
        assert_eq!(v["type"], "geoip");
        assert_eq!(v["exists"], false);

        assert_eq!(unsafe { xray_asset_verify(h, kind.as_ptr()) }, 0);
        assert_eq!(unsafe { xray_asset_is_downloading(h, kind.as_ptr()) }, 0);
        assert_eq!(unsafe { xray_asset_delete(h, kind.as_ptr()) }, 0);

        let bad = CString::new("mmdb").unwrap();
        assert_eq!(unsafe { xray_asset_verify(h, bad.as_ptr()) }, -3);

        let list = take_string(xray_asset_list(h));
        assert_eq!(serde_json::from_str::<serde_json::Value>(&list).unwrap().as_array().unwrap().len(), 2);

        assert_eq!(xray_asset_manager_delete(h), 0);
        assert_eq!(unsafe { xray_asset_verify(h, kind.as_ptr()) }, -5);
    }

    #[test]
    fn vpn_over_ffi() {
        let _g = serial();
        assert_eq!(xray_vpn_new(-9), -5);
        let e = xray_new_instance();
        let v = xray_vpn_new(e);
        assert!(v > 0);
        assert_eq!(xray_vpn_is_running(v), 0);
        assert_eq!(xray_vpn_stop(v), -1);

        let bad = CString::new(r#"{"tunFd": 0, "socksAddr": "127.0.0.1:10808"}"#).unwrap();
        assert_eq!(unsafe { xray_vpn_start(v, bad.as_ptr()) }, -3);

        assert_eq!(xray_vpn_delete(v), 0);
        assert_eq!(xray_delete_instance(e), 0);
    }

    #[test]
    fn relay_over_ffi() {
        let _g = serial();
        let r = xray_relay_new();
        assert_eq!(xray_relay_start(r), -6);
        let cfg = CString::new(r#"{"tun_fd": 3, "socks_addr": "127.0.0.1:1"}"#).unwrap();
        assert_eq!(unsafe { xray_relay_load_config(r, cfg.as_ptr()) }, 0);
        // SOCKS 探测失败
        assert_eq!(xray_relay_start(r), -4);
        assert!(xray_relay_get_stats(r).is_null());
        assert_eq!(xray_relay_reset_stats(r), 0);
        assert_eq!(xray_relay_delete(r), 0);
    }
}
