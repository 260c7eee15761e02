//! 把 tracing 事件转发给宿主注册的 C 回调

use std::ffi::CString;
use std::os::raw::{c_char, c_void};
use std::sync::{Mutex, OnceLock};

use tracing::field::{Field, Visit};
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::common::error::Result;

/// level: 0=TRACE, 1=DEBUG, 2=INFO, 3=WARN, 4=ERROR
pub type LogCallback = extern "C" fn(level: i32, message: *const c_char, ctx: *mut c_void);

#[derive(Clone, Copy)]
struct CallbackSlot {
    cb: LogCallback,
    ctx: *mut c_void,
}

// ctx 由宿主持有，回调可能在任意线程触发
unsafe impl Send for CallbackSlot {}

static LOG_CALLBACK: Mutex<Option<CallbackSlot>> = Mutex::new(None);
static LOGGING_INIT: OnceLock<bool> = OnceLock::new();

/// 改写全局回调槽的测试之间互斥
#[cfg(test)]
pub(crate) static SLOT_TEST_LOCK: Mutex<()> = Mutex::new(());

pub fn set_callback(cb: LogCallback, ctx: *mut c_void) -> Result<()> {
    *LOG_CALLBACK.lock()? = Some(CallbackSlot { cb, ctx });
    Ok(())
}

pub fn clear_callback() -> Result<()> {
    *LOG_CALLBACK.lock()? = None;
    Ok(())
}

pub fn level_code(level: &Level) -> i32 {
    match *level {
        Level::TRACE => 0,
        Level::DEBUG => 1,
        Level::INFO => 2,
        Level::WARN => 3,
        Level::ERROR => 4,
    }
}

/// 安装全局 subscriber（幂等）。`RUST_LOG` 优先于传入的默认级别。
///
/// 返回本进程的 subscriber 是否由这里安装。
pub fn init_logging(default_level: &str) -> bool {
    *LOGGING_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(default_level))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(filter)
            .with(CallbackLayer)
            .try_init()
            .is_ok()
    })
}

/// 提取 message 与其余结构化字段
struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl MessageVisitor {
    fn new() -> Self {
        Self {
            message: String::new(),
            fields: Vec::new(),
        }
    }

    fn format_output(&self) -> String {
        let mut output = self.message.clone();
        for (k, v) in &self.fields {
            output.push_str(&format!(" {k}={v}"));
        }
        output
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .push((field.name().to_string(), format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }
}

pub struct CallbackLayer;

impl<S> Layer<S> for CallbackLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        // 先复制出回调再释放锁，回调内部再打日志也不会死锁
        let slot = match LOG_CALLBACK.lock() {
            Ok(guard) => *guard,
            Err(_) => return,
        };
        let Some(slot) = slot else {
            return;
        };

        let mut visitor = MessageVisitor::new();
        event.record(&mut visitor);
        let meta = event.metadata();
        let line = format!("[{}] {}", meta.target(), visitor.format_output());
        // 消息中的 NUL 会截断，替换掉
        let Ok(c_line) = CString::new(line.replace('\0', " ")) else {
            return;
        };
        (slot.cb)(level_code(meta.level()), c_line.as_ptr(), slot.ctx);
    }
}
