//! 日志初始化
//!
//! 错误日志走 tracing：stderr 输出，配置了 error_log 时同时追加到文件，
//! 条目带时间戳与 `[DEBUG]`/`[INFO]`/`[WARN]`/`[ERR]` 标签。
//! 访问日志是独立的追加文件（未配置时为 stdout），不带标签。

use std::fs::{File, OpenOptions};
use std::io::{self, Write as _};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use parking_lot::Mutex;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// 解析配置中的日志级别，未知值回落到 warn
pub fn parse_level(level: &str) -> &'static str {
    match level.to_ascii_lowercase().as_str() {
        "debug" => "debug",
        "info" => "info",
        "warning" => "warn",
        "error" => "error",
        _ => "warn",
    }
}

/// 初始化全局 tracing 订阅者
///
/// 重复调用是无害的（测试中多个用例共享进程）。
pub fn init(level: &str, error_log: Option<&str>) -> Result<()> {
    let error_file = match error_log {
        Some(path) if !path.is_empty() => Some(Arc::new(Mutex::new(open_log_file(path)?))),
        _ => None,
    };

    let sink = ErrorSink { file: error_file };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(parse_level(level)))
        .event_format(TagFormat)
        .with_writer(move || sink.clone())
        .try_init();

    Ok(())
}

/// 打开追加日志文件，父目录不存在时按 0755 创建
fn open_log_file(path: &str) -> Result<File> {
    if let Some(dir) = Path::new(path).parent() {
        if !dir.as_os_str().is_empty() {
            create_log_dir(dir)?;
        }
    }

    let mut opts = OpenOptions::new();
    opts.append(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o644);
    }
    opts.open(path)
        .with_context(|| format!("failed to open log file {}", path))
}

/// 递归创建日志目录，权限固定为 0755 而非跟随 umask
fn create_log_dir(dir: &Path) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder
        .create(dir)
        .with_context(|| format!("failed to create log dir {}", dir.display()))
}

/// 错误日志输出端：stderr，外加可选的文件副本
#[derive(Clone)]
struct ErrorSink {
    file: Option<Arc<Mutex<File>>>,
}

impl io::Write for ErrorSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        if let Some(file) = &self.file {
            file.lock().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        if let Some(file) = &self.file {
            file.lock().flush()?;
        }
        Ok(())
    }
}

/// `2006/01/02 15:04:05 [INFO] message` 风格的事件格式
struct TagFormat;

impl<S, N> FormatEvent<S, N> for TagFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let tag = match *event.metadata().level() {
            Level::ERROR => "[ERR]",
            Level::WARN => "[WARN]",
            Level::INFO => "[INFO]",
            Level::DEBUG | Level::TRACE => "[DEBUG]",
        };
        write!(
            writer,
            "{} {} ",
            Local::now().format("%Y/%m/%d %H:%M:%S"),
            tag
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// 访问日志
///
/// 按行追加，无标签。处理器在连接关闭时写入一条记录。
pub struct AccessLog {
    sink: AccessSink,
}

enum AccessSink {
    Stdout,
    File(Mutex<File>),
}

impl AccessLog {
    /// 未配置路径时写到 stdout
    pub fn new(path: Option<&str>) -> Result<Self> {
        let sink = match path {
            Some(p) if !p.is_empty() => AccessSink::File(Mutex::new(open_log_file(p)?)),
            _ => AccessSink::Stdout,
        };
        Ok(Self { sink })
    }

    /// 追加一行记录
    pub fn log(&self, line: &str) {
        match &self.sink {
            AccessSink::Stdout => {
                let _ = writeln!(io::stdout(), "{}", line);
            }
            AccessSink::File(file) => {
                let _ = writeln!(file.lock(), "{}", line);
            }
        }
    }
}
