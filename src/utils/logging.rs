// 日志后端
//
// 协调器只通过 `log` 门面输出（target = "txn"），是否安装后端由宿主程序决定。
// 这里提供一个基于 flexi_logger 的文件后端：按大小轮转，异步写入。

use crate::config::LogConfig;
use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, LoggerHandle, Naming, WriteMode};
use std::sync::Mutex;

/// 已启动的后端句柄，`shutdown` 时取出并 flush
static LOGGER_HANDLE: Mutex<Option<LoggerHandle>> = Mutex::new(None);

fn file_spec(config: &LogConfig) -> FileSpec {
    FileSpec::default()
        .basename(&config.file)
        .directory(&config.dir)
}

/// 按 `config` 启动文件日志后端
///
/// 同一进程内只能成功调用一次；`config.level` 使用 flexi_logger 的过滤语法，
/// 例如 `"info"` 或 `"warn, txn=debug"`
pub fn init(config: &LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let handle = Logger::try_with_str(&config.level)?
        .log_to_file(file_spec(config))
        .rotate(
            Criterion::Size(config.max_file_size),
            Naming::Numbers,
            Cleanup::KeepLogFiles(config.max_files),
        )
        .write_mode(WriteMode::Async)
        .append()
        .start()?;

    if let Ok(mut slot) = LOGGER_HANDLE.lock() {
        *slot = Some(handle);
    }

    log::info!(target: "txn", "logging to {}/{} at level {}", config.dir, config.file, config.level);
    Ok(())
}

/// flush 异步缓冲并释放后端句柄
pub fn shutdown() {
    let handle = LOGGER_HANDLE.lock().ok().and_then(|mut slot| slot.take());
    if let Some(handle) = handle {
        handle.flush();
    }
}

pub fn is_initialized() -> bool {
    LOGGER_HANDLE
        .lock()
        .map(|slot| slot.is_some())
        .unwrap_or(false)
}
