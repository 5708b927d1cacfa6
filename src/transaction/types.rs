//! 事务管理类型定义
//!
//! 提供事务协调器所需的核心类型：状态、错误分类、配置、统计信息与失败上下文

use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 事务ID
///
/// 进程内唯一，仅用于日志与诊断
pub type TransactionId = u64;

/// 事务操作结果类型
pub type TransactionResult<T> = Result<T, TransactionError>;

/// 事务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// 活跃状态，可加入资源管理器、创建保存点、提交
    Active,
    /// 两阶段提交进行中
    Committing,
    /// 已提交
    Committed,
    /// 已标记为注定失败：仍可加入，但禁止提交
    Doomed,
    /// 提交或保存点操作失败，只能中止
    CommitFailed,
}

impl TransactionStatus {
    /// 检查是否允许加入资源管理器
    pub fn can_join(&self) -> bool {
        matches!(self, TransactionStatus::Active | TransactionStatus::Doomed)
    }

    /// 检查是否可以标记为注定失败
    pub fn can_doom(&self) -> bool {
        matches!(self, TransactionStatus::Active | TransactionStatus::Doomed)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Active => write!(f, "Active"),
            TransactionStatus::Committing => write!(f, "Committing"),
            TransactionStatus::Committed => write!(f, "Committed"),
            TransactionStatus::Doomed => write!(f, "Doomed"),
            TransactionStatus::CommitFailed => write!(f, "Commit failed"),
        }
    }
}

/// 参与者错误
///
/// 包装资源管理器、钩子或同步器抛出的任意错误，原样向调用方传播。
/// 调用方可以通过 [`ParticipantError::downcast_ref`] 取回原始错误类型。
#[derive(Clone)]
pub struct ParticipantError(Arc<dyn StdError + Send + Sync + 'static>);

impl ParticipantError {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    /// 以消息文本构造参与者错误
    pub fn msg(message: impl Into<String>) -> Self {
        Self(Arc::new(MessageError(message.into())))
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.0.as_ref()
    }
}

impl fmt::Debug for ParticipantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for ParticipantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct MessageError(String);

/// 事务错误类型
#[derive(Error, Debug, Clone)]
pub enum TransactionError {
    #[error("先前的操作已失败，失败上下文:\n\n{0}")]
    TransactionFailed(String),

    #[error("事务已注定失败，无法提交")]
    DoomedTransaction,

    #[error("暂时性错误: {0}")]
    Transient(String),

    #[error("当前没有事务")]
    NoTransaction,

    #[error("已经处于事务中")]
    AlreadyInTransaction,

    #[error("保存点回滚无效: {0}")]
    InvalidSavepointRollback(String),

    #[error("事务处于 {0} 状态，不能标记为注定失败")]
    NonDoomable(TransactionStatus),

    #[error("期望事务状态为 Active 或 Doomed，实际为 {0}")]
    InvalidStatus(TransactionStatus),

    #[error("事务已结束")]
    Closed,

    #[error("资源管理器不支持保存点: {0}")]
    SavepointsUnsupported(String),

    #[error("事务不属于该事务管理器")]
    ForeignTransaction,

    #[error("对象未在事务中登记数据")]
    DataNotFound,

    #[error("无效参数: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Participant(ParticipantError),
}

impl TransactionError {
    /// 构造暂时性（可重试）错误
    pub fn transient(message: impl Into<String>) -> Self {
        TransactionError::Transient(message.into())
    }

    /// 包装任意参与者错误
    pub fn participant<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        TransactionError::Participant(ParticipantError::new(error))
    }

    /// 以消息文本构造参与者错误
    pub fn participant_msg(message: impl Into<String>) -> Self {
        TransactionError::Participant(ParticipantError::msg(message))
    }

    /// 是否为暂时性错误，暂时性错误总是可以重试
    pub fn is_transient(&self) -> bool {
        matches!(self, TransactionError::Transient(_))
    }

    /// 若为参与者错误，尝试取回原始错误
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            TransactionError::Participant(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// 失败上下文
///
/// 事务进入 `CommitFailed` 时记录，之后的 join/commit/savepoint
/// 通过 [`TransactionError::TransactionFailed`] 复述该上下文
#[derive(Debug)]
pub struct FailureContext {
    pub operation: &'static str,
    pub error: TransactionError,
    pub captured_at: DateTime<Local>,
    pub backtrace: Backtrace,
}

impl FailureContext {
    pub fn capture(operation: &'static str, error: &TransactionError) -> Self {
        Self {
            operation,
            error: error.clone(),
            captured_at: Local::now(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "{} failed at {}\n{}\n{}\nerror: {:?}: {}",
            self.operation,
            self.captured_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            "stack backtrace:",
            self.backtrace,
            self.error,
            self.error
        )
    }
}

/// 事务管理器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionManagerConfig {
    /// 显式模式：必须先 begin() 才能使用事务
    pub explicit: bool,
    /// attempts() 的默认尝试次数
    pub default_attempts: usize,
    /// run() 的默认尝试次数
    pub default_run_tries: usize,
}

impl Default for TransactionManagerConfig {
    fn default() -> Self {
        Self {
            explicit: false,
            default_attempts: 3,
            default_run_tries: 3,
        }
    }
}

impl TransactionManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置为显式模式
    pub fn explicit(mut self) -> Self {
        self.explicit = true;
        self
    }

    pub fn with_default_attempts(mut self, attempts: usize) -> Self {
        self.default_attempts = attempts;
        self
    }

    pub fn with_default_run_tries(mut self, tries: usize) -> Self {
        self.default_run_tries = tries;
        self
    }
}

/// 事务统计信息
#[derive(Debug, Default)]
pub struct TransactionStats {
    /// 开始的事务数
    pub begun: AtomicU64,
    /// 已提交事务数
    pub committed: AtomicU64,
    /// 已中止事务数
    pub aborted: AtomicU64,
    /// 提交失败次数
    pub commit_failures: AtomicU64,
}

impl TransactionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_begun(&self) {
        self.begun.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_committed(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_commit_failures(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransactionStatsSnapshot {
        TransactionStatsSnapshot {
            begun: self.begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
        }
    }
}

/// 统计信息快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStatsSnapshot {
    pub begun: u64,
    pub committed: u64,
    pub aborted: u64,
    pub commit_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("磁盘已满")]
    struct DiskFull;

    #[test]
    fn test_status_transitions() {
        assert!(TransactionStatus::Active.can_join());
        assert!(TransactionStatus::Doomed.can_join());
        assert!(!TransactionStatus::Committing.can_join());
        assert!(!TransactionStatus::CommitFailed.can_join());

        assert!(TransactionStatus::Active.can_doom());
        assert!(!TransactionStatus::Committed.can_doom());
        assert_eq!(TransactionStatus::CommitFailed.to_string(), "Commit failed");
    }

    #[test]
    fn test_transient_classification() {
        assert!(TransactionError::transient("冲突").is_transient());
        assert!(!TransactionError::DoomedTransaction.is_transient());
        assert!(!TransactionError::participant(DiskFull).is_transient());
    }

    #[test]
    fn test_participant_error_downcast() {
        let err = TransactionError::participant(DiskFull);
        assert!(err.downcast_ref::<DiskFull>().is_some());
        assert_eq!(err.to_string(), "磁盘已满");

        let cloned = err.clone();
        assert!(cloned.downcast_ref::<DiskFull>().is_some());
        assert!(TransactionError::Closed.downcast_ref::<DiskFull>().is_none());
    }

    #[test]
    fn test_failure_context_render() {
        let ctx = FailureContext::capture("commit", &TransactionError::participant_msg("vote failed"));
        let text = ctx.render();
        assert!(text.starts_with("commit failed at"));
        assert!(text.contains("vote failed"));
    }

    #[test]
    fn test_config_builder() {
        let config = TransactionManagerConfig::new()
            .explicit()
            .with_default_attempts(5)
            .with_default_run_tries(2);

        assert!(config.explicit);
        assert_eq!(config.default_attempts, 5);
        assert_eq!(config.default_run_tries, 2);
    }

    #[test]
    fn test_transaction_stats() {
        let stats = TransactionStats::new();
        stats.increment_begun();
        stats.increment_begun();
        stats.increment_committed();
        stats.increment_aborted();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.begun, 2);
        assert_eq!(snapshot.committed, 1);
        assert_eq!(snapshot.aborted, 1);
        assert_eq!(snapshot.commit_failures, 0);
    }
}
