//! 事务管理模块
//!
//! 提供进程内的事务协调功能，包括：
//! - 事务生命周期管理（开始、提交、中止、注定失败）
//! - 两阶段提交（2PC），按资源管理器的排序键确定全局提交顺序
//! - 保存点（创建、回滚、失效）
//! - 提交/中止钩子与同步器
//! - 线程隔离的事务管理器与重试机制
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use txncoord::transaction::TransactionManager;
//!
//! let manager = TransactionManager::new();
//!
//! // 开始事务并加入资源管理器
//! let txn = manager.begin()?;
//! txn.join(Arc::new(my_resource))?;
//!
//! // 执行操作...
//!
//! // 提交事务
//! manager.commit()?;
//! ```

pub mod attempt;
pub mod hooks;
pub mod manager;
pub mod savepoint;
pub mod synchronizer;
pub mod two_phase;
pub mod txn;
pub mod types;

pub use attempt::{Attempt, Attempts, RunOptions};
pub use hooks::{AfterCommitHookFn, Hook, HookFn};
pub use manager::{ThreadTransactionManager, TransactionManager};
pub use savepoint::{
    AbortSavepoint, NoRollbackSavepoint, ResourceSavepoint, Savepoint, SavepointResourceManager,
};
pub use synchronizer::Synchronizer;
pub use two_phase::ResourceManager;
pub use txn::Transaction;
pub use types::*;

/// 事务管理模块版本
pub const VERSION: &str = "1.0.0";

/// 创建默认配置（隐式模式）的事务管理器
pub fn create_transaction_manager() -> TransactionManager {
    TransactionManager::with_config(TransactionManagerConfig::default())
}

/// 创建显式模式的事务管理器：必须先 begin() 才能使用事务
pub fn create_explicit_transaction_manager() -> TransactionManager {
    TransactionManager::with_config(TransactionManagerConfig::default().explicit())
}

/// 创建线程隔离的事务管理器
pub fn create_thread_transaction_manager(
    config: TransactionManagerConfig,
) -> ThreadTransactionManager {
    ThreadTransactionManager::with_config(config)
}
