//! 两阶段提交（2PC）执行引擎
//!
//! 定义参与2PC的资源管理器接口，并在 [`Transaction`] 上实现提交协议：
//!
//! ```text
//! 1. 按 sort_key 稳定排序所有已加入的资源管理器
//! 2. tpc_begin  → 依次调用
//! 3. commit     → 依次调用
//! 4. tpc_vote   → 依次调用，记录已投票者
//! 5. tpc_finish → 依次调用
//! ```
//!
//! 步骤 2-4 中任何失败都属于可恢复窗口：未投票者收到 abort，所有参与者收到 tpc_abort。
//! 步骤 5 失败属于不可恢复窗口：参与者可能已持久提交，不再做任何清理。

use std::sync::Arc;

use crate::transaction::savepoint::SavepointResourceManager;
use crate::transaction::{Transaction, TransactionError, TransactionResult, TransactionStatus};

/// 资源管理器trait
///
/// 定义参与2PC的资源的接口。所有方法都同步执行，阻塞由实现方自行负责。
pub trait ResourceManager: Send + Sync {
    /// 放弃该事务中的所有改动
    fn abort(&self, txn: &Transaction) -> TransactionResult<()>;

    /// 阶段1开始
    fn tpc_begin(&self, txn: &Transaction) -> TransactionResult<()>;

    /// 写入改动（尚未持久化）
    fn commit(&self, txn: &Transaction) -> TransactionResult<()>;

    /// 投票：返回 `Ok(())` 表示可以提交
    fn tpc_vote(&self, txn: &Transaction) -> TransactionResult<()>;

    /// 阶段2：使改动生效，此处的失败无法安全回滚
    fn tpc_finish(&self, txn: &Transaction) -> TransactionResult<()>;

    /// 放弃已开始的两阶段提交
    fn tpc_abort(&self, txn: &Transaction) -> TransactionResult<()>;

    /// 全局排序键
    ///
    /// 所有并发提交的事务都按该键的顺序访问资源管理器，
    /// 独立实现的资源管理器因此以一致的全局顺序获取内部锁
    fn sort_key(&self) -> String;

    /// 可选能力：保存点
    fn as_savepoint_manager(&self) -> Option<&dyn SavepointResourceManager> {
        None
    }

    /// 可选能力：判断错误是否值得重试
    fn should_retry(&self, _error: &TransactionError) -> bool {
        false
    }
}

/// 以数据指针地址作为资源管理器身份
pub(crate) fn resource_key(resource: &Arc<dyn ResourceManager>) -> usize {
    Arc::as_ptr(resource) as *const () as usize
}

impl Transaction {
    /// 提交事务
    ///
    /// 成功后事务被释放，不再是管理器的当前事务。失败后事务进入 `CommitFailed`，
    /// 仍是当前事务，只能通过 [`Transaction::abort`] 结束。
    pub fn commit(&self) -> TransactionResult<()> {
        let status = {
            let state = self.inner.state.lock();
            if state.closed {
                return Err(TransactionError::Closed);
            }
            state.status
        };

        if status == TransactionStatus::Doomed {
            return Err(TransactionError::DoomedTransaction);
        }

        self.invalidate_all_savepoints();

        if status == TransactionStatus::CommitFailed {
            return Err(self.prior_operation_failed());
        }

        self.call_before_commit_hooks()?;

        let synchronizers = self.synchronizers();
        if let Some(synchronizers) = &synchronizers {
            synchronizers.map(|s| s.before_completion(self))?;
        }
        self.set_status(TransactionStatus::Committing);

        match self.commit_resources() {
            Ok(()) => {
                self.set_status(TransactionStatus::Committed);

                let mut deferred = None;
                if let Some(synchronizers) = &synchronizers {
                    if let Err(e) = synchronizers.map(|s| s.after_completion(self)) {
                        log::error!(target: "txn", "txn.{} after_completion failed: {}", self.id(), e);
                        deferred = Some(e);
                    }
                }
                self.call_after_commit_hooks(true);
                if let Err(e) = self.free_manager() {
                    deferred.get_or_insert(e);
                }
                self.free();
                log::debug!(target: "txn", "txn.{} commit", self.id());

                match deferred {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
            Err(e) => {
                let e = self.save_commitish_error("commit", e);
                self.call_after_commit_hooks(false);
                Err(e)
            }
        }
    }

    fn commit_resources(&self) -> TransactionResult<()> {
        let mut resources = self.resources();
        resources.sort_by_cached_key(|rm| rm.sort_key());

        if let Err(e) = self.prepare_resources(&resources) {
            self.cleanup(&resources);
            self.notify_after_completion_logged();
            return Err(e);
        }

        for rm in &resources {
            if let Err(e) = rm.tpc_finish(self) {
                log::error!(
                    target: "txn",
                    "[CRITICAL] txn.{} A storage error occurred during the second phase of the \
                     two-phase commit ({}): {}. Resources may be in an inconsistent state.",
                    self.id(),
                    rm.sort_key(),
                    e
                );
                self.notify_after_completion_logged();
                return Err(e);
            }
        }
        Ok(())
    }

    fn prepare_resources(&self, resources: &[Arc<dyn ResourceManager>]) -> TransactionResult<()> {
        for rm in resources {
            rm.tpc_begin(self)?;
        }
        for rm in resources {
            rm.commit(self)?;
            log::debug!(target: "txn", "txn.{} commit {}", self.id(), rm.sort_key());
        }
        for rm in resources {
            rm.tpc_vote(self)?;
            self.inner.state.lock().voted.insert(resource_key(rm));
        }
        Ok(())
    }

    /// 在投票阶段（或保存点创建）失败后撤销参与者的改动
    ///
    /// 未投票者先收到 abort，随后所有参与者收到 tpc_abort；清理中的错误只记录日志
    pub(crate) fn cleanup(&self, resources: &[Arc<dyn ResourceManager>]) {
        let voted = self.inner.state.lock().voted.clone();

        for rm in resources {
            if !voted.contains(&resource_key(rm)) {
                if let Err(e) = rm.abort(self) {
                    log::error!(target: "txn", "txn.{} Error in abort() on manager {}: {}", self.id(), rm.sort_key(), e);
                }
            }
        }
        for rm in resources {
            if let Err(e) = rm.tpc_abort(self) {
                log::error!(target: "txn", "txn.{} Error in tpc_abort() on manager {}: {}", self.id(), rm.sort_key(), e);
            }
        }
    }

    fn notify_after_completion_logged(&self) {
        if let Some(synchronizers) = self.synchronizers() {
            if let Err(e) = synchronizers.map(|s| s.after_completion(self)) {
                log::error!(target: "txn", "txn.{} after_completion failed: {}", self.id(), e);
            }
        }
    }
}
