//! 保存点模块
//!
//! 保存点由创建时已加入事务的每个资源管理器各自的子保存点组成，支持部分回滚。
//! 回滚某个保存点会使序号更大的保存点全部失效；事务结束时所有保存点失效。

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::transaction::two_phase::ResourceManager;
use crate::transaction::{Transaction, TransactionError, TransactionResult, TransactionStatus};

/// 资源管理器级别的保存点
pub trait ResourceSavepoint: Send + Sync {
    fn rollback(&self) -> TransactionResult<()>;
}

/// 支持保存点的资源管理器
///
/// 实现方还需要在 [`ResourceManager::as_savepoint_manager`] 中返回 `Some(self)`
pub trait SavepointResourceManager: ResourceManager {
    fn savepoint(&self, txn: &Transaction) -> TransactionResult<Box<dyn ResourceSavepoint>>;
}

pub(crate) struct SavepointInner {
    transaction: Mutex<Option<Transaction>>,
    sub_savepoints: Mutex<Vec<Arc<dyn ResourceSavepoint>>>,
}

impl SavepointInner {
    /// 使保存点永久失效
    pub(crate) fn invalidate(&self) {
        let released = self.transaction.lock().take();
        drop(released);
    }

    /// 追加子保存点（用于保存点之后才加入的资源管理器）
    pub(crate) fn push(&self, savepoint: Arc<dyn ResourceSavepoint>) {
        self.sub_savepoints.lock().push(savepoint);
    }
}

/// 事务保存点
pub struct Savepoint {
    inner: Arc<SavepointInner>,
}

impl Savepoint {
    /// 保存点是否仍然有效
    pub fn valid(&self) -> bool {
        self.inner.transaction.lock().is_some()
    }

    /// 所属事务，失效后返回 `None`
    pub fn transaction(&self) -> Option<Transaction> {
        self.inner.transaction.lock().clone()
    }

    /// 回滚到该保存点
    ///
    /// 任一子保存点回滚失败时，事务进入 CommitFailed，只能中止
    pub fn rollback(&self) -> TransactionResult<()> {
        let txn = self.transaction().ok_or_else(|| {
            TransactionError::InvalidSavepointRollback("invalidated by a later savepoint".to_string())
        })?;
        txn.remove_and_invalidate_after(&self.inner);

        let sub_savepoints = self.inner.sub_savepoints.lock().clone();
        for savepoint in &sub_savepoints {
            if let Err(e) = savepoint.rollback() {
                return Err(txn.save_commitish_error("savepoint rollback", e));
            }
        }
        log::debug!(target: "txn", "txn.{} rolled back savepoint ({} resources)", txn.id(), sub_savepoints.len());
        Ok(())
    }
}

impl fmt::Debug for Savepoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Savepoint")
            .field("valid", &self.valid())
            .field("sub_savepoints", &self.inner.sub_savepoints.lock().len())
            .finish()
    }
}

/// 为保存点之后加入的资源管理器合成的子保存点：回滚即完全中止并移出事务
pub struct AbortSavepoint {
    resource: Arc<dyn ResourceManager>,
    transaction: Transaction,
}

impl AbortSavepoint {
    pub fn new(resource: Arc<dyn ResourceManager>, transaction: Transaction) -> Self {
        Self {
            resource,
            transaction,
        }
    }
}

impl ResourceSavepoint for AbortSavepoint {
    fn rollback(&self) -> TransactionResult<()> {
        self.resource.abort(&self.transaction)?;
        self.transaction.unjoin(&self.resource);
        Ok(())
    }
}

/// 乐观保存点中不支持保存点的资源管理器的占位：持有无害，回滚必然失败
pub struct NoRollbackSavepoint {
    sort_key: String,
}

impl NoRollbackSavepoint {
    pub fn new(resource: &dyn ResourceManager) -> Self {
        Self {
            sort_key: resource.sort_key(),
        }
    }
}

impl ResourceSavepoint for NoRollbackSavepoint {
    fn rollback(&self) -> TransactionResult<()> {
        Err(TransactionError::SavepointsUnsupported(self.sort_key.clone()))
    }
}

impl Transaction {
    /// 创建保存点
    ///
    /// `optimistic` 为真时，不支持保存点的资源管理器以 [`NoRollbackSavepoint`] 占位；
    /// 否则创建失败，所有资源管理器被中止，事务进入 CommitFailed
    pub fn savepoint(&self, optimistic: bool) -> TransactionResult<Savepoint> {
        let (status, closed, resources) = {
            let state = self.inner.state.lock();
            (state.status, state.closed, state.resources.clone())
        };
        if closed {
            return Err(TransactionError::Closed);
        }
        if status == TransactionStatus::CommitFailed {
            return Err(self.prior_operation_failed());
        }

        let mut sub_savepoints: Vec<Arc<dyn ResourceSavepoint>> = Vec::with_capacity(resources.len());
        for rm in &resources {
            match self.resource_savepoint(rm, optimistic) {
                Ok(savepoint) => sub_savepoints.push(savepoint),
                Err(e) => {
                    self.cleanup(&resources);
                    return Err(self.save_commitish_error("savepoint", e));
                }
            }
        }

        let inner = Arc::new(SavepointInner {
            transaction: Mutex::new(Some(self.clone())),
            sub_savepoints: Mutex::new(sub_savepoints),
        });
        {
            let mut state = self.inner.state.lock();
            state.savepoint_index += 1;
            let index = state.savepoint_index;
            state.savepoints.retain(|(weak, _)| weak.strong_count() > 0);
            state.savepoints.push((Arc::downgrade(&inner), index));
        }
        Ok(Savepoint { inner })
    }

    fn resource_savepoint(
        &self,
        rm: &Arc<dyn ResourceManager>,
        optimistic: bool,
    ) -> TransactionResult<Arc<dyn ResourceSavepoint>> {
        match rm.as_savepoint_manager() {
            Some(manager) => manager.savepoint(self).map(Arc::from),
            None if optimistic => Ok(Arc::new(NoRollbackSavepoint::new(&**rm))),
            None => Err(TransactionError::SavepointsUnsupported(rm.sort_key())),
        }
    }

    /// 移除并使序号大于 `target` 的保存点失效
    pub(crate) fn remove_and_invalidate_after(&self, target: &Arc<SavepointInner>) {
        let removed: Vec<Arc<SavepointInner>> = {
            let mut state = self.inner.state.lock();
            let index = state
                .savepoints
                .iter()
                .find(|(weak, _)| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(target)))
                .map(|(_, index)| *index);
            let Some(index) = index else {
                return;
            };

            let mut removed = Vec::new();
            state.savepoints.retain(|(weak, i)| {
                if *i > index {
                    removed.extend(weak.upgrade());
                    false
                } else {
                    true
                }
            });
            removed
        };
        for savepoint in &removed {
            savepoint.invalidate();
        }
    }

    /// 使全部保存点失效
    pub(crate) fn invalidate_all_savepoints(&self) {
        let all = std::mem::take(&mut self.inner.state.lock().savepoints);
        for savepoint in all.iter().filter_map(|(weak, _)| weak.upgrade()) {
            savepoint.invalidate();
        }
    }
}
