//! 事务状态机
//!
//! [`Transaction`] 是一个可克隆的句柄，所有克隆共享同一份事务状态。
//! 内部状态由 `parking_lot::Mutex` 保护；调用资源管理器、钩子或同步器时绝不持有锁，
//! 因此参与者可以在回调中安全地重新进入事务（例如在钩子中注册新钩子）。

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use crate::transaction::hooks::HookLists;
use crate::transaction::manager::ManagerInner;
use crate::transaction::savepoint::{AbortSavepoint, SavepointInner};
use crate::transaction::synchronizer::Synchronizer;
use crate::transaction::two_phase::{resource_key, ResourceManager};
use crate::transaction::{
    FailureContext, TransactionError, TransactionId, TransactionResult, TransactionStatus,
};
use crate::utils::WeakSet;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// 事务内部可变状态
pub(crate) struct TransactionState {
    pub(crate) status: TransactionStatus,
    /// 提交成功或中止后置位，事务不再接受 join/savepoint/commit
    pub(crate) closed: bool,
    pub(crate) resources: Vec<Arc<dyn ResourceManager>>,
    pub(crate) voted: HashSet<usize>,
    pub(crate) savepoint_index: u64,
    pub(crate) savepoints: Vec<(Weak<SavepointInner>, u64)>,
    user: String,
    description: String,
    extension: BTreeMap<String, Value>,
    failure: Option<Arc<FailureContext>>,
    synchronizers: Option<Arc<WeakSet<dyn Synchronizer>>>,
    manager: Option<Weak<ManagerInner>>,
}

pub(crate) struct TransactionInner {
    id: TransactionId,
    pub(crate) state: Mutex<TransactionState>,
    pub(crate) hooks: Mutex<HookLists>,
    data: Mutex<HashMap<usize, Arc<dyn Any + Send + Sync>>>,
}

/// 事务句柄
#[derive(Clone)]
pub struct Transaction {
    pub(crate) inner: Arc<TransactionInner>,
}

impl Transaction {
    /// 创建不属于任何事务管理器的独立事务
    pub fn new() -> Self {
        Self::build(Arc::new(WeakSet::new()), None)
    }

    pub(crate) fn with_manager(
        synchronizers: Arc<WeakSet<dyn Synchronizer>>,
        manager: Weak<ManagerInner>,
    ) -> Self {
        Self::build(synchronizers, Some(manager))
    }

    fn build(
        synchronizers: Arc<WeakSet<dyn Synchronizer>>,
        manager: Option<Weak<ManagerInner>>,
    ) -> Self {
        let id = NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed);
        let state = TransactionState {
            status: TransactionStatus::Active,
            closed: false,
            resources: Vec::new(),
            voted: HashSet::new(),
            savepoint_index: 0,
            savepoints: Vec::new(),
            user: String::new(),
            description: String::new(),
            extension: BTreeMap::new(),
            failure: None,
            synchronizers: Some(synchronizers),
            manager,
        };
        log::debug!(target: "txn", "txn.{} new transaction", id);
        Self {
            inner: Arc::new(TransactionInner {
                id,
                state: Mutex::new(state),
                hooks: Mutex::new(HookLists::default()),
                data: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    pub fn status(&self) -> TransactionStatus {
        self.inner.state.lock().status
    }

    pub(crate) fn set_status(&self, status: TransactionStatus) {
        self.inner.state.lock().status = status;
    }

    /// 事务是否已经结束（提交成功或已中止）
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn is_doomed(&self) -> bool {
        self.status() == TransactionStatus::Doomed
    }

    /// 标记事务注定失败
    ///
    /// 已处于 Doomed 时无效果；在提交过程中或提交之后调用返回 [`TransactionError::NonDoomable`]
    pub fn doom(&self) -> TransactionResult<()> {
        let mut state = self.inner.state.lock();
        if state.status == TransactionStatus::Doomed {
            return Ok(());
        }
        if !state.status.can_doom() {
            return Err(TransactionError::NonDoomable(state.status));
        }
        state.status = TransactionStatus::Doomed;
        Ok(())
    }

    /// 加入资源管理器
    ///
    /// 不按身份去重：同一资源管理器加入两次会在提交时被访问两次。
    /// 若已存在保存点，该资源管理器会以 [`AbortSavepoint`] 的形式补入每个存活的保存点。
    pub fn join(&self, resource: Arc<dyn ResourceManager>) -> TransactionResult<()> {
        let live_savepoints = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(TransactionError::Closed);
            }
            if state.status == TransactionStatus::CommitFailed {
                drop(state);
                return Err(self.prior_operation_failed());
            }
            if !state.status.can_join() {
                return Err(TransactionError::InvalidStatus(state.status));
            }
            state.resources.push(resource.clone());
            state.savepoints.retain(|(weak, _)| weak.strong_count() > 0);
            state
                .savepoints
                .iter()
                .filter_map(|(weak, _)| weak.upgrade())
                .collect::<Vec<_>>()
        };

        if !live_savepoints.is_empty() {
            let rollback = Arc::new(AbortSavepoint::new(resource, self.clone()));
            for savepoint in &live_savepoints {
                savepoint.push(rollback.clone());
            }
        }
        Ok(())
    }

    /// 移除资源管理器（按身份比较，移除全部匹配项）
    pub(crate) fn unjoin(&self, resource: &Arc<dyn ResourceManager>) {
        let key = resource_key(resource);
        let removed: Vec<_> = {
            let mut state = self.inner.state.lock();
            let (removed, kept): (Vec<_>, Vec<_>) = mem::take(&mut state.resources)
                .into_iter()
                .partition(|rm| resource_key(rm) == key);
            state.resources = kept;
            removed
        };
        drop(removed);
    }

    /// 当前已加入的资源管理器（按加入顺序）
    pub fn resources(&self) -> Vec<Arc<dyn ResourceManager>> {
        self.inner.state.lock().resources.clone()
    }

    /// 资源管理器是否仍在事务中（按身份比较）
    pub fn contains_resource(&self, resource: &Arc<dyn ResourceManager>) -> bool {
        let key = resource_key(resource);
        self.inner
            .state
            .lock()
            .resources
            .iter()
            .any(|rm| resource_key(rm) == key)
    }

    pub(crate) fn synchronizers(&self) -> Option<Arc<WeakSet<dyn Synchronizer>>> {
        self.inner.state.lock().synchronizers.clone()
    }

    /// 构造复述失败上下文的 [`TransactionError::TransactionFailed`]
    pub(crate) fn prior_operation_failed(&self) -> TransactionError {
        let failure = self.inner.state.lock().failure.clone();
        let context = match failure {
            Some(failure) => failure.render(),
            None => format!("transaction {} is in state {}", self.id(), self.status()),
        };
        TransactionError::TransactionFailed(context)
    }

    /// 记录提交类操作的失败：状态置为 CommitFailed 并捕获失败上下文
    pub(crate) fn save_commitish_error(
        &self,
        operation: &'static str,
        error: TransactionError,
    ) -> TransactionError {
        let context = Arc::new(FailureContext::capture(operation, &error));
        {
            let mut state = self.inner.state.lock();
            state.status = TransactionStatus::CommitFailed;
            state.failure = Some(context);
        }
        log::debug!(target: "txn", "txn.{} {} failed: {}", self.id(), operation, error);
        error
    }

    // ==================== 元数据 ====================

    pub fn user(&self) -> String {
        self.inner.state.lock().user.clone()
    }

    /// 设置用户，使用默认路径 "/"
    pub fn set_user(&self, user_name: &str) {
        self.set_user_with_path(user_name, "/");
    }

    /// 设置用户，存储为 "路径 用户名"
    pub fn set_user_with_path(&self, user_name: &str, path: &str) {
        self.inner.state.lock().user = format!("{} {}", path, user_name);
    }

    pub fn description(&self) -> String {
        self.inner.state.lock().description.clone()
    }

    pub fn set_description(&self, description: impl Into<String>) {
        self.inner.state.lock().description = description.into();
    }

    /// 在描述末尾追加一行（去除首尾空白）
    pub fn note(&self, text: &str) {
        let text = text.trim();
        let mut state = self.inner.state.lock();
        if state.description.is_empty() {
            state.description = text.to_string();
        } else {
            state.description.push('\n');
            state.description.push_str(text);
        }
    }

    pub fn extension(&self) -> BTreeMap<String, Value> {
        self.inner.state.lock().extension.clone()
    }

    pub fn set_extended_info(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.inner
            .state
            .lock()
            .extension
            .insert(name.into(), value.into());
    }

    // ==================== 每对象数据 ====================

    /// 以 `owner` 的身份为键保存数据，事务释放时丢弃
    pub fn set_data<O, T>(&self, owner: &O, value: T)
    where
        O: ?Sized,
        T: Any + Send + Sync,
    {
        let key = owner as *const O as *const () as usize;
        self.inner.data.lock().insert(key, Arc::new(value));
    }

    /// 读取 `owner` 保存的数据；不存在或类型不符时返回 [`TransactionError::DataNotFound`]
    pub fn data<T, O>(&self, owner: &O) -> TransactionResult<Arc<T>>
    where
        O: ?Sized,
        T: Any + Send + Sync,
    {
        let key = owner as *const O as *const () as usize;
        let value = self
            .inner
            .data
            .lock()
            .get(&key)
            .cloned()
            .ok_or(TransactionError::DataNotFound)?;
        value
            .downcast::<T>()
            .map_err(|_| TransactionError::DataNotFound)
    }

    /// 错误是否值得重试：暂时性错误，或任一已加入的资源管理器认为可以重试
    pub fn is_retryable_error(&self, error: &TransactionError) -> bool {
        error.is_transient() || self.resources().iter().any(|rm| rm.should_retry(error))
    }

    // ==================== 中止与释放 ====================

    /// 中止事务
    ///
    /// 任何状态下都可以调用，包括 CommitFailed。所有资源管理器、钩子和同步器都会收到通知，
    /// 过程中的第一个错误在全部通知完成后返回。无论成功与否事务都会被释放。
    pub fn abort(&self) -> TransactionResult<()> {
        let result = self.abort_participants();
        self.free();
        result
    }

    fn abort_participants(&self) -> TransactionResult<()> {
        let mut deferred: Option<TransactionError> = None;

        self.call_before_abort_hooks();
        self.invalidate_all_savepoints();

        let synchronizers = self.synchronizers();
        if let Some(synchronizers) = &synchronizers {
            if let Err(e) = synchronizers.map(|s| s.before_completion(self)) {
                log::error!(target: "txn", "txn.{} Failed to call synchronizers: {}", self.id(), e);
                deferred = Some(e);
            }
        }

        for rm in self.resources() {
            if let Err(e) = rm.abort(self) {
                log::error!(target: "txn", "txn.{} Failed to abort resource manager {}: {}", self.id(), rm.sort_key(), e);
                deferred.get_or_insert(e);
            }
        }

        self.call_after_abort_hooks();

        // 同步器在 after_completion 中看到的事务已不是当前事务，但每对象数据仍然可读
        if let Err(e) = self.free_manager() {
            deferred.get_or_insert(e);
        }
        if let Some(synchronizers) = &synchronizers {
            if let Err(e) = synchronizers.map(|s| s.after_completion(self)) {
                log::error!(target: "txn", "txn.{} after_completion failed: {}", self.id(), e);
                deferred.get_or_insert(e);
            }
        }

        log::debug!(target: "txn", "txn.{} abort", self.id());
        match deferred {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 对所有已加入的资源管理器调用 abort，错误只记录日志
    pub(crate) fn abort_resources_logged(&self) {
        for rm in self.resources() {
            if let Err(e) = rm.abort(self) {
                log::error!(target: "txn", "txn.{} Error in abort() on manager {}: {}", self.id(), rm.sort_key(), e);
            }
        }
    }

    /// 从所属管理器解除当前事务
    pub(crate) fn free_manager(&self) -> TransactionResult<()> {
        let manager = self.inner.state.lock().manager.take();
        match manager.and_then(|weak| weak.upgrade()) {
            Some(manager) => manager.free(self),
            None => Ok(()),
        }
    }

    /// 释放事务持有的全部集合
    ///
    /// 集合在锁外析构，资源管理器的 Drop 实现可以安全地访问本事务
    pub(crate) fn free(&self) {
        let (resources, savepoints, synchronizers, extension) = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.manager = None;
            state.voted.clear();
            (
                mem::take(&mut state.resources),
                mem::take(&mut state.savepoints),
                state.synchronizers.take(),
                mem::take(&mut state.extension),
            )
        };
        let hooks = mem::take(&mut *self.inner.hooks.lock());
        let data = mem::take(&mut *self.inner.data.lock());

        for savepoint in savepoints.iter().filter_map(|(weak, _)| weak.upgrade()) {
            savepoint.invalidate();
        }
        drop((resources, synchronizers, extension, hooks, data));
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Transaction {}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("status", &state.status)
            .field("closed", &state.closed)
            .field("resources", &state.resources.len())
            .finish()
    }
}
