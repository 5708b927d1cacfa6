//! 事务管理器
//!
//! [`TransactionManager`] 至多持有一个当前事务，并维护一组以弱引用登记的同步器。
//! 同步器集合在该管理器创建的所有事务之间共享，因此后登记的同步器同样能观察到后续事务。
//!
//! [`ThreadTransactionManager`] 为每个线程提供私有的 `TransactionManager`；
//! 通过 [`ThreadTransactionManager::manager`] 取得的句柄可以交给其他线程，
//! 用于跨线程登记或注销同步器（例如在关闭流程中）。

use std::cell::RefCell;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use crossbeam_utils::atomic::AtomicCell;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::transaction::attempt::{Attempts, RunOptions};
use crate::transaction::savepoint::Savepoint;
use crate::transaction::synchronizer::Synchronizer;
use crate::transaction::types::*;
use crate::transaction::Transaction;
use crate::utils::WeakSet;

pub(crate) struct ManagerInner {
    explicit: AtomicCell<bool>,
    current: Mutex<Option<Transaction>>,
    synchronizers: Arc<WeakSet<dyn Synchronizer>>,
    config: TransactionManagerConfig,
    stats: TransactionStats,
}

impl ManagerInner {
    /// 解除当前事务；`txn` 不是当前事务时返回 [`TransactionError::ForeignTransaction`]
    pub(crate) fn free(&self, txn: &Transaction) -> TransactionResult<()> {
        let released = {
            let mut current = self.current.lock();
            if current.as_ref() != Some(txn) {
                return Err(TransactionError::ForeignTransaction);
            }
            current.take()
        };
        drop(released);
        Ok(())
    }
}

/// 事务管理器
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<ManagerInner>,
}

impl TransactionManager {
    /// 创建隐式模式的事务管理器
    pub fn new() -> Self {
        Self::with_config(TransactionManagerConfig::default())
    }

    /// 创建显式模式的事务管理器
    pub fn explicit() -> Self {
        Self::with_config(TransactionManagerConfig::default().explicit())
    }

    pub fn with_config(config: TransactionManagerConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                explicit: AtomicCell::new(config.explicit),
                current: Mutex::new(None),
                synchronizers: Arc::new(WeakSet::new()),
                config,
                stats: TransactionStats::new(),
            }),
        }
    }

    pub fn is_explicit(&self) -> bool {
        self.inner.explicit.load()
    }

    pub fn set_explicit(&self, explicit: bool) {
        self.inner.explicit.store(explicit);
    }

    pub fn config(&self) -> &TransactionManagerConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> &TransactionStats {
        &self.inner.stats
    }

    fn create_transaction(&self) -> Transaction {
        self.inner.stats.increment_begun();
        Transaction::with_manager(self.inner.synchronizers.clone(), Arc::downgrade(&self.inner))
    }

    /// 开始新事务
    ///
    /// 隐式模式下先中止已有的当前事务；显式模式下已有当前事务时返回
    /// [`TransactionError::AlreadyInTransaction`]。所有已登记的同步器收到 new_transaction 通知。
    pub fn begin(&self) -> TransactionResult<Transaction> {
        if let Some(existing) = self.current() {
            if self.is_explicit() {
                return Err(TransactionError::AlreadyInTransaction);
            }
            self.inner.stats.increment_aborted();
            existing.abort()?;
        }

        let txn = self.create_transaction();
        *self.inner.current.lock() = Some(txn.clone());
        self.inner
            .synchronizers
            .map(|synch| synch.new_transaction(&txn))?;
        Ok(txn)
    }

    /// 获取当前事务
    ///
    /// 隐式模式下若没有当前事务则创建一个（不通知同步器）；显式模式下返回
    /// [`TransactionError::NoTransaction`]
    pub fn get(&self) -> TransactionResult<Transaction> {
        let mut current = self.inner.current.lock();
        if let Some(txn) = current.as_ref() {
            return Ok(txn.clone());
        }
        if self.is_explicit() {
            return Err(TransactionError::NoTransaction);
        }
        let txn = self.create_transaction();
        *current = Some(txn.clone());
        Ok(txn)
    }

    /// 当前事务（不会创建新事务）
    pub fn current(&self) -> Option<Transaction> {
        self.inner.current.lock().clone()
    }

    pub fn commit(&self) -> TransactionResult<()> {
        let txn = self.get()?;
        match txn.commit() {
            Ok(()) => {
                self.inner.stats.increment_committed();
                Ok(())
            }
            Err(e) => {
                self.inner.stats.increment_commit_failures();
                Err(e)
            }
        }
    }

    pub fn abort(&self) -> TransactionResult<()> {
        let txn = self.get()?;
        self.inner.stats.increment_aborted();
        txn.abort()
    }

    pub fn doom(&self) -> TransactionResult<()> {
        self.get()?.doom()
    }

    pub fn is_doomed(&self) -> TransactionResult<bool> {
        Ok(self.get()?.is_doomed())
    }

    pub fn savepoint(&self, optimistic: bool) -> TransactionResult<Savepoint> {
        self.get()?.savepoint(optimistic)
    }

    /// 登记同步器；若已有当前事务，立即以该事务调用 new_transaction
    pub fn register_synch(&self, synch: Arc<dyn Synchronizer>) -> TransactionResult<()> {
        self.inner.synchronizers.add(&synch);
        if let Some(txn) = self.current() {
            synch.new_transaction(&txn)?;
        }
        Ok(())
    }

    pub fn unregister_synch(&self, synch: &(dyn Synchronizer + 'static)) {
        self.inner.synchronizers.remove(synch);
    }

    pub fn clear_synchs(&self) {
        self.inner.synchronizers.clear();
    }

    /// 是否存在存活的已登记同步器
    pub fn registered_synchs(&self) -> bool {
        !self.inner.synchronizers.is_empty()
    }

    /// 错误是否值得重试
    ///
    /// 暂时性错误总是可以重试；否则询问当前事务中的资源管理器。没有当前事务时不会创建事务。
    pub fn retryable(&self, error: &TransactionError) -> bool {
        if error.is_transient() {
            return true;
        }
        match self.current() {
            Some(txn) => txn.resources().iter().any(|rm| rm.should_retry(error)),
            None => false,
        }
    }

    /// 在新事务中执行 `body`：成功则提交，失败则中止并返回原始错误
    pub fn with_transaction<T, F>(&self, body: F) -> TransactionResult<T>
    where
        F: FnOnce(&Transaction) -> TransactionResult<T>,
    {
        let txn = self.begin()?;
        match body(&txn) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                self.abort()?;
                Err(e)
            }
        }
    }

    /// 最多尝试 `number` 次的事务序列，`number` 为 0 时返回 [`TransactionError::InvalidArgument`]
    pub fn attempts(&self, number: usize) -> TransactionResult<Attempts> {
        Attempts::new(self.clone(), number)
    }

    /// 使用配置中的默认次数
    pub fn default_attempts(&self) -> TransactionResult<Attempts> {
        self.attempts(self.inner.config.default_attempts)
    }

    /// 在事务中执行 `func`，遇到可重试错误时按配置的默认次数重试
    pub fn run<T, F>(&self, func: F) -> TransactionResult<T>
    where
        F: FnMut() -> TransactionResult<T>,
    {
        self.run_with(RunOptions::new(), func)
    }

    /// 与 [`TransactionManager::run`] 相同，但使用指定的选项
    pub fn run_with<T, F>(&self, options: RunOptions, mut func: F) -> TransactionResult<T>
    where
        F: FnMut() -> TransactionResult<T>,
    {
        let tries = options.tries.unwrap_or(self.inner.config.default_run_tries);
        if tries == 0 {
            return Err(TransactionError::InvalidArgument("tries must be > 0".to_string()));
        }
        let note = options.note_text();

        let mut try_no = 0;
        loop {
            try_no += 1;
            let txn = self.begin()?;
            if let Some(note) = &note {
                txn.note(note);
            }

            let outcome = func().and_then(|value| {
                self.commit()?;
                Ok(value)
            });
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) => {
                    // 必须在中止之前判断：中止后资源管理器已离开事务
                    let retry = try_no < tries && self.retryable(&e);
                    self.abort()?;
                    if !retry {
                        return Err(e);
                    }
                    log::debug!(target: "txn", "txn.{} retrying after attempt {}/{}: {}", txn.id(), try_no, tries, e);
                }
            }
        }
    }

    /// 将 `func` 包装成每次调用都通过 [`TransactionManager::run_with`] 执行的闭包
    pub fn decorate<T, F>(&self, options: RunOptions, mut func: F) -> impl FnMut() -> TransactionResult<T>
    where
        F: FnMut() -> TransactionResult<T>,
    {
        let manager = self.clone();
        move || manager.run_with(options.clone(), &mut func)
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for TransactionManager {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for TransactionManager {}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("explicit", &self.is_explicit())
            .field("current", &self.current().map(|txn| txn.id()))
            .field("synchronizers", &self.inner.synchronizers.len())
            .finish()
    }
}

/// 线程隔离的事务管理器
///
/// 每个线程在首次访问时获得自己的 `TransactionManager`。注册表由调用方创建并注入，
/// 不依赖进程级全局状态。线程退出时，它的管理器从注册表中移除，
/// 未完成的当前事务被中止。
pub struct ThreadTransactionManager {
    config: TransactionManagerConfig,
    managers: Arc<ThreadManagers>,
}

type ThreadManagers = DashMap<ThreadId, TransactionManager>;

/// 线程退出时清理该线程在某个注册表中的条目
struct ThreadSlot {
    registry: Weak<ThreadManagers>,
    thread: ThreadId,
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let released = registry.remove(&self.thread).map(|(_, manager)| manager);
        drop(registry);

        let Some(manager) = released else {
            return;
        };
        if let Some(txn) = manager.current() {
            log::debug!(target: "txn", "txn.{} aborted at thread exit", txn.id());
            if let Err(e) = manager.abort() {
                log::error!(target: "txn", "txn.{} abort at thread exit failed: {}", txn.id(), e);
            }
        }
    }
}

thread_local! {
    static THREAD_SLOTS: RefCell<Vec<ThreadSlot>> = const { RefCell::new(Vec::new()) };
}

impl ThreadTransactionManager {
    pub fn new() -> Self {
        Self::with_config(TransactionManagerConfig::default())
    }

    pub fn with_config(config: TransactionManagerConfig) -> Self {
        Self {
            config,
            managers: Arc::new(DashMap::new()),
        }
    }

    /// 当前线程的事务管理器
    ///
    /// 返回的句柄可以发送给其他线程；除同步器登记外，其余操作应只由所属线程调用
    pub fn manager(&self) -> TransactionManager {
        let thread = thread::current().id();
        if let Some(manager) = self.managers.get(&thread) {
            return manager.clone();
        }

        let manager = self
            .managers
            .entry(thread)
            .or_insert_with(|| TransactionManager::with_config(self.config.clone()))
            .clone();
        self.track_current_thread(thread);
        manager
    }

    fn track_current_thread(&self, thread: ThreadId) {
        let registry = Arc::downgrade(&self.managers);
        // 线程正在退出时本地存储已销毁，此时不再登记
        let _ = THREAD_SLOTS.try_with(|slots| {
            let mut slots = slots.borrow_mut();
            slots.retain(|slot| slot.registry.strong_count() > 0);
            if !slots.iter().any(|slot| slot.registry.ptr_eq(&registry)) {
                slots.push(ThreadSlot { registry, thread });
            }
        });
    }

    /// 丢弃当前线程的事务管理器，返回被丢弃的管理器
    pub fn release_current_thread(&self) -> Option<TransactionManager> {
        self.managers
            .remove(&thread::current().id())
            .map(|(_, manager)| manager)
    }

    /// 已创建管理器且尚未退出的线程数
    pub fn thread_count(&self) -> usize {
        self.managers.len()
    }

    pub fn is_explicit(&self) -> bool {
        self.manager().is_explicit()
    }

    pub fn set_explicit(&self, explicit: bool) {
        self.manager().set_explicit(explicit);
    }

    pub fn begin(&self) -> TransactionResult<Transaction> {
        self.manager().begin()
    }

    pub fn get(&self) -> TransactionResult<Transaction> {
        self.manager().get()
    }

    pub fn commit(&self) -> TransactionResult<()> {
        self.manager().commit()
    }

    pub fn abort(&self) -> TransactionResult<()> {
        self.manager().abort()
    }

    pub fn doom(&self) -> TransactionResult<()> {
        self.manager().doom()
    }

    pub fn is_doomed(&self) -> TransactionResult<bool> {
        self.manager().is_doomed()
    }

    pub fn savepoint(&self, optimistic: bool) -> TransactionResult<Savepoint> {
        self.manager().savepoint(optimistic)
    }

    pub fn register_synch(&self, synch: Arc<dyn Synchronizer>) -> TransactionResult<()> {
        self.manager().register_synch(synch)
    }

    pub fn unregister_synch(&self, synch: &(dyn Synchronizer + 'static)) {
        self.manager().unregister_synch(synch);
    }

    pub fn clear_synchs(&self) {
        self.manager().clear_synchs();
    }

    pub fn registered_synchs(&self) -> bool {
        self.manager().registered_synchs()
    }

    pub fn with_transaction<T, F>(&self, body: F) -> TransactionResult<T>
    where
        F: FnOnce(&Transaction) -> TransactionResult<T>,
    {
        self.manager().with_transaction(body)
    }

    pub fn attempts(&self, number: usize) -> TransactionResult<Attempts> {
        self.manager().attempts(number)
    }

    pub fn run<T, F>(&self, func: F) -> TransactionResult<T>
    where
        F: FnMut() -> TransactionResult<T>,
    {
        self.manager().run(func)
    }

    pub fn run_with<T, F>(&self, options: RunOptions, func: F) -> TransactionResult<T>
    where
        F: FnMut() -> TransactionResult<T>,
    {
        self.manager().run_with(options, func)
    }
}

impl Default for ThreadTransactionManager {
    fn default() -> Self {
        Self::new()
    }
}
