//! 集成测试共享工具模块
//!
//! 提供记录调用顺序的资源管理器、支持保存点的示例数据管理器和记录型同步器

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use txncoord::transaction::{
    ResourceManager, ResourceSavepoint, SavepointResourceManager, Synchronizer, Transaction,
    TransactionError, TransactionResult,
};

/// 共享的调用日志，元素形如 "tpc_begin:aaa"
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn calls(log: &CallLog) -> Vec<String> {
    log.lock().clone()
}

/// 只保留以 `prefix` 开头的调用
pub fn calls_with_prefix(log: &CallLog, prefix: &str) -> Vec<String> {
    log.lock()
        .iter()
        .filter(|c| c.starts_with(prefix))
        .cloned()
        .collect()
}

/// 记录调用顺序的资源管理器
///
/// 可以指定在某个方法上失败，也可以指定把包含某段文本的错误视为可重试
pub struct RecordingResource {
    key: String,
    label: String,
    log: CallLog,
    fail_on: Option<&'static str>,
    retry_on: Option<String>,
}

impl RecordingResource {
    pub fn new(key: &str, log: &CallLog) -> Self {
        Self {
            key: key.to_string(),
            label: key.to_string(),
            log: log.clone(),
            fail_on: None,
            retry_on: None,
        }
    }

    /// 日志中使用的名称，默认与排序键相同
    pub fn labelled(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn failing_on(mut self, method: &'static str) -> Self {
        self.fail_on = Some(method);
        self
    }

    pub fn retrying_on(mut self, text: &str) -> Self {
        self.retry_on = Some(text.to_string());
        self
    }

    pub fn shared(self) -> Arc<dyn ResourceManager> {
        Arc::new(self)
    }

    fn call(&self, method: &'static str) -> TransactionResult<()> {
        self.log.lock().push(format!("{}:{}", method, self.label));
        if self.fail_on == Some(method) {
            return Err(TransactionError::participant_msg(format!(
                "{} failed in {}",
                self.label, method
            )));
        }
        Ok(())
    }
}

impl ResourceManager for RecordingResource {
    fn abort(&self, _txn: &Transaction) -> TransactionResult<()> {
        self.call("abort")
    }

    fn tpc_begin(&self, _txn: &Transaction) -> TransactionResult<()> {
        self.call("tpc_begin")
    }

    fn commit(&self, _txn: &Transaction) -> TransactionResult<()> {
        self.call("commit")
    }

    fn tpc_vote(&self, _txn: &Transaction) -> TransactionResult<()> {
        self.call("tpc_vote")
    }

    fn tpc_finish(&self, _txn: &Transaction) -> TransactionResult<()> {
        self.call("tpc_finish")
    }

    fn tpc_abort(&self, _txn: &Transaction) -> TransactionResult<()> {
        self.call("tpc_abort")
    }

    fn sort_key(&self) -> String {
        self.key.clone()
    }

    fn should_retry(&self, error: &TransactionError) -> bool {
        match &self.retry_on {
            Some(text) => error.to_string().contains(text.as_str()),
            None => false,
        }
    }
}

#[derive(Default)]
struct SampleState {
    committed: BTreeMap<String, String>,
    uncommitted: BTreeMap<String, String>,
    prepared: bool,
    transaction: Option<Transaction>,
}

/// 支持保存点的示例数据管理器
///
/// 改动写入 `uncommitted`，`tpc_finish` 后成为 `committed`，`abort` 丢弃改动。
/// 首次写入时自动加入当前事务。
#[derive(Clone)]
pub struct SampleDataManager {
    key: String,
    state: Arc<Mutex<SampleState>>,
}

impl SampleDataManager {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            state: Arc::new(Mutex::new(SampleState::default())),
        }
    }

    /// 在事务中写入键值；首次写入时加入事务
    pub fn put(&self, txn: &Transaction, key: &str, value: &str) -> TransactionResult<()> {
        let needs_join = {
            let mut state = self.state.lock();
            let needs_join = state.transaction.as_ref() != Some(txn);
            if needs_join {
                state.uncommitted = state.committed.clone();
                state.transaction = Some(txn.clone());
            }
            state.uncommitted.insert(key.to_string(), value.to_string());
            needs_join
        };
        if needs_join {
            txn.join(Arc::new(self.clone()))?;
        }
        Ok(())
    }

    /// 事务内可见的值
    pub fn get(&self, key: &str) -> Option<String> {
        let state = self.state.lock();
        if state.transaction.is_some() {
            state.uncommitted.get(key).cloned()
        } else {
            state.committed.get(key).cloned()
        }
    }

    /// 已提交的值
    pub fn committed(&self, key: &str) -> Option<String> {
        self.state.lock().committed.get(key).cloned()
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.uncommitted.clear();
        state.prepared = false;
        state.transaction = None;
    }
}

impl ResourceManager for SampleDataManager {
    fn abort(&self, _txn: &Transaction) -> TransactionResult<()> {
        self.reset();
        Ok(())
    }

    fn tpc_begin(&self, _txn: &Transaction) -> TransactionResult<()> {
        Ok(())
    }

    fn commit(&self, _txn: &Transaction) -> TransactionResult<()> {
        Ok(())
    }

    fn tpc_vote(&self, _txn: &Transaction) -> TransactionResult<()> {
        self.state.lock().prepared = true;
        Ok(())
    }

    fn tpc_finish(&self, _txn: &Transaction) -> TransactionResult<()> {
        let mut state = self.state.lock();
        if !state.prepared {
            return Err(TransactionError::participant_msg("tpc_finish before tpc_vote"));
        }
        state.committed = std::mem::take(&mut state.uncommitted);
        state.prepared = false;
        state.transaction = None;
        Ok(())
    }

    fn tpc_abort(&self, _txn: &Transaction) -> TransactionResult<()> {
        self.reset();
        Ok(())
    }

    fn sort_key(&self) -> String {
        self.key.clone()
    }

    fn as_savepoint_manager(&self) -> Option<&dyn SavepointResourceManager> {
        Some(self)
    }
}

impl SavepointResourceManager for SampleDataManager {
    fn savepoint(&self, _txn: &Transaction) -> TransactionResult<Box<dyn ResourceSavepoint>> {
        let snapshot = self.state.lock().uncommitted.clone();
        Ok(Box::new(SampleSavepoint {
            manager: self.clone(),
            snapshot,
        }))
    }
}

struct SampleSavepoint {
    manager: SampleDataManager,
    snapshot: BTreeMap<String, String>,
}

impl ResourceSavepoint for SampleSavepoint {
    fn rollback(&self) -> TransactionResult<()> {
        self.manager.state.lock().uncommitted = self.snapshot.clone();
        Ok(())
    }
}

/// 记录通知的同步器
pub struct RecordingSynch {
    name: String,
    log: CallLog,
    fail_before: bool,
}

impl RecordingSynch {
    pub fn new(name: &str, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: log.clone(),
            fail_before: false,
        })
    }

    /// before_completion 总是失败
    pub fn failing_before(name: &str, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: log.clone(),
            fail_before: true,
        })
    }
}

impl Synchronizer for RecordingSynch {
    fn before_completion(&self, txn: &Transaction) -> TransactionResult<()> {
        self.log
            .lock()
            .push(format!("before_completion:{}:{}", self.name, txn.id()));
        if self.fail_before {
            return Err(TransactionError::participant_msg(format!(
                "{} refused before_completion",
                self.name
            )));
        }
        Ok(())
    }

    fn after_completion(&self, txn: &Transaction) -> TransactionResult<()> {
        self.log
            .lock()
            .push(format!("after_completion:{}:{}", self.name, txn.id()));
        Ok(())
    }

    fn new_transaction(&self, txn: &Transaction) -> TransactionResult<()> {
        self.log
            .lock()
            .push(format!("new_transaction:{}:{}", self.name, txn.id()));
        Ok(())
    }
}
