//! 提交/中止钩子
//!
//! 每个事务维护四个独立的钩子队列。钩子在执行时可以继续向同一队列追加钩子，
//! 新追加的钩子在队列被视为排空之前同样会被调用。

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::mem;
use std::sync::Arc;

use serde_json::Value;

use crate::transaction::{Transaction, TransactionResult};

/// 提交前、中止前、中止后钩子的函数类型
pub type HookFn =
    dyn Fn(&[Value], &BTreeMap<String, Value>) -> TransactionResult<()> + Send + Sync;

/// 提交后钩子的函数类型，第一个参数为提交是否成功
pub type AfterCommitHookFn =
    dyn Fn(bool, &[Value], &BTreeMap<String, Value>) -> TransactionResult<()> + Send + Sync;

/// 钩子登记记录：可调用对象、位置参数、命名参数
pub struct Hook<F: ?Sized> {
    callable: Arc<F>,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
}

impl<F: ?Sized> Hook<F> {
    pub fn callable(&self) -> &Arc<F> {
        &self.callable
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &BTreeMap<String, Value> {
        &self.kwargs
    }
}

impl<F: ?Sized> Clone for Hook<F> {
    fn clone(&self) -> Self {
        Self {
            callable: self.callable.clone(),
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
        }
    }
}

impl<F: ?Sized> fmt::Debug for Hook<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("args", &self.args)
            .field("kwargs", &self.kwargs)
            .finish()
    }
}

#[derive(Default)]
pub(crate) struct HookLists {
    before_commit: VecDeque<Hook<HookFn>>,
    after_commit: VecDeque<Hook<AfterCommitHookFn>>,
    before_abort: VecDeque<Hook<HookFn>>,
    after_abort: VecDeque<Hook<HookFn>>,
}

impl HookLists {
    fn before_commit(&mut self) -> &mut VecDeque<Hook<HookFn>> {
        &mut self.before_commit
    }

    fn after_commit(&mut self) -> &mut VecDeque<Hook<AfterCommitHookFn>> {
        &mut self.after_commit
    }

    fn before_abort(&mut self) -> &mut VecDeque<Hook<HookFn>> {
        &mut self.before_abort
    }

    fn after_abort(&mut self) -> &mut VecDeque<Hook<HookFn>> {
        &mut self.after_abort
    }
}

type Selector<F> = fn(&mut HookLists) -> &mut VecDeque<Hook<F>>;

impl Transaction {
    pub fn add_before_commit_hook<F>(&self, hook: F, args: Vec<Value>, kwargs: BTreeMap<String, Value>)
    where
        F: Fn(&[Value], &BTreeMap<String, Value>) -> TransactionResult<()> + Send + Sync + 'static,
    {
        let callable: Arc<HookFn> = Arc::new(hook);
        self.inner.hooks.lock().before_commit.push_back(Hook { callable, args, kwargs });
    }

    pub fn add_after_commit_hook<F>(&self, hook: F, args: Vec<Value>, kwargs: BTreeMap<String, Value>)
    where
        F: Fn(bool, &[Value], &BTreeMap<String, Value>) -> TransactionResult<()> + Send + Sync + 'static,
    {
        let callable: Arc<AfterCommitHookFn> = Arc::new(hook);
        self.inner.hooks.lock().after_commit.push_back(Hook { callable, args, kwargs });
    }

    pub fn add_before_abort_hook<F>(&self, hook: F, args: Vec<Value>, kwargs: BTreeMap<String, Value>)
    where
        F: Fn(&[Value], &BTreeMap<String, Value>) -> TransactionResult<()> + Send + Sync + 'static,
    {
        let callable: Arc<HookFn> = Arc::new(hook);
        self.inner.hooks.lock().before_abort.push_back(Hook { callable, args, kwargs });
    }

    pub fn add_after_abort_hook<F>(&self, hook: F, args: Vec<Value>, kwargs: BTreeMap<String, Value>)
    where
        F: Fn(&[Value], &BTreeMap<String, Value>) -> TransactionResult<()> + Send + Sync + 'static,
    {
        let callable: Arc<HookFn> = Arc::new(hook);
        self.inner.hooks.lock().after_abort.push_back(Hook { callable, args, kwargs });
    }

    pub fn before_commit_hooks(&self) -> Vec<Hook<HookFn>> {
        self.inner.hooks.lock().before_commit.iter().cloned().collect()
    }

    pub fn after_commit_hooks(&self) -> Vec<Hook<AfterCommitHookFn>> {
        self.inner.hooks.lock().after_commit.iter().cloned().collect()
    }

    pub fn before_abort_hooks(&self) -> Vec<Hook<HookFn>> {
        self.inner.hooks.lock().before_abort.iter().cloned().collect()
    }

    pub fn after_abort_hooks(&self) -> Vec<Hook<HookFn>> {
        self.inner.hooks.lock().after_abort.iter().cloned().collect()
    }

    /// 提交前钩子：第一个错误立即返回，剩余钩子不再调用，并中止所有资源管理器
    pub(crate) fn call_before_commit_hooks(&self) -> TransactionResult<()> {
        let result = self.call_hooks(
            "before-commit",
            HookLists::before_commit,
            |hook| (hook.callable)(hook.args.as_slice(), &hook.kwargs),
            true,
            false,
        );
        if result.is_err() {
            self.abort_resources_logged();
        }
        result
    }

    pub(crate) fn call_after_commit_hooks(&self, status: bool) {
        let _ = self.call_hooks(
            "after-commit",
            HookLists::after_commit,
            |hook| (hook.callable)(status, hook.args.as_slice(), &hook.kwargs),
            false,
            true,
        );
    }

    pub(crate) fn call_before_abort_hooks(&self) {
        let _ = self.call_hooks(
            "before-abort",
            HookLists::before_abort,
            |hook| (hook.callable)(hook.args.as_slice(), &hook.kwargs),
            false,
            false,
        );
    }

    pub(crate) fn call_after_abort_hooks(&self) {
        let _ = self.call_hooks(
            "after-abort",
            HookLists::after_abort,
            |hook| (hook.callable)(hook.args.as_slice(), &hook.kwargs),
            false,
            true,
        );
    }

    /// 排空钩子队列
    ///
    /// `propagate` 为真时遇到第一个错误即停止并返回；否则记录日志后继续。
    /// 队列非空时，结束后清空队列；`clean` 为真时再中止所有资源管理器。
    fn call_hooks<F, I>(
        &self,
        kind: &'static str,
        select: Selector<F>,
        mut invoke: I,
        propagate: bool,
        clean: bool,
    ) -> TransactionResult<()>
    where
        F: ?Sized,
        I: FnMut(&Hook<F>) -> TransactionResult<()>,
    {
        if select(&mut self.inner.hooks.lock()).is_empty() {
            return Ok(());
        }

        let mut result = Ok(());
        loop {
            let next = select(&mut self.inner.hooks.lock()).pop_front();
            let Some(hook) = next else {
                break;
            };
            if let Err(e) = invoke(&hook) {
                if propagate {
                    result = Err(e);
                    break;
                }
                log::error!(target: "txn", "txn.{} Error in {} hook: {}", self.id(), kind, e);
            }
        }

        let remaining = mem::take(select(&mut self.inner.hooks.lock()));
        drop(remaining);
        if clean {
            self.abort_resources_logged();
        }
        result
    }
}
