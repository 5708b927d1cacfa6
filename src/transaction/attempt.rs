//! 重试机制
//!
//! [`Attempts`] 是一次性、有限的事务尝试序列：前 n−1 个元素是重试守卫，
//! 成功即结束序列，遇到可重试错误时中止并继续；最后一个元素直接以管理器为作用域，
//! 其错误总是返回给调用方。
//!
//! ```rust,ignore
//! for attempt in manager.attempts(3)? {
//!     if let Some(value) = attempt.run(|txn| do_work(txn))? {
//!         break;
//!     }
//! }
//! ```

use std::cell::Cell;
use std::rc::Rc;

use crate::transaction::manager::TransactionManager;
use crate::transaction::{Transaction, TransactionError, TransactionResult};

/// 事务尝试序列
pub struct Attempts {
    manager: TransactionManager,
    remaining: usize,
    succeeded: Rc<Cell<bool>>,
}

impl Attempts {
    pub(crate) fn new(manager: TransactionManager, number: usize) -> TransactionResult<Self> {
        if number == 0 {
            return Err(TransactionError::InvalidArgument(
                "number must be positive".to_string(),
            ));
        }
        Ok(Self {
            manager,
            remaining: number,
            succeeded: Rc::new(Cell::new(false)),
        })
    }
}

impl Iterator for Attempts {
    type Item = Attempt;

    fn next(&mut self) -> Option<Attempt> {
        if self.remaining == 0 || self.succeeded.get() {
            return None;
        }
        self.remaining -= 1;

        let kind = if self.remaining > 0 {
            AttemptKind::Retry(self.succeeded.clone())
        } else {
            AttemptKind::Final
        };
        Some(Attempt {
            manager: self.manager.clone(),
            kind,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.succeeded.get() {
            (0, Some(0))
        } else {
            (0, Some(self.remaining))
        }
    }
}

enum AttemptKind {
    Retry(Rc<Cell<bool>>),
    Final,
}

/// 单次事务尝试
pub struct Attempt {
    manager: TransactionManager,
    kind: AttemptKind,
}

impl Attempt {
    /// 是否为序列中的最后一次尝试
    pub fn is_final(&self) -> bool {
        matches!(self.kind, AttemptKind::Final)
    }

    /// 在新事务中执行 `body`
    ///
    /// 返回 `Ok(Some(value))` 表示已提交；`Ok(None)` 表示遇到可重试错误，事务已中止，
    /// 调用方应继续下一次尝试；不可重试的错误（以及最后一次尝试的任何错误）以 `Err` 返回
    pub fn run<T, F>(self, body: F) -> TransactionResult<Option<T>>
    where
        F: FnOnce(&Transaction) -> TransactionResult<T>,
    {
        match self.kind {
            AttemptKind::Final => self.manager.with_transaction(body).map(Some),
            AttemptKind::Retry(succeeded) => {
                let txn = self.manager.begin()?;
                let outcome = body(&txn).and_then(|value| {
                    self.manager.commit()?;
                    Ok(value)
                });
                match outcome {
                    Ok(value) => {
                        succeeded.set(true);
                        Ok(Some(value))
                    }
                    Err(e) => retry_or_raise(&self.manager, e).map(|()| None),
                }
            }
        }
    }
}

/// 先判断可否重试再中止；中止本身失败时返回中止的错误
fn retry_or_raise(manager: &TransactionManager, error: TransactionError) -> TransactionResult<()> {
    let retry = manager.retryable(&error);
    manager.abort()?;
    if retry {
        log::debug!(target: "txn", "retryable error, trying again: {}", error);
        Ok(())
    } else {
        Err(error)
    }
}

/// `run` 的选项
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// 尝试次数，缺省时使用管理器配置中的 `default_run_tries`
    pub tries: Option<usize>,
    /// 事务名称，写入事务描述；名称 "_" 被忽略
    pub name: Option<String>,
    /// 事务说明，写入事务描述
    pub doc: Option<String>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tries(mut self, tries: usize) -> Self {
        self.tries = Some(tries);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    /// 写入事务描述的文本："名称\n\n说明"、仅名称或仅说明
    pub fn note_text(&self) -> Option<String> {
        let name = self
            .name
            .as_deref()
            .filter(|name| !name.is_empty() && *name != "_");
        let doc = self.doc.as_deref().filter(|doc| !doc.is_empty());
        match (name, doc) {
            (Some(name), Some(doc)) => Some(format!("{}\n\n{}", name, doc)),
            (Some(name), None) => Some(name.to_string()),
            (None, Some(doc)) => Some(doc.to_string()),
            (None, None) => None,
        }
    }
}
