//! 同步器接口
//!
//! 同步器是独立于资源管理器的观察者，在事务开始与结束的边界上得到通知。
//! 事务管理器以弱引用持有同步器，登记本身不会延长同步器的生命周期。

use crate::transaction::{Transaction, TransactionResult};

/// 同步器trait
pub trait Synchronizer: Send + Sync {
    /// 在提交或中止开始之前调用
    fn before_completion(&self, _txn: &Transaction) -> TransactionResult<()> {
        Ok(())
    }

    /// 在提交或中止完成之后调用
    ///
    /// 中止路径上调用时，事务已不再是管理器的当前事务，但每对象数据仍可读取
    fn after_completion(&self, _txn: &Transaction) -> TransactionResult<()> {
        Ok(())
    }

    /// 管理器开始新事务时调用；在已有当前事务时登记的同步器会立即收到一次
    fn new_transaction(&self, _txn: &Transaction) -> TransactionResult<()> {
        Ok(())
    }
}
