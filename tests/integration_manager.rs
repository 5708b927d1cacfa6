//! 事务管理器集成测试
//!
//! 测试范围:
//! - attempts(n) 的尝试次数与守卫数量
//! - run 的重试、命名与装饰器形式
//! - 注定失败（doom）
//! - 显式模式
//! - 同步器的延迟登记与跨线程登记
//! - 线程隔离的事务管理器

mod common;

use std::sync::Arc;
use std::thread;

use common::{calls, new_log, RecordingResource, RecordingSynch};
use txncoord::transaction::{
    RunOptions, ThreadTransactionManager, TransactionError, TransactionManager,
    TransactionManagerConfig,
};

// ==================== attempts 测试 ====================

#[test]
fn test_attempts_succeeding_on_kth_try() {
    for k in 1..=4 {
        let manager = TransactionManager::new();
        let mut guards = 0;
        let mut executions = 0;

        for attempt in manager.attempts(4).expect("创建尝试序列失败") {
            guards += 1;
            let outcome = attempt
                .run(|_| {
                    executions += 1;
                    if executions < k {
                        Err(TransactionError::transient("conflict"))
                    } else {
                        Ok(executions)
                    }
                })
                .expect("可重试错误不应返回");
            if let Some(value) = outcome {
                assert_eq!(value, k);
            }
        }

        assert_eq!(guards, k, "第 {} 次成功时的守卫数量错误", k);
        assert_eq!(executions, k);
        assert_eq!(manager.stats().snapshot().committed, 1);
    }
}

#[test]
fn test_attempts_always_failing_raises_on_last() {
    let manager = TransactionManager::new();
    let mut guards = 0;
    let mut last_error = None;

    for attempt in manager.attempts(4).expect("创建尝试序列失败") {
        guards += 1;
        let is_final = attempt.is_final();
        match attempt.run(|_| Err::<(), _>(TransactionError::transient("conflict"))) {
            Ok(None) => assert!(!is_final),
            Ok(Some(())) => panic!("不应成功"),
            Err(e) => {
                assert!(is_final, "只有最后一次尝试应当返回错误");
                last_error = Some(e);
            }
        }
    }

    assert_eq!(guards, 4);
    assert!(last_error.expect("最后一次尝试应当返回错误").is_transient());
    assert!(manager.current().is_none());
}

#[test]
fn test_attempts_retry_commit_failures_classified_by_resource() {
    let log = new_log();
    let manager = TransactionManager::new();
    let mut tries = 0;

    for attempt in manager.attempts(3).expect("创建尝试序列失败") {
        tries += 1;
        let fail = tries == 1;
        let log = log.clone();
        let done = attempt
            .run(move |txn| {
                let rm = RecordingResource::new("db", &log).retrying_on("vote");
                let rm = if fail { rm.failing_on("tpc_vote") } else { rm };
                txn.join(rm.shared())
            })
            .expect("资源管理器认为可以重试");
        if done.is_some() {
            break;
        }
    }

    assert_eq!(tries, 2);
    assert!(calls(&log).contains(&"tpc_finish:db".to_string()));
}

#[test]
fn test_attempts_zero_is_invalid() {
    let manager = TransactionManager::new();
    assert!(matches!(
        manager.attempts(0),
        Err(TransactionError::InvalidArgument(_))
    ));
}

#[test]
fn test_default_attempts_from_config() {
    let manager =
        TransactionManager::with_config(TransactionManagerConfig::new().with_default_attempts(2));
    let count = manager.default_attempts().expect("创建尝试序列失败").count();
    assert_eq!(count, 2);
}

// ==================== run 测试 ====================

#[test]
fn test_run_retries_errors_approved_by_resource() {
    let log = new_log();
    let manager = TransactionManager::new();
    let probe = manager.clone();
    let mut executions = 0;

    let result = manager.run_with(RunOptions::new().with_tries(3), || {
        executions += 1;
        probe
            .get()?
            .join(RecordingResource::new("db", &log).retrying_on("deadlock").shared())?;
        if executions < 3 {
            return Err(TransactionError::participant_msg("deadlock detected"));
        }
        Ok("done")
    });

    assert_eq!(result.expect("第三次应当成功"), "done");
    assert_eq!(executions, 3);
    assert_eq!(manager.stats().snapshot().committed, 1);
}

#[test]
fn test_run_does_not_retry_other_errors() {
    let manager = TransactionManager::new();
    let mut executions = 0;
    let err = manager
        .run(|| {
            executions += 1;
            Err::<(), _>(TransactionError::participant_msg("constraint violated"))
        })
        .expect_err("不可重试的错误应当返回");
    assert_eq!(err.to_string(), "constraint violated");
    assert_eq!(executions, 1);
    assert!(manager.current().is_none());
}

#[test]
fn test_run_uses_default_tries_from_config() {
    let manager =
        TransactionManager::with_config(TransactionManagerConfig::new().with_default_run_tries(5));
    let mut executions = 0;
    let _ = manager.run(|| {
        executions += 1;
        Err::<(), _>(TransactionError::transient("busy"))
    });
    assert_eq!(executions, 5);
}

#[test]
fn test_decorated_function_names_its_transactions() {
    let manager = TransactionManager::new();
    let probe = manager.clone();
    let mut job = manager.decorate(
        RunOptions::new().with_name("nightly").with_doc("Rebuild indexes").with_tries(1),
        move || Ok(probe.get()?.description()),
    );

    assert_eq!(job().expect("执行失败"), "nightly\n\nRebuild indexes");
    assert_eq!(job().expect("执行失败"), "nightly\n\nRebuild indexes");
}

// ==================== doom 测试 ====================

#[test]
fn test_doom_blocks_commit_until_abort() {
    let manager = TransactionManager::new();
    manager.begin().expect("开始事务失败");
    assert!(!manager.is_doomed().expect("查询失败"));

    manager.doom().expect("标记失败");
    assert!(manager.is_doomed().expect("查询失败"));
    assert!(matches!(manager.commit(), Err(TransactionError::DoomedTransaction)));

    // 注定失败的事务仍然可以加入资源管理器
    let log = new_log();
    manager
        .get()
        .expect("获取事务失败")
        .join(RecordingResource::new("a", &log).shared())
        .expect("加入失败");

    manager.abort().expect("中止失败");
    assert!(!manager.is_doomed().expect("查询失败"));
    manager.commit().expect("新事务应当可以提交");
}

// ==================== 显式模式测试 ====================

#[test]
fn test_explicit_mode_contract() {
    let manager = TransactionManager::explicit();

    assert!(matches!(manager.get(), Err(TransactionError::NoTransaction)));
    assert!(matches!(manager.commit(), Err(TransactionError::NoTransaction)));
    assert!(matches!(manager.abort(), Err(TransactionError::NoTransaction)));

    let txn = manager.begin().expect("开始事务失败");
    assert!(matches!(manager.begin(), Err(TransactionError::AlreadyInTransaction)));
    assert_eq!(manager.get().expect("获取事务失败"), txn);
    manager.commit().expect("提交失败");

    assert!(matches!(manager.get(), Err(TransactionError::NoTransaction)));
}

#[test]
fn test_explicit_mode_can_be_toggled() {
    let manager = TransactionManager::new();
    manager.set_explicit(true);
    assert!(manager.is_explicit());
    assert!(matches!(manager.get(), Err(TransactionError::NoTransaction)));

    manager.set_explicit(false);
    manager.get().expect("隐式模式下应当自动创建事务");
}

// ==================== 同步器测试 ====================

#[test]
fn test_late_registered_synchronizer_sees_current_transaction() {
    let log = new_log();
    let manager = TransactionManager::new();
    let txn = manager.begin().expect("开始事务失败");

    let synch = RecordingSynch::new("late", &log);
    manager.register_synch(synch.clone()).expect("登记失败");

    assert_eq!(calls(&log), vec![format!("new_transaction:late:{}", txn.id())]);
}

#[test]
fn test_synchronizers_notified_in_registration_order() {
    let log = new_log();
    let manager = TransactionManager::new();
    let synchs: Vec<_> = (0..8)
        .map(|i| RecordingSynch::new(&format!("s{}", i), &log))
        .collect();
    for synch in &synchs {
        manager.register_synch(synch.clone()).expect("登记失败");
    }

    for _ in 0..5 {
        log.lock().clear();
        let txn = manager.begin().expect("开始事务失败");
        let expected: Vec<String> = (0..8)
            .map(|i| format!("new_transaction:s{}:{}", i, txn.id()))
            .collect();
        assert_eq!(calls(&log), expected);
        manager.commit().expect("提交失败");
    }
}

#[test]
fn test_clear_synchs() {
    let log = new_log();
    let manager = TransactionManager::new();
    let s1 = RecordingSynch::new("s1", &log);
    let s2 = RecordingSynch::new("s2", &log);
    manager.register_synch(s1.clone()).expect("登记失败");
    manager.register_synch(s2.clone()).expect("登记失败");
    assert!(manager.registered_synchs());

    manager.clear_synchs();
    assert!(!manager.registered_synchs());
    manager.begin().expect("开始事务失败");
    assert!(calls(&log).is_empty());
}

// ==================== 线程隔离测试 ====================

#[test]
fn test_thread_managers_are_isolated() {
    let registry = Arc::new(ThreadTransactionManager::new());
    let main_txn = registry.begin().expect("开始事务失败");

    let worker_registry = registry.clone();
    let worker_txn = thread::spawn(move || {
        let txn = worker_registry.get().expect("获取事务失败");
        worker_registry.commit().expect("提交失败");
        txn
    })
    .join()
    .expect("线程执行失败");

    assert_ne!(main_txn, worker_txn);
    assert_eq!(registry.get().expect("获取事务失败"), main_txn);
}

#[test]
fn test_cross_thread_synchronizer_registration() {
    let log = new_log();
    let registry = Arc::new(ThreadTransactionManager::new());
    let owner_manager = registry.manager();
    let txn = registry.begin().expect("开始事务失败");

    let synch = RecordingSynch::new("shutdown", &log);
    let admin_handle = owner_manager.clone();
    let remote_synch = synch.clone();
    thread::spawn(move || {
        admin_handle
            .register_synch(remote_synch)
            .expect("跨线程登记失败");
    })
    .join()
    .expect("线程执行失败");

    // 登记发生在另一个线程，但作用于所属线程的管理器
    assert!(registry.registered_synchs());
    assert_eq!(
        calls(&log),
        vec![format!("new_transaction:shutdown:{}", txn.id())]
    );

    registry.commit().expect("提交失败");
    assert!(calls(&log).contains(&format!("after_completion:shutdown:{}", txn.id())));

    let admin_handle = owner_manager.clone();
    let remote_synch = synch.clone();
    thread::spawn(move || admin_handle.unregister_synch(&*remote_synch))
        .join()
        .expect("线程执行失败");
    assert!(!registry.registered_synchs());
}

#[test]
fn test_thread_exit_aborts_and_releases_open_transaction() {
    let log = new_log();
    let registry = Arc::new(ThreadTransactionManager::new());

    let worker_registry = registry.clone();
    let worker_log = log.clone();
    let resource = thread::spawn(move || {
        let rm = RecordingResource::new("db", &worker_log).shared();
        let weak = Arc::downgrade(&rm);
        worker_registry.begin().expect("开始事务失败");
        worker_registry.get().expect("获取事务失败").join(rm).expect("加入失败");
        weak
    })
    .join()
    .expect("线程执行失败");

    assert_eq!(registry.thread_count(), 0);
    assert!(resource.upgrade().is_none(), "线程退出后资源管理器应当被释放");
    assert_eq!(calls(&log), vec!["abort:db".to_string()]);
}

#[test]
fn test_thread_exit_keeps_other_threads_managers() {
    let registry = Arc::new(ThreadTransactionManager::new());
    let main_txn = registry.begin().expect("开始事务失败");

    let worker_registry = registry.clone();
    thread::spawn(move || {
        worker_registry.get().expect("获取事务失败");
    })
    .join()
    .expect("线程执行失败");

    assert_eq!(registry.thread_count(), 1);
    assert_eq!(registry.manager().current(), Some(main_txn));
}

#[test]
fn test_release_current_thread() {
    let registry = ThreadTransactionManager::with_config(TransactionManagerConfig::new().explicit());
    assert!(registry.is_explicit());
    let first = registry.manager();
    assert_eq!(registry.thread_count(), 1);

    let released = registry.release_current_thread().expect("应当存在当前线程的管理器");
    assert_eq!(released, first);
    assert_eq!(registry.thread_count(), 0);
    assert_ne!(registry.manager(), first);
}
