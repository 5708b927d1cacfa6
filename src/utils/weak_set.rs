//! 弱引用集合
//!
//! 集合成员不会因为被登记而延长生命周期。成员在别处被释放后，
//! 集合在下一次访问时自动收缩，遍历时静默跳过已失效成员。
//!
//! 成员以数据指针地址作为身份标识。由于集合自身持有 `Weak`，
//! 在条目被清理之前该地址不会被重新分配，因此不会出现身份混淆。

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

fn address_of<T: ?Sized>(item: *const T) -> usize {
    item as *const () as usize
}

/// 弱引用集合
///
/// 成员按登记顺序保存，遍历顺序即登记顺序。
pub struct WeakSet<T: ?Sized> {
    members: Mutex<Vec<(usize, Weak<T>)>>,
}

impl<T: ?Sized> WeakSet<T> {
    pub fn new() -> Self {
        Self {
            members: Mutex::new(Vec::new()),
        }
    }

    /// 登记成员，重复登记同一对象无效果（保留首次登记的位置）
    pub fn add(&self, item: &Arc<T>) {
        let key = address_of(Arc::as_ptr(item));
        let mut members = self.members.lock();
        members.retain(|(_, weak)| weak.strong_count() > 0);
        if !members.iter().any(|(member, _)| *member == key) {
            members.push((key, Arc::downgrade(item)));
        }
    }

    /// 移除成员，成员不存在时不报错
    pub fn remove(&self, item: &T) {
        let key = address_of(item as *const T);
        self.members.lock().retain(|(member, _)| *member != key);
    }

    pub fn contains(&self, item: &T) -> bool {
        let key = address_of(item as *const T);
        self.members
            .lock()
            .iter()
            .any(|(member, weak)| *member == key && weak.strong_count() > 0)
    }

    /// 存活成员数量（顺带清理已失效条目）
    pub fn len(&self) -> usize {
        let mut members = self.members.lock();
        members.retain(|(_, weak)| weak.strong_count() > 0);
        members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.members.lock().clear();
    }

    /// 以弱引用列表形式返回存活成员，按登记顺序
    pub fn as_weak_list(&self) -> Vec<Weak<T>> {
        let mut members = self.members.lock();
        members.retain(|(_, weak)| weak.strong_count() > 0);
        members.iter().map(|(_, weak)| weak.clone()).collect()
    }

    /// 按登记顺序对每个存活成员调用 `visitor`
    ///
    /// 调用期间不持有内部锁，访问者可以安全地增删成员。
    /// 遇到第一个错误时停止并返回该错误。
    pub fn map<E, F>(&self, mut visitor: F) -> Result<(), E>
    where
        F: FnMut(&Arc<T>) -> Result<(), E>,
    {
        let alive: Vec<Arc<T>> = {
            let mut members = self.members.lock();
            members.retain(|(_, weak)| weak.strong_count() > 0);
            members.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
        };

        for member in &alive {
            visitor(member)?;
        }
        Ok(())
    }
}

impl<T: ?Sized> Default for WeakSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> std::fmt::Debug for WeakSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakSet")
            .field("len", &self.len())
            .finish()
    }
}
