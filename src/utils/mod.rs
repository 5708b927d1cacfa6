// 工具模块 - 仅用于导出各个子模块，不包含具体实现

// 日志模块
pub mod logging;

// 弱引用集合模块
pub mod weak_set;
pub use weak_set::WeakSet;
