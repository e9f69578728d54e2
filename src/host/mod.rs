//! # 主机资源模块
//!
//! 内核防火墙表和中继进程都是进程外的全局状态，
//! 这里把它们封装成窄接口，业务逻辑只通过 trait 访问。

pub mod process;
pub mod table;

// 重新导出常用类型
pub use process::{is_root, lookup_uid, restart_service, ProcFsRegistry, ProcessRegistry};
pub use table::{CommandOutcome, IptablesTable, RuleTable, SimulatedTable};
