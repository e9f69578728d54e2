//! # 规则模块
//!
//! 此模块负责：
//! 1. 定义 iptables 规则模型并渲染为命令参数
//! 2. 从重定向策略生成有序规则集
//! 3. 模拟数据包经过规则后的去向
//! 4. 把规则集下发到主机防火墙，或整体清空

pub mod eval;
pub mod iptables;
mod manager;
pub mod plan;

pub use eval::{Packet, Verdict};
pub use iptables::{Position, Rule, Table, MANAGED_TABLES};
pub use manager::{InstallReport, RuleManager};
