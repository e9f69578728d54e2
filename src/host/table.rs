//! # 防火墙表后端
//!
//! [`RuleTable`] 是规则管理器与内核防火墙之间的窄接口：
//! - [`IptablesTable`]: 真正执行 `iptables` 命令
//! - [`SimulatedTable`]: 在内存中维护链，用于 `--dry-run` 与测试
//!
//! 每次命令执行都返回 [`CommandOutcome`]，由调用方决定失败时是否继续。

use std::collections::HashMap;
use std::fmt;
use std::process::Command;

#[cfg(test)]
use crate::rule::eval::Verdict;
use crate::rule::eval::{self, Packet, Trace};
use crate::rule::{Position, Rule, Table, MANAGED_TABLES};

// ========================================
// 命令结果
// ========================================

/// 单条外部命令的执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// 退出码为 0
    Success,
    /// 命令运行但退出码非 0
    Failed { code: Option<i32>, stderr: String },
    /// 命令无法启动（未安装、无权限等）
    SpawnError(String),
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Success)
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandOutcome::Success => write!(f, "ok"),
            CommandOutcome::Failed { code, stderr } => match code {
                Some(c) => write!(f, "exit status {}: {}", c, stderr),
                None => write!(f, "terminated by signal: {}", stderr),
            },
            CommandOutcome::SpawnError(e) => write!(f, "failed to spawn: {}", e),
        }
    }
}

// ========================================
// 表接口
// ========================================

/// 主机防火墙表的抽象
pub trait RuleTable {
    /// 下发单条规则
    fn apply(&mut self, rule: &Rule) -> CommandOutcome;

    /// 清空一张表
    fn flush(&mut self, table: Table) -> CommandOutcome;

    /// 清空本工具管理的所有表
    fn flush_all(&mut self) -> Vec<(Table, CommandOutcome)> {
        MANAGED_TABLES
            .iter()
            .map(|&table| (table, self.flush(table)))
            .collect()
    }
}

// ========================================
// iptables 后端
// ========================================

/// 调用 iptables 命令的真实后端
pub struct IptablesTable {
    /// iptables 可执行文件
    program: String,
}

impl IptablesTable {
    pub fn new() -> Self {
        Self::with_program("iptables")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, args: &[String]) -> CommandOutcome {
        tracing::debug!(cmd = %self.program, args = ?args, "running");
        match Command::new(&self.program).args(args).output() {
            Ok(output) if output.status.success() => CommandOutcome::Success,
            Ok(output) => CommandOutcome::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            },
            Err(e) => CommandOutcome::SpawnError(e.to_string()),
        }
    }
}

impl Default for IptablesTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleTable for IptablesTable {
    fn apply(&mut self, rule: &Rule) -> CommandOutcome {
        self.run(&rule.to_args())
    }

    fn flush(&mut self, table: Table) -> CommandOutcome {
        let args = match table {
            // 与手动执行 `iptables -F` 一致
            Table::Filter => vec!["-F".to_string()],
            Table::Nat => vec!["-t".to_string(), "nat".to_string(), "-F".to_string()],
        };
        self.run(&args)
    }
}

// ========================================
// 内存模拟后端
// ========================================

/// 在内存中模拟内核链状态
///
/// `echo` 打开时把等价的 iptables 命令打印到标准输出。
#[derive(Debug, Default)]
pub struct SimulatedTable {
    chains: HashMap<Table, Vec<Rule>>,
    echo: bool,
    /// 第 N 次 apply（从 0 计）返回失败，用于测试尽力而为策略
    fail_at: Vec<usize>,
    applied: usize,
}

impl SimulatedTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 打印命令的模拟后端（--dry-run）
    pub fn echoing() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    /// 指定哪些 apply 调用失败
    #[cfg(test)]
    pub fn failing_at(indices: &[usize]) -> Self {
        Self {
            fail_at: indices.to_vec(),
            ..Self::default()
        }
    }

    /// 某张表当前的链
    pub fn chain(&self, table: Table) -> &[Rule] {
        self.chains.get(&table).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 所有表中的规则总数
    #[cfg(test)]
    pub fn rule_count(&self) -> usize {
        self.chains.values().map(Vec::len).sum()
    }

    /// 用当前链状态求值
    #[cfg(test)]
    pub fn evaluate(&self, packet: &Packet) -> Verdict {
        self.trace(packet).verdict
    }

    /// 用当前链状态求值，附带命中的规则下标
    pub fn trace(&self, packet: &Packet) -> Trace {
        eval::trace(self.chain(Table::Nat), self.chain(Table::Filter), packet)
    }
}

impl RuleTable for SimulatedTable {
    fn apply(&mut self, rule: &Rule) -> CommandOutcome {
        let index = self.applied;
        self.applied += 1;

        if self.echo {
            println!("iptables {}", rule);
        }
        if self.fail_at.contains(&index) {
            return CommandOutcome::Failed {
                code: Some(1),
                stderr: "simulated failure".to_string(),
            };
        }

        let chain = self.chains.entry(rule.table).or_default();
        match rule.position {
            Position::Insert => chain.insert(0, rule.clone()),
            Position::Append => chain.push(rule.clone()),
        }
        CommandOutcome::Success
    }

    fn flush(&mut self, table: Table) -> CommandOutcome {
        if self.echo {
            match table {
                Table::Filter => println!("iptables -F"),
                Table::Nat => println!("iptables -t nat -F"),
            }
        }
        self.chains.remove(&table);
        CommandOutcome::Success
    }
}
