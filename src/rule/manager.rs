//! # 规则管理器
//!
//! 把策略下发到主机防火墙，或整体撤销。
//!
//! 单条规则失败只记录日志并继续（尽力而为），不做回滚：
//! 下一次 `install` 开头的 flush 就是恢复手段。

use crate::config::RedirectPolicy;
use crate::host::{CommandOutcome, RuleTable};

use super::iptables::{Rule, Table};
use super::plan::{self, RuleSet};

// ========================================
// 安装报告
// ========================================

/// 一次 install / flush 的执行报告
#[derive(Debug, Default)]
pub struct InstallReport {
    /// 成功下发的规则数
    pub applied: usize,
    /// 失败的规则及原因
    pub failed: Vec<(Rule, CommandOutcome)>,
    /// 失败的 flush
    pub flush_failures: Vec<(Table, CommandOutcome)>,
}

impl InstallReport {
    /// 是否全部成功
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.flush_failures.is_empty()
    }

    pub fn total(&self) -> usize {
        self.applied + self.failed.len()
    }
}

// ========================================
// 管理器
// ========================================

/// 规则管理器
pub struct RuleManager<'a, T: RuleTable> {
    table: &'a mut T,
}

impl<'a, T: RuleTable> RuleManager<'a, T> {
    pub fn new(table: &'a mut T) -> Self {
        Self { table }
    }

    /// 先清空再按顺序下发完整策略
    pub fn install(&mut self, policy: &RedirectPolicy) -> InstallReport {
        let mut report = InstallReport {
            flush_failures: self.flush_tables(),
            ..Default::default()
        };

        let set: RuleSet = plan::build(policy);
        tracing::info!(
            rules = set.len(),
            trans_port = policy.trans_port,
            dns_port = policy.dns_port,
            relay_uid = policy.relay_uid,
            "installing redirect policy"
        );

        // 严格顺序执行：后面的规则依赖前面的规则已生效
        for rule in set.rules() {
            let outcome = self.table.apply(rule);
            if outcome.is_success() {
                tracing::debug!(purpose = %rule.purpose, rule = %rule, "applied");
                report.applied += 1;
            } else {
                tracing::warn!(purpose = %rule.purpose, rule = %rule, error = %outcome, "rule failed, continuing");
                report.failed.push((rule.clone(), outcome));
            }
        }

        report
    }

    /// 清空所有受管理的表
    pub fn flush(&mut self) -> InstallReport {
        InstallReport {
            flush_failures: self.flush_tables(),
            ..Default::default()
        }
    }

    fn flush_tables(&mut self) -> Vec<(Table, CommandOutcome)> {
        self.table
            .flush_all()
            .into_iter()
            .filter(|(table, outcome)| {
                if outcome.is_success() {
                    tracing::debug!(%table, "flushed");
                    false
                } else {
                    tracing::warn!(%table, error = %outcome, "flush failed");
                    true
                }
            })
            .collect()
    }
}

// ========================================
// 测试模块
// ========================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::host::SimulatedTable;
    use crate::rule::eval::{Packet, Verdict};
    use crate::rule::iptables::Purpose;

    fn policy() -> RedirectPolicy {
        Settings::default().policy(106)
    }

    #[test]
    fn test_install_applies_every_rule() {
        let mut table = SimulatedTable::new();
        let report = RuleManager::new(&mut table).install(&policy());

        let expected = plan::build(&policy());
        assert!(report.is_clean());
        assert_eq!(report.applied, expected.len());
        assert_eq!(table.rule_count(), expected.len());
    }

    #[test]
    fn test_install_twice_is_idempotent() {
        let mut table = SimulatedTable::new();
        RuleManager::new(&mut table).install(&policy());
        let nat_once = table.chain(Table::Nat).to_vec();
        let filter_once = table.chain(Table::Filter).to_vec();

        RuleManager::new(&mut table).install(&policy());
        assert_eq!(table.chain(Table::Nat), nat_once.as_slice());
        assert_eq!(table.chain(Table::Filter), filter_once.as_slice());
    }

    #[test]
    fn test_flush_removes_everything() {
        let mut table = SimulatedTable::new();
        let mut manager = RuleManager::new(&mut table);
        manager.install(&policy());
        let report = manager.flush();
        assert!(report.is_clean());
        assert_eq!(report.total(), 0);

        assert_eq!(table.rule_count(), 0);
        // 回到默认放行
        let packet = Packet::tcp_syn("8.8.8.8".parse().unwrap(), 443);
        assert_eq!(table.evaluate(&packet), Verdict::Accept);
    }

    #[test]
    fn test_failed_rule_does_not_stop_install() {
        // 第 3 条（nat 中继 RETURN）失败
        let mut table = SimulatedTable::failing_at(&[2]);
        let report = RuleManager::new(&mut table).install(&policy());

        let expected = plan::build(&policy());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0.purpose, Purpose::RelayExempt);
        assert_eq!(report.applied, expected.len() - 1);
        assert_eq!(report.total(), expected.len());

        // 兜底规则仍然生效
        let last = table.chain(Table::Filter).last().unwrap();
        assert_eq!(last.purpose, Purpose::CatchAll);
    }

    #[test]
    fn test_installed_table_routes_through_relay() {
        let mut table = SimulatedTable::new();
        RuleManager::new(&mut table).install(&policy());

        let web = Packet::tcp_syn("93.184.216.34".parse().unwrap(), 443);
        assert_eq!(table.evaluate(&web), Verdict::Redirect(9040));

        let lan = Packet::tcp_syn("172.16.4.2".parse().unwrap(), 80);
        assert_eq!(table.evaluate(&lan), Verdict::Accept);
    }
}
