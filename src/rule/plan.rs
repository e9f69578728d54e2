//! # 规则集生成
//!
//! 把 [`RedirectPolicy`] 翻译成有序的规则列表。
//!
//! ## 顺序（首条匹配生效，顺序即正确性）
//! 1. filter: 两条加固规则（`-I` 插入链首）
//! 2. nat: 中继用户 RETURN
//! 3. nat: UDP DNS 重定向到 DNS 捕获端口
//! 4. nat: 每个豁免网段 RETURN
//! 5. nat: TCP SYN 重定向到透明代理端口（兜底）
//! 6. filter: ESTABLISHED,RELATED 放行
//! 7. filter: 每个豁免网段放行、中继用户放行
//! 8. filter: REJECT（兜底）
//!
//! nat 表只改写目标地址，filter 表独立决定放行与否，
//! 所以豁免规则在两张表里各写一遍。

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

#[cfg(test)]
use super::eval::{self, Packet, Verdict};
use super::iptables::{
    AddrMatch, ConnState, FlagMatch, Match, Position, Protocol, Purpose, Rule, Table, Target,
    TcpFlag,
};
use crate::config::RedirectPolicy;

/// 回环接口名
const LOOPBACK_IFACE: &str = "lo";

// ========================================
// 规则集
// ========================================

/// 按下发顺序排列的规则集
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条规则（记录下发顺序）
    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// 下发顺序
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// 某张表在内核中的实际链顺序
    ///
    /// `-I` 插入链首，`-A` 追加链尾，因此与下发顺序不一定相同。
    #[cfg(test)]
    pub fn chain(&self, table: Table) -> Vec<Rule> {
        let mut chain = Vec::new();
        for rule in self.rules.iter().filter(|r| r.table == table) {
            match rule.position {
                Position::Insert => chain.insert(0, rule.clone()),
                Position::Append => chain.push(rule.clone()),
            }
        }
        chain
    }

    /// 模拟一个本机发出的包经过 nat 与 filter 表后的结果
    #[cfg(test)]
    pub fn evaluate(&self, packet: &Packet) -> Verdict {
        eval::evaluate(&self.chain(Table::Nat), &self.chain(Table::Filter), packet)
    }
}

// ========================================
// 规则构造
// ========================================

/// 根据策略生成完整规则集（不含 flush）
pub fn build(policy: &RedirectPolicy) -> RuleSet {
    let mut set = RuleSet::new();
    let loopback = host_net(policy.loopback);

    // 1. 加固：丢弃标志位矛盾的 TCP 包
    for second in [TcpFlag::Fin, TcpFlag::Rst] {
        set.push(Rule {
            table: Table::Filter,
            position: Position::Insert,
            matches: Match {
                not_out_iface: Some(LOOPBACK_IFACE.to_string()),
                destination: Some(AddrMatch::not(loopback)),
                source: Some(AddrMatch::not(loopback)),
                protocol: Some(Protocol::Tcp),
                tcp_flags: Some(FlagMatch {
                    mask: vec![TcpFlag::Ack, second],
                    set: vec![TcpFlag::Ack, second],
                }),
                ..Default::default()
            },
            target: Target::Drop,
            purpose: Purpose::Hardening,
        });
    }

    // 2. 中继自身流量不重定向，否则会回环到自己
    set.push(Rule {
        table: Table::Nat,
        position: Position::Append,
        matches: owner(policy.relay_uid),
        target: Target::Return,
        purpose: Purpose::RelayExempt,
    });

    // 3. DNS 捕获
    set.push(Rule {
        table: Table::Nat,
        position: Position::Append,
        matches: Match {
            protocol: Some(Protocol::Udp),
            dport: Some(policy.dns_port),
            ..Default::default()
        },
        target: Target::Redirect(policy.dns_port),
        purpose: Purpose::DnsCapture,
    });

    // 4. 豁免网段
    for net in &policy.exempt_networks {
        set.push(Rule {
            table: Table::Nat,
            position: Position::Append,
            matches: destination(*net),
            target: Target::Return,
            purpose: Purpose::NetworkExempt,
        });
    }

    // 5. 其余 TCP 连接发起包全部送进透明代理端口
    set.push(Rule {
        table: Table::Nat,
        position: Position::Append,
        matches: Match {
            protocol: Some(Protocol::Tcp),
            syn: true,
            ..Default::default()
        },
        target: Target::Redirect(policy.trans_port),
        purpose: Purpose::CatchAll,
    });

    // 6. 已建立连接的回程流量
    set.push(Rule {
        table: Table::Filter,
        position: Position::Append,
        matches: Match {
            states: vec![ConnState::Established, ConnState::Related],
            ..Default::default()
        },
        target: Target::Accept,
        purpose: Purpose::Established,
    });

    // 7. filter 表里再放行一次豁免网段与中继用户
    for net in &policy.exempt_networks {
        set.push(Rule {
            table: Table::Filter,
            position: Position::Append,
            matches: destination(*net),
            target: Target::Accept,
            purpose: Purpose::NetworkExempt,
        });
    }
    set.push(Rule {
        table: Table::Filter,
        position: Position::Append,
        matches: owner(policy.relay_uid),
        target: Target::Accept,
        purpose: Purpose::RelayExempt,
    });

    // 8. 其余一律拒绝
    set.push(Rule {
        table: Table::Filter,
        position: Position::Append,
        matches: Match::default(),
        target: Target::Reject,
        purpose: Purpose::CatchAll,
    });

    set
}

fn host_net(addr: Ipv4Addr) -> Ipv4Net {
    Ipv4Net::from(addr)
}

fn owner(uid: u32) -> Match {
    Match {
        uid_owner: Some(uid),
        ..Default::default()
    }
}

fn destination(net: Ipv4Net) -> Match {
    Match {
        destination: Some(AddrMatch::is(net)),
        ..Default::default()
    }
}
