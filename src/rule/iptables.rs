//! # iptables 规则模型
//!
//! 定义规则数据结构，并把每条规则渲染成 iptables 命令参数。
//!
//! 所有规则都挂在 `OUTPUT` 链上：本工具只关心本机发出的流量。

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

/// 本工具操作的链
pub const CHAIN: &str = "OUTPUT";

// ========================================
// 基础枚举
// ========================================

/// iptables 表
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// filter 表：决定放行 / 丢弃
    Filter,
    /// nat 表：改写目标地址
    Nat,
}

/// 本工具管理的表（flush 时全部清空）
pub const MANAGED_TABLES: [Table; 2] = [Table::Filter, Table::Nat];

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 规则插入位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// `-A`：追加到链尾
    Append,
    /// `-I`：插入到链首
    Insert,
}

/// 传输层协议
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// TCP 标志位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpFlag {
    Syn,
    Ack,
    Fin,
    Rst,
}

impl TcpFlag {
    fn as_str(&self) -> &'static str {
        match self {
            TcpFlag::Syn => "SYN",
            TcpFlag::Ack => "ACK",
            TcpFlag::Fin => "FIN",
            TcpFlag::Rst => "RST",
        }
    }
}

/// 连接跟踪状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    New,
    Established,
    Related,
}

impl ConnState {
    fn as_str(&self) -> &'static str {
        match self {
            ConnState::New => "NEW",
            ConnState::Established => "ESTABLISHED",
            ConnState::Related => "RELATED",
        }
    }
}

/// 规则动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Accept,
    Drop,
    Reject,
    /// 结束当前链，交给后续表按默认流程处理
    Return,
    /// 重定向到本机端口
    Redirect(u16),
}

/// 规则用途，仅用于日志与报告
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// 丢弃标志位矛盾的 TCP 包
    Hardening,
    /// 中继进程自身流量豁免
    RelayExempt,
    /// DNS 捕获
    DnsCapture,
    /// 豁免网段
    NetworkExempt,
    /// 已建立连接放行
    Established,
    /// 兜底规则（nat 表重定向 / filter 表拒绝）
    CatchAll,
}

impl Purpose {
    /// 是否为豁免类规则（必须出现在兜底规则之前）
    #[cfg(test)]
    pub fn is_exemption(&self) -> bool {
        matches!(
            self,
            Purpose::RelayExempt | Purpose::NetworkExempt | Purpose::Established
        )
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Purpose::Hardening => "hardening",
            Purpose::RelayExempt => "relay-exempt",
            Purpose::DnsCapture => "dns-capture",
            Purpose::NetworkExempt => "network-exempt",
            Purpose::Established => "established",
            Purpose::CatchAll => "catch-all",
        };
        f.pad(s)
    }
}

// ========================================
// 匹配条件
// ========================================

/// 地址匹配，可取反（`! -d 127.0.0.1`）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrMatch {
    pub net: Ipv4Net,
    pub negated: bool,
}

impl AddrMatch {
    pub fn is(net: Ipv4Net) -> Self {
        Self { net, negated: false }
    }

    pub fn not(net: Ipv4Net) -> Self {
        Self { net, negated: true }
    }

    pub fn matches(&self, addr: Ipv4Addr) -> bool {
        self.net.contains(&addr) != self.negated
    }

    /// 单主机地址不带 /32 输出，与手写命令一致
    fn render(&self) -> String {
        if self.net.prefix_len() == 32 {
            self.net.addr().to_string()
        } else {
            self.net.to_string()
        }
    }
}

/// TCP 标志位匹配：`--tcp-flags <mask> <set>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagMatch {
    pub mask: Vec<TcpFlag>,
    pub set: Vec<TcpFlag>,
}

/// 一条规则的全部匹配条件，None 表示不限制
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Match {
    /// 出接口取反（`! -o lo`）
    pub not_out_iface: Option<String>,
    pub destination: Option<AddrMatch>,
    pub source: Option<AddrMatch>,
    pub protocol: Option<Protocol>,
    pub tcp_flags: Option<FlagMatch>,
    /// `--syn`：仅 SYN 置位的连接发起包
    pub syn: bool,
    pub dport: Option<u16>,
    pub uid_owner: Option<u32>,
    pub states: Vec<ConnState>,
}

// ========================================
// 规则
// ========================================

/// 单条 iptables 规则
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub table: Table,
    pub position: Position,
    pub matches: Match,
    pub target: Target,
    pub purpose: Purpose,
}

impl Rule {
    /// 渲染为 iptables 参数（不含程序名）
    ///
    /// filter 是默认表，不输出 `-t filter`。
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let m = &self.matches;

        if self.table != Table::Filter {
            push(&mut args, &["-t", self.table.as_str()]);
        }

        let pos = match self.position {
            Position::Append => "-A",
            Position::Insert => "-I",
        };
        push(&mut args, &[pos, CHAIN]);

        if let Some(iface) = &m.not_out_iface {
            push(&mut args, &["!", "-o", iface.as_str()]);
        }
        if let Some(dst) = &m.destination {
            if dst.negated {
                push(&mut args, &["!"]);
            }
            push(&mut args, &["-d", &dst.render()]);
        }
        if let Some(src) = &m.source {
            if src.negated {
                push(&mut args, &["!"]);
            }
            push(&mut args, &["-s", &src.render()]);
        }
        if let Some(proto) = m.protocol {
            push(&mut args, &["-p", proto.as_str()]);
        }
        if let Some(flags) = &m.tcp_flags {
            push(
                &mut args,
                &[
                    "-m",
                    "tcp",
                    "--tcp-flags",
                    &join_flags(&flags.mask),
                    &join_flags(&flags.set),
                ],
            );
        }
        if m.syn {
            push(&mut args, &["--syn"]);
        }
        if let Some(port) = m.dport {
            push(&mut args, &["--dport", &port.to_string()]);
        }
        if let Some(uid) = m.uid_owner {
            push(&mut args, &["-m", "owner", "--uid-owner", &uid.to_string()]);
        }
        if !m.states.is_empty() {
            let states = m
                .states
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(",");
            push(&mut args, &["-m", "state", "--state", &states]);
        }

        match self.target {
            Target::Accept => push(&mut args, &["-j", "ACCEPT"]),
            Target::Drop => push(&mut args, &["-j", "DROP"]),
            Target::Reject => push(&mut args, &["-j", "REJECT"]),
            Target::Return => push(&mut args, &["-j", "RETURN"]),
            Target::Redirect(port) => push(
                &mut args,
                &["-j", "REDIRECT", "--to-ports", &port.to_string()],
            ),
        }

        args
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_args().join(" "))
    }
}

fn push(args: &mut Vec<String>, parts: &[&str]) {
    args.extend(parts.iter().map(|p| p.to_string()));
}

fn join_flags(flags: &[TcpFlag]) -> String {
    flags
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

// ========================================
// 测试模块
// ========================================
#[cfg(test)]
mod tests {
    use super::*;

    fn host(addr: &str) -> Ipv4Net {
        Ipv4Net::new(addr.parse().unwrap(), 32).unwrap()
    }

    #[test]
    fn test_render_hardening_rule() {
        let rule = Rule {
            table: Table::Filter,
            position: Position::Insert,
            matches: Match {
                not_out_iface: Some("lo".into()),
                destination: Some(AddrMatch::not(host("127.0.0.1"))),
                source: Some(AddrMatch::not(host("127.0.0.1"))),
                protocol: Some(Protocol::Tcp),
                tcp_flags: Some(FlagMatch {
                    mask: vec![TcpFlag::Ack, TcpFlag::Fin],
                    set: vec![TcpFlag::Ack, TcpFlag::Fin],
                }),
                ..Default::default()
            },
            target: Target::Drop,
            purpose: Purpose::Hardening,
        };

        assert_eq!(
            rule.to_string(),
            "-I OUTPUT ! -o lo ! -d 127.0.0.1 ! -s 127.0.0.1 -p tcp -m tcp --tcp-flags ACK,FIN ACK,FIN -j DROP"
        );
    }

    #[test]
    fn test_render_nat_redirect() {
        let rule = Rule {
            table: Table::Nat,
            position: Position::Append,
            matches: Match {
                protocol: Some(Protocol::Udp),
                dport: Some(53),
                ..Default::default()
            },
            target: Target::Redirect(53),
            purpose: Purpose::DnsCapture,
        };
        assert_eq!(
            rule.to_args(),
            vec![
                "-t", "nat", "-A", "OUTPUT", "-p", "udp", "--dport", "53", "-j", "REDIRECT",
                "--to-ports", "53"
            ]
        );
    }

    #[test]
    fn test_render_owner_and_state() {
        let owner = Rule {
            table: Table::Nat,
            position: Position::Append,
            matches: Match {
                uid_owner: Some(106),
                ..Default::default()
            },
            target: Target::Return,
            purpose: Purpose::RelayExempt,
        };
        assert_eq!(
            owner.to_string(),
            "-t nat -A OUTPUT -m owner --uid-owner 106 -j RETURN"
        );

        let state = Rule {
            table: Table::Filter,
            position: Position::Append,
            matches: Match {
                states: vec![ConnState::Established, ConnState::Related],
                ..Default::default()
            },
            target: Target::Accept,
            purpose: Purpose::Established,
        };
        assert_eq!(
            state.to_string(),
            "-A OUTPUT -m state --state ESTABLISHED,RELATED -j ACCEPT"
        );
    }

    #[test]
    fn test_addr_match_negation() {
        let m = AddrMatch::not(host("127.0.0.1"));
        assert!(!m.matches("127.0.0.1".parse().unwrap()));
        assert!(m.matches("8.8.8.8".parse().unwrap()));

        let net = AddrMatch::is("192.168.0.0/16".parse().unwrap());
        assert!(net.matches("192.168.1.5".parse().unwrap()));
        assert_eq!(net.render(), "192.168.0.0/16");
    }
}
