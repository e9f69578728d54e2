//! # 规则求值
//!
//! 按内核对本机发出包的处理顺序模拟规则匹配：
//! 先走 nat/OUTPUT（仅新连接），再走 filter/OUTPUT，每张表首条匹配生效。
//! 被 REDIRECT 的包目标改写为回环地址，并从 `lo` 发出。
//!
//! 只覆盖本工具会生成的匹配条件，不是通用的 netfilter 实现。

use std::net::Ipv4Addr;

use super::iptables::{ConnState, Protocol, Rule, Target, TcpFlag};

/// 回环接口名
const LOOPBACK_IFACE: &str = "lo";

/// 默认外网接口名（仅用于模拟）
const DEFAULT_IFACE: &str = "eth0";

// ========================================
// 模拟数据包
// ========================================

/// 一个本机发出的模拟数据包
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub protocol: Protocol,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub dport: u16,
    pub out_iface: String,
    /// 发出该包的进程所属 uid（内核转发的包没有）
    pub uid: Option<u32>,
    /// 已置位的 TCP 标志
    pub flags: Vec<TcpFlag>,
    pub state: ConnState,
}

impl Packet {
    fn new(protocol: Protocol, destination: Ipv4Addr, dport: u16) -> Self {
        let out_iface = if destination.is_loopback() {
            LOOPBACK_IFACE
        } else {
            DEFAULT_IFACE
        };
        Self {
            protocol,
            source: if destination.is_loopback() {
                Ipv4Addr::LOCALHOST
            } else {
                Ipv4Addr::new(192, 0, 2, 10)
            },
            destination,
            dport,
            out_iface: out_iface.to_string(),
            uid: None,
            flags: Vec::new(),
            state: ConnState::New,
        }
    }

    /// TCP 连接发起包（仅 SYN）
    pub fn tcp_syn(destination: Ipv4Addr, dport: u16) -> Self {
        let mut packet = Self::new(Protocol::Tcp, destination, dport);
        packet.flags = vec![TcpFlag::Syn];
        packet
    }

    /// TCP 包，标志位由调用方指定
    #[cfg(test)]
    pub fn tcp(destination: Ipv4Addr, dport: u16, flags: &[TcpFlag]) -> Self {
        let mut packet = Self::new(Protocol::Tcp, destination, dport);
        packet.flags = flags.to_vec();
        packet
    }

    pub fn udp(destination: Ipv4Addr, dport: u16) -> Self {
        Self::new(Protocol::Udp, destination, dport)
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    /// 标记为已建立连接中的后续包
    #[cfg(test)]
    pub fn established(mut self) -> Self {
        self.state = ConnState::Established;
        if self.protocol == Protocol::Tcp {
            self.flags = vec![TcpFlag::Ack];
        }
        self
    }

    fn has_flag(&self, flag: TcpFlag) -> bool {
        self.flags.contains(&flag)
    }
}

// ========================================
// 求值结果
// ========================================

/// 数据包的最终去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// 被改写到本机端口并放行（进入中继）
    Redirect(u16),
    /// 原样放行
    Accept,
    Drop,
    Reject,
}

/// 匹配轨迹：每张表命中的规则下标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    pub nat_match: Option<usize>,
    pub filter_match: Option<usize>,
    pub verdict: Verdict,
}

/// 判断规则是否匹配数据包
pub fn matches(rule: &Rule, packet: &Packet) -> bool {
    let m = &rule.matches;

    if let Some(iface) = &m.not_out_iface {
        if &packet.out_iface == iface {
            return false;
        }
    }
    if let Some(dst) = &m.destination {
        if !dst.matches(packet.destination) {
            return false;
        }
    }
    if let Some(src) = &m.source {
        if !src.matches(packet.source) {
            return false;
        }
    }
    if let Some(proto) = m.protocol {
        if packet.protocol != proto {
            return false;
        }
    }
    if let Some(flags) = &m.tcp_flags {
        let ok = flags
            .mask
            .iter()
            .all(|f| packet.has_flag(*f) == flags.set.contains(f));
        if !ok {
            return false;
        }
    }
    if m.syn {
        // --syn 等价于 --tcp-flags SYN,RST,ACK,FIN SYN
        let ok = packet.has_flag(TcpFlag::Syn)
            && !packet.has_flag(TcpFlag::Ack)
            && !packet.has_flag(TcpFlag::Rst)
            && !packet.has_flag(TcpFlag::Fin);
        if !ok {
            return false;
        }
    }
    if let Some(port) = m.dport {
        if packet.dport != port {
            return false;
        }
    }
    if let Some(uid) = m.uid_owner {
        if packet.uid != Some(uid) {
            return false;
        }
    }
    if !m.states.is_empty() && !m.states.contains(&packet.state) {
        return false;
    }

    true
}

/// 返回链上首条匹配规则的下标
pub fn first_match(chain: &[Rule], packet: &Packet) -> Option<usize> {
    chain.iter().position(|rule| matches(rule, packet))
}

/// 求值并返回完整轨迹
pub fn trace(nat: &[Rule], filter: &[Rule], packet: &Packet) -> Trace {
    let mut packet = packet.clone();
    let mut redirected = None;

    // nat 表只处理连接的第一个包
    let nat_match = if packet.state == ConnState::New {
        first_match(nat, &packet)
    } else {
        None
    };

    if let Some(idx) = nat_match {
        if let Target::Redirect(port) = nat[idx].target {
            packet.destination = Ipv4Addr::LOCALHOST;
            packet.dport = port;
            packet.out_iface = LOOPBACK_IFACE.to_string();
            redirected = Some(port);
        }
    }

    // filter 表未命中时走链默认策略 ACCEPT
    let filter_match = first_match(filter, &packet);
    let filter_target = filter_match
        .map(|idx| filter[idx].target)
        .unwrap_or(Target::Accept);

    let verdict = match filter_target {
        Target::Drop => Verdict::Drop,
        Target::Reject => Verdict::Reject,
        // filter 表中的 RETURN 在内置链上等同于默认策略
        Target::Accept | Target::Return | Target::Redirect(_) => match redirected {
            Some(port) => Verdict::Redirect(port),
            None => Verdict::Accept,
        },
    };

    Trace {
        nat_match,
        filter_match,
        verdict,
    }
}

/// 求值，只返回最终去向
pub fn evaluate(nat: &[Rule], filter: &[Rule], packet: &Packet) -> Verdict {
    trace(nat, filter, packet).verdict
}
