//! # tor-redirect
//!
//! Linux CLI 工具，通过 iptables 把本机所有出站流量透明地送进 Tor。
//!
//! ## 功能
//! - 下发透明代理规则：TCP 连接重定向到 TransPort，DNS 重定向到 DNSPort
//! - 豁免回环、私有网段以及 Tor 进程自身的流量
//! - 撤销规则，恢复默认放行
//! - 让 Tor 重建链路并确认新的出口 IP
//! - 查询当前出口 IP
//!
//! ## 使用
//! ```bash
//! # 启用透明代理（需要 root）
//! sudo tor-redirect --load
//!
//! # 只打印将要执行的命令
//! tor-redirect --load --dry-run
//!
//! # 关闭透明代理
//! sudo tor-redirect --flush
//!
//! # 请求新链路
//! sudo tor-redirect --refresh
//!
//! # 查看当前出口 IP（JSON 输出）
//! tor-redirect --ip --json
//! ```

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgGroup, CommandFactory, Parser};
use ipnet::Ipv4Net;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// 导入我们的模块
mod circuit;
mod config;
mod error;
mod host;
mod rule;
mod torrc;
mod verify;

use config::Settings;
use host::{IptablesTable, ProcFsRegistry, SimulatedTable};
use rule::{InstallReport, Packet, RuleManager, Verdict};
use verify::{HttpProbe, VerificationResult, Verifier};

// ========================================
// CLI 参数定义
// ========================================

/// Tor 透明代理 iptables 重定向工具
#[derive(Parser)]
#[command(name = "tor-redirect")]
#[command(version)]
#[command(about = "Route all outbound traffic through Tor using iptables")]
#[command(group(
    ArgGroup::new("mode")
        .args(["load", "flush", "refresh", "ip"])
        .multiple(false)
))]
struct Cli {
    /// 下发 Tor 透明代理规则
    #[arg(long, short = 'l')]
    load: bool,

    /// 清空 iptables 规则
    #[arg(long, short = 'f')]
    flush: bool,

    /// 请求新的 Tor 链路
    #[arg(long, short = 'r')]
    refresh: bool,

    /// 显示当前出口 IP
    #[arg(long, short = 'i')]
    ip: bool,

    /// 配置文件路径 (可选，默认 /etc/tor-redirect.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// torrc 路径
    #[arg(long, value_name = "PATH")]
    torrc: Option<PathBuf>,

    /// 额外豁免网段，可重复
    #[arg(long, value_name = "CIDR")]
    exempt: Vec<Ipv4Net>,

    /// Tor 运行用户
    #[arg(long, value_name = "NAME")]
    relay_user: Option<String>,

    /// Tor 进程名
    #[arg(long, value_name = "NAME")]
    relay_process: Option<String>,

    /// 主接口最多尝试次数
    #[arg(long, value_name = "N")]
    attempts: Option<u32>,

    /// 重试间隔（秒）
    #[arg(long, value_name = "SECS")]
    interval: Option<u64>,

    /// 下发规则后重启 Tor 并验证出口
    #[arg(long, requires = "load")]
    restart_relay: bool,

    /// 只打印命令，不修改系统
    #[arg(long)]
    dry_run: bool,

    /// JSON 格式输出出口信息
    #[arg(long)]
    json: bool,

    /// 显示调试日志
    #[arg(long, short = 'v')]
    verbose: bool,
}

/// 本次调用选择的模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Load,
    Flush,
    Refresh,
    Ip,
}

impl Cli {
    fn mode(&self) -> Option<Mode> {
        if self.load {
            Some(Mode::Load)
        } else if self.flush {
            Some(Mode::Flush)
        } else if self.refresh {
            Some(Mode::Refresh)
        } else if self.ip {
            Some(Mode::Ip)
        } else {
            None
        }
    }

    /// 命令行覆盖配置文件
    fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(p) = &self.torrc {
            settings.torrc = p.clone();
        }
        settings.extra_networks.extend(self.exempt.iter().copied());
        if let Some(u) = &self.relay_user {
            settings.relay_user = u.clone();
        }
        if let Some(p) = &self.relay_process {
            settings.relay_process = p.clone();
        }
        if let Some(n) = self.attempts {
            settings.verify.attempts = n.max(1);
        }
        if let Some(s) = self.interval {
            settings.verify.interval = Duration::from_secs(s);
        }
    }
}

// ========================================
// 主函数
// ========================================

fn main() {
    // 解析命令行参数
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let Some(mode) = cli.mode() else {
        // 未选择模式：打印帮助，正常退出
        if let Err(e) = Cli::command().print_help() {
            tracing::warn!(error = %e, "could not print help");
        }
        println!();
        return;
    };

    // 处理错误
    if let Err(e) = run(&cli, mode) {
        eprintln!("[!] Error: {:#}", e);
        process::exit(1);
    }
}

/// 初始化日志：RUST_LOG 优先，其次按 --verbose 决定级别
fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "tor_redirect=debug"
    } else {
        "tor_redirect=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(cli: &Cli, mode: Mode) -> Result<()> {
    // 1. 合并配置
    let mut settings = Settings::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut settings);

    // 2. 确保 torrc 开启了透明代理端口（dry-run 不写文件）
    if cli.dry_run {
        tracing::info!(path = %settings.torrc.display(), "dry run: relay config left untouched");
    } else {
        let directives = torrc::Directives {
            virtual_net: settings.virtual_net,
            trans_port: settings.trans_port,
            dns_port: settings.dns_port,
        };
        if let Err(e) = torrc::ensure_directives(&settings.torrc, &directives) {
            // 不影响防火墙操作
            tracing::warn!(error = %format!("{:#}", e), "could not update relay config");
        }
    }

    // 3. 执行对应的模式
    match mode {
        Mode::Load => run_load(cli, &settings),
        Mode::Flush => run_flush(cli),
        Mode::Refresh => run_refresh(cli, &settings),
        Mode::Ip => run_ip(cli, &settings),
    }
}

// ========================================
// 各模式实现
// ========================================

/// 下发规则
fn run_load(cli: &Cli, settings: &Settings) -> Result<()> {
    // 先解析中继 uid：失败时一条规则都不动
    let relay_uid = host::lookup_uid(&settings.relay_user)
        .context("Cannot exempt relay traffic from redirection")?;
    let policy = settings.policy(relay_uid);

    let report = if cli.dry_run {
        let mut table = SimulatedTable::echoing();
        let report = RuleManager::new(&mut table).install(&policy);
        println!();
        print_chains(&table);
        print_sample_verdicts(&table, &policy);
        report
    } else {
        let mut table = IptablesTable::new();
        RuleManager::new(&mut table).install(&policy)
    };

    print_report(&report);
    println!("{}", load_banner(cli.dry_run));

    if cli.restart_relay && !cli.dry_run {
        host::restart_service(&settings.relay_process)?;
        println!("[+] Tor restarted");
        let result = verifier(settings)?.verify(settings.verify.attempts, settings.verify.interval)?;
        print_result(&result, cli.json)?;
    }

    Ok(())
}

/// 清空规则
fn run_flush(cli: &Cli) -> Result<()> {
    let report = if cli.dry_run {
        let mut table = SimulatedTable::echoing();
        RuleManager::new(&mut table).flush()
    } else {
        let mut table = IptablesTable::new();
        RuleManager::new(&mut table).flush()
    };

    print_report(&report);
    println!("[!] Tor routing disabled");
    Ok(())
}

/// 请求新链路
fn run_refresh(cli: &Cli, settings: &Settings) -> Result<()> {
    let registry = if cli.dry_run {
        ProcFsRegistry::dry_run()
    } else {
        ProcFsRegistry::new()
    };
    let verifier = verifier(settings)?;

    let refresher = circuit::CircuitRefresher::new(&registry, &verifier, &settings.relay_process);
    let result = refresher.refresh(settings.verify.attempts, settings.verify.interval)?;
    print_result(&result, cli.json)
}

/// 只查询出口
fn run_ip(cli: &Cli, settings: &Settings) -> Result<()> {
    println!("[*] Getting public IP through Tor...");
    let result = verifier(settings)?.verify(settings.verify.attempts, settings.verify.interval)?;
    print_result(&result, cli.json)
}

fn verifier(settings: &Settings) -> Result<Verifier<HttpProbe>> {
    Ok(Verifier::new(HttpProbe::new(&settings.verify)?))
}

// ========================================
// 输出
// ========================================

/// 输出 install / flush 报告
fn print_report(report: &InstallReport) {
    if report.is_clean() {
        return;
    }

    for (table, outcome) in &report.flush_failures {
        eprintln!("[!] Flush of {} table failed: {}", table, outcome);
    }
    if !report.failed.is_empty() {
        eprintln!(
            "[!] {} of {} rules failed to apply",
            report.failed.len(),
            report.total()
        );
        for (rule, outcome) in &report.failed {
            eprintln!("    iptables {}  ({})", rule, outcome);
        }
    }
    if !host::is_root() {
        eprintln!("[!] Must be run as root");
    }
}

/// --load 结束时的提示
fn load_banner(dry_run: bool) -> &'static str {
    if dry_run {
        "[*] Dry run: no rules were installed"
    } else {
        "[+] Tor routing enabled"
    }
}

/// dry-run 时打印模拟后的链
fn print_chains(table: &SimulatedTable) {
    for t in rule::MANAGED_TABLES {
        println!("# {} OUTPUT", t);
        for (idx, r) in table.chain(t).iter().enumerate() {
            println!("{:>3}  {:<15}\t{}", idx + 1, r.purpose, r);
        }
    }
    println!();
}

/// dry-run 时模拟几类典型数据包的去向
fn print_sample_verdicts(table: &SimulatedTable, policy: &config::RedirectPolicy) {
    let public = std::net::Ipv4Addr::new(1, 1, 1, 1);
    let mut samples = vec![
        ("tcp syn", Packet::tcp_syn(public, 443)),
        ("udp dns", Packet::udp(public, policy.dns_port)),
        ("udp other", Packet::udp(public, 123)),
        ("relay tcp syn", Packet::tcp_syn(public, 443).with_uid(policy.relay_uid)),
    ];
    for net in &policy.exempt_networks {
        let addr = net.hosts().next().unwrap_or(net.addr());
        samples.push(("exempt tcp syn", Packet::tcp_syn(addr, 443)));
    }

    println!("# sample verdicts");
    for (label, packet) in &samples {
        let trace = table.trace(packet);
        let verdict = match trace.verdict {
            Verdict::Redirect(port) => format!("REDIRECT :{}", port),
            Verdict::Accept => "ACCEPT".to_string(),
            Verdict::Drop => "DROP".to_string(),
            Verdict::Reject => "REJECT".to_string(),
        };
        // 命中规则编号与 print_chains 一致（从 1 开始，- 表示未命中）
        let hit = |idx: Option<usize>| idx.map_or("-".to_string(), |i| (i + 1).to_string());
        println!(
            "{:<15}\t{}:{:<6}\t{:<14}\tnat {} / filter {}",
            label,
            packet.destination,
            packet.dport,
            verdict,
            hit(trace.nat_match),
            hit(trace.filter_match)
        );
    }
    println!();
}

/// 输出出口信息
fn print_result(result: &VerificationResult, json_output: bool) -> Result<()> {
    if json_output {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!("[+] Current Tor IP: {}", result.address);
    match result.is_tor {
        Some(false) => println!("[!] Exit address is not a Tor exit"),
        Some(true) | None => {}
    }
    if result.endpoint == verify::Endpoint::Fallback {
        println!("[?] Reported by fallback endpoint, Tor status unknown");
    }
    Ok(())
}

// ========================================
// 测试模块
// ========================================
#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("tor-redirect").chain(args.iter().copied()))
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_mode_dispatch() {
        assert_eq!(parse(&["--load"]).unwrap().mode(), Some(Mode::Load));
        assert_eq!(parse(&["-f"]).unwrap().mode(), Some(Mode::Flush));
        assert_eq!(parse(&["--refresh"]).unwrap().mode(), Some(Mode::Refresh));
        assert_eq!(parse(&["-i", "--json"]).unwrap().mode(), Some(Mode::Ip));
    }

    #[test]
    fn test_no_mode_selected() {
        // 没有模式时 main 打印帮助并以 0 退出
        let cli = parse(&[]).unwrap();
        assert_eq!(cli.mode(), None);

        let cli = parse(&["--dry-run", "-v"]).unwrap();
        assert_eq!(cli.mode(), None);
    }

    #[test]
    fn test_modes_are_mutually_exclusive() {
        for pair in [
            ["--load", "--flush"],
            ["--refresh", "--ip"],
            ["-l", "-i"],
            ["--flush", "--refresh"],
        ] {
            let err = parse(&pair).err().expect("conflicting modes rejected");
            assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict, "{:?}", pair);
        }
    }

    #[test]
    fn test_restart_relay_requires_load() {
        let err = parse(&["--restart-relay"]).err().expect("missing --load rejected");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);

        let err = parse(&["--flush", "--restart-relay"]).err().expect("flush rejected");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);

        let cli = parse(&["--load", "--restart-relay"]).unwrap();
        assert_eq!(cli.mode(), Some(Mode::Load));
        assert!(cli.restart_relay);
    }

    #[test]
    fn test_overrides_apply_on_top_of_settings() {
        let cli = parse(&[
            "--load",
            "--exempt",
            "100.64.0.0/10",
            "--exempt",
            "198.18.0.0/15",
            "--relay-user",
            "debian-tor",
            "--attempts",
            "0",
            "--interval",
            "2",
        ])
        .unwrap();

        let mut settings = Settings::default();
        cli.apply_overrides(&mut settings);

        assert_eq!(settings.relay_user, "debian-tor");
        assert_eq!(
            settings.extra_networks,
            vec![
                "100.64.0.0/10".parse::<Ipv4Net>().unwrap(),
                "198.18.0.0/15".parse().unwrap()
            ]
        );
        // 至少尝试一次
        assert_eq!(settings.verify.attempts, 1);
        assert_eq!(settings.verify.interval, Duration::from_secs(2));
    }

    #[test]
    fn test_load_banner_reflects_dry_run() {
        assert_eq!(load_banner(false), "[+] Tor routing enabled");
        assert!(!load_banner(true).contains("enabled"));
    }

    #[test]
    fn test_invalid_exempt_network_rejected() {
        assert!(parse(&["--load", "--exempt", "not-a-cidr"]).is_err());
    }
}
