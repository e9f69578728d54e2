//! # 配置模块
//!
//! 配置分三层，后者覆盖前者：
//! 1. 内置默认值（与 torrc 中追加的指令一致）
//! 2. 可选的 TOML 配置文件（默认 `/etc/tor-redirect.toml`）
//! 3. 命令行参数（在 main.rs 中覆盖）
//!
//! ## 配置文件示例
//! ```toml
//! trans_port = 9040
//! dns_port = 53
//! exempt_networks = ["192.168.0.0/16", "172.16.0.0/12", "10.8.0.0/24"]
//! relay_user = "debian-tor"
//!
//! [verify]
//! attempts = 8
//! interval_secs = 5
//! ```

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use serde::Deserialize;

use crate::error::RedirectError;

// ========================================
// 默认值
// ========================================

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "/etc/tor-redirect.toml";

/// 默认 torrc 路径
pub const DEFAULT_TORRC_PATH: &str = "/etc/tor/torrc";

/// 默认 DNS 捕获端口
pub const DEFAULT_DNS_PORT: u16 = 53;

/// 默认透明代理端口（Tor TransPort）
pub const DEFAULT_TRANS_PORT: u16 = 9040;

/// 主探测接口：返回 `{"IsTor": true, "IP": "..."}`
pub const DEFAULT_PRIMARY_URL: &str = "https://check.torproject.org/api/ip";

/// 备用探测接口：返回纯文本 IP
pub const DEFAULT_FALLBACK_URL: &str = "https://ident.me";

/// 回环网段的各种写法，始终豁免
const LOOPBACK_NETWORKS: [&str; 3] = ["127.0.0.0/9", "127.128.0.0/10", "127.0.0.0/8"];

/// 默认不走 Tor 的私有网段
const PRIVATE_NETWORKS: [&str; 2] = ["192.168.0.0/16", "172.16.0.0/12"];

fn parse_nets(nets: &[&str]) -> Vec<Ipv4Net> {
    nets.iter().filter_map(|n| n.parse().ok()).collect()
}

// ========================================
// 重定向策略
// ========================================

/// 一次调用所使用的重定向策略（构造后不可变）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectPolicy {
    /// DNS 捕获端口
    pub dns_port: u16,
    /// TCP 透明代理端口
    pub trans_port: u16,
    /// Tor 自动映射主机名使用的虚拟地址段
    pub virtual_net: Ipv4Net,
    /// 回环地址
    pub loopback: Ipv4Addr,
    /// 豁免网段（按安装顺序）
    pub exempt_networks: Vec<Ipv4Net>,
    /// 中继进程所属用户的 uid
    pub relay_uid: u32,
}

impl RedirectPolicy {
    /// 判断目标地址是否落在任一豁免网段内
    #[cfg(test)]
    pub fn is_exempt(&self, addr: Ipv4Addr) -> bool {
        self.exempt_networks.iter().any(|net| net.contains(&addr))
    }
}

// ========================================
// 验证参数
// ========================================

/// 连通性验证参数
#[derive(Debug, Clone)]
pub struct VerifySettings {
    /// 主接口最多尝试次数
    pub attempts: u32,
    /// 两次尝试之间的等待时间
    pub interval: Duration,
    /// 单次请求超时
    pub timeout: Duration,
    pub primary_url: String,
    pub fallback_url: String,
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            attempts: 8,
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
            primary_url: DEFAULT_PRIMARY_URL.to_string(),
            fallback_url: DEFAULT_FALLBACK_URL.to_string(),
        }
    }
}

// ========================================
// 完整设置
// ========================================

/// 合并默认值、配置文件与命令行之后的设置
#[derive(Debug, Clone)]
pub struct Settings {
    pub dns_port: u16,
    pub trans_port: u16,
    pub virtual_net: Ipv4Net,
    pub loopback: Ipv4Addr,
    /// 回环网段（始终豁免）
    pub loopback_networks: Vec<Ipv4Net>,
    /// 私有网段（可由配置文件替换）
    pub private_networks: Vec<Ipv4Net>,
    /// 额外豁免网段（命令行 --exempt）
    pub extra_networks: Vec<Ipv4Net>,
    /// 中继进程运行用户
    pub relay_user: String,
    /// 中继进程名
    pub relay_process: String,
    /// 中继配置文件路径
    pub torrc: PathBuf,
    pub verify: VerifySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dns_port: DEFAULT_DNS_PORT,
            trans_port: DEFAULT_TRANS_PORT,
            virtual_net: Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 10)
                .unwrap_or_default(),
            loopback: Ipv4Addr::LOCALHOST,
            loopback_networks: parse_nets(&LOOPBACK_NETWORKS),
            private_networks: parse_nets(&PRIVATE_NETWORKS),
            extra_networks: Vec::new(),
            relay_user: "tor".to_string(),
            relay_process: "tor".to_string(),
            torrc: PathBuf::from(DEFAULT_TORRC_PATH),
            verify: VerifySettings::default(),
        }
    }
}

impl Settings {
    /// 加载设置
    ///
    /// - `path` 为 Some：文件必须存在
    /// - `path` 为 None：默认路径存在时读取，否则使用内置默认值
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = Self::default();

        let file_path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                default.exists().then_some(default)
            }
        };

        if let Some(file_path) = file_path {
            let content = fs::read_to_string(&file_path)
                .with_context(|| format!("Failed to read config {}", file_path.display()))?;
            settings.merge_toml(&file_path, &content)?;
            tracing::debug!(path = %file_path.display(), "loaded config file");
        }

        Ok(settings)
    }

    /// 用 TOML 内容覆盖当前设置
    pub fn merge_toml(&mut self, path: &Path, content: &str) -> Result<()> {
        let file: FileConfig =
            toml::from_str(content).map_err(|e| RedirectError::InvalidConfig {
                path: path.to_path_buf(),
                reason: e.message().to_string(),
            })?;

        if let Some(v) = file.dns_port {
            self.dns_port = v;
        }
        if let Some(v) = file.trans_port {
            self.trans_port = v;
        }
        if let Some(v) = file.virtual_net {
            self.virtual_net = v;
        }
        if let Some(v) = file.loopback {
            self.loopback = v;
        }
        if let Some(v) = file.exempt_networks {
            self.private_networks = v;
        }
        if let Some(v) = file.relay_user {
            self.relay_user = v;
        }
        if let Some(v) = file.relay_process {
            self.relay_process = v;
        }
        if let Some(v) = file.torrc {
            self.torrc = v;
        }

        let verify = file.verify;
        if let Some(v) = verify.attempts {
            self.verify.attempts = v;
        }
        if let Some(v) = verify.interval_secs {
            self.verify.interval = Duration::from_secs(v);
        }
        if let Some(v) = verify.timeout_secs {
            self.verify.timeout = Duration::from_secs(v);
        }
        if let Some(v) = verify.primary_url {
            self.verify.primary_url = v;
        }
        if let Some(v) = verify.fallback_url {
            self.verify.fallback_url = v;
        }

        self.validate(path)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let invalid = |reason: &str| RedirectError::InvalidConfig {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        if self.dns_port == 0 || self.trans_port == 0 {
            return Err(invalid("ports must be non-zero").into());
        }
        if self.verify.attempts == 0 {
            return Err(invalid("verify.attempts must be at least 1").into());
        }
        if self.relay_user.is_empty() || self.relay_process.is_empty() {
            return Err(invalid("relay_user and relay_process must not be empty").into());
        }
        Ok(())
    }

    /// 按安装顺序列出所有豁免网段：回环 → 私有 → 额外，去重
    pub fn exempt_networks(&self) -> Vec<Ipv4Net> {
        let mut nets: Vec<Ipv4Net> = Vec::new();
        let all = self
            .loopback_networks
            .iter()
            .chain(&self.private_networks)
            .chain(&self.extra_networks);
        for net in all {
            if !nets.contains(net) {
                nets.push(*net);
            }
        }
        nets
    }

    /// 用已解析的中继 uid 构造策略
    pub fn policy(&self, relay_uid: u32) -> RedirectPolicy {
        RedirectPolicy {
            dns_port: self.dns_port,
            trans_port: self.trans_port,
            virtual_net: self.virtual_net,
            loopback: self.loopback,
            exempt_networks: self.exempt_networks(),
            relay_uid,
        }
    }
}

// ========================================
// 配置文件结构
// ========================================

/// TOML 配置文件（所有字段可选）
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    dns_port: Option<u16>,
    trans_port: Option<u16>,
    virtual_net: Option<Ipv4Net>,
    loopback: Option<Ipv4Addr>,
    exempt_networks: Option<Vec<Ipv4Net>>,
    relay_user: Option<String>,
    relay_process: Option<String>,
    torrc: Option<PathBuf>,
    verify: FileVerify,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileVerify {
    attempts: Option<u32>,
    interval_secs: Option<u64>,
    timeout_secs: Option<u64>,
    primary_url: Option<String>,
    fallback_url: Option<String>,
}

// ========================================
// 测试模块
// ========================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_exempt_order() {
        let settings = Settings::default();
        let nets: Vec<String> = settings
            .exempt_networks()
            .iter()
            .map(|n| n.to_string())
            .collect();
        assert_eq!(
            nets,
            vec![
                "127.0.0.0/9",
                "127.128.0.0/10",
                "127.0.0.0/8",
                "192.168.0.0/16",
                "172.16.0.0/12"
            ]
        );
        assert_eq!(settings.virtual_net.to_string(), "10.0.0.0/10");
    }

    #[test]
    fn test_extra_networks_deduplicated() {
        let mut settings = Settings::default();
        settings.extra_networks = vec![
            "10.8.0.0/24".parse().unwrap(),
            "192.168.0.0/16".parse().unwrap(),
        ];
        let nets = settings.exempt_networks();
        assert_eq!(nets.len(), 6);
        assert_eq!(nets.last().unwrap().to_string(), "10.8.0.0/24");
    }

    #[test]
    fn test_merge_toml_overrides() {
        let mut settings = Settings::default();
        let content = r#"
trans_port = 9050
exempt_networks = ["10.1.0.0/16"]
relay_user = "debian-tor"

[verify]
attempts = 3
interval_secs = 1
"#;
        settings
            .merge_toml(Path::new("test.toml"), content)
            .unwrap();

        assert_eq!(settings.trans_port, 9050);
        assert_eq!(settings.dns_port, DEFAULT_DNS_PORT);
        assert_eq!(settings.relay_user, "debian-tor");
        assert_eq!(settings.verify.attempts, 3);
        assert_eq!(settings.verify.interval, Duration::from_secs(1));

        // 回环网段不受配置文件影响
        let policy = settings.policy(106);
        assert!(policy.is_exempt(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(policy.is_exempt(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(!policy.is_exempt(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn test_merge_toml_rejects_unknown_and_invalid() {
        let mut settings = Settings::default();
        assert!(settings
            .merge_toml(Path::new("a.toml"), "bogus_key = 1")
            .is_err());

        let mut settings = Settings::default();
        let err = settings
            .merge_toml(Path::new("b.toml"), "[verify]\nattempts = 0")
            .unwrap_err();
        assert!(err.to_string().contains("verify.attempts"));
    }

    #[test]
    fn test_load_explicit_missing_path_fails() {
        let result = Settings::load(Some(Path::new("/nonexistent/tor-redirect.toml")));
        assert!(result.is_err());
    }
}
