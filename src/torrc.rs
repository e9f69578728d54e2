//! # torrc 配置检查
//!
//! 透明代理依赖中继开启 `TransPort` / `DNSPort` 等指令。
//! 如果配置文件里没有 `VirtualAddrNetwork`，就在末尾追加一整段；
//! 已有内容永远不改写、不删除。

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use ipnet::Ipv4Net;

/// 用来判断是否已配置的指令
const MARKER_DIRECTIVE: &str = "VirtualAddrNetwork";

/// 检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrcStatus {
    /// 配置文件不存在，什么也不做
    Missing,
    /// 已包含所需指令
    AlreadyConfigured,
    /// 已追加指令段
    Appended,
}

/// 需要追加的指令
#[derive(Debug, Clone)]
pub struct Directives {
    pub virtual_net: Ipv4Net,
    pub trans_port: u16,
    pub dns_port: u16,
}

impl Directives {
    /// 渲染为 torrc 文本块
    pub fn render(&self) -> String {
        format!(
            "\n## Added by {}\nVirtualAddrNetwork {}\nAutomapHostsOnResolve 1\nTransPort {}\nDNSPort {}\n",
            env!("CARGO_PKG_NAME"),
            self.virtual_net,
            self.trans_port,
            self.dns_port
        )
    }
}

/// 确保 torrc 中包含透明代理所需指令
pub fn ensure_directives(path: &Path, directives: &Directives) -> Result<TorrcStatus> {
    if !path.is_file() {
        tracing::debug!(path = %path.display(), "relay config not found, skipping");
        return Ok(TorrcStatus::Missing);
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    if has_directive(&content) {
        return Ok(TorrcStatus::AlreadyConfigured);
    }

    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {} for appending", path.display()))?;
    file.write_all(directives.render().as_bytes())
        .with_context(|| format!("Failed to append to {}", path.display()))?;

    tracing::info!(path = %path.display(), "appended transparent proxy directives");
    Ok(TorrcStatus::Appended)
}

/// 只认未被注释的指令行，关键字不区分大小写（与 tor 解析一致）
fn has_directive(content: &str) -> bool {
    content
        .lines()
        .map(str::trim_start)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_whitespace().next())
        .any(|keyword| keyword.eq_ignore_ascii_case(MARKER_DIRECTIVE))
}

// ========================================
// 测试模块
// ========================================
#[cfg(test)]
mod tests {
    use super::*;

    fn directives() -> Directives {
        Directives {
            virtual_net: "10.0.0.0/10".parse().unwrap(),
            trans_port: 9040,
            dns_port: 53,
        }
    }

    #[test]
    fn test_appends_when_missing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "SocksPort 9050").unwrap();
        writeln!(file, "#VirtualAddrNetwork 10.192.0.0/10").unwrap();

        let status = ensure_directives(file.path(), &directives()).unwrap();
        assert_eq!(status, TorrcStatus::Appended);

        let content = fs::read_to_string(file.path()).unwrap();
        assert!(content.starts_with("SocksPort 9050\n#VirtualAddrNetwork"));
        assert!(content.contains("\nVirtualAddrNetwork 10.0.0.0/10\n"));
        assert!(content.contains("AutomapHostsOnResolve 1\n"));
        assert!(content.contains("TransPort 9040\n"));
        assert!(content.contains("DNSPort 53\n"));

        // 再次执行不会重复追加
        let status = ensure_directives(file.path(), &directives()).unwrap();
        assert_eq!(status, TorrcStatus::AlreadyConfigured);
        assert_eq!(fs::read_to_string(file.path()).unwrap(), content);
    }

    #[test]
    fn test_existing_directive_left_untouched() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let original = "VirtualAddrNetwork 10.192.0.0/10\nTransPort 9041\n";
        file.write_all(original.as_bytes()).unwrap();

        let status = ensure_directives(file.path(), &directives()).unwrap();
        assert_eq!(status, TorrcStatus::AlreadyConfigured);
        assert_eq!(fs::read_to_string(file.path()).unwrap(), original);
    }

    #[test]
    fn test_directive_keyword_case_insensitive() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let original = "SocksPort 9050\n  virtualaddrnetwork 10.192.0.0/10\nTransPort 9040\n";
        file.write_all(original.as_bytes()).unwrap();

        let status = ensure_directives(file.path(), &directives()).unwrap();
        assert_eq!(status, TorrcStatus::AlreadyConfigured);
        assert_eq!(fs::read_to_string(file.path()).unwrap(), original);

        assert!(has_directive("VIRTUALADDRNETWORK 10.192.0.0/10"));
        assert!(!has_directive("# virtualaddrnetwork 10.192.0.0/10"));
        assert!(!has_directive("VirtualAddrNetworkIPv6 [FC00::]/7"));
    }

    #[test]
    fn test_missing_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("torrc");
        let status = ensure_directives(&path, &directives()).unwrap();
        assert_eq!(status, TorrcStatus::Missing);
        assert!(!path.exists());
    }
}
