//! # 错误类型
//!
//! 调用方需要区分处理的失败都在这里定义。
//! 其余错误（I/O、命令启动失败等）统一通过 anyhow 传播。

use std::path::PathBuf;

use thiserror::Error;

/// 重定向器的类型化错误
#[derive(Debug, Error)]
pub enum RedirectError {
    /// 找不到中继进程（例如 tor 未运行）
    #[error("relay process '{0}' is not running")]
    RelayNotRunning(String),

    /// 中继用户不存在，无法得到 uid
    #[error("relay user '{0}' does not exist on this host")]
    RelayUserUnknown(String),

    /// 所有重试与备用接口均失败
    #[error("could not determine public IP after {attempts} attempts and fallback; traffic redirection is not confirmed to be working")]
    VerificationExhausted { attempts: u32 },

    /// 配置文件内容非法
    #[error("invalid config {path}: {reason}")]
    InvalidConfig { path: PathBuf, reason: String },
}
