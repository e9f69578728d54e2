//! # 连通性验证
//!
//! 通过外部 "what is my IP" 接口确认流量确实经过中继：
//! 1. 主接口（JSON，带 `IP` 字段）最多尝试 N 次，每次独立超时
//! 2. 失败后等待固定间隔再重试（中继监听端口可能还没就绪）
//! 3. 全部失败后，访问一次纯文本备用接口，不再重试
//! 4. 仍然失败则返回 [`RedirectError::VerificationExhausted`]

use std::fmt;
use std::net::IpAddr;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::VerifySettings;
use crate::error::RedirectError;

// ========================================
// 探测接口
// ========================================

/// 探测使用的接口
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Primary,
    Fallback,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Primary => write!(f, "primary"),
            Endpoint::Fallback => write!(f, "fallback"),
        }
    }
}

/// 单次探测的响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub address: IpAddr,
    /// 主接口会告诉我们是否来自 Tor 出口，备用接口没有这个信息
    pub is_tor: Option<bool>,
}

/// 单次探测失败的原因
#[derive(Debug, Error)]
pub enum ProbeError {
    /// 超时、连接被拒等
    #[error("request failed: {0}")]
    Transport(String),
    /// 返回内容不是合法 IP
    #[error("unexpected response: {0}")]
    Malformed(String),
}

/// 出口地址探测器
pub trait AddressProbe {
    fn query(&self, endpoint: Endpoint) -> Result<ProbeResponse, ProbeError>;
}

// ========================================
// HTTP 实现
// ========================================

/// check.torproject.org 的返回格式
#[derive(Debug, Deserialize)]
struct TorCheckResponse {
    #[serde(rename = "IP")]
    ip: String,
    #[serde(rename = "IsTor", default)]
    is_tor: Option<bool>,
}

/// 基于 reqwest 阻塞客户端的探测器
pub struct HttpProbe {
    client: reqwest::blocking::Client,
    primary_url: String,
    fallback_url: String,
}

impl HttpProbe {
    pub fn new(settings: &VerifySettings) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(settings.timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            primary_url: settings.primary_url.clone(),
            fallback_url: settings.fallback_url.clone(),
        })
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response, ProbeError> {
        self.client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| ProbeError::Transport(e.to_string()))
    }
}

impl AddressProbe for HttpProbe {
    fn query(&self, endpoint: Endpoint) -> Result<ProbeResponse, ProbeError> {
        match endpoint {
            Endpoint::Primary => {
                let resp = self
                    .get(&self.primary_url)?
                    .json::<TorCheckResponse>()
                    .map_err(|e| {
                        if e.is_decode() {
                            ProbeError::Malformed(e.to_string())
                        } else {
                            ProbeError::Transport(e.to_string())
                        }
                    })?;
                parse_primary(resp)
            }
            Endpoint::Fallback => {
                let body = self
                    .get(&self.fallback_url)?
                    .text()
                    .map_err(|e| ProbeError::Transport(e.to_string()))?;
                parse_fallback(&body)
            }
        }
    }
}

/// 校验主接口返回的 IP 字段
fn parse_primary(resp: TorCheckResponse) -> Result<ProbeResponse, ProbeError> {
    let address = resp
        .ip
        .trim()
        .parse()
        .map_err(|_| ProbeError::Malformed(resp.ip.clone()))?;
    Ok(ProbeResponse {
        address,
        is_tor: resp.is_tor,
    })
}

/// 解析备用接口纯文本
fn parse_fallback(body: &str) -> Result<ProbeResponse, ProbeError> {
    let text = body.trim();
    if text.is_empty() {
        return Err(ProbeError::Malformed("empty body".to_string()));
    }
    let address = text
        .parse()
        .map_err(|_| ProbeError::Malformed(text.chars().take(64).collect()))?;
    Ok(ProbeResponse {
        address,
        is_tor: None,
    })
}

// ========================================
// 验证器
// ========================================

/// 验证结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    /// 第三方看到的出口地址
    pub address: IpAddr,
    /// 给出结果的接口
    pub endpoint: Endpoint,
    /// 主接口第几次尝试成功（备用接口为 None）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_tor: Option<bool>,
}

/// 连通性验证器
pub struct Verifier<P: AddressProbe> {
    probe: P,
}

impl<P: AddressProbe> Verifier<P> {
    pub fn new(probe: P) -> Self {
        Self { probe }
    }

    #[cfg(test)]
    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// 有界重试 + 一次备用查询
    pub fn verify(
        &self,
        max_attempts: u32,
        interval: Duration,
    ) -> Result<VerificationResult, RedirectError> {
        tracing::info!(max_attempts, "checking public IP through the relay");

        for attempt in 1..=max_attempts {
            match self.probe.query(Endpoint::Primary) {
                Ok(resp) => {
                    return Ok(VerificationResult {
                        address: resp.address,
                        endpoint: Endpoint::Primary,
                        attempt: Some(attempt),
                        is_tor: resp.is_tor,
                    });
                }
                Err(e) => {
                    tracing::warn!(attempt, max_attempts, error = %e, "waiting for relay");
                    // 最后一次失败后不再等待，直接走备用接口
                    if attempt < max_attempts && !interval.is_zero() {
                        thread::sleep(interval);
                    }
                }
            }
        }

        match self.probe.query(Endpoint::Fallback) {
            Ok(resp) => Ok(VerificationResult {
                address: resp.address,
                endpoint: Endpoint::Fallback,
                attempt: None,
                is_tor: resp.is_tor,
            }),
            Err(e) => {
                tracing::error!(error = %e, "fallback probe failed");
                Err(RedirectError::VerificationExhausted {
                    attempts: max_attempts,
                })
            }
        }
    }
}
