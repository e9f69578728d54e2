//! # 链路刷新
//!
//! 让中继进程丢弃当前链路并重建：找到中继 PID，发送 SIGHUP，再验证新链路。

use std::time::Duration;

use anyhow::Result;

use crate::error::RedirectError;
use crate::host::ProcessRegistry;
use crate::verify::{AddressProbe, VerificationResult, Verifier};

/// 链路刷新器
pub struct CircuitRefresher<'a, R: ProcessRegistry, P: AddressProbe> {
    registry: &'a R,
    verifier: &'a Verifier<P>,
    /// 中继进程名
    process_name: &'a str,
}

impl<'a, R: ProcessRegistry, P: AddressProbe> CircuitRefresher<'a, R, P> {
    pub fn new(registry: &'a R, verifier: &'a Verifier<P>, process_name: &'a str) -> Self {
        Self {
            registry,
            verifier,
            process_name,
        }
    }

    /// 请求新链路并验证
    ///
    /// 中继未运行时直接失败：不发信号，也不做验证。
    pub fn refresh(&self, max_attempts: u32, interval: Duration) -> Result<VerificationResult> {
        let pid = self
            .registry
            .find_by_name(self.process_name)
            .ok_or_else(|| RedirectError::RelayNotRunning(self.process_name.to_string()))?;

        tracing::info!(pid, process = self.process_name, "requesting new circuit");
        self.registry.signal_reload(pid)?;

        Ok(self.verifier.verify(max_attempts, interval)?)
    }
}

// ========================================
// 测试模块
// ========================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::tests::FlakyProbe;
    use crate::verify::Endpoint;
    use std::cell::RefCell;

    /// 记录信号的假进程表
    struct FakeRegistry {
        pid: Option<i32>,
        signalled: RefCell<Vec<i32>>,
    }

    impl FakeRegistry {
        fn new(pid: Option<i32>) -> Self {
            Self {
                pid,
                signalled: RefCell::new(Vec::new()),
            }
        }
    }

    impl ProcessRegistry for FakeRegistry {
        fn find_by_name(&self, name: &str) -> Option<i32> {
            if name == "tor" {
                self.pid
            } else {
                None
            }
        }

        fn signal_reload(&self, pid: i32) -> Result<()> {
            self.signalled.borrow_mut().push(pid);
            Ok(())
        }
    }

    #[test]
    fn test_refresh_signals_then_verifies() {
        let registry = FakeRegistry::new(Some(812));
        let verifier = Verifier::new(FlakyProbe::new(1, false));
        let refresher = CircuitRefresher::new(&registry, &verifier, "tor");

        let result = refresher.refresh(4, Duration::ZERO).unwrap();
        assert_eq!(*registry.signalled.borrow(), vec![812]);
        assert_eq!(result.endpoint, Endpoint::Primary);
        assert_eq!(result.attempt, Some(2));
    }

    #[test]
    fn test_refresh_without_relay_is_fatal() {
        let registry = FakeRegistry::new(None);
        let probe = FlakyProbe::new(0, true);
        let verifier = Verifier::new(probe);
        let refresher = CircuitRefresher::new(&registry, &verifier, "tor");

        let err = refresher.refresh(4, Duration::ZERO).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RedirectError>(),
            Some(RedirectError::RelayNotRunning(name)) if name == "tor"
        ));
        // 没有发信号，也没有访问任何接口
        assert!(registry.signalled.borrow().is_empty());
        assert!(verifier.probe().calls.borrow().is_empty());
    }

    #[test]
    fn test_refresh_propagates_verification_failure() {
        let registry = FakeRegistry::new(Some(812));
        let verifier = Verifier::new(FlakyProbe::new(u32::MAX, false));
        let refresher = CircuitRefresher::new(&registry, &verifier, "tor");

        let err = refresher.refresh(2, Duration::ZERO).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RedirectError>(),
            Some(RedirectError::VerificationExhausted { attempts: 2 })
        ));
        assert_eq!(*registry.signalled.borrow(), vec![812]);
    }
}
