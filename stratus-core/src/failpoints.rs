//! Failpoint integration for fault injection testing
//!
//! Crash windows in the work ledger, the state machine and the migration
//! protocol are marked with [`fail_point!`]. With the `failpoints` feature
//! off every marker compiles to nothing.

/// Initialize failpoints for testing
/// Must be called at the start of tests that use failpoints
#[cfg(feature = "failpoints")]
pub fn init() {
    fail::cfg("stratus", "off").ok();
}

/// Inject a failpoint that returns a `StratusError::RuntimeFault`
///
/// Usage:
/// ```ignore
/// fail_point!("work_ledger::begin_work");
/// ```
#[macro_export]
#[cfg(feature = "failpoints")]
macro_rules! fail_point {
    ($name:expr) => {{
        fail::fail_point!($name, |_| {
            Err($crate::error::StratusError::RuntimeFault {
                message: concat!("Failpoint triggered: ", $name).to_string(),
            })
        });
    }};
    ($name:expr, $err:expr) => {{
        fail::fail_point!($name, |_| { Err($err) });
    }};
}

/// No-op version for when failpoints feature is disabled
#[macro_export]
#[cfg(not(feature = "failpoints"))]
macro_rules! fail_point {
    ($name:expr) => {};
    ($name:expr, $err:expr) => {};
}

/// Test helper to run code with a failpoint enabled
#[cfg(feature = "failpoints")]
pub async fn with_failpoint<F, R>(name: &str, config: &str, f: F) -> R
where
    F: std::future::Future<Output = R>,
{
    fail::cfg(name, config)
        .map_err(|e| {
            tracing::error!("Failed to configure failpoint '{}': {}", name, e);
        })
        .ok();
    let result = f.await;
    fail::cfg(name, "off")
        .map_err(|e| {
            tracing::error!("Failed to disable failpoint '{}': {}", name, e);
        })
        .ok();
    result
}

#[cfg(test)]
#[cfg(feature = "failpoints")]
mod tests {
    use super::*;
    use crate::error::{StratusError, StratusResult};

    #[test]
    fn test_failpoint_macro() {
        init();

        fn may_fail() -> StratusResult<()> {
            fail_point!("test::fail");
            Ok(())
        }

        assert!(may_fail().is_ok());

        fail::cfg("test::fail", "return").unwrap();
        assert!(matches!(may_fail(), Err(StratusError::RuntimeFault { .. })));

        fail::cfg("test::fail", "off").unwrap();
        assert!(may_fail().is_ok());
    }

    #[test]
    fn test_custom_error() {
        init();

        fn may_fail_custom() -> StratusResult<()> {
            fail_point!(
                "test::custom",
                StratusError::Storage {
                    operation: "commit".to_string(),
                    source: Box::new(std::io::Error::new(std::io::ErrorKind::Other, "injected")),
                }
            );
            Ok(())
        }

        fail::cfg("test::custom", "return").unwrap();
        match may_fail_custom() {
            Err(StratusError::Storage { operation, .. }) => assert_eq!(operation, "commit"),
            other => panic!("Expected storage error, got {:?}", other),
        }
        fail::cfg("test::custom", "off").unwrap();
    }
}
