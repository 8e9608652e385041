use std::time::Duration;

use smart_default::SmartDefault;

/// Tuning knobs shared by a registry and its discovery driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, SmartDefault)]
pub struct RegistryConfig {
    /// Upper bound for any single bus call; a call that takes longer counts as unreachable.
    #[default(Duration::from_secs(5))]
    pub call_timeout: Duration,

    /// How long a peer whose introspection failed stays in the table before it is evicted.
    #[default(Duration::from_secs(2))]
    pub failed_grace: Duration,

    /// Delay between losing the bus and trying to reconnect.
    #[default(Duration::from_secs(3))]
    pub reconnect_delay: Duration,
}

/// Run `fut`, treating expiry of `timeout` as the peer being unreachable.
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = crate::BusResult<T>>,
) -> crate::BusResult<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(crate::BusError::Unreachable(format!("no reply within {:?}", timeout))),
    }
}
