//! Polling helpers that block a workflow until a server reaches a state.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::inventory::{CloudState, DiscoveredInstance};
use crate::CloudProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("instance entered terminal state {0}")]
    TerminalState(CloudState),
    #[error("provider error: {0:#}")]
    Provider(#[from] anyhow::Error),
    #[error("wait cancelled")]
    Cancelled,
}

/// Polls until the server reports running. Describe failures are logged and
/// retried on the next tick; shutting-down or terminated fail immediately.
pub async fn wait_until_running(
    provider: &dyn CloudProvider,
    zone: &str,
    server_id: &str,
    policy: WaitPolicy,
    cancel: &CancellationToken,
) -> Result<DiscoveredInstance, WaitError> {
    let poll = async {
        loop {
            match provider.describe_instance(zone, server_id).await {
                Ok(Some(server)) if server.state == CloudState::Running => return Ok(server),
                Ok(Some(server)) if server.state.is_terminal_failure() => {
                    return Err(WaitError::TerminalState(server.state));
                }
                Ok(Some(server)) => {
                    tracing::debug!(zone, server_id, state = %server.state, "waiting for running");
                }
                Ok(None) => tracing::debug!(zone, server_id, "server not visible yet"),
                Err(e) => {
                    tracing::warn!(
                        zone,
                        server_id,
                        error = %format!("{e:#}"),
                        "describe failed, polling again"
                    );
                }
            }
            tokio::time::sleep(policy.interval).await;
        }
    };
    bounded(poll, policy, cancel).await
}

/// Polls until the server is gone or reports terminated.
pub async fn wait_until_terminated(
    provider: &dyn CloudProvider,
    zone: &str,
    server_id: &str,
    policy: WaitPolicy,
    cancel: &CancellationToken,
) -> Result<(), WaitError> {
    let poll = async {
        loop {
            match provider.describe_instance(zone, server_id).await {
                Ok(None) => return Ok(()),
                Ok(Some(server)) if server.state == CloudState::Terminated => return Ok(()),
                Ok(Some(server)) => {
                    tracing::debug!(
                        zone,
                        server_id,
                        state = %server.state,
                        "waiting for termination"
                    );
                }
                Err(e) => return Err(WaitError::Provider(e)),
            }
            tokio::time::sleep(policy.interval).await;
        }
    };
    bounded(poll, policy, cancel).await
}

async fn bounded<T, F>(
    poll: F,
    policy: WaitPolicy,
    cancel: &CancellationToken,
) -> Result<T, WaitError>
where
    F: std::future::Future<Output = Result<T, WaitError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WaitError::Cancelled),
        res = tokio::time::timeout(policy.timeout, poll) => match res {
            Ok(outcome) => outcome,
            Err(_) => Err(WaitError::Timeout(policy.timeout)),
        },
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::mock::MockProvider;

    fn policy() -> WaitPolicy {
        WaitPolicy {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_running_times_out_when_stuck() {
        let provider = MockProvider::manual();
        let id = provider
            .create_instance("zone-a", "DEV1-S", "ubuntu", None, "tag")
            .await
            .unwrap();

        let err = wait_until_running(&provider, "zone-a", &id, policy(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_running_fails_on_terminal_state() {
        let provider = MockProvider::manual();
        let id = provider
            .create_instance("zone-a", "DEV1-S", "ubuntu", None, "tag")
            .await
            .unwrap();
        provider.set_state(&id, CloudState::ShuttingDown).await;

        let err = wait_until_running(&provider, "zone-a", &id, policy(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::TerminalState(CloudState::ShuttingDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_observes_cancellation() {
        let provider = MockProvider::manual();
        let id = provider
            .create_instance("zone-a", "DEV1-S", "ubuntu", None, "tag")
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = wait_until_running(&provider, "zone-a", &id, policy(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_terminated_accepts_absent_server() {
        let provider = MockProvider::manual();
        let cancel = CancellationToken::new();
        let res = wait_until_terminated(&provider, "zone-a", "missing", policy(), &cancel).await;
        assert!(res.is_ok());
    }
}
