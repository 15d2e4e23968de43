// Proactive token renewal

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::manager::TokenManager;
use crate::error::TokenError;

/// When to re-run refresh()
#[derive(Debug, Clone, PartialEq)]
pub enum RenewalPolicy {
    /// Single timer for expires_in() at start, never rearmed
    Once,

    /// Rearm after every attempt
    Continuous {
        /// Refresh this long before expiry
        lead: Duration,
        /// First retry delay after a failed refresh
        backoff_base: Duration,
        /// Upper bound for retry delays
        backoff_max: Duration,
    },
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        RenewalPolicy::Continuous {
            lead: Duration::from_secs(60),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
        }
    }
}

/// Handle to a running renewal task
pub struct RenewalHandle {
    task: JoinHandle<()>,
}

impl RenewalHandle {
    /// Stop the renewal task
    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn the renewal task for `manager`
///
/// Constructing a `TokenManager` never starts a timer. `RenewalPolicy::Once`
/// arms its single timer here, from the state held when `spawn` is called,
/// so call it right after construction to renew the startup credential.
pub fn spawn(manager: Arc<TokenManager>, policy: RenewalPolicy) -> RenewalHandle {
    let task = match policy {
        RenewalPolicy::Once => tokio::spawn(run_once(manager)),
        RenewalPolicy::Continuous {
            lead,
            backoff_base,
            backoff_max,
        } => tokio::spawn(run_continuous(manager, lead, backoff_base, backoff_max)),
    };

    RenewalHandle { task }
}

async fn run_once(manager: Arc<TokenManager>) {
    let delay = Duration::from_millis(manager.expires_in().await);
    tracing::debug!("Token refresh scheduled in {}ms", delay.as_millis());

    tokio::time::sleep(delay).await;

    // Outcome is reported through manager events
    let _ = manager.refresh().await;
}

async fn run_continuous(
    manager: Arc<TokenManager>,
    lead: Duration,
    backoff_base: Duration,
    backoff_max: Duration,
) {
    let mut auth = manager.watch_auth();
    let mut failures: u32 = 0;

    loop {
        auth.borrow_and_update();

        if !manager.can_refresh().await {
            tracing::debug!("No refresh token on record, waiting for authentication");
            if auth.changed().await.is_err() {
                break;
            }
            failures = 0;
            continue;
        }

        let delay = if failures == 0 {
            rearm_delay(Duration::from_millis(manager.expires_in().await), lead, backoff_base)
        } else {
            calculate_backoff_delay(failures - 1, backoff_base, backoff_max)
        };
        tracing::debug!(failures, "Token refresh scheduled in {}ms", delay.as_millis());

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = auth.changed() => {
                if changed.is_err() {
                    break;
                }
                // State replaced under us, reschedule from the new expiry
                failures = 0;
                continue;
            }
        }

        match manager.refresh().await {
            // A token that is already spent would rearm at zero delay
            Ok(_) if manager.expires_in().await == 0 => {
                failures = failures.saturating_add(1);
                tracing::warn!(
                    "Refreshed token has no remaining lifetime ({} consecutive)",
                    failures
                );
            }
            Ok(_) | Err(TokenError::Superseded) => failures = 0,
            Err(e) => {
                failures = failures.saturating_add(1);
                tracing::warn!(
                    "Scheduled token refresh failed ({} consecutive): {}",
                    failures,
                    e
                );
            }
        }
    }
}

/// Delay before the next refresh of a token with `remaining` lifetime
///
/// Refreshes `lead` before expiry. Tokens living no longer than `lead` are
/// refreshed at half their remaining lifetime, but never sooner than `floor`.
/// An expired token is refreshed immediately.
fn rearm_delay(remaining: Duration, lead: Duration, floor: Duration) -> Duration {
    if remaining.is_zero() {
        Duration::ZERO
    } else if remaining > lead {
        remaining - lead
    } else {
        (remaining / 2).max(floor)
    }
}

/// Exponential backoff: base * 2^attempt, with up to 10% jitter, capped at `max`
pub fn calculate_backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let delay = base.saturating_mul(2_u32.saturating_pow(attempt)).min(max);
    let jitter = delay.mul_f64(0.1 * rand::random::<f64>());
    (delay + jitter).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::ManualClock;
    use crate::auth::manager::{ClientSettings, STORAGE_KEY};
    use crate::auth::testing::MockTransport;
    use crate::auth::types::TokenState;
    use crate::error::TransportFailure;
    use crate::store::{CredentialStore, EphemeralStore};
    use serde_json::{json, Value};

    const NOW: i64 = 1_700_000_000_000;

    fn manager_with(state: Option<TokenState>, transport: Arc<MockTransport>) -> Arc<TokenManager> {
        let store = Arc::new(EphemeralStore::new());
        if let Some(state) = state {
            store
                .set(STORAGE_KEY, &serde_json::to_string(&state).unwrap())
                .unwrap();
        }
        Arc::new(TokenManager::with_clock(
            ClientSettings::new("https://auth.example.com").unwrap(),
            store,
            transport,
            Arc::new(ManualClock::new(NOW)),
        ))
    }

    fn state_expiring_in(ms: i64) -> TokenState {
        TokenState {
            access_token: Some("T".to_string()),
            refresh_token: Some("R".to_string()),
            token_type: Some("bearer".to_string()),
            time: Some(NOW),
            expires_in: Some(ms),
            ..Default::default()
        }
    }

    fn token_response() -> Result<Value, TransportFailure> {
        Ok(json!({"access_token": "T2", "expires_in": 3600, "token_type": "bearer"}))
    }

    #[test]
    fn test_backoff_calculation() {
        let base = Duration::from_millis(1000);
        let max = Duration::from_secs(300);

        let delay0 = calculate_backoff_delay(0, base, max);
        let delay1 = calculate_backoff_delay(1, base, max);
        let delay2 = calculate_backoff_delay(2, base, max);

        assert!(delay0 >= Duration::from_millis(1000) && delay0 <= Duration::from_millis(1100));
        assert!(delay1 >= Duration::from_millis(2000) && delay1 <= Duration::from_millis(2200));
        assert!(delay2 >= Duration::from_millis(4000) && delay2 <= Duration::from_millis(4400));
    }

    #[test]
    fn test_backoff_is_capped() {
        let max = Duration::from_secs(300);
        assert_eq!(calculate_backoff_delay(40, Duration::from_secs(1), max), max);
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_refreshes_immediately_when_unauthenticated() {
        let transport = MockTransport::new();
        let manager = manager_with(None, transport.clone());
        let mut events = manager.events();

        let handle = spawn(manager, RenewalPolicy::Once);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(handle.is_finished());
        assert_eq!(transport.request_count(), 0);
        assert_eq!(events.try_recv().unwrap().name(), "error");
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_fires_at_expiry_and_is_not_rearmed() {
        let transport = MockTransport::new();
        transport.respond(token_response());
        transport.respond(token_response());
        let manager = manager_with(Some(state_expiring_in(5_000)), transport.clone());

        let handle = spawn(manager, RenewalPolicy::Once);

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(transport.request_count(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.request_count(), 1);

        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert_eq!(transport.request_count(), 1);
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_rearms_after_success() {
        let transport = MockTransport::new();
        transport.respond(token_response());
        transport.respond(token_response());
        let manager = manager_with(Some(state_expiring_in(5_000)), transport.clone());

        let handle = spawn(
            manager,
            RenewalPolicy::Continuous {
                lead: Duration::from_millis(1_000),
                backoff_base: Duration::from_secs(1),
                backoff_max: Duration::from_secs(60),
            },
        );

        tokio::time::sleep(Duration::from_millis(3_900)).await;
        assert_eq!(transport.request_count(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.request_count(), 1);

        // Manual clock stays put: next refresh is 3600s - 1s after the first
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert_eq!(transport.request_count(), 2);

        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_backs_off_after_failure() {
        let transport = MockTransport::new();
        transport.respond(Err(TransportFailure::new(Some(500), "500", Value::Null)));
        transport.respond(token_response());
        let manager = manager_with(Some(state_expiring_in(0)), transport.clone());
        let mut events = manager.events();

        let handle = spawn(
            manager,
            RenewalPolicy::Continuous {
                lead: Duration::ZERO,
                backoff_base: Duration::from_secs(10),
                backoff_max: Duration::from_secs(60),
            },
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.request_count(), 1);
        assert_eq!(events.try_recv().unwrap().name(), "failure");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.request_count(), 1);

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(transport.request_count(), 2);

        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_waits_for_authentication() {
        let transport = MockTransport::new();
        transport.respond(token_response());
        transport.respond(Ok(json!({
            "access_token": "T3",
            "refresh_token": "R3",
            "expires_in": 3600
        })));
        let manager = manager_with(None, transport.clone());

        let handle = spawn(manager.clone(), RenewalPolicy::default());

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(transport.request_count(), 0);

        // access() without a refresh token: scheduler keeps waiting
        manager.access("c", "u").await.unwrap();
        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert_eq!(transport.request_count(), 1);

        manager.clear().await;
        manager.access("c", "u").await.unwrap();
        assert_eq!(transport.request_count(), 2);

        // Token with refresh token: renewal armed 60s before expiry
        tokio::time::sleep(Duration::from_secs(3_530)).await;
        assert_eq!(transport.request_count(), 2);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(transport.request_count(), 3);

        handle.stop();
    }

    #[test]
    fn test_rearm_delay() {
        let lead = Duration::from_secs(60);
        let floor = Duration::from_secs(1);

        assert_eq!(rearm_delay(Duration::ZERO, lead, floor), Duration::ZERO);
        assert_eq!(rearm_delay(Duration::from_secs(3600), lead, floor), Duration::from_secs(3540));
        assert_eq!(rearm_delay(Duration::from_secs(60), lead, floor), Duration::from_secs(30));
        assert_eq!(rearm_delay(Duration::from_secs(30), lead, floor), Duration::from_secs(15));
        assert_eq!(rearm_delay(Duration::from_millis(500), lead, floor), floor);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_paces_tokens_shorter_than_lead() {
        let transport = MockTransport::new();
        for _ in 0..500 {
            transport.respond(Ok(json!({"access_token": "T2", "expires_in": 30})));
        }
        let manager = manager_with(Some(state_expiring_in(30_000)), transport.clone());

        let handle = spawn(manager, RenewalPolicy::default());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.request_count(), 0);

        // Half of the 30s lifetime
        tokio::time::sleep(Duration::from_millis(14_900)).await;
        assert_eq!(transport.request_count(), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.request_count(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.request_count(), 5);

        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_backs_off_when_refresh_yields_no_lifetime() {
        let transport = MockTransport::new();
        for _ in 0..50 {
            transport.respond(Ok(json!({"access_token": "T2", "token_type": "bearer"})));
        }
        let manager = manager_with(Some(state_expiring_in(0)), transport.clone());

        let handle = spawn(manager, RenewalPolicy::default());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.request_count(), 1);

        // Retries at ~1s, ~3s, ~7s, then not before 15s
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.request_count(), 4);

        handle.stop();
    }
}
