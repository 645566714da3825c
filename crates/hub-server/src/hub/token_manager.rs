//! TokenManager: validates tokens via an injected `TokenVerifier`,
//! schedules a refresh `REFRESH_LEAD` before expiry, retries on transient
//! failure, and emits `TokenRefreshed`/`TokenExpired` events for the owning
//! connection handler to act on. One scheduled task per connection, since
//! the hub already knows each connection's exact expiry and a polling
//! sweep over every token would be wasted work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::TokenVerifier;
use crate::hub::events::HubEvent;

const RETRY_BACKOFFS: [StdDuration; 2] = [StdDuration::from_secs(1), StdDuration::from_secs(3)];

#[derive(Clone)]
pub struct TokenManager {
    verifier: Arc<dyn TokenVerifier>,
    events: mpsc::UnboundedSender<HubEvent>,
    schedules: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
    refresh_lead: chrono::Duration,
}

impl TokenManager {
    #[must_use]
    pub fn new(verifier: Arc<dyn TokenVerifier>, events: mpsc::UnboundedSender<HubEvent>, refresh_lead: StdDuration) -> Self {
        Self {
            verifier,
            events,
            schedules: Arc::new(RwLock::new(HashMap::new())),
            refresh_lead: chrono::Duration::from_std(refresh_lead).unwrap_or(chrono::Duration::seconds(60)),
        }
    }

    /// Registers (or replaces) the refresh schedule for `connection_id`.
    ///
    /// Returns a boxed future rather than being declared `async fn`: `run_schedule`
    /// calls back into this method on successful refresh, and an `async fn` here
    /// would make the compiler try to compute an infinitely-sized recursive
    /// future type. Boxing breaks the cycle without changing behavior.
    pub fn register_token(
        &self,
        connection_id: Uuid,
        expires_at: DateTime<Utc>,
        refresh_token: Option<String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let cancel = CancellationToken::new();
            {
                let mut schedules = self.schedules.write().await;
                if let Some(prior) = schedules.insert(connection_id, cancel.clone()) {
                    prior.cancel();
                }
            }

            let manager = self.clone();
            tokio::spawn(async move {
                manager.run_schedule(connection_id, expires_at, refresh_token, cancel).await;
            });
        })
    }

    pub async fn unregister(&self, connection_id: Uuid) {
        if let Some(token) = self.schedules.write().await.remove(&connection_id) {
            token.cancel();
        }
    }

    async fn run_schedule(
        &self,
        connection_id: Uuid,
        expires_at: DateTime<Utc>,
        refresh_token: Option<String>,
        cancel: CancellationToken,
    ) {
        let fire_at = expires_at - self.refresh_lead;
        let wait = (fire_at - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);

        tokio::select! {
            () = cancel.cancelled() => return,
            () = sleep(wait) => {}
        }

        let Some(refresh_token) = refresh_token else {
            warn!(%connection_id, "token expiring with no refresh token, marking expired");
            let _ = self.events.send(HubEvent::TokenExpired { connection_id });
            self.schedules.write().await.remove(&connection_id);
            return;
        };

        for (attempt, backoff) in std::iter::once(StdDuration::ZERO).chain(RETRY_BACKOFFS).enumerate() {
            if attempt > 0 {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = sleep(backoff) => {}
                }
            }

            match self.verifier.refresh(&refresh_token).await {
                Ok((new_token, verified)) => {
                    info!(%connection_id, attempt, "token refreshed");
                    let _ = self.events.send(HubEvent::TokenRefreshed {
                        connection_id,
                        new_token,
                        new_expiry: verified.expires_at,
                    });
                    self.register_token(connection_id, verified.expires_at, verified.refresh_token).await;
                    return;
                }
                Err(err) => {
                    warn!(%connection_id, attempt, error = %err, "token refresh attempt failed");
                }
            }
        }

        warn!(%connection_id, "token refresh exhausted retries, expiring connection");
        let _ = self.events.send(HubEvent::TokenExpired { connection_id });
        self.schedules.write().await.remove(&connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::VerifiedToken;
    use async_trait::async_trait;
    use hub_shared::HubError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysFails;
    #[async_trait]
    impl TokenVerifier for AlwaysFails {
        async fn verify(&self, _token: &str) -> Result<VerifiedToken, HubError> {
            Err(HubError::Unauthorized)
        }
        async fn refresh(&self, _refresh_token: &str) -> Result<(String, VerifiedToken), HubError> {
            Err(HubError::InvalidRefreshToken)
        }
    }

    struct CountingSucceeds(AtomicUsize);
    #[async_trait]
    impl TokenVerifier for CountingSucceeds {
        async fn verify(&self, _token: &str) -> Result<VerifiedToken, HubError> {
            Err(HubError::Unauthorized)
        }
        async fn refresh(&self, _refresh_token: &str) -> Result<(String, VerifiedToken), HubError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok((
                "new-token".to_string(),
                VerifiedToken {
                    principal_id: Uuid::new_v4(),
                    expires_at: Utc::now() + chrono::Duration::hours(1),
                    refresh_token: Some("refresh-2".to_string()),
                },
            ))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expires_connection_when_no_refresh_token() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = TokenManager::new(Arc::new(AlwaysFails), tx, StdDuration::from_millis(10));
        let connection_id = Uuid::new_v4();
        manager
            .register_token(connection_id, Utc::now() + chrono::Duration::milliseconds(15), None)
            .await;

        tokio::time::advance(StdDuration::from_secs(1)).await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, HubEvent::TokenExpired { connection_id: c } if c == connection_id));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_success_emits_token_refreshed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = TokenManager::new(Arc::new(CountingSucceeds(AtomicUsize::new(0))), tx, StdDuration::from_millis(10));
        let connection_id = Uuid::new_v4();
        manager
            .register_token(
                connection_id,
                Utc::now() + chrono::Duration::milliseconds(15),
                Some("refresh-1".to_string()),
            )
            .await;

        tokio::time::advance(StdDuration::from_secs(1)).await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, HubEvent::TokenRefreshed { connection_id: c, .. } if c == connection_id));
    }

    #[tokio::test]
    async fn duplicate_registration_cancels_prior_schedule() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let manager = TokenManager::new(Arc::new(AlwaysFails), tx, StdDuration::from_secs(60));
        let connection_id = Uuid::new_v4();
        manager
            .register_token(connection_id, Utc::now() + chrono::Duration::hours(1), None)
            .await;
        let first_token = manager.schedules.read().await.get(&connection_id).cloned().unwrap();
        manager
            .register_token(connection_id, Utc::now() + chrono::Duration::hours(2), None)
            .await;
        assert!(first_token.is_cancelled());
    }
}
