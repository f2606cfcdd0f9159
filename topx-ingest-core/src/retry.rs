//! Bounded exponential backoff around the remote catalog.
//!
//! [`Retrying`] implements [`RemoteCatalog`] for any inner implementation, so
//! the synchroniser keeps a plain, retry-free call contract.
//!
//! A transient error does not tell whether the server applied the request.
//! Calls that change repository state therefore check for the earlier
//! attempt's effect before sending again. Uploads are not wrapped: a lost
//! upload aborts the run and the next run skips every record folder the
//! repository already registered.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::contract::{is_permanent, ContainerRef, NewContainer, RemoteCatalog, RemoteEntity};
use crate::error::{BoxError, IngestError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries once and never sleeps.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.max_attempts == 0 {
            return Err(IngestError::InvalidConfiguration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(IngestError::InvalidConfiguration(format!(
                "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }
        Ok(())
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }

    /// Runs `call` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, BoxError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        self.run_guarded(operation, call, || std::future::ready(None))
            .await
    }

    /// Like [`RetryPolicy::run`], but before every repeat asks `applied` whether
    /// the failed attempt took effect anyway; a `Some` ends the loop with that value.
    pub async fn run_guarded<T, F, Fut, G, GFut>(
        &self,
        operation: &str,
        mut call: F,
        mut applied: G,
    ) -> Result<T, BoxError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
        G: FnMut() -> GFut,
        GFut: Future<Output = Option<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation, attempt, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if is_permanent(&e) || attempt >= max_attempts => return Err(e),
                Err(e) => {
                    let delay = self.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    if let Some(value) = applied().await {
                        info!(operation, attempt, "Failed attempt had been applied, not resending");
                        return Ok(value);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// Decorator adding [`RetryPolicy`] to a catalog.
pub struct Retrying<I> {
    inner: I,
    policy: RetryPolicy,
}

impl<I> Retrying<I> {
    pub fn new(inner: I, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<I: RemoteCatalog> RemoteCatalog for Retrying<I> {
    async fn find_by_identifier(
        &self,
        scheme: &str,
        value: &str,
    ) -> Result<Vec<RemoteEntity>, BoxError> {
        self.policy
            .run("find_by_identifier", || {
                self.inner.find_by_identifier(scheme, value)
            })
            .await
    }

    async fn fetch_container(&self, reference: &ContainerRef) -> Result<RemoteEntity, BoxError> {
        self.policy
            .run("fetch_container", || self.inner.fetch_container(reference))
            .await
    }

    async fn create_container(&self, request: NewContainer) -> Result<RemoteEntity, BoxError> {
        let inner = &self.inner;
        let reference = &request.reference;
        self.policy
            .run_guarded(
                "create_container",
                || inner.create_container(request.clone()),
                move || async move { inner.fetch_container(reference).await.ok() },
            )
            .await
    }

    async fn attach_identifier(
        &self,
        entity: &RemoteEntity,
        scheme: &str,
        value: &str,
    ) -> Result<(), BoxError> {
        let inner = &self.inner;
        self.policy
            .run_guarded(
                "attach_identifier",
                || inner.attach_identifier(entity, scheme, value),
                move || async move {
                    match inner.find_by_identifier(scheme, value).await {
                        Ok(found) if found.iter().any(|e| e.reference == entity.reference) => {
                            Some(())
                        }
                        _ => None,
                    }
                },
            )
            .await
    }

    async fn attach_metadata(
        &self,
        entity: &RemoteEntity,
        schema_uri: &str,
        document: Vec<u8>,
    ) -> Result<RemoteEntity, BoxError> {
        self.policy
            .run("attach_metadata", || {
                self.inner
                    .attach_metadata(entity, schema_uri, document.clone())
            })
            .await
    }

    fn reference(&self, entity: &RemoteEntity) -> ContainerRef {
        self.inner.reference(entity)
    }
}
