//! Limiter traits shared by the local and distributed implementations.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use super::reservation::Reservation;
use crate::error::Result;

/// A token budget for one (quota, interval) pair.
///
/// Implementations must be safe to call concurrently. An error is returned
/// only for infrastructure failures; an exhausted budget is expressed
/// through the returned [`Reservation`]. Dropping the future aborts the
/// attempt.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Reserve a single token.
    async fn reserve(&self) -> Result<Reservation>;
}

/// A limiter keyed by event ID.
///
/// Every distinct event ID has its own budget; the same ID always maps to
/// the same budget.
#[async_trait]
pub trait EventLimiter: Send + Sync {
    /// Reserve a single token from the budget of `event_id`.
    async fn reserve_event(&self, event_id: &str) -> Result<Reservation>;
}

#[async_trait]
impl<T: Limiter + ?Sized> Limiter for Arc<T> {
    async fn reserve(&self) -> Result<Reservation> {
        (**self).reserve().await
    }
}

#[async_trait]
impl<T: EventLimiter + ?Sized> EventLimiter for Arc<T> {
    async fn reserve_event(&self, event_id: &str) -> Result<Reservation> {
        (**self).reserve_event(event_id).await
    }
}

/// Adapts a closure into a [`Limiter`].
pub struct LimiterFn<F>(pub F);

#[async_trait]
impl<F> Limiter for LimiterFn<F>
where
    F: Fn() -> BoxFuture<'static, Result<Reservation>> + Send + Sync,
{
    async fn reserve(&self) -> Result<Reservation> {
        (self.0)().await
    }
}

/// Adapts a closure into an [`EventLimiter`].
pub struct EventLimiterFn<F>(pub F);

#[async_trait]
impl<F> EventLimiter for EventLimiterFn<F>
where
    F: Fn(String) -> BoxFuture<'static, Result<Reservation>> + Send + Sync,
{
    async fn reserve_event(&self, event_id: &str) -> Result<Reservation> {
        (self.0)(event_id.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RatemuxError;
    use futures::FutureExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_limiter_fn() {
        let limiter = LimiterFn(|| async { Ok::<_, RatemuxError>(Reservation::admit(7)) }.boxed());
        let res = limiter.reserve().await.unwrap();
        assert!(res.is_ok());
        assert_eq!(res.tokens(), 7);
    }

    #[tokio::test]
    async fn test_event_limiter_fn_sees_event_id() {
        let limiter = EventLimiterFn(|event_id: String| {
            async move {
                let res = if event_id == "blocked" {
                    Reservation::reject(Duration::from_secs(1))
                } else {
                    Reservation::admit(1)
                };
                Ok::<_, RatemuxError>(res)
            }
            .boxed()
        });

        assert!(limiter.reserve_event("alice").await.unwrap().is_ok());
        assert!(!limiter.reserve_event("blocked").await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_errors_pass_through_arc() {
        let limiter: Arc<dyn EventLimiter> = Arc::new(EventLimiterFn(|_: String| {
            async { Err::<Reservation, _>(RatemuxError::Store("connection refused".into())) }.boxed()
        }));

        let err = limiter.reserve_event("x").await.unwrap_err();
        assert!(err.is_infrastructure());
    }
}
