use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures_util::future::LocalBoxFuture;
use governor::{DefaultKeyedRateLimiter, Quota};
use std::future::{ready, Ready};
use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroU32;
use std::rc::Rc;
use std::sync::Arc;

/// Tracked clients above which idle entries are dropped.
const PRUNE_THRESHOLD: usize = 10_000;

/// Per-client-IP request limit, shared by every worker
#[derive(Clone)]
pub struct RateLimiter {
    limiter: Arc<DefaultKeyedRateLimiter<IpAddr>>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        let per_minute = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: Arc::new(DefaultKeyedRateLimiter::keyed(Quota::per_minute(per_minute))),
        }
    }
}

/// Forgets clients whose quota has fully replenished once the table grows
/// past `threshold`.
fn prune(limiter: &DefaultKeyedRateLimiter<IpAddr>, threshold: usize) {
    if limiter.len() > threshold {
        limiter.retain_recent();
        limiter.shrink_to_fit();
        tracing::debug!(remaining = limiter.len(), "Pruned rate limiter state");
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimiter
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RateLimiterMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RateLimiterMiddleware {
            service: Rc::new(service),
            limiter: self.limiter.clone(),
        }))
    }
}

pub struct RateLimiterMiddleware<S> {
    service: Rc<S>,
    limiter: Arc<DefaultKeyedRateLimiter<IpAddr>>,
}

impl<S, B> Service<ServiceRequest> for RateLimiterMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let client = req
            .peer_addr()
            .map(|addr| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let decision = self.limiter.check_key(&client);
        prune(&self.limiter, PRUNE_THRESHOLD);

        match decision {
            Ok(_) => {
                let fut = self.service.call(req);
                Box::pin(async move { fut.await })
            }
            Err(_) => {
                tracing::warn!(client = %client, "Rate limit exceeded for path: {}", req.path());
                Box::pin(async {
                    Err(actix_web::error::ErrorTooManyRequests(
                        "Rate limit exceeded. Please try again later.",
                    ))
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_idle_clients_are_pruned_past_threshold() {
        let limiter = RateLimiter::new(60);
        for n in 0..5u16 {
            let client = IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, n));
            assert!(limiter.limiter.check_key(&client).is_ok());
        }
        assert_eq!(limiter.limiter.len(), 5);

        // Below the threshold nothing is touched.
        prune(&limiter.limiter, 5);
        assert_eq!(limiter.limiter.len(), 5);

        // Each client spent one of 60 cells, so all are still recent.
        prune(&limiter.limiter, 2);
        assert_eq!(limiter.limiter.len(), 5);
    }

    #[test]
    fn test_replenished_clients_are_forgotten() {
        let quota = Quota::per_second(NonZeroU32::MIN).allow_burst(NonZeroU32::MIN);
        let limiter = DefaultKeyedRateLimiter::<IpAddr>::keyed(quota);
        assert!(limiter.check_key(&IpAddr::V4(Ipv4Addr::LOCALHOST)).is_ok());
        assert_eq!(limiter.len(), 1);

        std::thread::sleep(std::time::Duration::from_millis(1100));
        prune(&limiter, 0);
        assert!(limiter.is_empty());
    }
}
