//! Session authentication.
//!
//! Accepts the session cookie or an `Authorization: Bearer` header, verifies
//! the signed token and stores its [`Claims`] in the request extensions.
//! Handlers pick the caller up with the [`SessionUser`] extractor.

use crate::auth::{Claims, SessionKeys, SESSION_COOKIE};
use crate::errors::CrmError;
use actix_web::{
    dev::{forward_ready, Payload, Service, ServiceRequest, ServiceResponse, Transform},
    Error, FromRequest, HttpMessage, HttpRequest,
};
use futures_util::future::LocalBoxFuture;
use std::future::{ready, Ready};
use std::rc::Rc;
use uuid::Uuid;

const PUBLIC_PATHS: &[&str] = &[
    "/health",
    "/metrics",
    "/auth/sign-up",
    "/auth/sign-in",
    "/auth/sign-out",
];

pub struct SessionAuth {
    keys: SessionKeys,
}

impl SessionAuth {
    pub fn new(keys: SessionKeys) -> Self {
        Self { keys }
    }
}

impl<S, B> Transform<S, ServiceRequest> for SessionAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = SessionAuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(SessionAuthMiddleware {
            service: Rc::new(service),
            keys: self.keys.clone(),
        }))
    }
}

pub struct SessionAuthMiddleware<S> {
    service: Rc<S>,
    keys: SessionKeys,
}

fn session_token(req: &ServiceRequest) -> Option<String> {
    if let Some(cookie) = req.cookie(SESSION_COOKIE) {
        return Some(cookie.value().to_string());
    }

    req.headers()
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
}

impl<S, B> Service<ServiceRequest> for SessionAuthMiddleware<S>
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
        if PUBLIC_PATHS.contains(&req.path()) {
            let fut = self.service.call(req);
            return Box::pin(async move { fut.await });
        }

        let claims = match session_token(&req) {
            Some(token) => self.keys.verify(&token),
            None => Err(CrmError::Unauthorized),
        };

        match claims {
            Ok(claims) => {
                req.extensions_mut().insert(claims);
                let fut = self.service.call(req);
                Box::pin(async move { fut.await })
            }
            Err(err) => {
                tracing::debug!(path = %req.path(), "Request without valid session");
                Box::pin(async move { Err(err.into()) })
            }
        }
    }
}

/// The authenticated caller's id, taken from verified session claims
#[derive(Debug, Clone, Copy)]
pub struct SessionUser(pub Uuid);

impl FromRequest for SessionUser {
    type Error = CrmError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<Claims>()
                .map(|claims| SessionUser(claims.sub))
                .ok_or(CrmError::Unauthorized),
        )
    }
}
