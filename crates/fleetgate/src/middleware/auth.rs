//! Shared-secret API key guard.
//!
//! Authentication is deliberately minimal: keys are compared against a
//! configurable header. The inference surface (`/api/*`) is guarded by
//! `security.apiKeys`, the admin surface (`/admin/*`) by
//! `security.adminApiKeys`; an empty key list leaves the corresponding
//! surface open. Health and metrics endpoints are never guarded.

use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::{Error, HttpResponse};
use futures_util::future::{ready, LocalBoxFuture, Ready};
use serde_json::json;
use std::rc::Rc;
use std::sync::Arc;

/// Key material and header name, shared by all workers.
#[derive(Debug, Clone)]
pub struct ApiKeyConfig {
    pub header: String,
    pub api_keys: Vec<String>,
    pub admin_api_keys: Vec<String>,
}

impl ApiKeyConfig {
    pub fn from_settings(security: &crate::models::settings::SecuritySettings) -> Self {
        Self {
            header: security.api_key_header.clone(),
            api_keys: security.api_keys.clone(),
            admin_api_keys: security.admin_api_keys.clone(),
        }
    }
}

/// Transform factory for the API key guard.
#[derive(Clone)]
pub struct ApiKeyGuard {
    config: Arc<ApiKeyConfig>,
}

impl ApiKeyGuard {
    pub fn new(config: ApiKeyConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for ApiKeyGuard
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = ApiKeyGuardMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ApiKeyGuardMiddleware {
            service: Rc::new(service),
            config: Arc::clone(&self.config),
        }))
    }
}

pub struct ApiKeyGuardMiddleware<S> {
    service: Rc<S>,
    config: Arc<ApiKeyConfig>,
}

impl<S> ApiKeyGuardMiddleware<S> {
    fn required_keys<'a>(config: &'a ApiKeyConfig, path: &str) -> Option<&'a [String]> {
        if path.starts_with("/admin") {
            if config.admin_api_keys.is_empty() {
                None
            } else {
                Some(&config.admin_api_keys)
            }
        } else if path.starts_with("/api") {
            if config.api_keys.is_empty() {
                None
            } else {
                Some(&config.api_keys)
            }
        } else {
            None
        }
    }
}

impl<S, B> Service<ServiceRequest> for ApiKeyGuardMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let config = Arc::clone(&self.config);
        let service = Rc::clone(&self.service);

        let authorized = match Self::required_keys(&config, req.path()) {
            None => true,
            Some(keys) => req
                .headers()
                .get(config.header.as_str())
                .and_then(|value| value.to_str().ok())
                .map(|presented| keys.iter().any(|key| key == presented))
                .unwrap_or(false),
        };

        if !authorized {
            let response = HttpResponse::Unauthorized()
                .json(json!({
                    "error": "missing or invalid API key",
                    "type": "unauthorized",
                }))
                .map_into_right_body();
            let (request, _) = req.into_parts();
            return Box::pin(async move { Ok(ServiceResponse::new(request, response)) });
        }

        Box::pin(async move {
            let response = service.call(req).await?;
            Ok(response.map_into_left_body())
        })
    }
}
