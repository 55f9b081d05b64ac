//! Standard security response headers.

use actix_web::middleware::DefaultHeaders;

/// Security headers applied to every response.
pub fn security_headers() -> DefaultHeaders {
    DefaultHeaders::new()
        .add(("X-Content-Type-Options", "nosniff"))
        .add(("X-Frame-Options", "DENY"))
        .add(("Referrer-Policy", "no-referrer"))
        .add(("Cache-Control", "no-store"))
}

/// CORS allow-origin header from `security.corsOrigins`. Multiple origins
/// collapse to the first entry; `*` stays a wildcard.
pub fn cors_headers(origins: &[String]) -> DefaultHeaders {
    let origin = origins.first().cloned().unwrap_or_else(|| "*".to_string());
    DefaultHeaders::new()
        .add(("Access-Control-Allow-Origin", origin))
        .add(("Access-Control-Allow-Headers", "content-type, x-api-key, x-fleetgate-debug"))
        .add(("Access-Control-Allow-Methods", "GET, POST, PUT, DELETE, OPTIONS"))
}
