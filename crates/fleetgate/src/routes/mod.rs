//! HTTP route handlers and endpoint definitions for the orchestrator.
//!
//! # Module Organization
//!
//! - [`health`] - Health check endpoints for monitoring and Kubernetes probes
//! - [`proxy`] - The inference surface (generate/chat/embeddings/tags) with
//!   streaming pass-through
//! - [`admin`] - Administrative REST surface (servers, breakers, bans,
//!   config, queue, history)
//! - [`metrics`] - Prometheus text exposition
//!
//! Routes are registered through per-module `configure_*` functions so the
//! composition root stays a flat list of `App::configure` calls.

pub mod admin;
pub mod health;
pub mod metrics;
pub mod proxy;
