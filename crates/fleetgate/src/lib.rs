//! # Fleetgate
//!
//! A reverse-proxy orchestrator for fleets of homogeneous inference backends,
//! built with Rust and Actix Web. Fleetgate accepts client inference requests,
//! selects a backend hosting the requested model, enforces concurrency and
//! health policy, forwards the request (streaming included), retries across
//! backends on failure, and exposes administrative and observability surfaces.
//!
//! ## Core Subsystems
//!
//! - **Fleet registry** — server records, model index, `:latest` resolution
//! - **Circuit breakers** — two-level (server and server:model) state machines
//!   with adaptive thresholds and error classification
//! - **Health checking** — periodic fan-out probes for liveness, model lists,
//!   versions and hardware snapshots
//! - **Recovery coordination** — serialized active probes for half-open breakers
//! - **Load balancing** — score-based ranking from rolling per-(server,model)
//!   metrics, with round-robin and least-connections variants
//! - **Request queue** — bounded priority queue with aging and timeouts
//! - **Orchestrator** — failover-first dispatch with two-phase retry across
//!   backends and bounded same-server retries
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌──────────────────┐
//! │   Client    │──▶│    Fleetgate     │──▶│   Inference      │
//! │             │   │                  │   │   Backends       │
//! └─────────────┘   │  ┌───────────────┤   └──────────────────┘
//!                   │  │ Request Queue ││
//!                   │  ├───────────────┤│
//!                   │  │ Load Balancer ││
//!                   │  ├───────────────┤│
//!                   │  │ Circuit Break ││
//!                   │  ├───────────────┤│
//!                   │  │ Health Checks ││
//!                   │  └───────────────┘│
//!                   └──────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - **[`config`]** - Configuration loading, validation, and periodic reload
//! - **[`models`]** - Data models, error taxonomy, and typed settings
//! - **[`services`]** - The routing and reliability engine
//! - **[`routes`]** - HTTP route definitions and handlers
//! - **[`middleware`]** - API key guard and security headers
//! - **[`utils`]** - Model-name helpers and key formatting
//! - **[`logs`]** - Logging configuration and structured output
//!
//! ## Environment Variables
//!
//! - `FLEETGATE_CONFIG_PATH`: Configuration file path (default: `./config.json`)
//! - `FLEETGATE_HOST`: Server bind address (overrides config `host`)
//! - `FLEETGATE_PORT`: Server port (overrides config `port`)
//! - `NO_COLOR`: Disable colored log output

pub mod config;
pub mod logs;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod utils;
