//! # apiguard-core - Rate Limiting and Retry for Remote APIs
//!
//! Protects callers of a rate-limited, failure-prone backend:
//! - Sliding-window admission control with a FIFO wait queue
//! - Backoff curves (fixed, linear, exponential, custom) with jitter
//! - Circuit breaker with lazy half-open recovery
//! - Retry policy and executor with metrics
//!
//! ## Architecture
//!
//! Components are plain structs shared through `Arc`; nothing is global:
//! ```text
//!                    ┌───────────────────────────────────┐
//!   caller ────────▶ │               Guard               │
//!                    │  ┌─────────────┐  ┌────────────┐  │
//!                    │  │ RateLimiter │─▶│  Retry     │  │ ──▶ backend
//!                    │  │ window+queue│  │  Executor  │  │
//!                    │  └─────────────┘  └─────┬──────┘  │
//!                    │                   ┌─────▼──────┐  │
//!                    │                   │RetryPolicy │  │
//!                    │                   │ backoff,   │  │
//!                    │                   │ breaker,   │  │
//!                    │                   │ metrics    │  │
//!                    │                   └────────────┘  │
//!                    └───────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod guard;
pub mod types;

// Internal utilities
pub mod observability;

pub use guard::{Guard, RateLimiter, RequestFn, RetryExecutor, RetryPolicy, RetryableRequest};
pub use types::{Config, Error, Failure, FailureCategory, Result};
