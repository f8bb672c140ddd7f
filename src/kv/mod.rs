//! Shared ephemeral state (§3 "KV-store state", §4.C/D/B). This stack
//! carries no Redis-equivalent dependency, so each piece of state that
//! would otherwise live in a KV store is realized here as a dedicated SQL
//! table mutated only through single atomic statements — never an
//! application-level read-modify-write. See DESIGN.md's resolution of
//! the "shared KV store" question.

pub mod blueprint_cache;
pub mod circuit_breaker;
pub mod rate_limiter;

pub use blueprint_cache::{BlueprintMapper, CatalogLookup};
pub use circuit_breaker::{BreakerState, CircuitBreaker, FailureKind};
pub use rate_limiter::AdaptiveRateLimiter;
