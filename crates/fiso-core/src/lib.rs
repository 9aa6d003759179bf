//! Shared runtime machinery for fiso's two data planes, Link and Flow:
//! the per-target resilience stack (circuit breaker, rate limiter, retry
//! executor, resolver, credential provider), the target model, and the
//! external interfaces both planes compose against.

pub mod breaker;
pub mod clock;
pub mod contracts;
pub mod credentials;
pub mod error;
pub mod events;
pub mod limiter;
pub mod resolver;
pub mod retry;
pub mod target;

pub use breaker::{BreakerConfig, BreakerError, BreakerRegistry, CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{Classified, FisoError, ProcessingStage};
pub use limiter::RateLimiter;
pub use resolver::{CachingResolver, Resolver, SharedResolver, StaticResolver};
pub use retry::{RetryConfig, RetryError};
pub use target::{Protocol, Target, TargetStore};
