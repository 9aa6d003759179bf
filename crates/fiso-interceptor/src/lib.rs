//! Interceptor runtime: sandbox lifecycle, wrapper semantics (metrics +
//! fail-open/fail-closed), the ordered chain, and the per-target registry.

pub mod chain;
pub mod registry;
pub mod sandbox;

pub use chain::{Chain, SandboxedInterceptor, WrappedInterceptor};
pub use registry::InterceptorRegistry;
pub use sandbox::{NativeSandbox, Sandbox};
