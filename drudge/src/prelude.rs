//! The purpose of this module is to alleviate the need to import many of the `[drudge]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use drudge::prelude::*;
//! ```
pub use crate::backend::Backend;
pub use crate::backoff::{Backoff, Jitter};
pub use crate::job::{
    ExecutionError, ExecutionResult, HookError, Job, JobFailure, JobId, JobStatus,
};
pub use crate::lifecycle::ExitReason;
pub use crate::rate_limit::{InMemoryCounterStore, RateLimit, RateLimiter};
pub use crate::registry::JobRegistry;
pub use crate::worker::{Worker, WorkerConfig, WorkerReport};
pub use crate::DrudgeError;
pub use async_trait::async_trait;
pub use chrono::TimeDelta;
