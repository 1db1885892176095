//! Wraps registered handlers with lifecycle tracking.

mod redis_job;

pub use redis_job::{RedisJobRunner, MAX_PANIC_STACK_BYTES};
