//! Redis plumbing: key layout, Lua scripts, the shared connection and helpers.

pub mod keys;
pub mod pool;
pub mod scripts;
pub mod utils;

pub use keys::KeySpace;
pub use pool::RedisPool;
pub use utils::{
    acquire_lock, hget_all, hm_get, hm_set, hscan_all, release_lock, scan_keys, zpop_min,
};
