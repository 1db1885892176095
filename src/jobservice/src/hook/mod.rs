//! Web hook delivery: the HTTP client and the agent keeping the durable retry set.

pub mod agent;
pub mod client;
pub mod event;

pub use agent::Agent;
pub use client::HookClient;
pub use event::Event;
