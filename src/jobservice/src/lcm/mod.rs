//! Lifecycle controller: tracker factory plus the status retry loop.

mod controller;

pub use controller::Controller;
