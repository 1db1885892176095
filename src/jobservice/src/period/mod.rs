//! Periodic jobs: cron policies, their store and the enqueuer turning them into
//! scheduled executions.

pub mod enqueuer;
pub mod policy;
pub mod scheduler;
pub mod store;

pub use enqueuer::PeriodicEnqueuer;
pub use policy::{
    CronType, Notification, NotificationEvent, Policy, DAILY_MIDNIGHT_CRON, WELL_KNOWN_JOBS,
};
pub use scheduler::Scheduler;
pub use store::PolicyStore;
