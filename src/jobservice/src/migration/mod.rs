//! Schema migration of persisted Redis state.

mod manager;
mod migrator;
mod v181;

pub use manager::{parse_version, MigrationManager, Outcome, TARGET_SCHEMA_VERSION};
pub use migrator::{Metadata, Migrator};
pub use v181::PolicyMigratorV181;
