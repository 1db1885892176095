use async_trait::async_trait;

/// Which state a migrator upgrades.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Versions this migrator accepts as input, e.g. `<1.8.0`
    pub from: String,
    /// Version written once this migrator succeeded
    pub to: String,
    /// The objects it touches
    pub object_ref: String,
}

/// One step of the migration chain. Steps must be safe to run twice.
#[async_trait]
pub trait Migrator: Send + Sync {
    fn metadata(&self) -> Metadata;

    async fn migrate(&self) -> crate::error::Result<()>;
}
