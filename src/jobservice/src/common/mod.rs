//! Building blocks shared by every component.

pub mod list;
pub mod rds;
pub mod utils;

pub use list::SyncList;
pub use utils::Parameters;
