pub mod buffer;
pub mod commit;
pub mod config;
pub mod deltamain;
pub mod engine;
pub mod error;
pub mod index;
pub mod lifetime;
pub mod log;
pub mod table;

pub mod prelude {
    pub use crate::commit::{CommitManager, SnapshotDescriptor};
    pub use crate::config::StorageConfig;
    pub use crate::deltamain::PageLayout;
    pub use crate::engine::Storage;
    pub use crate::error::*;
    pub use crate::table::scan::*;
    pub use crate::table::*;
    pub use deltastore_catalog::{Field, FieldType, Schema, TableId, TupleBuilder, Value};
}
