pub mod schema;
pub mod tuple;
pub mod value;

pub use schema::{Field, FieldAttributes, FieldType, Schema};
pub use tuple::{TupleBuilder, TupleReader};
pub use value::Value;

use thiserror::Error;

/// Identifier of a user table.
pub type TableId = u64;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("schema must contain at least one field")]
    EmptySchema,
    #[error("field index out of bound")]
    FieldIndexOutOfBound,
    #[error("value count mismatch")]
    ValueCountMismatch,
    #[error("value type mismatch")]
    ValueTypeMismatch,
    #[error("invalid tuple format")]
    InvalidFormat,
}
