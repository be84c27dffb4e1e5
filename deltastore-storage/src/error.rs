use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid snapshot")]
    InvalidSnapshot,
    #[error("invalid table")]
    InvalidTable,
    #[error("table not found")]
    TableNotFound,
    #[error("table already exists")]
    TableAlreadyExists,
    #[error("write conflict")]
    Conflict,
    #[error("insufficient memory({0})")]
    InsufficientMemory(usize),
    #[error("hash table full")]
    HashTableFull,
    #[error("server overload")]
    ServerOverload,
    #[error("invalid format")]
    InvalidFormat,
}

impl From<deltastore_catalog::Error> for Error {
    #[inline]
    fn from(src: deltastore_catalog::Error) -> Self {
        match src {
            deltastore_catalog::Error::InvalidFormat => Error::InvalidFormat,
            _ => Error::InvalidArgument,
        }
    }
}
