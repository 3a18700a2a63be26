use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("vote count {0} is too large to store")]
    CountOverflow(u64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handler error: {0}")]
    Handler(String),
}

pub type Result<T> = std::result::Result<T, Error>;
