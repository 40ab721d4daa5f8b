use crate::application::remote::StoreError;

pub fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::PoolTimedOut => StoreError::Timeout,
        sqlx::Error::Io(io) => StoreError::Transport(io.to_string()),
        sqlx::Error::Tls(tls) => StoreError::Transport(tls.to_string()),
        sqlx::Error::PoolClosed => StoreError::Transport("connection pool closed".to_string()),
        sqlx::Error::ColumnDecode { index, source } => {
            StoreError::Decode(format!("column {index}: {source}"))
        }
        sqlx::Error::Decode(source) => StoreError::Decode(source.to_string()),
        sqlx::Error::Database(db) if db.message().contains("duplicate key") => {
            StoreError::Duplicate {
                constraint: db.constraint().unwrap_or("unknown").to_string(),
            }
        }
        sqlx::Error::Database(db)
            if db.message().contains("violates foreign key constraint")
                || db.message().contains("invalid input syntax") =>
        {
            StoreError::InvalidInput {
                message: db.message().to_string(),
            }
        }
        sqlx::Error::Database(db) if db.message().contains("violates") => StoreError::Integrity {
            message: db.message().to_string(),
        },
        sqlx::Error::Database(db)
            if db
                .message()
                .contains("canceling statement due to user request") =>
        {
            StoreError::Timeout
        }
        sqlx::Error::Database(db) => StoreError::Persistence {
            message: db.message().to_string(),
            code: db.code().map(|code| code.into_owned()),
        },
        other => StoreError::from_persistence(other),
    }
}
