pub mod error;
mod models;
pub mod registration_store;

pub use error::{Result, StorageError};
pub use registration_store::SqliteRegistrationStore;

use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::str::FromStr;

/// Opens (creating if missing) the registration database and applies
/// migrations.
pub async fn init_registration_db(db_path: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(db_path)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePool::connect_with(options).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    tracing::info!(db_path, "registration DB initialized");
    Ok(pool)
}
