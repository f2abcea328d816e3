pub mod models;
pub mod store;

pub mod queries {
    pub mod usage;
}

pub use store::PgUsageStore;

/// Schema migrations embedded from `crates/db/migrations`.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();
