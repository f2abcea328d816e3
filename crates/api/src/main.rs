use std::net::SocketAddr;
use std::sync::Arc;

use gateway_core::config::Settings;
use gateway_core::quota::{InMemoryUsageStore, UsageStore};
use gateway_db::{PgUsageStore, MIGRATOR};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing::{info, warn};

mod error;
mod middleware;
mod routes;
mod state;

use crate::state::{AppState, Clients};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let settings = Settings::from_env()?;

    let store: Arc<dyn UsageStore> = match settings.database_url.as_deref() {
        Some(database_url) => {
            let db = PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await?;
            MIGRATOR.run(&db).await?;
            info!("usage store: postgres");
            Arc::new(PgUsageStore::new(db))
        }
        None => {
            if settings.is_production() {
                warn!("DATABASE_URL not set; usage is kept in memory and not shared between instances");
            }
            Arc::new(InMemoryUsageStore::new())
        }
    };

    let clients = Clients::from_settings(&settings)?;
    let addr: SocketAddr = settings.api_bind.parse()?;
    let state = AppState::new(settings, store, clients)?;

    let app = routes::app(state);

    info!(%addr, "starting api");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
