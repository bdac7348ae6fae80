use mongodb::{options::ClientOptions, Client, Database};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::errors::Result;

const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn get_db_client(config: &AppConfig, database_url: &str) -> Result<Database> {
    let mut options = ClientOptions::parse(database_url).await?;
    options.app_name = Some("mpesa-bridge".to_string());
    // Bound every store call
    options.server_selection_timeout = Some(SERVER_SELECTION_TIMEOUT);
    options.connect_timeout = Some(CONNECT_TIMEOUT);

    let client = Client::with_options(options)?;
    let db = client.database(&config.database_name);

    match db.list_collection_names().await {
        Ok(collections) => {
            info!("Connected to database: {}", config.database_name);
            info!("Collections found: {:?}", collections);
        }
        Err(e) => {
            warn!(
                "Database '{}' may not exist or is inaccessible: {}",
                config.database_name, e
            );
        }
    }

    Ok(db)
}
