use anyhow::{Context, Result};
use launchpad::config::PlatformConfig;
use launchpad::logs::store::SqliteLogStore;
use launchpad::registry::Registry;

/// Create the registry and log store schemas, then exit.
pub fn cmd_init_db(config: &PlatformConfig) -> Result<()> {
    Registry::open(&config.registry.path).context("Failed to initialize registry database")?;
    println!("Registry: {}", config.registry.path.display());

    SqliteLogStore::open(&config.log_store.path).context("Failed to initialize log store")?;
    println!("Log store: {}", config.log_store.path.display());
    Ok(())
}
