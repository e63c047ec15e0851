//! Maintenance entry point: opens (or creates) the configured database,
//! checks the whole tree and logs what it found.

use store::config::StoreConfig;
use store::storage::Database;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match StoreConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Loaded configuration: database_path={}, block_size={}, cache_blocks={}",
        config.database_path.display(),
        config.block_size,
        config.cache_blocks
    );

    let database = match Database::open_or_create(&config) {
        Ok(database) => database,
        Err(e) => {
            tracing::error!("Failed to open database: {e}");
            std::process::exit(1);
        }
    };

    match database.verify() {
        Ok(stats) => tracing::info!(
            depth = stats.depth,
            nodes = stats.nodes,
            leaves = stats.leaves,
            pairs = stats.pairs,
            overflow_values = stats.overflow_values,
            "tree verified"
        ),
        Err(e) => {
            tracing::error!(corruption = e.is_corruption(), "Verification failed: {e}");
            std::process::exit(1);
        }
    }

    let cache = database.cache_stats();
    tracing::info!(
        hits = cache.hits,
        misses = cache.misses,
        evictions = cache.evictions,
        block_size = database.block_size(),
        "cache statistics"
    );

    if let Err(e) = database.flush() {
        tracing::error!("Failed to flush database: {e}");
        std::process::exit(1);
    }
}
