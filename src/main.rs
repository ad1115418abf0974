// src/main.rs
mod aggregate;
mod api;
mod auth;
mod broker;
mod cache;
mod config;
mod db;
mod error;
mod feed;
mod market;
mod models;
mod quotes;
mod single_flight;
mod upstream;

use crate::api::AppState;
use crate::cache::Cache;
use crate::config::Config;
use crate::db::ScyllaCredentialStore;
use crate::feed::{ChannelHub, FeedRegistry};
use crate::market::MarketService;
use env_logger::{Builder, Env};
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tokio::time;
use warp::Filter;

const CHANNEL_CAPACITY: usize = 256;

async fn sweep_cache(cache: Arc<Cache>, every: Duration) {
    let mut ticker = time::interval(every);
    loop {
        ticker.tick().await;
        let purged = cache.purge_expired().await;
        if purged > 0 {
            debug!(
                "Purged {} expired cache entries, {} remain",
                purged,
                cache.len().await
            );
        }
    }
}

#[tokio::main]
async fn main() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return;
        }
    };
    info!(
        "Starting broker gateway against the {:?} broker at {}",
        config.environment, config.endpoints.rest_url
    );

    let session = match db::init(&config.scylla_uri).await {
        Ok(session) => Arc::new(session),
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            return;
        }
    };
    let store = Arc::new(ScyllaCredentialStore::new(session));

    let cache = Arc::new(Cache::new());
    task::spawn(sweep_cache(cache.clone(), config.cache_sweep_interval));

    let hub = Arc::new(ChannelHub::new(CHANNEL_CAPACITY));
    let feeds = Arc::new(FeedRegistry::new(hub, &config.endpoints.ws_url));
    let market = Arc::new(MarketService::new(
        store,
        cache,
        config.endpoints.clone(),
        config.ttl,
        config.quote_wait_timeout,
    ));

    let state = Arc::new(AppState {
        market,
        feeds: feeds.clone(),
        jwt_secret: Arc::new(config.jwt_secret.clone()),
    });

    let api = api::routes(state)
        .recover(error::handle_rejection)
        .with(warp::log("broker_gateway"));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received");
    };

    let (addr, server) = match warp::serve(api).try_bind_with_graceful_shutdown(config.bind_addr, shutdown) {
        Ok(bound) => bound,
        Err(e) => {
            error!("Failed to bind {}: {}", config.bind_addr, e);
            return;
        }
    };
    info!("Server running on http://{}", addr);
    server.await;

    feeds.shutdown().await;
    info!("Broker gateway stopped");
}
