// src/quotes.rs
use crate::broker::{split_instrument, QuoteSource};
use crate::cache::{cache_key, Cache};
use crate::error::Result;
use crate::models::Quote;
use crate::single_flight::SingleFlight;
use futures::future::join_all;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Cached live quotes with at most one upstream request per instrument.
pub struct QuoteFetcher {
    cache: Arc<Cache>,
    flights: SingleFlight<Quote>,
    ttl_secs: u64,
    default_segment: String,
}

impl QuoteFetcher {
    pub fn new(
        cache: Arc<Cache>,
        ttl_secs: u64,
        wait_timeout: Duration,
        default_segment: &str,
    ) -> Self {
        QuoteFetcher {
            cache,
            flights: SingleFlight::new(wait_timeout),
            ttl_secs,
            default_segment: default_segment.to_string(),
        }
    }

    pub async fn fetch(&self, source: Arc<dyn QuoteSource>, instrument: &str) -> Result<Quote> {
        let (segment, security_id) = split_instrument(instrument, &self.default_segment);
        let key = cache_key("quote", &[segment, security_id]);

        if let Some(value) = self.cache.get(&key).await {
            match serde_json::from_value::<Quote>(value) {
                Ok(mut quote) => {
                    quote.from_cache = true;
                    return Ok(quote);
                }
                Err(e) => warn!("Ignoring unreadable cached quote {}: {}", key, e),
            }
        }

        let cache = self.cache.clone();
        let ttl = self.ttl_secs;
        let segment = segment.to_string();
        let security_id = security_id.to_string();
        let entry_key = key.clone();
        self.flights
            .run(&key, move || async move {
                debug!("Fetching quote {}:{} from broker", segment, security_id);
                let quote = source.quote(&segment, &security_id).await?;
                cache.set(&entry_key, &quote, ttl).await;
                Ok(quote)
            })
            .await
    }

    /// Fetches several instruments concurrently. Failed instruments are
    /// logged and left out of the result.
    pub async fn fetch_many(
        &self,
        source: Arc<dyn QuoteSource>,
        instruments: &[String],
    ) -> BTreeMap<String, Quote> {
        let results = join_all(
            instruments
                .iter()
                .map(|instrument| self.fetch(source.clone(), instrument)),
        )
        .await;

        instruments
            .iter()
            .zip(results)
            .filter_map(|(instrument, result)| match result {
                Ok(quote) => Some((instrument.clone(), quote)),
                Err(e) => {
                    warn!("Quote for {} unavailable: {}", instrument, e);
                    None
                }
            })
            .collect()
    }
}
