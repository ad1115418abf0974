// src/market.rs
use crate::aggregate::{merge_portfolio, normalize_funds, paginate, summarize, today_pnl};
use crate::broker::{BrokerClient, QuoteSource};
use crate::cache::{cache_key, Cache};
use crate::config::{BrokerEndpoints, CacheTtl};
use crate::db::{self, CredentialStore};
use crate::error::{GatewayError, Result};
use crate::models::{
    Credential, CredentialStatus, Funds, LinkRequest, Page, PortfolioLine, PortfolioSummary,
    Quote, TodayPnl,
};
use crate::quotes::QuoteFetcher;
use crate::upstream::{
    UpstreamHolding, UpstreamLedgerEntry, UpstreamOrder, UpstreamPosition, UpstreamTrade,
};
use chrono::{NaiveDate, Utc};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Broker operations for authenticated users, each resolved against the
/// user's credential and served through the shared cache.
pub struct MarketService {
    store: Arc<dyn CredentialStore>,
    cache: Arc<Cache>,
    quotes: QuoteFetcher,
    endpoints: BrokerEndpoints,
    ttl: CacheTtl,
}

fn check_date(raw: &str) -> Result<&str> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|_| raw)
        .map_err(|_| GatewayError::BadRequest(format!("expected YYYY-MM-DD date, got {:?}", raw)))
}

impl MarketService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        cache: Arc<Cache>,
        endpoints: BrokerEndpoints,
        ttl: CacheTtl,
        quote_wait_timeout: Duration,
    ) -> Self {
        let quotes = QuoteFetcher::new(
            cache.clone(),
            ttl.quote,
            quote_wait_timeout,
            &endpoints.default_segment,
        );
        MarketService {
            store,
            cache,
            quotes,
            endpoints,
            ttl,
        }
    }

    pub async fn credential(&self, user_id: &str) -> Result<Credential> {
        db::resolve(self.store.as_ref(), user_id).await
    }

    async fn client(&self, user_id: &str) -> Result<BrokerClient> {
        let credential = self.credential(user_id).await?;
        BrokerClient::new(&credential, &self.endpoints)
    }

    async fn cached<T, F, Fut>(&self, key: String, ttl_secs: u64, load: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(value) = self.cache.get(&key).await {
            match serde_json::from_value::<T>(value) {
                Ok(hit) => {
                    debug!("Cache hit for {}", key);
                    return Ok(hit);
                }
                Err(e) => warn!("Discarding unreadable cache entry {}: {}", key, e),
            }
        }
        let fresh = load().await?;
        self.cache.set(&key, &fresh, ttl_secs).await;
        Ok(fresh)
    }

    // Credential link flow.

    pub async fn link(&self, user_id: &str, request: LinkRequest) -> Result<CredentialStatus> {
        if request.client_id.trim().is_empty() || request.api_key.trim().is_empty() {
            return Err(GatewayError::BadRequest(
                "clientId and apiKey are required".to_string(),
            ));
        }
        let credential = Credential {
            user_id: user_id.to_string(),
            broker: request.broker,
            client_id: request.client_id,
            api_key: request.api_key,
            api_secret: request.api_secret,
            access_token: request.access_token.filter(|t| !t.is_empty()),
            linked_at: Utc::now(),
        };
        self.store.upsert(&credential).await?;
        info!("Linked {} account for user {}", credential.broker, user_id);
        Ok(CredentialStatus::from(&credential))
    }

    pub async fn refresh_token(&self, user_id: &str, access_token: &str) -> Result<CredentialStatus> {
        if access_token.trim().is_empty() {
            return Err(GatewayError::BadRequest("accessToken is required".to_string()));
        }
        self.store.update_access_token(user_id, access_token).await?;
        self.invalidate_user(user_id).await;
        let credential = self
            .store
            .find(user_id)
            .await?
            .ok_or_else(|| GatewayError::MissingCredentials(user_id.to_string()))?;
        Ok(CredentialStatus::from(&credential))
    }

    pub async fn credential_status(&self, user_id: &str) -> Result<CredentialStatus> {
        self.store
            .find(user_id)
            .await?
            .map(|c| CredentialStatus::from(&c))
            .ok_or_else(|| GatewayError::MissingCredentials(user_id.to_string()))
    }

    async fn invalidate_user(&self, user_id: &str) {
        for namespace in ["holdings", "positions", "funds", "orders"] {
            self.cache.del(&cache_key(namespace, &[user_id])).await;
        }
    }

    // Raw broker resources.

    pub async fn holdings(&self, user_id: &str) -> Result<Vec<UpstreamHolding>> {
        self.cached(cache_key("holdings", &[user_id]), self.ttl.holdings, || async {
            self.client(user_id).await?.holdings().await
        })
        .await
    }

    pub async fn positions(&self, user_id: &str) -> Result<Vec<UpstreamPosition>> {
        self.cached(cache_key("positions", &[user_id]), self.ttl.positions, || async {
            self.client(user_id).await?.positions().await
        })
        .await
    }

    pub async fn orders(&self, user_id: &str) -> Result<Vec<UpstreamOrder>> {
        self.cached(cache_key("orders", &[user_id]), self.ttl.orders, || async {
            self.client(user_id).await?.orders().await
        })
        .await
    }

    pub async fn funds(&self, user_id: &str) -> Result<Funds> {
        let raw = self
            .cached(cache_key("funds", &[user_id]), self.ttl.funds, || async {
                self.client(user_id).await?.fund_limit().await
            })
            .await
            .map_err(|e| {
                warn!("Failed to fetch funds for {}: {}", user_id, e);
                e
            })?;
        Ok(normalize_funds(&raw))
    }

    // Aggregated views.

    /// Holdings merged with positions. A failing upstream list counts as
    /// empty so the dashboard still renders; missing credentials still fail.
    pub async fn portfolio(&self, user_id: &str) -> Result<BTreeMap<String, PortfolioLine>> {
        self.credential(user_id).await?;
        let (holdings, positions) = tokio::join!(self.holdings(user_id), self.positions(user_id));
        let holdings = holdings.unwrap_or_else(|e| {
            warn!("Holdings unavailable for {}: {}", user_id, e);
            Vec::new()
        });
        let positions = positions.unwrap_or_else(|e| {
            warn!("Positions unavailable for {}: {}", user_id, e);
            Vec::new()
        });
        Ok(merge_portfolio(&holdings, &positions))
    }

    pub async fn portfolio_summary(&self, user_id: &str) -> Result<PortfolioSummary> {
        let lines = self.portfolio(user_id).await?;
        Ok(summarize(lines.values()))
    }

    pub async fn today_pnl(&self, user_id: &str) -> Result<TodayPnl> {
        self.credential(user_id).await?;
        let (orders, positions) = tokio::join!(self.orders(user_id), self.positions(user_id));
        let orders = orders.unwrap_or_else(|e| {
            warn!("Orders unavailable for {}: {}", user_id, e);
            Vec::new()
        });
        let positions = positions.unwrap_or_else(|e| {
            warn!("Positions unavailable for {}: {}", user_id, e);
            Vec::new()
        });
        Ok(today_pnl(&orders, &positions, Utc::now().date_naive()))
    }

    pub async fn trade_history(
        &self,
        user_id: &str,
        from: &str,
        to: &str,
        page: usize,
    ) -> Result<Vec<UpstreamTrade>> {
        let (from, to) = (check_date(from)?, check_date(to)?);
        let page_str = page.to_string();
        let key = cache_key("trades", &[user_id, from, to, page_str.as_str()]);
        self.cached(key, self.ttl.trade_history, || async {
            self.client(user_id)
                .await?
                .trade_history(from, to, page)
                .await
        })
        .await
    }

    pub async fn ledger(
        &self,
        user_id: &str,
        from: &str,
        to: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Page<UpstreamLedgerEntry>> {
        let (from, to) = (check_date(from)?, check_date(to)?);
        let key = cache_key("ledger", &[user_id, from, to]);
        let entries: Vec<UpstreamLedgerEntry> = self
            .cached(key, self.ttl.ledger, || async {
                self.client(user_id).await?.ledger(from, to).await
            })
            .await?;
        Ok(paginate(&entries, page, page_size))
    }

    // Quotes.

    pub async fn quote(&self, user_id: &str, instrument: &str) -> Result<Quote> {
        let source: Arc<dyn QuoteSource> = Arc::new(self.client(user_id).await?);
        self.quotes.fetch(source, instrument).await
    }

    pub async fn quotes(&self, user_id: &str, instruments: &[String]) -> Result<BTreeMap<String, Quote>> {
        let source: Arc<dyn QuoteSource> = Arc::new(self.client(user_id).await?);
        Ok(self.quotes.fetch_many(source, instruments).await)
    }

    // Actions; these fail loudly.

    pub async fn margin(&self, user_id: &str, request: &Value) -> Result<Value> {
        let reply = self.client(user_id).await?.margin_calculator(request).await?;
        if reply.is_null() || reply.as_object().map_or(false, |o| o.is_empty()) {
            return Err(GatewayError::MalformedPayload(
                "empty margin calculator response".to_string(),
            ));
        }
        Ok(reply)
    }

    pub async fn convert_position(&self, user_id: &str, request: &Value) -> Result<Value> {
        let reply = self
            .client(user_id)
            .await?
            .convert_position(request)
            .await?;
        self.cache.del(&cache_key("positions", &[user_id])).await;
        self.cache.del(&cache_key("holdings", &[user_id])).await;
        info!("Converted position for user {}", user_id);
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{credential, MemoryCredentialStore};
    use serde_json::json;

    async fn service(url: &str) -> MarketService {
        let store = Arc::new(MemoryCredentialStore::default());
        store.upsert(&credential("u1", Some("tok"))).await.unwrap();
        MarketService::new(
            store,
            Arc::new(Cache::new()),
            BrokerEndpoints {
                rest_url: url.to_string(),
                ws_url: "ws://127.0.0.1:1".to_string(),
                default_segment: "NSE_EQ".to_string(),
                request_timeout: Duration::from_secs(2),
                quote_timeout: Duration::from_secs(2),
            },
            CacheTtl::default(),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn unlinked_user_gets_missing_credentials() {
        let svc = service("http://127.0.0.1:1").await;
        assert!(matches!(
            svc.portfolio("ghost").await,
            Err(GatewayError::MissingCredentials(_))
        ));
        assert!(matches!(
            svc.credential_status("ghost").await,
            Err(GatewayError::MissingCredentials(_))
        ));
    }

    #[tokio::test]
    async fn portfolio_survives_failed_positions_and_caches_holdings() {
        let mut server = mockito::Server::new_async().await;
        let holdings = server
            .mock("GET", "/holdings")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"tradingSymbol":"TCS","totalQty":10,"avgCostPrice":100}]"#)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("GET", "/positions")
            .with_status(500)
            .with_body("oops")
            .create_async()
            .await;

        let svc = service(&server.url()).await;
        let summary = svc.portfolio_summary("u1").await.unwrap();
        assert_eq!(summary.total_investment, 1000.0);
        assert_eq!(summary.current_value, 0.0);

        // Holdings now come from cache.
        let lines = svc.portfolio("u1").await.unwrap();
        assert_eq!(lines.len(), 1);
        holdings.assert_async().await;
    }

    #[tokio::test]
    async fn funds_fail_loudly_and_normalize_on_success() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/fundlimit")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"availabelBalance":"250.456","sodLimit":300}"#)
            .create_async()
            .await;

        let svc = service(&server.url()).await;
        let funds = svc.funds("u1").await.unwrap();
        assert_eq!(funds.available_balance, 250.46);
        assert_eq!(funds.sod_limit, 300.0);

        let broken = service("http://127.0.0.1:1").await;
        assert!(broken.funds("u1").await.is_err());
    }

    #[tokio::test]
    async fn ledger_is_paginated_locally() {
        let mut server = mockito::Server::new_async().await;
        let body = json!((0..5)
            .map(|i| json!({"narration": format!("entry {}", i), "debit": "0", "credit": i, "runbal": 10 * i}))
            .collect::<Vec<_>>());
        server
            .mock("GET", "/ledger")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("from-date".into(), "2024-01-01".into()),
                mockito::Matcher::UrlEncoded("to-date".into(), "2024-01-31".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let svc = service(&server.url()).await;
        let page = svc
            .ledger("u1", "2024-01-01", "2024-01-31", 1, 2)
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].narration, "entry 2");
        assert!(page.has_more);

        assert!(matches!(
            svc.ledger("u1", "01/01/2024", "2024-01-31", 0, 10).await,
            Err(GatewayError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn conversion_invalidates_cached_positions() {
        let mut server = mockito::Server::new_async().await;
        let positions = server
            .mock("GET", "/positions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("[]")
            .expect(2)
            .create_async()
            .await;
        server
            .mock("POST", "/positions/convert")
            .with_status(202)
            .create_async()
            .await;

        let svc = service(&server.url()).await;
        svc.positions("u1").await.unwrap();
        svc.positions("u1").await.unwrap();
        svc.convert_position("u1", &json!({"toProductType": "CNC"}))
            .await
            .unwrap();
        svc.positions("u1").await.unwrap();

        positions.assert_async().await;
    }

    #[tokio::test]
    async fn link_and_refresh_token() {
        let svc = service("http://127.0.0.1:1").await;
        let status = svc
            .link(
                "u2",
                LinkRequest {
                    broker: "dhan".into(),
                    client_id: "42".into(),
                    api_key: "k".into(),
                    api_secret: "s".into(),
                    access_token: None,
                },
            )
            .await
            .unwrap();
        assert!(!status.has_access_token);
        assert!(matches!(
            svc.credential("u2").await,
            Err(GatewayError::MissingCredentials(_))
        ));

        let refreshed = svc.refresh_token("u2", "new-token").await.unwrap();
        assert!(refreshed.has_access_token);
        assert!(svc.credential("u2").await.is_ok());
    }
}
