// src/broker.rs
use crate::config::BrokerEndpoints;
use crate::error::{GatewayError, Result};
use crate::models::{Credential, Quote};
use crate::upstream::{
    UpstreamFunds, UpstreamHolding, UpstreamLedgerEntry, UpstreamOrder, UpstreamPosition,
    UpstreamQuoteResponse, UpstreamTrade,
};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;

/// Splits `"NSE_EQ:1333"` into segment and id; a bare id gets the default
/// segment.
pub fn split_instrument<'a>(instrument: &'a str, default_segment: &'a str) -> (&'a str, &'a str) {
    match instrument.split_once(':') {
        Some((segment, id)) if !segment.is_empty() => (segment, id.trim()),
        _ => (default_segment, instrument.trim()),
    }
}

/// Anything that can produce a live quote for one instrument.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn quote(&self, segment: &str, security_id: &str) -> Result<Quote>;
}

/// HTTP client bound to one user's access token. Built per request and
/// dropped with it.
pub struct BrokerClient {
    http: Client,
    base_url: String,
    client_id: String,
    access_token: String,
    quote_timeout: Duration,
}

impl BrokerClient {
    pub fn new(credential: &Credential, endpoints: &BrokerEndpoints) -> Result<Self> {
        let access_token = credential
            .access_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::MissingCredentials(credential.user_id.clone()))?;
        let http = Client::builder()
            .timeout(endpoints.request_timeout)
            .build()?;
        Ok(BrokerClient {
            http,
            base_url: endpoints.rest_url.clone(),
            client_id: credential.client_id.clone(),
            access_token,
            quote_timeout: endpoints.quote_timeout,
        })
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("access-token", &self.access_token)
            .header("client-id", &self.client_id)
            .header("Accept", "application/json")
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder, path: &str) -> Result<T> {
        let response = self.authorized(builder).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Broker {} returned HTTP {}: {}", path, status, body);
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        debug!("Broker {} returned HTTP {}", path, status);
        Ok(response.json::<T>().await?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        self.send(self.http.get(&url), path).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        self.send(self.http.post(&url).json(body), path).await
    }

    pub async fn holdings(&self) -> Result<Vec<UpstreamHolding>> {
        self.get("/holdings").await
    }

    pub async fn positions(&self) -> Result<Vec<UpstreamPosition>> {
        self.get("/positions").await
    }

    pub async fn fund_limit(&self) -> Result<UpstreamFunds> {
        self.get("/fundlimit").await
    }

    pub async fn orders(&self) -> Result<Vec<UpstreamOrder>> {
        self.get("/orders").await
    }

    pub async fn trade_history(&self, from: &str, to: &str, page: usize) -> Result<Vec<UpstreamTrade>> {
        self.get(&format!("/trades/{}/{}/{}", from, to, page)).await
    }

    pub async fn ledger(&self, from: &str, to: &str) -> Result<Vec<UpstreamLedgerEntry>> {
        self.get(&format!("/ledger?from-date={}&to-date={}", from, to))
            .await
    }

    pub async fn margin_calculator(&self, request: &Value) -> Result<Value> {
        self.post("/margincalculator", request).await
    }

    pub async fn convert_position(&self, request: &Value) -> Result<Value> {
        let url = format!("{}/positions/convert", self.base_url);
        let response = self
            .authorized(self.http.post(&url).json(request))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            error!("Position conversion returned HTTP {}: {}", status, body);
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        // The broker answers 202 with an empty body on success.
        if body.trim().is_empty() {
            return Ok(json!({"status": "accepted"}));
        }
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn ohlc(&self, segment: &str, security_id: &str) -> Result<UpstreamQuoteResponse> {
        let id: Value = security_id
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(security_id));
        let mut body = serde_json::Map::new();
        body.insert(segment.to_string(), Value::Array(vec![id]));
        let url = format!("{}/marketfeed/ohlc", self.base_url);
        let builder = self
            .http
            .post(&url)
            .timeout(self.quote_timeout)
            .json(&Value::Object(body));
        self.send(builder, "/marketfeed/ohlc").await
    }
}

#[async_trait]
impl QuoteSource for BrokerClient {
    async fn quote(&self, segment: &str, security_id: &str) -> Result<Quote> {
        self.ohlc(segment, security_id)
            .await?
            .into_quote(segment, security_id, Utc::now())
    }
}
