// src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A user's link to their broker account.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub user_id: String,
    pub broker: String,
    pub client_id: String,
    pub api_key: String,
    pub api_secret: String,
    pub access_token: Option<String>,
    pub linked_at: DateTime<Utc>,
}

/// What the API reveals about a linked credential.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialStatus {
    pub broker: String,
    pub client_id: String,
    pub has_access_token: bool,
    pub linked_at: DateTime<Utc>,
}

impl From<&Credential> for CredentialStatus {
    fn from(c: &Credential) -> Self {
        CredentialStatus {
            broker: c.broker.clone(),
            client_id: c.client_id.clone(),
            has_access_token: c.access_token.is_some(),
            linked_at: c.linked_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRequest {
    pub broker: String,
    pub client_id: String,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub access_token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub security_id: String,
    pub ltp: f64,
    pub change: f64,
    pub change_percent: f64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub from_cache: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotesRequest {
    pub security_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductType {
    Delivery,
    Intraday,
    Margin,
    Other,
}

impl ProductType {
    pub fn from_broker(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CNC" | "DELIVERY" => ProductType::Delivery,
            "INTRADAY" | "MIS" => ProductType::Intraday,
            "MARGIN" | "MTF" | "NRML" => ProductType::Margin,
            _ => ProductType::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineSource {
    Holding,
    Position,
    Both,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioLine {
    pub trading_symbol: String,
    pub security_id: String,
    pub exchange: String,
    pub quantity: f64,
    pub average_cost: f64,
    pub last_price: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub product_type: ProductType,
    pub source: LineSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSummary {
    pub total_investment: f64,
    pub current_value: f64,
    #[serde(rename = "overallPnL")]
    pub overall_pnl: f64,
    #[serde(rename = "overallPnLPercent")]
    pub overall_pnl_percent: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub line_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Funds {
    pub available_balance: f64,
    pub sod_limit: f64,
    pub collateral: f64,
    pub receivable: f64,
    pub utilized: f64,
    pub blocked_payout: f64,
    pub withdrawable: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodayPnl {
    pub realized: f64,
    pub unrealized: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
pub struct TradeQuery {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub page: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerQuery {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page_size() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct SocketQuery {
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub security_ids: Vec<String>,
}

/// Message published on a user's real-time channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: &str, data: Value) -> Self {
        Envelope {
            kind: kind.to_string(),
            data,
        }
    }
}
