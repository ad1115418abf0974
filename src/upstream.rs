// src/upstream.rs
//! Broker response schemas.
//!
//! Every field the broker may omit, rename or send as a string is declared
//! here explicitly, and each resource has one normalization into the
//! internal model types. Numeric fields coerce unparsable or missing values
//! to zero.

use crate::error::{GatewayError, Result};
use crate::models::{LineSource, PortfolioLine, ProductType, Quote};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// `Number(x) || 0`: numbers pass through, numeric strings parse, anything
/// else (including NaN and infinities) is zero.
pub fn coerce_f64(value: &Value) -> f64 {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if s.trim().is_empty() => Some(0.0),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    parsed.filter(|x| x.is_finite()).unwrap_or(0.0)
}

fn lenient_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(coerce_f64(&Value::deserialize(deserializer)?))
}

fn lenient_opt_f64<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        other => Some(coerce_f64(&other)),
    })
}

fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamHolding {
    #[serde(default, alias = "symbol", deserialize_with = "lenient_string")]
    pub trading_symbol: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub security_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub exchange: String,
    #[serde(default, alias = "qty", alias = "quantity", deserialize_with = "lenient_f64")]
    pub total_qty: f64,
    #[serde(default, alias = "avgCost", alias = "averagePrice", deserialize_with = "lenient_f64")]
    pub avg_cost_price: f64,
    #[serde(default, alias = "ltp", alias = "lastPrice", deserialize_with = "lenient_f64")]
    pub last_traded_price: f64,
}

impl UpstreamHolding {
    pub fn into_line(self) -> PortfolioLine {
        let unrealized = if self.last_traded_price > 0.0 {
            self.total_qty * (self.last_traded_price - self.avg_cost_price)
        } else {
            0.0
        };
        PortfolioLine {
            trading_symbol: self.trading_symbol,
            security_id: self.security_id,
            exchange: self.exchange,
            quantity: self.total_qty,
            average_cost: self.avg_cost_price,
            last_price: self.last_traded_price,
            realized_pnl: 0.0,
            unrealized_pnl: unrealized,
            product_type: ProductType::Delivery,
            source: LineSource::Holding,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamPosition {
    #[serde(default, alias = "symbol", deserialize_with = "lenient_string")]
    pub trading_symbol: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub security_id: String,
    #[serde(default, alias = "exchange", deserialize_with = "lenient_string")]
    pub exchange_segment: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub product_type: String,
    #[serde(default, alias = "quantity", deserialize_with = "lenient_f64")]
    pub net_qty: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub buy_avg: f64,
    #[serde(default, alias = "avgCost", deserialize_with = "lenient_f64")]
    pub cost_price: f64,
    #[serde(default, alias = "realizedPnl", deserialize_with = "lenient_f64")]
    pub realized_profit: f64,
    #[serde(default, alias = "unrealizedPnl", deserialize_with = "lenient_f64")]
    pub unrealized_profit: f64,
    #[serde(default, alias = "ltp", alias = "lastPrice", deserialize_with = "lenient_f64")]
    pub last_traded_price: f64,
}

impl UpstreamPosition {
    /// Cost price when the broker reports one, buy average otherwise.
    pub fn avg_cost(&self) -> f64 {
        if self.cost_price != 0.0 {
            self.cost_price
        } else {
            self.buy_avg
        }
    }

    pub fn is_open(&self) -> bool {
        self.net_qty != 0.0
    }

    pub fn into_line(self) -> PortfolioLine {
        let average_cost = self.avg_cost();
        PortfolioLine {
            product_type: ProductType::from_broker(&self.product_type),
            trading_symbol: self.trading_symbol,
            security_id: self.security_id,
            exchange: self.exchange_segment,
            quantity: self.net_qty,
            average_cost,
            last_price: self.last_traded_price,
            realized_pnl: self.realized_profit,
            unrealized_pnl: self.unrealized_profit,
            source: LineSource::Position,
        }
    }
}

/// Fund limits. The broker has shipped the available balance under three
/// names, one of them misspelled, so each is kept as its own field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamFunds {
    #[serde(default, rename = "availableBalance", deserialize_with = "lenient_opt_f64")]
    pub available_balance: Option<f64>,
    #[serde(default, rename = "availabelBalance", deserialize_with = "lenient_opt_f64")]
    pub availabel_balance: Option<f64>,
    #[serde(default, rename = "available_balance", deserialize_with = "lenient_opt_f64")]
    pub available_balance_snake: Option<f64>,
    #[serde(default, rename = "sodLimit", deserialize_with = "lenient_opt_f64")]
    pub sod_limit: Option<f64>,
    #[serde(default, rename = "collateralAmount", deserialize_with = "lenient_opt_f64")]
    pub collateral_amount: Option<f64>,
    #[serde(default, rename = "receivableAmount", deserialize_with = "lenient_opt_f64")]
    pub receivable_amount: Option<f64>,
    #[serde(default, rename = "receiveableAmount", deserialize_with = "lenient_opt_f64")]
    pub receiveable_amount: Option<f64>,
    #[serde(default, rename = "utilizedAmount", deserialize_with = "lenient_opt_f64")]
    pub utilized_amount: Option<f64>,
    #[serde(default, rename = "blockedPayoutAmount", deserialize_with = "lenient_opt_f64")]
    pub blocked_payout_amount: Option<f64>,
    #[serde(default, rename = "withdrawableBalance", deserialize_with = "lenient_opt_f64")]
    pub withdrawable_balance: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamOrder {
    #[serde(default, deserialize_with = "lenient_string")]
    pub order_id: String,
    #[serde(default, alias = "status", deserialize_with = "lenient_string")]
    pub order_status: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub trading_symbol: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub security_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub transaction_type: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub product_type: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub quantity: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub price: f64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub create_time: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub update_time: String,
    #[serde(default, alias = "pnl", deserialize_with = "lenient_f64")]
    pub realized_profit: f64,
}

impl UpstreamOrder {
    pub fn is_completed(&self) -> bool {
        matches!(
            self.order_status.trim().to_ascii_uppercase().as_str(),
            "TRADED" | "COMPLETE" | "COMPLETED" | "FILLED"
        )
    }

    /// Update time when present, create time otherwise.
    pub fn effective_time(&self) -> &str {
        if self.update_time.trim().is_empty() {
            &self.create_time
        } else {
            &self.update_time
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamTrade {
    #[serde(default, deserialize_with = "lenient_string")]
    pub order_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub exchange_trade_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub trading_symbol: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub security_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub transaction_type: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub product_type: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub traded_quantity: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub traded_price: f64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub exchange_time: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamLedgerEntry {
    #[serde(default, deserialize_with = "lenient_string")]
    pub narration: String,
    #[serde(default, rename = "voucherdate", deserialize_with = "lenient_string")]
    pub voucher_date: String,
    #[serde(default, rename = "vouchernumber", deserialize_with = "lenient_string")]
    pub voucher_number: String,
    #[serde(default, rename = "voucherdesc", deserialize_with = "lenient_string")]
    pub voucher_desc: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub debit: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub credit: f64,
    #[serde(default, rename = "runbal", deserialize_with = "lenient_f64")]
    pub running_balance: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamOhlc {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub open: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub close: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub high: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub low: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamQuoteEntry {
    #[serde(default, alias = "lastPrice", deserialize_with = "lenient_f64")]
    pub last_price: f64,
    #[serde(default)]
    pub ohlc: UpstreamOhlc,
}

/// `{"data": {"<segment>": {"<id>": {...}}}, "status": "success"}`
#[derive(Debug, Default, Deserialize)]
pub struct UpstreamQuoteResponse {
    #[serde(default)]
    pub data: HashMap<String, HashMap<String, UpstreamQuoteEntry>>,
    #[serde(default)]
    pub status: String,
}

impl UpstreamQuoteResponse {
    pub fn into_quote(
        mut self,
        segment: &str,
        security_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Quote> {
        if self.data.values().all(|ids| ids.is_empty()) {
            return Err(GatewayError::MalformedPayload(format!(
                "empty quote data for {}:{}",
                segment, security_id
            )));
        }
        let entry = self
            .data
            .get_mut(segment)
            .and_then(|ids| ids.remove(security_id))
            .ok_or_else(|| {
                GatewayError::MalformedPayload(format!(
                    "quote for {}:{} missing from response",
                    segment, security_id
                ))
            })?;

        let prev_close = entry.ohlc.close;
        let change = if prev_close > 0.0 {
            entry.last_price - prev_close
        } else {
            0.0
        };
        let change_percent = if prev_close > 0.0 {
            change / prev_close * 100.0
        } else {
            0.0
        };
        Ok(Quote {
            security_id: security_id.to_string(),
            ltp: entry.last_price,
            change,
            change_percent,
            updated_at: now,
            from_cache: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coercion_matches_number_or_zero() {
        assert_eq!(coerce_f64(&json!(12.5)), 12.5);
        assert_eq!(coerce_f64(&json!("12.5")), 12.5);
        assert_eq!(coerce_f64(&json!(" 7 ")), 7.0);
        assert_eq!(coerce_f64(&json!("abc")), 0.0);
        assert_eq!(coerce_f64(&json!(null)), 0.0);
        assert_eq!(coerce_f64(&json!("NaN")), 0.0);
        assert_eq!(coerce_f64(&json!({"x": 1})), 0.0);
    }

    #[test]
    fn holdings_accept_alternate_names_and_string_numbers() {
        let holding: UpstreamHolding =
            serde_json::from_value(json!({"symbol": "TCS", "qty": "10", "avgCost": 100}))
                .unwrap();
        assert_eq!(holding.trading_symbol, "TCS");
        assert_eq!(holding.total_qty, 10.0);
        assert_eq!(holding.avg_cost_price, 100.0);
        assert_eq!(holding.last_traded_price, 0.0);

        let line = holding.into_line();
        assert_eq!(line.product_type, ProductType::Delivery);
        assert_eq!(line.unrealized_pnl, 0.0);
    }

    #[test]
    fn positions_fall_back_to_buy_average() {
        let position: UpstreamPosition = serde_json::from_value(json!({
            "tradingSymbol": "INFY",
            "securityId": 1594,
            "exchangeSegment": "NSE_EQ",
            "productType": "INTRADAY",
            "netQty": 5,
            "buyAvg": "1500.5",
            "costPrice": null
        }))
        .unwrap();
        assert_eq!(position.security_id, "1594");
        assert_eq!(position.avg_cost(), 1500.5);
        assert!(position.is_open());
        assert_eq!(position.into_line().product_type, ProductType::Intraday);
    }

    #[test]
    fn funds_keep_each_spelling_separately() {
        let funds: UpstreamFunds = serde_json::from_value(json!({
            "availableBalance": 100.0,
            "availabelBalance": "90",
            "sodLimit": null
        }))
        .unwrap();
        assert_eq!(funds.available_balance, Some(100.0));
        assert_eq!(funds.availabel_balance, Some(90.0));
        assert_eq!(funds.sod_limit, None);
    }

    #[test]
    fn quote_response_normalizes_change_from_previous_close() {
        let response: UpstreamQuoteResponse = serde_json::from_value(json!({
            "data": {"NSE_EQ": {"1333": {"last_price": 110.0, "ohlc": {"open": 101, "close": 100, "high": 112, "low": 99}}}},
            "status": "success"
        }))
        .unwrap();
        let quote = response.into_quote("NSE_EQ", "1333", Utc::now()).unwrap();
        assert_eq!(quote.ltp, 110.0);
        assert_eq!(quote.change, 10.0);
        assert!((quote.change_percent - 10.0).abs() < 1e-9);
        assert!(!quote.from_cache);
    }

    #[test]
    fn empty_quote_data_is_malformed() {
        let response: UpstreamQuoteResponse =
            serde_json::from_value(json!({"data": {}, "status": "success"})).unwrap();
        assert!(matches!(
            response.into_quote("NSE_EQ", "1333", Utc::now()),
            Err(GatewayError::MalformedPayload(_))
        ));
    }
}
