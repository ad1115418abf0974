// src/aggregate.rs
//! Pure shaping of broker data into dashboard views.
//!
//! Accumulation happens in `f64`; values are rounded to two decimals only
//! when a view is produced.

use crate::models::{Funds, LineSource, Page, PortfolioLine, PortfolioSummary, TodayPnl};
use crate::upstream::{UpstreamFunds, UpstreamHolding, UpstreamOrder, UpstreamPosition};
use chrono::NaiveDate;
use std::collections::BTreeMap;

pub const MAX_PAGE_SIZE: usize = 500;

/// Two-decimal rounding, half away from zero.
pub fn round2(value: f64) -> f64 {
    let rounded = (value * 100.0).round() / 100.0;
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// Holdings keyed by trading symbol, overlaid by positions for the same
/// symbol. A position without a last price keeps the holding's.
pub fn merge_portfolio(
    holdings: &[UpstreamHolding],
    positions: &[UpstreamPosition],
) -> BTreeMap<String, PortfolioLine> {
    let mut merged = BTreeMap::new();

    for holding in holdings {
        let line = holding.clone().into_line();
        merged.insert(line.trading_symbol.clone(), line);
    }

    for position in positions {
        let incoming = position.clone().into_line();
        let holding = merged
            .get(&incoming.trading_symbol)
            .filter(|line| line.source != LineSource::Position)
            .cloned();
        let line = match holding {
            Some(holding) => PortfolioLine {
                last_price: if incoming.last_price > 0.0 {
                    incoming.last_price
                } else {
                    holding.last_price
                },
                security_id: if incoming.security_id.is_empty() {
                    holding.security_id
                } else {
                    incoming.security_id.clone()
                },
                source: LineSource::Both,
                ..incoming
            },
            None => incoming,
        };
        merged.insert(line.trading_symbol.clone(), line);
    }

    merged
}

pub fn summarize<'a, I>(lines: I) -> PortfolioSummary
where
    I: IntoIterator<Item = &'a PortfolioLine>,
{
    let mut investment = 0.0;
    let mut value = 0.0;
    let mut realized = 0.0;
    let mut unrealized = 0.0;
    let mut count = 0;

    for line in lines {
        investment += line.quantity * line.average_cost;
        value += line.quantity * line.last_price;
        realized += line.realized_pnl;
        unrealized += line.unrealized_pnl;
        count += 1;
    }

    let pnl = value - investment;
    let pnl_percent = if investment != 0.0 {
        pnl / investment * 100.0
    } else {
        0.0
    };

    PortfolioSummary {
        total_investment: round2(investment),
        current_value: round2(value),
        overall_pnl: round2(pnl),
        overall_pnl_percent: round2(pnl_percent),
        realized_pnl: round2(realized),
        unrealized_pnl: round2(unrealized),
        line_count: count,
    }
}

fn first_present(candidates: &[Option<f64>]) -> f64 {
    candidates.iter().find_map(|v| *v).unwrap_or(0.0)
}

pub fn normalize_funds(raw: &UpstreamFunds) -> Funds {
    Funds {
        available_balance: round2(first_present(&[
            raw.available_balance,
            raw.availabel_balance,
            raw.available_balance_snake,
        ])),
        sod_limit: round2(first_present(&[raw.sod_limit])),
        collateral: round2(first_present(&[raw.collateral_amount])),
        receivable: round2(first_present(&[
            raw.receivable_amount,
            raw.receiveable_amount,
        ])),
        utilized: round2(first_present(&[raw.utilized_amount])),
        blocked_payout: round2(first_present(&[raw.blocked_payout_amount])),
        withdrawable: round2(first_present(&[raw.withdrawable_balance])),
    }
}

/// Leading `YYYY-MM-DD` of a broker timestamp.
fn trading_day(timestamp: &str) -> Option<NaiveDate> {
    let day = timestamp.trim().get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

pub fn today_pnl(
    orders: &[UpstreamOrder],
    positions: &[UpstreamPosition],
    today: NaiveDate,
) -> TodayPnl {
    let realized: f64 = orders
        .iter()
        .filter(|o| o.is_completed() && trading_day(o.effective_time()) == Some(today))
        .map(|o| o.realized_profit)
        .sum();

    let unrealized: f64 = positions
        .iter()
        .filter(|p| p.is_open())
        .map(|p| p.net_qty * (p.last_traded_price - p.avg_cost()))
        .sum();

    TodayPnl {
        realized: round2(realized),
        unrealized: round2(unrealized),
        total: round2(realized + unrealized),
    }
}

/// Zero-based page of `items`; page size is clamped to `1..=MAX_PAGE_SIZE`.
pub fn paginate<T: Clone>(items: &[T], page: usize, page_size: usize) -> Page<T> {
    let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
    let start = page.saturating_mul(page_size).min(items.len());
    let end = start.saturating_add(page_size).min(items.len());
    Page {
        items: items[start..end].to_vec(),
        page,
        page_size,
        total: items.len(),
        has_more: end < items.len(),
    }
}
