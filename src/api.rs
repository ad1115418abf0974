// src/api.rs
use crate::auth::{user_from_header, verify_token};
use crate::error::GatewayError;
use crate::feed::{ControlKind, ControlMessage, FeedRegistry};
use crate::market::MarketService;
use crate::models::{
    LedgerQuery, LinkRequest, PortfolioLine, QuotesRequest, SocketQuery, SubscriptionRequest,
    TokenRequest, TradeQuery,
};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

pub struct AppState {
    pub market: Arc<MarketService>,
    pub feeds: Arc<FeedRegistry>,
    pub jwt_secret: Arc<String>,
}

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    broker_routes(state.clone())
        .or(market_routes(state.clone()))
        .or(feed_routes(state))
}

fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Resolves the platform user id carried by the bearer token.
fn with_user(
    secret: Arc<String>,
) -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::header::<String>("authorization").and_then(move |header: String| {
        let secret = secret.clone();
        async move { user_from_header(&header, &secret).map_err(warp::reject::custom) }
    })
}

fn respond<T: Serialize>(
    operation: &str,
    user_id: &str,
    result: Result<T, GatewayError>,
) -> Result<warp::reply::Json, Rejection> {
    match result {
        Ok(value) => {
            debug!("{} succeeded for user {}", operation, user_id);
            Ok(warp::reply::json(&value))
        }
        Err(e) => {
            error!("Failed to {} for user {}: {}", operation, user_id, e);
            Err(warp::reject::custom(e))
        }
    }
}

fn broker_routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let user = with_user(state.jwt_secret.clone());

    let link = warp::path!("broker" / "link")
        .and(warp::post())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(link_handler);

    let token = warp::path!("broker" / "token")
        .and(warp::put())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(token_handler);

    let status = warp::path!("broker" / "credential")
        .and(warp::get())
        .and(user)
        .and(with_state(state))
        .and_then(credential_handler);

    link.or(token).or(status)
}

fn market_routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let user = with_user(state.jwt_secret.clone());

    let holdings = warp::path!("market" / "holdings")
        .and(warp::get())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and_then(holdings_handler);

    let positions = warp::path!("market" / "positions")
        .and(warp::get())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and_then(positions_handler);

    let portfolio = warp::path!("market" / "portfolio")
        .and(warp::get())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and_then(portfolio_handler);

    let summary = warp::path!("market" / "portfolio" / "summary")
        .and(warp::get())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and_then(summary_handler);

    let funds = warp::path!("market" / "funds")
        .and(warp::get())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and_then(funds_handler);

    let orders = warp::path!("market" / "orders")
        .and(warp::get())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and_then(orders_handler);

    let pnl = warp::path!("market" / "pnl" / "today")
        .and(warp::get())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and_then(today_pnl_handler);

    let trades = warp::path!("market" / "trades")
        .and(warp::get())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and(warp::query::<TradeQuery>())
        .and_then(trades_handler);

    let ledger = warp::path!("market" / "ledger")
        .and(warp::get())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and(warp::query::<LedgerQuery>())
        .and_then(ledger_handler);

    let quote = warp::path!("market" / "quote" / String)
        .and(warp::get())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and_then(quote_handler);

    let quotes = warp::path!("market" / "quotes")
        .and(warp::post())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(quotes_handler);

    let margin = warp::path!("market" / "margin")
        .and(warp::post())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(margin_handler);

    let convert = warp::path!("market" / "positions" / "convert")
        .and(warp::post())
        .and(user)
        .and(with_state(state))
        .and(warp::body::json())
        .and_then(convert_handler);

    holdings
        .or(positions)
        .or(portfolio)
        .or(summary)
        .or(funds)
        .or(orders)
        .or(pnl)
        .or(trades)
        .or(ledger)
        .or(quote)
        .or(quotes)
        .or(margin)
        .or(convert)
}

fn feed_routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let user = with_user(state.jwt_secret.clone());

    let status = warp::path!("market" / "feed")
        .and(warp::get())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and_then(feed_status_handler);

    let start = warp::path!("market" / "feed" / "start")
        .and(warp::post())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and_then(feed_start_handler);

    let stop = warp::path!("market" / "feed" / "stop")
        .and(warp::post())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and_then(feed_stop_handler);

    let subscribe = warp::path!("market" / "feed" / "subscribe")
        .and(warp::post())
        .and(user.clone())
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(feed_subscribe_handler);

    let unsubscribe = warp::path!("market" / "feed" / "unsubscribe")
        .and(warp::post())
        .and(user)
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(feed_unsubscribe_handler);

    let socket = warp::path!("market" / "feed" / "ws")
        .and(warp::ws())
        .and(warp::query::<SocketQuery>())
        .and(with_state(state))
        .and_then(socket_handler);

    status.or(start).or(stop).or(subscribe).or(unsubscribe).or(socket)
}

async fn link_handler(
    user_id: String,
    state: Arc<AppState>,
    request: LinkRequest,
) -> Result<impl Reply, Rejection> {
    let result = state.market.link(&user_id, request).await;
    respond("link broker account", &user_id, result).map(|reply| {
        info!("Broker account linked for user {}", user_id);
        warp::reply::with_status(reply, warp::http::StatusCode::CREATED)
    })
}

async fn token_handler(
    user_id: String,
    state: Arc<AppState>,
    request: TokenRequest,
) -> Result<impl Reply, Rejection> {
    let result = state
        .market
        .refresh_token(&user_id, &request.access_token)
        .await;
    respond("refresh access token", &user_id, result)
}

async fn credential_handler(user_id: String, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let result = state.market.credential_status(&user_id).await;
    respond("read credential status", &user_id, result)
}

async fn holdings_handler(user_id: String, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let result = state.market.holdings(&user_id).await.map(|holdings| {
        holdings
            .into_iter()
            .map(|h| h.into_line())
            .collect::<Vec<PortfolioLine>>()
    });
    respond("fetch holdings", &user_id, result)
}

async fn positions_handler(user_id: String, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let result = state.market.positions(&user_id).await.map(|positions| {
        positions
            .into_iter()
            .map(|p| p.into_line())
            .collect::<Vec<PortfolioLine>>()
    });
    respond("fetch positions", &user_id, result)
}

async fn portfolio_handler(user_id: String, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let result = state
        .market
        .portfolio(&user_id)
        .await
        .map(|lines| lines.into_values().collect::<Vec<PortfolioLine>>());
    respond("build portfolio", &user_id, result)
}

async fn summary_handler(user_id: String, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let result = state.market.portfolio_summary(&user_id).await;
    respond("summarize portfolio", &user_id, result)
}

async fn funds_handler(user_id: String, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let result = state.market.funds(&user_id).await;
    respond("fetch funds", &user_id, result)
}

async fn orders_handler(user_id: String, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let result = state.market.orders(&user_id).await;
    respond("fetch orders", &user_id, result)
}

async fn today_pnl_handler(user_id: String, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let result = state.market.today_pnl(&user_id).await;
    respond("compute today's P&L", &user_id, result)
}

async fn trades_handler(
    user_id: String,
    state: Arc<AppState>,
    query: TradeQuery,
) -> Result<impl Reply, Rejection> {
    let result = state
        .market
        .trade_history(&user_id, &query.from, &query.to, query.page)
        .await;
    respond("fetch trade history", &user_id, result)
}

async fn ledger_handler(
    user_id: String,
    state: Arc<AppState>,
    query: LedgerQuery,
) -> Result<impl Reply, Rejection> {
    let result = state
        .market
        .ledger(&user_id, &query.from, &query.to, query.page, query.page_size)
        .await;
    respond("fetch ledger", &user_id, result)
}

async fn quote_handler(
    instrument: String,
    user_id: String,
    state: Arc<AppState>,
) -> Result<impl Reply, Rejection> {
    let result = state.market.quote(&user_id, &instrument).await;
    respond("fetch quote", &user_id, result)
}

async fn quotes_handler(
    user_id: String,
    state: Arc<AppState>,
    request: QuotesRequest,
) -> Result<impl Reply, Rejection> {
    let result = state.market.quotes(&user_id, &request.security_ids).await;
    respond("fetch quotes", &user_id, result)
}

async fn margin_handler(
    user_id: String,
    state: Arc<AppState>,
    request: Value,
) -> Result<impl Reply, Rejection> {
    let result = state.market.margin(&user_id, &request).await;
    respond("calculate margin", &user_id, result)
}

async fn convert_handler(
    user_id: String,
    state: Arc<AppState>,
    request: Value,
) -> Result<impl Reply, Rejection> {
    let result = state.market.convert_position(&user_id, &request).await;
    respond("convert position", &user_id, result)
}

async fn feed_start_handler(user_id: String, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let result = async {
        let credential = state.market.credential(&user_id).await?;
        state.feeds.start(&credential).await
    }
    .await
    .map(|started| json!({ "started": started, "running": true }));
    respond("start live feed", &user_id, result)
}

async fn feed_status_handler(user_id: String, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let running = state.feeds.is_running(&user_id).await;
    let subscriptions = state.feeds.subscriptions(&user_id).await;
    respond::<Value>(
        "read live feed status",
        &user_id,
        Ok(json!({ "running": running, "subscriptions": subscriptions })),
    )
}

async fn feed_stop_handler(user_id: String, state: Arc<AppState>) -> Result<impl Reply, Rejection> {
    let stopped = state.feeds.stop(&user_id).await;
    respond::<Value>(
        "stop live feed",
        &user_id,
        Ok(json!({ "stopped": stopped, "running": false })),
    )
}

async fn feed_subscribe_handler(
    user_id: String,
    state: Arc<AppState>,
    request: SubscriptionRequest,
) -> Result<impl Reply, Rejection> {
    let result = state
        .feeds
        .subscribe(&user_id, &request.security_ids)
        .await
        .map(|frames| json!({ "frames": frames, "instruments": request.security_ids.len() }));
    respond("subscribe to live feed", &user_id, result)
}

async fn feed_unsubscribe_handler(
    user_id: String,
    state: Arc<AppState>,
    request: SubscriptionRequest,
) -> Result<impl Reply, Rejection> {
    let result = state
        .feeds
        .unsubscribe(&user_id, &request.security_ids)
        .await
        .map(|frames| json!({ "frames": frames, "instruments": request.security_ids.len() }));
    respond("unsubscribe from live feed", &user_id, result)
}

async fn socket_handler(
    ws: Ws,
    query: SocketQuery,
    state: Arc<AppState>,
) -> Result<impl Reply, Rejection> {
    let user_id = verify_token(&query.token, &state.jwt_secret).map_err(warp::reject::custom)?;
    Ok(ws.on_upgrade(move |socket| client_session(socket, user_id, state)))
}

/// Streams the user's envelopes to a dashboard socket and applies the
/// control messages it sends to the user's broker connection.
async fn client_session(socket: WebSocket, user_id: String, state: Arc<AppState>) {
    let (mut outgoing, mut incoming) = socket.split();
    let mut envelopes = state.feeds.hub().subscribe(&user_id).await;
    info!("Dashboard socket opened for user {}", user_id);

    let forward_user = user_id.clone();
    let forward = tokio::spawn(async move {
        loop {
            match envelopes.recv().await {
                Ok(envelope) => {
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Skipping unencodable envelope: {}", e);
                            continue;
                        }
                    };
                    if outgoing.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Dashboard socket for {} skipped {} envelopes", forward_user, skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    while let Some(frame) = incoming.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                warn!("Dashboard socket for {} failed: {}", user_id, e);
                break;
            }
        };
        if message.is_close() {
            break;
        }
        let text = match message.to_str() {
            Ok(text) => text,
            Err(_) => continue,
        };
        let control: ControlMessage = match serde_json::from_str(text) {
            Ok(control) => control,
            Err(e) => {
                debug!("Ignoring dashboard message from {}: {}", user_id, e);
                continue;
            }
        };
        let result = match control.kind {
            ControlKind::Subscribe => state.feeds.subscribe(&user_id, &control.symbols).await,
            ControlKind::Unsubscribe => state.feeds.unsubscribe(&user_id, &control.symbols).await,
        };
        if let Err(e) = result {
            warn!("Control message from {} not applied: {}", user_id, e);
        }
    }

    forward.abort();
    info!("Dashboard socket closed for user {}", user_id);
}
