//! 통합 테스트용 목 거래소.
//!
//! 프레임 형식:
//! - `{"channel": "trades", "data": [{"symbol", "id", "price", "qty", "side"}]}`
//! - `{"channel": "book", "type": "snapshot"|"delta", "symbol", "bids", "asks", "first", "last", "checksum"}`
//! - `{"channel": "orders", "data": [{"symbol", "id", "status"}]}`
//! - `{"event": "error", "hashes": [...], "code": "auth"|"rate"|"bad"}`

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use trader_core::{
    parse_decimal, Order, OrderBookLevel, OrderStatusType, OrderType, Side, Symbol, TradeTick,
};
use trader_stream::{
    BookConfig, BookDelta, BookSnapshot, Channel, ChecksumConfig, Credential, NormalizedEvent,
    RequestContext, SequenceRule, StreamEngine, StreamError, StreamResult, Transport,
    VenueProtocol, Visibility,
};

pub struct MockVenue {
    pub book: BookConfig,
}

impl MockVenue {
    pub fn with_checksum(depth: usize) -> Self {
        Self {
            book: BookConfig {
                sequence: SequenceRule::None,
                checksum: Some(ChecksumConfig {
                    depth,
                    ..ChecksumConfig::okx()
                }),
                max_depth: None,
            },
        }
    }

    pub fn with_sequence(sequence: SequenceRule) -> Self {
        Self {
            book: BookConfig {
                sequence,
                ..Default::default()
            },
        }
    }
}

fn text<'a>(value: &'a Value, key: &str) -> StreamResult<&'a str> {
    value[key]
        .as_str()
        .ok_or_else(|| StreamError::Parse(format!("missing {}", key)))
}

fn symbol(value: &Value) -> StreamResult<Symbol> {
    Ok(text(value, "symbol")?.parse::<Symbol>()?)
}

fn levels(value: &Value) -> StreamResult<Vec<OrderBookLevel>> {
    let mut out = Vec::new();
    for level in value.as_array().into_iter().flatten() {
        let price = parse_decimal(level[0].as_str().unwrap_or_default())?;
        let qty = parse_decimal(level[1].as_str().unwrap_or_default())?;
        out.push(OrderBookLevel::new(price, qty));
    }
    Ok(out)
}

impl VenueProtocol for MockVenue {
    fn venue(&self) -> &str {
        "mockex"
    }

    fn parse(&self, frame: &str) -> StreamResult<Vec<NormalizedEvent>> {
        let msg: Value = serde_json::from_str(frame)?;
        if msg["event"] == "error" {
            let hashes = msg["hashes"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|h| h.as_str().map(String::from))
                .collect();
            let error = match msg["code"].as_str() {
                Some("auth") => StreamError::Authentication("invalid credential".into()),
                Some("rate") => StreamError::RateLimitExceeded("slow down".into()),
                _ => StreamError::BadRequest("rejected".into()),
            };
            return Ok(vec![NormalizedEvent::Error { hashes, error }]);
        }

        match msg["channel"].as_str() {
            Some("trades") => {
                let mut trades = Vec::new();
                for t in msg["data"].as_array().into_iter().flatten() {
                    trades.push(TradeTick {
                        symbol: symbol(t)?,
                        id: text(t, "id")?.to_string(),
                        order_id: t["order"].as_str().map(String::from),
                        price: parse_decimal(text(t, "price")?)?,
                        quantity: parse_decimal(text(t, "qty")?)?,
                        side: if t["side"] == "sell" { Side::Sell } else { Side::Buy },
                        timestamp: chrono::Utc::now(),
                        fee: None,
                    });
                }
                Ok(vec![NormalizedEvent::Trades(trades)])
            }
            Some("orders") => {
                let mut orders = Vec::new();
                for o in msg["data"].as_array().into_iter().flatten() {
                    let status = match o["status"].as_str() {
                        Some("filled") => OrderStatusType::Filled,
                        _ => OrderStatusType::Open,
                    };
                    orders.push(Order::new(text(o, "id")?, symbol(o)?, Side::Buy, OrderType::Limit, status));
                }
                Ok(vec![NormalizedEvent::Orders(orders)])
            }
            Some("book") => {
                let symbol = symbol(&msg)?;
                let bids = levels(&msg["bids"])?;
                let asks = levels(&msg["asks"])?;
                let checksum = msg["checksum"].as_i64();
                if msg["type"] == "snapshot" {
                    Ok(vec![NormalizedEvent::OrderBookSnapshot(BookSnapshot {
                        symbol,
                        bids,
                        asks,
                        nonce: msg["last"].as_u64(),
                        timestamp: None,
                        checksum,
                    })])
                } else {
                    Ok(vec![NormalizedEvent::OrderBookDelta(BookDelta {
                        symbol,
                        bids,
                        asks,
                        first: msg["first"].as_u64(),
                        last: msg["last"].as_u64(),
                        prev: None,
                        timestamp: None,
                        checksum,
                    })])
                }
            }
            _ => Ok(Vec::new()),
        }
    }

    fn topic(&self, channel: &Channel) -> String {
        match channel {
            Channel::Orders(_) => "orders".to_string(),
            other => other.message_hash(),
        }
    }

    fn subscribe_payload(
        &self,
        channels: &[Channel],
        ctx: &RequestContext<'_>,
    ) -> StreamResult<Option<Value>> {
        let args: Vec<String> = channels.iter().map(|c| self.topic(c)).collect();
        let token = match ctx.credential {
            Some(Credential::Token(token)) => json!(token),
            _ => Value::Null,
        };
        Ok(Some(json!({"op": "subscribe", "id": ctx.request_id, "args": args, "token": token})))
    }

    fn unsubscribe_payload(
        &self,
        channels: &[Channel],
        ctx: &RequestContext<'_>,
    ) -> StreamResult<Option<Value>> {
        let args: Vec<String> = channels.iter().map(|c| self.topic(c)).collect();
        Ok(Some(json!({"op": "unsubscribe", "id": ctx.request_id, "args": args})))
    }

    fn book_config(&self, _symbol: &Symbol) -> BookConfig {
        self.book.clone()
    }
}

/// 보낸 페이로드를 기록하는 전송 채널.
#[derive(Default)]
pub struct MockTransport {
    pub sent: Mutex<Vec<Value>>,
}

impl MockTransport {
    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, payload: &Value) -> StreamResult<()> {
        self.sent.lock().unwrap().push(payload.clone());
        Ok(())
    }

    async fn close(&self) -> StreamResult<()> {
        Ok(())
    }
}

pub async fn attach(engine: StreamEngine<MockVenue>) -> (Arc<StreamEngine<MockVenue>>, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::default());
    engine.attach(Visibility::Public, transport.clone()).await;
    engine.attach(Visibility::Private, transport.clone()).await;
    (Arc::new(engine), transport)
}

/// 대기 중인 메시지 해시가 `n`개 이상이 될 때까지 양보합니다.
pub async fn wait_pending(engine: &StreamEngine<MockVenue>, visibility: Visibility, n: usize) {
    let conn = engine.connection(visibility);
    while conn.router().lock().await.pending_hashes().len() < n {
        tokio::task::yield_now().await;
    }
}

pub fn btc() -> Symbol {
    Symbol::spot("BTC", "USDT")
}
