//! 시장 데이터 타입.
//!
//! 스트림 엔진이 캐시에 보관하고 구독자에게 전달하는 정규화된 시장 데이터:
//! - `Ticker` - 실시간 시세
//! - `TradeTick` - 체결 (공개 체결 및 내 체결)
//! - `Kline` - OHLCV 캔들
//! - `OrderBook` - 호가창 스냅샷 뷰

use crate::domain::order::{Fee, Side};
use crate::types::{Price, Quantity, Symbol, Timeframe};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 실시간 시세 데이터.
///
/// 거래소마다 제공하는 필드가 달라 대부분 선택 값입니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: Symbol,
    pub bid: Option<Price>,
    pub ask: Option<Price>,
    pub last: Option<Price>,
    pub high: Option<Price>,
    pub low: Option<Price>,
    /// 24시간 거래량 (기준 자산)
    pub base_volume: Option<Quantity>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Ticker {
    /// 심볼만 채운 빈 시세를 생성합니다.
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            bid: None,
            ask: None,
            last: None,
            high: None,
            low: None,
            base_volume: None,
            timestamp: None,
        }
    }

    /// 매수/매도 스프레드.
    pub fn spread(&self) -> Option<Decimal> {
        Some(self.ask? - self.bid?)
    }
}

/// 체결 데이터.
///
/// 공개 체결 스트림과 내 체결 스트림이 같은 타입을 사용합니다.
/// 내 체결에는 `order_id`와 `fee`가 채워집니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeTick {
    pub symbol: Symbol,
    /// 체결 ID
    pub id: String,
    /// 체결을 만든 주문 ID (내 체결만)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub price: Price,
    pub quantity: Quantity,
    pub side: Side,
    pub timestamp: DateTime<Utc>,
    /// 체결 수수료 (내 체결만)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee: Option<Fee>,
}

impl TradeTick {
    /// 체결 금액 (가격 × 수량).
    pub fn cost(&self) -> Decimal {
        self.price * self.quantity
    }
}

/// OHLCV 캔들.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    /// 캔들 시작 시각 (캐시 버킷 키)
    pub open_time: DateTime<Utc>,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Quantity,
}

/// 호가 레벨.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: Price,
    pub quantity: Quantity,
}

impl OrderBookLevel {
    pub fn new(price: Price, quantity: Quantity) -> Self {
        Self { price, quantity }
    }
}

/// 호가창 스냅샷 뷰.
///
/// 로컬 호가창에서 잘라낸 읽기 전용 복사본입니다.
/// 매수 호가는 가격 내림차순, 매도 호가는 오름차순입니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: Symbol,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    /// 마지막으로 적용된 시퀀스 번호
    pub nonce: Option<u64>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl OrderBook {
    /// 최우선 매수 호가.
    pub fn best_bid(&self) -> Option<Price> {
        self.bids.first().map(|l| l.price)
    }

    /// 최우선 매도 호가.
    pub fn best_ask(&self) -> Option<Price> {
        self.asks.first().map(|l| l.price)
    }

    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()? - self.best_bid()?)
    }

    /// 호가가 교차(bid >= ask)되어 있는지 확인합니다.
    pub fn is_crossed(&self) -> bool {
        matches!((self.best_bid(), self.best_ask()), (Some(b), Some(a)) if b >= a)
    }
}
