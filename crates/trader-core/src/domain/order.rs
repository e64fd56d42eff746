//! 주문 타입.
//!
//! 개인 채널로 수신되는 주문 업데이트의 정규화된 형태입니다:
//! - `Side` - 주문 방향 (매수/매도)
//! - `OrderType` - 주문 유형
//! - `OrderStatusType` - 주문 상태
//! - `Fee` - 수수료
//! - `Order` - 주문 엔티티

use crate::domain::market_data::TradeTick;
use crate::types::{Price, Quantity, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 주문 방향 (매수 또는 매도).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// 매수
    Buy,
    /// 매도
    Sell,
}

impl Side {
    /// 반대 방향을 반환합니다.
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// 주문 유형.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    /// 스톱/익절 등 기타 조건부 주문
    Conditional,
}

/// 주문 상태 유형.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatusType {
    /// 거래소에 접수됨
    Open,
    /// 부분 체결됨
    PartiallyFilled,
    /// 전량 체결됨
    Filled,
    /// 취소됨
    Cancelled,
    /// 거래소에서 거부됨
    Rejected,
    /// 유효 기간 만료
    Expired,
}

impl OrderStatusType {
    /// 주문이 최종 상태인지 확인합니다.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            OrderStatusType::Filled
                | OrderStatusType::Cancelled
                | OrderStatusType::Rejected
                | OrderStatusType::Expired
        )
    }

    /// 주문이 여전히 활성 상태인지 확인합니다.
    pub fn is_active(&self) -> bool {
        !self.is_final()
    }
}

/// 수수료.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fee {
    /// 수수료 통화
    pub currency: String,
    /// 수수료 금액
    pub cost: Decimal,
    /// 수수료율 (알려진 경우)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<Decimal>,
}

impl Fee {
    pub fn new(currency: impl Into<String>, cost: Decimal) -> Self {
        Self {
            currency: currency.into().to_uppercase(),
            cost,
            rate: None,
        }
    }
}

/// 거래소가 보고한 주문.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// 거래소 주문 ID
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatusType,
    /// 지정가 (시장가 주문은 없음)
    pub price: Option<Price>,
    /// 주문 수량
    pub amount: Option<Quantity>,
    /// 체결 수량
    pub filled: Option<Quantity>,
    /// 평균 체결가
    pub average: Option<Price>,
    /// 주문 생성 시각
    pub timestamp: Option<DateTime<Utc>>,
    /// 단일 통화 수수료
    pub fee: Option<Fee>,
    /// 여러 통화로 부과된 수수료
    #[serde(default)]
    pub fees: Vec<Fee>,
    /// 이 주문에 속한 체결 목록
    #[serde(default)]
    pub trades: Vec<TradeTick>,
}

impl Order {
    /// 필수 필드만 채운 주문을 생성합니다.
    pub fn new(
        id: impl Into<String>,
        symbol: Symbol,
        side: Side,
        order_type: OrderType,
        status: OrderStatusType,
    ) -> Self {
        Self {
            id: id.into(),
            client_order_id: None,
            symbol,
            side,
            order_type,
            status,
            price: None,
            amount: None,
            filled: None,
            average: None,
            timestamp: None,
            fee: None,
            fees: Vec::new(),
            trades: Vec::new(),
        }
    }

    /// 남은 수량.
    pub fn remaining(&self) -> Option<Quantity> {
        Some(self.amount? - self.filled.unwrap_or_default())
    }
}
