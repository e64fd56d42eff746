//! 파생상품 포지션 타입.

use crate::types::{Price, Quantity, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 포지션 방향.
///
/// 헤지 모드 거래소는 같은 심볼에 대해 롱/숏을 따로 보고합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
    /// 단방향 모드
    Both,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
            PositionSide::Both => write!(f, "both"),
        }
    }
}

/// 거래소가 보고한 포지션.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub side: PositionSide,
    /// 계약 수량 (0이면 청산된 포지션)
    pub contracts: Quantity,
    pub entry_price: Option<Price>,
    pub mark_price: Option<Price>,
    pub unrealized_pnl: Option<Decimal>,
    pub leverage: Option<Decimal>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Position {
    pub fn new(symbol: Symbol, side: PositionSide, contracts: Quantity) -> Self {
        Self {
            symbol,
            side,
            contracts,
            entry_price: None,
            mark_price: None,
            unrealized_pnl: None,
            leverage: None,
            timestamp: None,
        }
    }

    /// 포지션이 열려 있는지 확인합니다.
    pub fn is_open(&self) -> bool {
        !self.contracts.is_zero()
    }

    /// 명목 가치 (계약 수 × 마크 가격).
    pub fn notional(&self) -> Option<Decimal> {
        self.mark_price.map(|p| p * self.contracts.abs())
    }
}
