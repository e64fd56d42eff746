//! 심볼 및 시장 유형 정의.
//!
//! 이 모듈은 트레이딩 심볼 관련 타입을 정의합니다:
//! - `MarketType` - 시장 유형 (현물, 무기한 스왑, 만기 선물 등)
//! - `Symbol` - 거래소 중립적인 통합 심볼 (`BASE/QUOTE` 또는 `BASE/QUOTE:SETTLE`)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TraderError;

/// 시장 유형 분류.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    /// 현물 시장
    Spot,
    /// 마진 시장
    Margin,
    /// 무기한 스왑
    Swap,
    /// 만기 선물
    Future,
}

impl MarketType {
    /// 파생상품 시장인지 확인합니다.
    pub fn is_contract(&self) -> bool {
        matches!(self, MarketType::Swap | MarketType::Future)
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketType::Spot => write!(f, "spot"),
            MarketType::Margin => write!(f, "margin"),
            MarketType::Swap => write!(f, "swap"),
            MarketType::Future => write!(f, "future"),
        }
    }
}

/// 거래 가능한 상품을 나타내는 통합 심볼.
///
/// 기준 자산, 호가 자산, (파생상품의 경우) 정산 자산으로 구성됩니다.
/// 예: 현물 `BTC/USDT`, 무기한 스왑 `BTC/USDT:USDT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    /// 기준 자산 (예: BTC)
    pub base: String,
    /// 호가 자산 (예: USDT)
    pub quote: String,
    /// 정산 자산 (파생상품만)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settle: Option<String>,
    /// 시장 유형
    pub market_type: MarketType,
}

impl Symbol {
    /// 새 심볼을 생성합니다.
    pub fn new(base: impl Into<String>, quote: impl Into<String>, market_type: MarketType) -> Self {
        Self {
            base: base.into().to_uppercase(),
            quote: quote.into().to_uppercase(),
            settle: None,
            market_type,
        }
    }

    /// 현물 심볼을 생성합니다.
    pub fn spot(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self::new(base, quote, MarketType::Spot)
    }

    /// 무기한 스왑 심볼을 생성합니다.
    pub fn swap(
        base: impl Into<String>,
        quote: impl Into<String>,
        settle: impl Into<String>,
    ) -> Self {
        Self {
            settle: Some(settle.into().to_uppercase()),
            ..Self::new(base, quote, MarketType::Swap)
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.settle {
            Some(settle) => write!(f, "{}/{}:{}", self.base, self.quote, settle),
            None => write!(f, "{}/{}", self.base, self.quote),
        }
    }
}

impl FromStr for Symbol {
    type Err = TraderError;

    /// `BASE/QUOTE` 또는 `BASE/QUOTE:SETTLE` 형식을 파싱합니다.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pair, settle) = match s.split_once(':') {
            Some((pair, settle)) => (pair, Some(settle)),
            None => (s, None),
        };

        let (base, quote) = pair
            .split_once('/')
            .filter(|(b, q)| !b.is_empty() && !q.is_empty())
            .ok_or_else(|| TraderError::InvalidInput(format!("잘못된 심볼 형식: {}", s)))?;

        match settle {
            Some(settle) if !settle.is_empty() => Ok(Symbol::swap(base, quote, settle)),
            Some(_) => Err(TraderError::InvalidInput(format!("정산 자산 누락: {}", s))),
            None => Ok(Symbol::spot(base, quote)),
        }
    }
}
