//! 가격/수량 표현을 위한 Decimal 별칭.

use rust_decimal::Decimal;
use std::str::FromStr;

use crate::error::{TraderError, TraderResult};

/// 가격 타입.
pub type Price = Decimal;

/// 수량 타입.
pub type Quantity = Decimal;

/// 거래소가 문자열로 보낸 숫자를 Decimal로 파싱합니다.
///
/// `1e-5` 같은 지수 표기도 허용합니다.
pub fn parse_decimal(raw: &str) -> TraderResult<Decimal> {
    let raw = raw.trim();
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|_| TraderError::InvalidInput(format!("숫자 형식 아님: {}", raw)))
}
