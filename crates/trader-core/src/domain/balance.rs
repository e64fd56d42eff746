//! 계정 잔고 타입.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 단일 자산 잔고.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    /// 사용 가능 수량
    pub free: Decimal,
    /// 주문 등에 묶인 수량
    pub locked: Decimal,
}

impl Balance {
    pub fn new(asset: impl Into<String>, free: Decimal, locked: Decimal) -> Self {
        Self {
            asset: asset.into().to_uppercase(),
            free,
            locked,
        }
    }

    /// 총 잔고.
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

/// 계정 전체 잔고 스냅샷.
///
/// 부분 업데이트는 `apply`로 병합됩니다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Balances {
    pub assets: BTreeMap<String, Balance>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Balances {
    /// 자산별 업데이트를 병합합니다.
    pub fn apply(&mut self, updates: impl IntoIterator<Item = Balance>, timestamp: Option<DateTime<Utc>>) {
        for balance in updates {
            self.assets.insert(balance.asset.clone(), balance);
        }
        if timestamp.is_some() {
            self.timestamp = timestamp;
        }
    }

    pub fn get(&self, asset: &str) -> Option<&Balance> {
        self.assets.get(&asset.to_uppercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_balances_apply() {
        let mut balances = Balances::default();
        balances.apply(
            vec![
                Balance::new("usdt", dec!(100), dec!(0)),
                Balance::new("BTC", dec!(1), dec!(0.5)),
            ],
            None,
        );
        balances.apply(vec![Balance::new("USDT", dec!(80), dec!(20))], None);

        assert_eq!(balances.assets.len(), 2);
        assert_eq!(balances.get("usdt").unwrap().total(), dec!(100));
        assert_eq!(balances.get("BTC").unwrap().total(), dec!(1.5));
    }
}
