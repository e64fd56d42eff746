//! 호가창 한쪽 (매수 또는 매도).

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use trader_core::OrderBookLevel;

/// 가격 정렬된 호가 레벨 집합.
///
/// 매수 쪽은 가격 내림차순, 매도 쪽은 오름차순으로 노출됩니다.
#[derive(Debug, Clone, PartialEq)]
pub struct BookSide {
    levels: BTreeMap<Decimal, Decimal>,
    descending: bool,
}

impl BookSide {
    pub fn bids() -> Self {
        Self {
            levels: BTreeMap::new(),
            descending: true,
        }
    }

    pub fn asks() -> Self {
        Self {
            levels: BTreeMap::new(),
            descending: false,
        }
    }

    /// 가격 레벨을 저장합니다. 수량이 0이면 레벨을 삭제합니다.
    pub fn store(&mut self, price: Decimal, amount: Decimal) {
        // 같은 가격이라도 수신한 자릿수를 유지하도록 키를 다시 넣음
        self.levels.remove(&price);
        if !amount.is_zero() {
            self.levels.insert(price, amount);
        }
    }

    pub fn remove(&mut self, price: Decimal) -> Option<Decimal> {
        self.levels.remove(&price)
    }

    /// 최우선 호가.
    pub fn best(&self) -> Option<OrderBookLevel> {
        let entry = if self.descending {
            self.levels.iter().next_back()
        } else {
            self.levels.iter().next()
        };
        entry.map(|(p, q)| OrderBookLevel::new(*p, *q))
    }

    /// 최우선부터 `limit`개 레벨을 반환합니다.
    pub fn levels(&self, limit: Option<usize>) -> Vec<OrderBookLevel> {
        let take = limit.unwrap_or(usize::MAX);
        let to_level = |(p, q): (&Decimal, &Decimal)| OrderBookLevel::new(*p, *q);
        if self.descending {
            self.levels.iter().rev().take(take).map(to_level).collect()
        } else {
            self.levels.iter().take(take).map(to_level).collect()
        }
    }

    /// 최우선부터 `depth`개만 남기고 나머지를 버립니다.
    pub fn truncate(&mut self, depth: usize) {
        while self.levels.len() > depth {
            if self.descending {
                self.levels.pop_first();
            } else {
                self.levels.pop_last();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn clear(&mut self) {
        self.levels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_bids_sorted_descending() {
        let mut bids = BookSide::bids();
        bids.store(dec!(100), dec!(1));
        bids.store(dec!(102), dec!(2));
        bids.store(dec!(101), dec!(3));

        let prices: Vec<_> = bids.levels(None).iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![dec!(102), dec!(101), dec!(100)]);
        assert_eq!(bids.best().unwrap().price, dec!(102));
    }

    #[test]
    fn test_asks_sorted_ascending() {
        let mut asks = BookSide::asks();
        asks.store(dec!(103), dec!(1));
        asks.store(dec!(101), dec!(1));
        assert_eq!(asks.best().unwrap().price, dec!(101));
        assert_eq!(asks.levels(Some(1)).len(), 1);
    }

    #[test]
    fn test_zero_amount_removes() {
        let mut asks = BookSide::asks();
        asks.store(dec!(101), dec!(1));
        asks.store(dec!(101), dec!(0));
        assert!(asks.is_empty());
        // 없는 레벨 삭제는 무시
        asks.store(dec!(105), dec!(0));
        assert!(asks.is_empty());
    }

    #[test]
    fn test_truncate_keeps_best() {
        let mut bids = BookSide::bids();
        for p in [dec!(1), dec!(2), dec!(3), dec!(4)] {
            bids.store(p, dec!(1));
        }
        bids.truncate(2);
        let prices: Vec<_> = bids.levels(None).iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![dec!(4), dec!(3)]);

        let mut asks = BookSide::asks();
        for p in [dec!(1), dec!(2), dec!(3)] {
            asks.store(p, dec!(1));
        }
        asks.truncate(1);
        assert_eq!(asks.best().unwrap().price, dec!(1));
        assert_eq!(asks.len(), 1);
    }

    #[test]
    fn test_store_refreshes_scale() {
        let mut asks = BookSide::asks();
        asks.store(dec!(1.5), dec!(1));
        asks.store(dec!(1.50), dec!(2));
        let level = asks.best().unwrap();
        assert_eq!(level.price.to_string(), "1.50");
        assert_eq!(level.quantity, dec!(2));
    }
}
