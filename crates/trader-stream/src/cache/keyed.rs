//! 식별자 기반 갱신 캐시.
//!
//! 같은 키의 항목이 다시 들어오면 기존 슬롯을 제자리에서 교체합니다.
//! 교체는 축출 순서를 바꾸지 않지만, `limit`은 마지막 갱신 순서로
//! 정렬해 교체된 항목을 최신으로 취급합니다.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use trader_core::{PositionSide, Symbol};

use super::tracker::UpdateTracker;
use super::{check_capacity, CacheItem, Identified, Insertion, Sided};
use crate::error::StreamResult;

#[derive(Debug)]
struct Entry<T> {
    item: T,
    touched: u64,
}

/// `(심볼, K)` 키로 색인되는 고정 용량 저장소.
struct KeyedStore<T, K> {
    entries: VecDeque<Entry<T>>,
    /// 키 → 삽입 일련번호. 위치는 `serial - front`.
    index: HashMap<(Symbol, K), u64>,
    front: u64,
    clock: u64,
    capacity: usize,
    key_of: fn(&T) -> K,
    updates: UpdateTracker<K>,
}

impl<T: CacheItem, K: Eq + Hash + Clone> KeyedStore<T, K> {
    fn new(capacity: usize, key_of: fn(&T) -> K) -> StreamResult<Self> {
        check_capacity(capacity)?;
        Ok(Self {
            entries: VecDeque::with_capacity(capacity),
            index: HashMap::new(),
            front: 0,
            clock: 0,
            capacity,
            key_of,
            updates: UpdateTracker::default(),
        })
    }

    fn full_key(&self, item: &T) -> (Symbol, K) {
        (item.symbol().clone(), (self.key_of)(item))
    }

    fn position(&self, key: &(Symbol, K)) -> Option<usize> {
        self.index.get(key).map(|serial| (serial - self.front) as usize)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn insert(&mut self, item: T) -> Insertion {
        let key = self.full_key(&item);
        self.updates.record(&key.0, Some(key.1.clone()));
        let touched = self.tick();

        if let Some(pos) = self.position(&key) {
            self.entries[pos] = Entry { item, touched };
            return Insertion::Replaced;
        }

        if self.entries.len() == self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                let evicted_key = self.full_key(&evicted.item);
                self.index.remove(&evicted_key);
                self.front += 1;
            }
        }

        let serial = self.front + self.entries.len() as u64;
        self.index.insert(key, serial);
        self.entries.push_back(Entry { item, touched });
        Insertion::Appended
    }

    /// 존재하는 항목만 교체하며 새 업데이트로 세지 않습니다.
    fn patch(&mut self, item: T) -> bool {
        let key = self.full_key(&item);
        match self.position(&key) {
            Some(pos) => {
                self.entries[pos].item = item;
                true
            }
            None => false,
        }
    }

    fn get(&self, symbol: &Symbol, key: K) -> Option<&T> {
        self.position(&(symbol.clone(), key))
            .map(|pos| &self.entries[pos].item)
    }

    fn remove_symbol(&mut self, symbol: &Symbol) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.item.symbol() != symbol);
        self.front = 0;
        self.index.clear();
        for (i, entry) in self.entries.iter().enumerate() {
            let key = (entry.item.symbol().clone(), (self.key_of)(&entry.item));
            self.index.insert(key, i as u64);
        }
        self.updates.forget(symbol);
        before - self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.front = 0;
        self.updates.reset();
    }
}

impl<T: CacheItem + Clone, K: Eq + Hash + Clone> KeyedStore<T, K> {
    fn latest(&self, symbol: Option<&Symbol>, n: Option<usize>) -> Vec<T> {
        let mut picked: Vec<&Entry<T>> = self
            .entries
            .iter()
            .filter(|e| symbol.map_or(true, |s| e.item.symbol() == s))
            .collect();
        picked.sort_by_key(|e| e.touched);
        let skip = n.map_or(0, |n| picked.len().saturating_sub(n));
        picked.into_iter().skip(skip).map(|e| e.item.clone()).collect()
    }
}

macro_rules! delegate_keyed {
    ($name:ident, $bound:ident) => {
        impl<T: CacheItem + $bound> $name<T> {
            /// 용량이 0이면 설정 에러를 반환합니다.
            pub fn new(capacity: usize) -> StreamResult<Self> {
                Ok(Self(KeyedStore::new(capacity, Self::key_of)?))
            }

            /// 새 항목이면 추가하고, 같은 키가 있으면 제자리에서 교체합니다.
            pub fn append(&mut self, item: T) -> Insertion {
                self.0.insert(item)
            }

            /// 이미 있는 항목만 교체합니다. 새 업데이트 집계에 포함되지 않습니다.
            pub fn patch(&mut self, item: T) -> bool {
                self.0.patch(item)
            }

            pub fn get_limit(
                &mut self,
                symbol: Option<&Symbol>,
                limit: Option<usize>,
            ) -> Option<usize> {
                self.0.updates.get_limit(symbol, limit)
            }

            /// 심볼의 모든 항목을 제거하고 제거된 개수를 반환합니다.
            pub fn remove_symbol(&mut self, symbol: &Symbol) -> usize {
                self.0.remove_symbol(symbol)
            }

            pub fn len(&self) -> usize {
                self.0.entries.len()
            }

            pub fn is_empty(&self) -> bool {
                self.0.entries.is_empty()
            }

            pub fn capacity(&self) -> usize {
                self.0.capacity
            }

            /// 축출 순서(삽입 순)로 순회합니다.
            pub fn iter(&self) -> impl Iterator<Item = &T> {
                self.0.entries.iter().map(|e| &e.item)
            }

            pub fn clear(&mut self) {
                self.0.clear()
            }
        }

        impl<T: CacheItem + $bound + Clone> $name<T> {
            /// 최근 갱신된 `n`개를 갱신 순서로 반환합니다.
            pub fn limit(&self, n: usize) -> Vec<T> {
                self.0.latest(None, Some(n))
            }

            /// 심볼로 거른 뒤 최근 갱신된 `limit`개를 반환합니다.
            pub fn snapshot(&self, symbol: Option<&Symbol>, limit: Option<usize>) -> Vec<T> {
                self.0.latest(symbol, limit)
            }
        }
    };
}

/// `(심볼, id)`로 갱신되는 캐시 (주문, 내 체결).
pub struct ArrayCacheById<T>(KeyedStore<T, String>);

impl<T: CacheItem + Identified> ArrayCacheById<T> {
    fn key_of(item: &T) -> String {
        item.id().to_string()
    }

    pub fn get(&self, symbol: &Symbol, id: &str) -> Option<&T> {
        self.0.get(symbol, id.to_string())
    }
}

delegate_keyed!(ArrayCacheById, Identified);

/// `(심볼, 방향)`으로 갱신되는 캐시 (포지션).
pub struct ArrayCacheBySide<T>(KeyedStore<T, PositionSide>);

impl<T: CacheItem + Sided> ArrayCacheBySide<T> {
    fn key_of(item: &T) -> PositionSide {
        item.side()
    }

    pub fn get(&self, symbol: &Symbol, side: PositionSide) -> Option<&T> {
        self.0.get(symbol, side)
    }
}

delegate_keyed!(ArrayCacheBySide, Sided);

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use trader_core::{Order, OrderStatusType, OrderType, Position, Side};

    fn order(symbol: &str, id: &str, status: OrderStatusType) -> Order {
        Order::new(
            id,
            symbol.parse().unwrap(),
            Side::Buy,
            OrderType::Limit,
            status,
        )
    }

    #[test]
    fn test_identity_update_keeps_length() {
        let mut cache = ArrayCacheById::new(10).unwrap();
        cache.append(order("BTC/USDT", "1", OrderStatusType::Open));
        cache.append(order("BTC/USDT", "2", OrderStatusType::Open));
        let outcome = cache.append(order("BTC/USDT", "1", OrderStatusType::Filled));

        assert_eq!(outcome, Insertion::Replaced);
        assert_eq!(cache.len(), 2);
        let btc: Symbol = "BTC/USDT".parse().unwrap();
        assert_eq!(cache.get(&btc, "1").unwrap().status, OrderStatusType::Filled);

        // 축출 순서는 그대로, 소비자 관점에서는 최신
        let order_ids: Vec<_> = cache.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(order_ids, vec!["1", "2"]);
        let latest: Vec<_> = cache.limit(2).into_iter().map(|o| o.id).collect();
        assert_eq!(latest, vec!["2", "1"]);
    }

    #[test]
    fn test_same_id_different_symbol_is_distinct() {
        let mut cache = ArrayCacheById::new(10).unwrap();
        cache.append(order("BTC/USDT", "1", OrderStatusType::Open));
        cache.append(order("ETH/USDT", "1", OrderStatusType::Open));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_eviction_keeps_index_consistent() {
        let mut cache = ArrayCacheById::new(2).unwrap();
        cache.append(order("BTC/USDT", "1", OrderStatusType::Open));
        cache.append(order("BTC/USDT", "2", OrderStatusType::Open));
        cache.append(order("BTC/USDT", "3", OrderStatusType::Open));

        let btc: Symbol = "BTC/USDT".parse().unwrap();
        assert!(cache.get(&btc, "1").is_none());

        cache.append(order("BTC/USDT", "2", OrderStatusType::Cancelled));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&btc, "2").unwrap().status, OrderStatusType::Cancelled);
        assert_eq!(cache.get(&btc, "3").unwrap().status, OrderStatusType::Open);
    }

    #[test]
    fn test_get_limit_counts_distinct_ids() {
        let btc: Symbol = "BTC/USDT".parse().unwrap();
        let mut cache = ArrayCacheById::new(10).unwrap();
        cache.append(order("BTC/USDT", "1", OrderStatusType::Open));
        cache.append(order("BTC/USDT", "1", OrderStatusType::PartiallyFilled));
        cache.append(order("BTC/USDT", "2", OrderStatusType::Open));
        assert_eq!(cache.get_limit(Some(&btc), None), Some(2));
    }

    #[test]
    fn test_patch_does_not_count() {
        let btc: Symbol = "BTC/USDT".parse().unwrap();
        let mut cache = ArrayCacheById::new(10).unwrap();
        cache.append(order("BTC/USDT", "1", OrderStatusType::Open));
        assert_eq!(cache.get_limit(Some(&btc), None), Some(1));

        assert!(cache.patch(order("BTC/USDT", "1", OrderStatusType::Filled)));
        assert!(!cache.patch(order("BTC/USDT", "9", OrderStatusType::Filled)));
        assert_eq!(cache.get_limit(Some(&btc), None), Some(1));
        assert_eq!(cache.get(&btc, "1").unwrap().status, OrderStatusType::Filled);
    }

    #[test]
    fn test_remove_symbol() {
        let mut cache = ArrayCacheById::new(10).unwrap();
        cache.append(order("BTC/USDT", "1", OrderStatusType::Open));
        cache.append(order("ETH/USDT", "2", OrderStatusType::Open));
        cache.append(order("BTC/USDT", "3", OrderStatusType::Open));

        let btc: Symbol = "BTC/USDT".parse().unwrap();
        let eth: Symbol = "ETH/USDT".parse().unwrap();
        assert_eq!(cache.remove_symbol(&btc), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&eth, "2").is_some());

        cache.append(order("ETH/USDT", "2", OrderStatusType::Filled));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_positions_by_side() {
        let sym = Symbol::swap("BTC", "USDT", "USDT");
        let mut cache = ArrayCacheBySide::new(10).unwrap();
        cache.append(Position::new(sym.clone(), PositionSide::Long, dec!(1)));
        cache.append(Position::new(sym.clone(), PositionSide::Short, dec!(2)));
        cache.append(Position::new(sym.clone(), PositionSide::Long, dec!(3)));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&sym, PositionSide::Long).unwrap().contracts, dec!(3));
        assert_eq!(cache.snapshot(Some(&sym), Some(1))[0].side, PositionSide::Long);
    }
}
