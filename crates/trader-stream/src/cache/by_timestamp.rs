//! 캔들 버킷 캐시.

use std::collections::VecDeque;

use trader_core::Symbol;

use super::tracker::UpdateTracker;
use super::{check_capacity, CacheItem, Insertion, Timestamped};
use crate::error::StreamResult;

/// 시작 시각 버킷으로 갱신되는 캐시 (OHLCV).
///
/// - 기존 버킷과 같은 시각: 그 버킷을 교체
/// - 마지막 버킷보다 나중 시각: 추가
/// - 그보다 이른 새 시각: 무시
#[derive(Debug)]
pub struct ArrayCacheByTimestamp<T> {
    items: VecDeque<T>,
    capacity: usize,
    updates: UpdateTracker<i64>,
}

impl<T: CacheItem + Timestamped> ArrayCacheByTimestamp<T> {
    /// 용량이 0이면 설정 에러를 반환합니다.
    pub fn new(capacity: usize) -> StreamResult<Self> {
        check_capacity(capacity)?;
        Ok(Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            updates: UpdateTracker::default(),
        })
    }

    pub fn append(&mut self, item: T) -> Insertion {
        let bucket = item.bucket();
        let symbol = item.symbol().clone();

        let outcome = match self.items.back().map(Timestamped::bucket) {
            Some(last) if bucket == last => {
                if let Some(slot) = self.items.back_mut() {
                    *slot = item;
                }
                Insertion::Replaced
            }
            Some(last) if bucket < last => {
                // 이미 버퍼에 있는 과거 버킷이면 교체, 아니면 무시
                match self.items.iter().position(|c| c.bucket() == bucket) {
                    Some(pos) => {
                        self.items[pos] = item;
                        Insertion::Replaced
                    }
                    None => return Insertion::Ignored,
                }
            }
            _ => {
                if self.items.len() == self.capacity {
                    self.items.pop_front();
                }
                self.items.push_back(item);
                Insertion::Appended
            }
        };

        self.updates.record(&symbol, Some(bucket));
        outcome
    }

    pub fn get_limit(&mut self, symbol: Option<&Symbol>, limit: Option<usize>) -> Option<usize> {
        self.updates.get_limit(symbol, limit)
    }

    /// 가장 최근 버킷.
    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T: CacheItem + Timestamped + Clone> ArrayCacheByTimestamp<T> {
    /// 최신 `n`개 버킷을 시간 순으로 반환합니다.
    pub fn limit(&self, n: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip).cloned().collect()
    }
}
