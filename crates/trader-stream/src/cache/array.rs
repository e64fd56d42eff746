//! 추가 전용 링 버퍼 캐시.

use std::collections::VecDeque;

use trader_core::Symbol;

use super::tracker::UpdateTracker;
use super::{check_capacity, CacheItem, Insertion};
use crate::error::StreamResult;

/// 추가 전용 캐시 (공개 체결 등).
///
/// 최대 `capacity`개를 보관하며 가득 차면 가장 오래된 항목을 버립니다.
/// 순회 순서는 오래된 것부터 최신 순입니다.
#[derive(Debug)]
pub struct ArrayCache<T> {
    items: VecDeque<T>,
    capacity: usize,
    updates: UpdateTracker<()>,
}

impl<T: CacheItem> ArrayCache<T> {
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
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.updates.record(item.symbol(), None);
        self.items.push_back(item);
        Insertion::Appended
    }

    /// 마지막 읽기 이후 새 항목 수를 기준으로 반환 개수를 정합니다.
    pub fn get_limit(&mut self, symbol: Option<&Symbol>, limit: Option<usize>) -> Option<usize> {
        self.updates.get_limit(symbol, limit)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.updates.reset();
    }
}

impl<T: CacheItem + Clone> ArrayCache<T> {
    /// 최신 `n`개를 오래된 순서로 복사해 반환합니다.
    pub fn limit(&self, n: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip).cloned().collect()
    }
}
