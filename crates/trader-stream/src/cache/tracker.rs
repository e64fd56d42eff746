//! 캐시별 "새 업데이트" 집계.
//!
//! `watch*` 호출은 마지막 읽기 이후 도착한 항목 수만큼만 돌려줍니다.
//! 읽기(`get_limit`)는 카운터를 즉시 지우지 않고 표시만 해 두며,
//! 다음 `record` 때 초기화됩니다. 따라서 업데이트 없이 두 번 읽으면
//! 같은 값을 얻습니다.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use trader_core::Symbol;

#[derive(Debug)]
struct SymbolUpdates<K> {
    count: usize,
    seen: HashSet<K>,
    stale: bool,
}

impl<K> Default for SymbolUpdates<K> {
    fn default() -> Self {
        Self {
            count: 0,
            seen: HashSet::new(),
            stale: false,
        }
    }
}

#[derive(Debug)]
pub(crate) struct UpdateTracker<K> {
    all: usize,
    clear_all: bool,
    by_symbol: HashMap<Symbol, SymbolUpdates<K>>,
}

impl<K> Default for UpdateTracker<K> {
    fn default() -> Self {
        Self {
            all: 0,
            clear_all: false,
            by_symbol: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash> UpdateTracker<K> {
    /// 업데이트를 기록합니다.
    ///
    /// `key`가 주어지면 같은 읽기 구간 안에서 같은 키는 한 번만 셉니다.
    pub(crate) fn record(&mut self, symbol: &Symbol, key: Option<K>) {
        if self.clear_all {
            self.clear_all = false;
            self.all = 0;
            self.by_symbol.clear();
        }

        let entry = self.by_symbol.entry(symbol.clone()).or_default();
        if entry.stale {
            entry.stale = false;
            entry.count = 0;
            entry.seen.clear();
        }

        let fresh = match key {
            Some(k) => entry.seen.insert(k),
            None => true,
        };
        if fresh {
            entry.count += 1;
            self.all += 1;
        }
    }

    /// 마지막 읽기 이후의 업데이트 수와 요청 한도 중 작은 값.
    ///
    /// 집계된 값이 없으면 요청 한도를 그대로 돌려줍니다.
    pub(crate) fn get_limit(&mut self, symbol: Option<&Symbol>, limit: Option<usize>) -> Option<usize> {
        let counted = match symbol {
            None => {
                self.clear_all = true;
                Some(self.all)
            }
            Some(symbol) => self.by_symbol.get_mut(symbol).map(|e| {
                e.stale = true;
                e.count
            }),
        };

        match (counted, limit) {
            (None, limit) => limit,
            (Some(c), Some(l)) => Some(c.min(l)),
            (Some(c), None) => Some(c),
        }
    }

    pub(crate) fn forget(&mut self, symbol: &Symbol) {
        if let Some(e) = self.by_symbol.remove(symbol) {
            if !e.stale {
                self.all = self.all.saturating_sub(e.count);
            }
        }
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}
