//! 연결 하나가 관리하는 호가창 모음.

use std::collections::HashMap;

use trader_core::Symbol;

use super::book::{BookConfig, LocalOrderBook};

/// 심볼 → 로컬 호가창.
#[derive(Debug, Default)]
pub struct OrderBookStore {
    books: HashMap<Symbol, LocalOrderBook>,
    buffer_limit: usize,
}

impl OrderBookStore {
    /// `buffer_limit`은 스냅샷 전에 보관할 델타 수 상한입니다.
    pub fn new(buffer_limit: usize) -> Self {
        Self {
            books: HashMap::new(),
            buffer_limit,
        }
    }

    /// 심볼의 호가창을 반환하고, 없으면 `config`로 새로 만듭니다.
    pub fn get_or_create(
        &mut self,
        symbol: &Symbol,
        config: impl FnOnce() -> BookConfig,
    ) -> &mut LocalOrderBook {
        let buffer_limit = self.buffer_limit;
        self.books
            .entry(symbol.clone())
            .or_insert_with(|| LocalOrderBook::new(symbol.clone(), config(), buffer_limit))
    }

    pub fn get(&self, symbol: &Symbol) -> Option<&LocalOrderBook> {
        self.books.get(symbol)
    }

    pub fn get_mut(&mut self, symbol: &Symbol) -> Option<&mut LocalOrderBook> {
        self.books.get_mut(symbol)
    }

    pub fn remove(&mut self, symbol: &Symbol) -> Option<LocalOrderBook> {
        self.books.remove(symbol)
    }

    /// 모든 호가창을 폐기하고 폐기된 개수를 반환합니다.
    pub fn clear(&mut self) -> usize {
        let n = self.books.len();
        self.books.clear();
        n
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.books.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}
