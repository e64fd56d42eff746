//! `watch*` API를 받치는 고정 용량 캐시.
//!
//! 캐시 종류별 갱신 규칙:
//! - [`ArrayCache`]: 추가 전용 (공개 체결)
//! - [`ArrayCacheById`]: `(심볼, id)` 기준 교체 (주문, 내 체결)
//! - [`ArrayCacheByTimestamp`]: 캔들 시작 시각 기준 교체 (OHLCV)
//! - [`ArrayCacheBySide`]: `(심볼, 방향)` 기준 교체 (포지션)
//!
//! 모든 캐시는 가득 차면 가장 오래된 항목부터 버리고,
//! `get_limit`으로 마지막 읽기 이후 새로 들어온 항목 수를 알려줍니다.

mod array;
mod by_timestamp;
mod keyed;
mod merge;
mod tracker;

pub use array::ArrayCache;
pub use by_timestamp::ArrayCacheByTimestamp;
pub use keyed::{ArrayCacheById, ArrayCacheBySide};
pub use merge::{fold_trade_into_order, merge_order};

use trader_core::{Kline, Order, Position, PositionSide, Symbol, TradeTick};

use crate::error::{StreamError, StreamResult};

/// 캐시에 저장할 수 있는 항목.
pub trait CacheItem {
    fn symbol(&self) -> &Symbol;
}

/// 거래소가 부여한 식별자를 가진 항목.
pub trait Identified {
    fn id(&self) -> &str;
}

/// 캔들 시작 시각(ms)을 가진 항목.
pub trait Timestamped {
    fn bucket(&self) -> i64;
}

/// 포지션 방향을 가진 항목.
pub trait Sided {
    fn side(&self) -> PositionSide;
}

/// `append` 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    /// 새 항목으로 추가됨
    Appended,
    /// 기존 항목을 교체함
    Replaced,
    /// 과거 데이터라 버려짐
    Ignored,
}

fn check_capacity(capacity: usize) -> StreamResult<()> {
    if capacity == 0 {
        return Err(StreamError::Config(
            "cache capacity must be positive".to_string(),
        ));
    }
    Ok(())
}

impl CacheItem for TradeTick {
    fn symbol(&self) -> &Symbol {
        &self.symbol
    }
}

impl Identified for TradeTick {
    fn id(&self) -> &str {
        &self.id
    }
}

impl CacheItem for Order {
    fn symbol(&self) -> &Symbol {
        &self.symbol
    }
}

impl Identified for Order {
    fn id(&self) -> &str {
        &self.id
    }
}

impl CacheItem for Kline {
    fn symbol(&self) -> &Symbol {
        &self.symbol
    }
}

impl Timestamped for Kline {
    fn bucket(&self) -> i64 {
        self.open_time.timestamp_millis()
    }
}

impl CacheItem for Position {
    fn symbol(&self) -> &Symbol {
        &self.symbol
    }
}

impl Sided for Position {
    fn side(&self) -> PositionSide {
        self.side
    }
}
