//! 심볼 하나의 로컬 호가창 동기화 상태 머신.
//!
//! ```text
//! Uninitialized --reset--> Synced --연속 델타--> Synced
//!                           |
//!                           +--시퀀스 누락/체크섬 불일치--> Desynced --reset--> Synced
//! ```

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use trader_core::{OrderBook, OrderBookLevel, Symbol};

use super::side::BookSide;
use crate::checksum::{compute_checksum, ChecksumConfig};
use crate::error::{StreamError, StreamResult};

/// 동기화 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// 스냅샷 대기 중
    Uninitialized,
    /// 스냅샷과 연속 델타가 적용된 상태
    Synced,
    /// 누락 또는 무결성 오류로 폐기됨. 새 스냅샷 필요
    Desynced,
}

/// 델타 시퀀스 검증 규칙.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceRule {
    /// 검증하지 않음 (체크섬으로만 검증하는 거래소)
    #[default]
    None,
    /// 델타가 `[first, last]` 구간을 가짐. 다음 델타는 `first == nonce + 1`
    Span,
    /// 델타가 직전 시퀀스(`prev`)를 가짐. 다음 델타는 `prev == nonce`
    Linked,
}

/// 심볼별 호가창 파라미터.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookConfig {
    pub sequence: SequenceRule,
    pub checksum: Option<ChecksumConfig>,
    /// 저장 레벨 상한 (체크섬 깊이 이상이어야 함)
    pub max_depth: Option<usize>,
}

/// 전체 호가 스냅샷.
#[derive(Debug, Clone, PartialEq)]
pub struct BookSnapshot {
    pub symbol: Symbol,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    pub nonce: Option<u64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub checksum: Option<i64>,
}

/// 증분 호가 업데이트. 수량 0은 해당 가격 삭제.
#[derive(Debug, Clone, PartialEq)]
pub struct BookDelta {
    pub symbol: Symbol,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    /// 이 델타가 덮는 첫 시퀀스
    pub first: Option<u64>,
    /// 이 델타가 덮는 마지막 시퀀스
    pub last: Option<u64>,
    /// 직전 델타의 마지막 시퀀스
    pub prev: Option<u64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub checksum: Option<i64>,
}

/// `apply_delta` 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Applied,
    /// 스냅샷 전이라 버퍼에 보관
    Buffered,
    /// 이미 반영된 시퀀스
    Stale,
    /// 기준 스냅샷이 없어 버림
    Dropped,
}

/// 로컬 호가창.
#[derive(Debug, Clone)]
pub struct LocalOrderBook {
    symbol: Symbol,
    bids: BookSide,
    asks: BookSide,
    nonce: Option<u64>,
    timestamp: Option<DateTime<Utc>>,
    state: SyncState,
    awaiting_first_delta: bool,
    buffer: VecDeque<BookDelta>,
    buffer_limit: usize,
    config: BookConfig,
}

impl LocalOrderBook {
    pub fn new(symbol: Symbol, config: BookConfig, buffer_limit: usize) -> Self {
        Self {
            symbol,
            bids: BookSide::bids(),
            asks: BookSide::asks(),
            nonce: None,
            timestamp: None,
            state: SyncState::Uninitialized,
            awaiting_first_delta: false,
            buffer: VecDeque::new(),
            buffer_limit,
            config,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn nonce(&self) -> Option<u64> {
        self.nonce
    }

    pub fn config(&self) -> &BookConfig {
        &self.config
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// 스냅샷으로 호가창을 통째로 교체하고 버퍼의 델타를 재생합니다.
    pub fn reset(&mut self, snapshot: BookSnapshot) -> StreamResult<()> {
        self.bids.clear();
        self.asks.clear();
        for level in &snapshot.bids {
            self.bids.store(level.price, level.quantity);
        }
        for level in &snapshot.asks {
            self.asks.store(level.price, level.quantity);
        }
        self.nonce = snapshot.nonce;
        self.timestamp = snapshot.timestamp;
        self.state = SyncState::Synced;
        self.awaiting_first_delta = true;
        self.enforce_depth();

        if let Some(expected) = snapshot.checksum {
            self.verify_checksum(expected)?;
        }

        let buffered: Vec<BookDelta> = self.buffer.drain(..).collect();
        let replayed = buffered.len();
        let mut pending = buffered.into_iter();
        while let Some(delta) = pending.next() {
            if let Err(e) = self.apply_synced(delta) {
                if matches!(e, StreamError::Desync(_)) {
                    self.buffer.extend(pending);
                }
                return Err(e);
            }
        }

        debug!(symbol = %self.symbol, nonce = ?self.nonce, replayed, "order book reset");
        Ok(())
    }

    /// 증분 업데이트를 적용합니다.
    ///
    /// 시퀀스 누락 시 호가창을 폐기하고 `Desync` 에러를 반환합니다.
    pub fn apply_delta(&mut self, delta: BookDelta) -> StreamResult<DeltaOutcome> {
        match self.state {
            SyncState::Synced => self.apply_synced(delta),
            SyncState::Uninitialized | SyncState::Desynced => {
                if self.config.sequence == SequenceRule::None {
                    return Ok(DeltaOutcome::Dropped);
                }
                if self.buffer.len() >= self.buffer_limit {
                    warn!(symbol = %self.symbol, limit = self.buffer_limit, "delta buffer full, dropping oldest");
                    self.buffer.pop_front();
                }
                self.buffer.push_back(delta);
                Ok(DeltaOutcome::Buffered)
            }
        }
    }

    fn apply_synced(&mut self, delta: BookDelta) -> StreamResult<DeltaOutcome> {
        match self.check_sequence(&delta) {
            Ok(true) => {}
            Ok(false) => return Ok(DeltaOutcome::Stale),
            Err(e @ StreamError::Desync(_)) => {
                // 누락을 드러낸 델타는 다음 스냅샷 뒤에 재생
                self.buffer.push_back(delta);
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        for level in &delta.bids {
            self.bids.store(level.price, level.quantity);
        }
        for level in &delta.asks {
            self.asks.store(level.price, level.quantity);
        }
        if delta.last.is_some() {
            self.nonce = delta.last;
        }
        if delta.timestamp.is_some() {
            self.timestamp = delta.timestamp;
        }
        self.awaiting_first_delta = false;
        self.enforce_depth();

        if let Some(expected) = delta.checksum {
            self.verify_checksum(expected)?;
        }
        Ok(DeltaOutcome::Applied)
    }

    /// 적용 가능하면 true, 이미 반영된 델타면 false.
    fn check_sequence(&mut self, delta: &BookDelta) -> StreamResult<bool> {
        let rule = self.config.sequence;
        if rule == SequenceRule::None {
            return Ok(true);
        }

        let last = delta.last.ok_or_else(|| {
            StreamError::Parse(format!("{} delta without sequence number", self.symbol))
        })?;
        let Some(nonce) = self.nonce else {
            return Ok(true);
        };

        let contiguous = match rule {
            SequenceRule::None => true,
            SequenceRule::Span => {
                if last <= nonce {
                    return Ok(false);
                }
                let first = delta.first.unwrap_or(last);
                match nonce.checked_add(1) {
                    Some(next) if self.awaiting_first_delta => first <= next && next <= last,
                    Some(next) => first == next,
                    None => false,
                }
            }
            SequenceRule::Linked => {
                if last < nonce {
                    return Ok(false);
                }
                let linked = delta.prev == Some(nonce);
                let spans = delta.first.is_some_and(|first| first <= nonce && nonce <= last);
                linked || (self.awaiting_first_delta && spans)
            }
        };

        if contiguous {
            return Ok(true);
        }

        let message = format!(
            "{} sequence gap: nonce {} then delta [{:?}, {}] prev {:?}",
            self.symbol, nonce, delta.first, last, delta.prev
        );
        warn!(symbol = %self.symbol, nonce, last, "order book desync");
        self.invalidate();
        Err(StreamError::Desync(message))
    }

    /// 현재 호가창의 체크섬을 서버 값과 비교합니다.
    ///
    /// 불일치하면 호가창을 폐기하고 `Checksum` 에러를 반환합니다.
    pub fn verify_checksum(&mut self, expected: i64) -> StreamResult<()> {
        let Some(config) = &self.config.checksum else {
            return Ok(());
        };

        let bids = self.bids.levels(Some(config.depth));
        let asks = self.asks.levels(Some(config.depth));
        let actual = compute_checksum(&bids, &asks, config);
        if actual == expected {
            return Ok(());
        }

        warn!(symbol = %self.symbol, expected, actual, "order book checksum mismatch");
        let message = format!("{} checksum {} != {}", self.symbol, actual, expected);
        self.invalidate();
        Err(StreamError::Checksum(message))
    }

    /// 상위 `limit`개 레벨만 담은 읽기 전용 뷰를 만듭니다.
    ///
    /// 저장된 레벨은 줄이지 않습니다.
    pub fn limit(&self, limit: Option<usize>) -> OrderBook {
        OrderBook {
            symbol: self.symbol.clone(),
            bids: self.bids.levels(limit),
            asks: self.asks.levels(limit),
            nonce: self.nonce,
            timestamp: self.timestamp,
        }
    }

    /// 호가창을 폐기하고 새 스냅샷을 기다리는 상태로 만듭니다.
    pub fn invalidate(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.buffer.clear();
        self.nonce = None;
        self.state = SyncState::Desynced;
    }

    fn enforce_depth(&mut self) {
        if let Some(depth) = self.config.max_depth {
            self.bids.truncate(depth);
            self.asks.truncate(depth);
        }
    }
}
