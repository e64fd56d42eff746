//! 심볼별 로컬 호가창과 그 저장소.

mod book;
mod side;
mod store;

pub use book::{
    BookConfig, BookDelta, BookSnapshot, DeltaOutcome, LocalOrderBook, SequenceRule, SyncState,
};
pub use side::BookSide;
pub use store::OrderBookStore;
