//! 스트림으로 수신되는 정규화된 도메인 모델.

mod balance;
mod market_data;
mod order;
mod position;

pub use balance::*;
pub use market_data::*;
pub use order::*;
pub use position::*;
