//! 트레이딩 시스템 전반에서 사용되는 공통 타입.

mod decimal;
mod symbol;
mod timeframe;

pub use decimal::*;
pub use symbol::*;
pub use timeframe::*;
