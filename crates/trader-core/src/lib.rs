//! # Trader Core
//!
//! 실시간 스트림 계층이 공유하는 핵심 도메인 타입을 제공합니다:
//! - 심볼, 시장 유형, 타임프레임
//! - 시세, 체결, 캔들, 호가창 뷰
//! - 주문, 수수료, 포지션, 잔고
//! - 도메인 에러
//! - 로깅 인프라

pub mod domain;
pub mod error;
pub mod logging;
pub mod types;

pub use domain::*;
pub use error::*;
pub use logging::*;
pub use types::*;
