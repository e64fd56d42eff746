//! 도메인 타입 공통 에러.
//!
//! 스트림 엔진 고유의 에러는 `trader-stream`의 `StreamError`를 사용합니다.

use thiserror::Error;

/// 도메인 타입 파싱 및 초기화 에러.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TraderError {
    /// 설정 에러
    #[error("설정 에러: {0}")]
    Config(String),

    /// 잘못된 입력
    #[error("잘못된 입력: {0}")]
    InvalidInput(String),

    /// 직렬화 에러
    #[error("직렬화 에러: {0}")]
    Serialization(String),
}

/// 도메인 작업을 위한 Result 타입.
pub type TraderResult<T> = Result<T, TraderError>;

impl From<serde_json::Error> for TraderError {
    fn from(err: serde_json::Error) -> Self {
        TraderError::Serialization(err.to_string())
    }
}
