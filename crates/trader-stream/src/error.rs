//! 스트림 에러 타입.

use thiserror::Error;
use tokio_tungstenite::tungstenite;
use trader_core::TraderError;

/// 스트림 계층 에러.
///
/// 한 번의 실패가 여러 대기자에게 전달되므로 `Clone`을 구현합니다.
/// 메시지에는 거래소 이름이 포함됩니다 (`StreamError::in_venue`).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    /// 네트워크/연결 에러 (하트비트 타임아웃 포함)
    #[error("Network error: {0}")]
    Network(String),

    /// 연결 종료
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// 인증 실패. 자동 재시도하지 않음
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// 호가창 체크섬 불일치
    #[error("Checksum mismatch: {0}")]
    Checksum(String),

    /// 호가창 시퀀스 누락
    #[error("Order book desync: {0}")]
    Desync(String),

    /// 거래소가 거부한 요청
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// 지원되지 않는 작업
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// 요청 한도 초과
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// 수신 프레임 파싱 에러
    #[error("Parse error: {0}")]
    Parse(String),

    /// 설정 에러
    #[error("Configuration error: {0}")]
    Config(String),

    /// 요청 타임아웃
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// 구독 해제 또는 엔진 종료로 취소됨
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

/// 스트림 작업을 위한 Result 타입.
pub type StreamResult<T> = Result<T, StreamError>;

impl StreamError {
    /// 메시지 앞에 거래소 이름을 붙입니다.
    pub fn in_venue(self, venue: &str) -> Self {
        let q = |msg: String| {
            if msg.starts_with(venue) {
                msg
            } else {
                format!("{} {}", venue, msg)
            }
        };
        match self {
            StreamError::Network(m) => StreamError::Network(q(m)),
            StreamError::Disconnected(m) => StreamError::Disconnected(q(m)),
            StreamError::Authentication(m) => StreamError::Authentication(q(m)),
            StreamError::Checksum(m) => StreamError::Checksum(q(m)),
            StreamError::Desync(m) => StreamError::Desync(q(m)),
            StreamError::BadRequest(m) => StreamError::BadRequest(q(m)),
            StreamError::NotSupported(m) => StreamError::NotSupported(q(m)),
            StreamError::RateLimitExceeded(m) => StreamError::RateLimitExceeded(q(m)),
            StreamError::Parse(m) => StreamError::Parse(q(m)),
            StreamError::Config(m) => StreamError::Config(q(m)),
            StreamError::Timeout(m) => StreamError::Timeout(q(m)),
            StreamError::Cancelled(m) => StreamError::Cancelled(q(m)),
        }
    }

    /// 호출자가 재시도할 수 있는 에러인지 확인.
    ///
    /// 엔진 자체는 어떤 에러도 자동 재시도하지 않습니다.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamError::Network(_)
                | StreamError::Disconnected(_)
                | StreamError::Desync(_)
                | StreamError::Checksum(_)
                | StreamError::RateLimitExceeded(_)
                | StreamError::Timeout(_)
        )
    }

    /// 인증 에러인지 확인.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, StreamError::Authentication(_))
    }

    /// 호가창 무결성 에러(체크섬/시퀀스)인지 확인.
    pub fn is_integrity_error(&self) -> bool {
        matches!(self, StreamError::Checksum(_) | StreamError::Desync(_))
    }

    /// 재시도해도 해결되지 않는 에러인지 확인.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StreamError::Authentication(_)
                | StreamError::BadRequest(_)
                | StreamError::NotSupported(_)
                | StreamError::Config(_)
        )
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Parse(err.to_string())
    }
}

impl From<config::ConfigError> for StreamError {
    fn from(err: config::ConfigError) -> Self {
        StreamError::Config(err.to_string())
    }
}

impl From<tungstenite::Error> for StreamError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                StreamError::Disconnected(err.to_string())
            }
            other => StreamError::Network(other.to_string()),
        }
    }
}

impl From<TraderError> for StreamError {
    fn from(err: TraderError) -> Self {
        match err {
            TraderError::Config(m) => StreamError::Config(m),
            TraderError::InvalidInput(m) => StreamError::BadRequest(m),
            TraderError::Serialization(m) => StreamError::Parse(m),
        }
    }
}
