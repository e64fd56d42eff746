//! 스트림 엔진과 거래소별 구현 사이의 trait 정의.
//!
//! 엔진은 거래소 와이어 형식을 모릅니다. 거래소 어댑터가 [`VenueProtocol`]로
//! 프레임을 [`NormalizedEvent`]로 바꾸고 구독 요청을 만들어 줍니다.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use trader_core::{Balance, Kline, Order, Position, Symbol, Ticker, TradeTick};

use crate::channel::Channel;
use crate::error::{StreamError, StreamResult};
use crate::orderbook::{BookConfig, BookDelta, BookSnapshot};

/// 거래소 프레임을 정규화한 이벤트.
#[derive(Debug, Clone)]
pub enum NormalizedEvent {
    /// 시세 업데이트
    Ticker(Ticker),
    /// 공개 체결
    Trades(Vec<TradeTick>),
    /// 내 체결
    MyTrades(Vec<TradeTick>),
    /// 캔들 (같은 시작 시각이면 교체)
    Ohlcv(Vec<Kline>),
    /// 호가 스냅샷
    OrderBookSnapshot(BookSnapshot),
    /// 호가 증분
    OrderBookDelta(BookDelta),
    /// 주문 업데이트
    Orders(Vec<Order>),
    /// 잔고 업데이트 (변경된 자산만)
    Balance {
        balances: Vec<Balance>,
        timestamp: Option<DateTime<Utc>>,
    },
    /// 포지션 업데이트
    Positions(Vec<Position>),
    /// 구독 확인
    Subscribed { topics: Vec<String> },
    /// 구독 해제 확인
    Unsubscribed { topics: Vec<String> },
    /// 거래소 에러 응답. `hashes`가 비어 있으면 연결의 모든 대기자에게 전달
    Error {
        hashes: Vec<String>,
        error: StreamError,
    },
    /// 인증 챌린지 (서버가 보낸 nonce)
    Challenge(String),
    /// 하트비트/pong
    Heartbeat,
}

/// 송신 채널.
///
/// 웹소켓 쓰기 절반이나 테스트용 목 구현이 이 trait을 구현합니다.
#[async_trait]
pub trait Transport: Send + Sync {
    /// JSON 페이로드 전송.
    async fn send(&self, payload: &Value) -> StreamResult<()>;

    /// 연결 종료.
    async fn close(&self) -> StreamResult<()>;
}

/// 인증 자격 증명.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// 서버 챌린지에 대한 서명
    Challenge { challenge: String, signature: String },
    /// 세션 토큰 (listen key 등)
    Token(String),
}

/// 요청 페이로드를 만들 때 필요한 문맥.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    /// 연결 단위로 증가하는 요청 ID
    pub request_id: u64,
    /// 개인 채널이면 인증 정보
    pub credential: Option<&'a Credential>,
}

/// 거래소 와이어 프로토콜.
pub trait VenueProtocol: Send + Sync {
    /// 거래소 이름 (에러 메시지 접두사).
    fn venue(&self) -> &str;

    /// 수신 텍스트 프레임을 이벤트로 변환.
    ///
    /// 관심 없는 프레임은 빈 벡터를 반환합니다.
    fn parse(&self, frame: &str) -> StreamResult<Vec<NormalizedEvent>>;

    /// 채널의 와이어 토픽 이름. 같은 토픽이면 와이어 구독을 공유합니다.
    fn topic(&self, channel: &Channel) -> String;

    /// 구독 요청. `None`이면 보낼 필요가 없음 (연결 URL로 구독되는 경우 등).
    fn subscribe_payload(
        &self,
        channels: &[Channel],
        ctx: &RequestContext<'_>,
    ) -> StreamResult<Option<Value>>;

    /// 구독 해제 요청.
    fn unsubscribe_payload(
        &self,
        channels: &[Channel],
        ctx: &RequestContext<'_>,
    ) -> StreamResult<Option<Value>>;

    // === 선택 구현 ===

    /// 심볼별 호가창 동기화 규칙.
    fn book_config(&self, _symbol: &Symbol) -> BookConfig {
        BookConfig::default()
    }

    /// 인증 챌린지 요청.
    fn challenge_request(&self, _ctx: &RequestContext<'_>) -> StreamResult<Value> {
        Err(StreamError::NotSupported(format!(
            "{} challenge authentication",
            self.venue()
        )))
    }

    /// 앱 수준 ping 페이로드. `None`이면 웹소켓 ping 프레임 사용.
    fn ping_payload(&self) -> Option<Value> {
        None
    }
}

/// 발급된 세션 토큰.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    /// 유효 기간
    pub ttl: Duration,
}

/// 세션 토큰 발급자 (REST 호출).
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// 새 토큰 발급.
    async fn issue(&self) -> StreamResult<IssuedToken>;

    /// 기존 토큰 연장. 기본 구현은 새로 발급합니다.
    async fn renew(&self, _token: &str) -> StreamResult<IssuedToken> {
        self.issue().await
    }
}

/// 챌린지 서명기.
pub trait ChallengeSigner: Send + Sync {
    fn sign(&self, challenge: &str) -> StreamResult<String>;
}
