//! 거래소 실시간 스트림 엔진.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - `watch_*` API: 구독 후 다음 업데이트까지 대기
//! - 고정 용량 캐시와 "마지막 읽기 이후" 조회
//! - 로컬 호가창 동기화 (시퀀스/체크섬 검증)
//! - 메시지 해시 기반 구독 라우팅과 중복 구독 제거
//! - 챌린지 서명 및 세션 토큰 인증
//! - WebSocket 수신 루프와 하트비트 감시
//!
//! 거래소별 와이어 형식은 [`VenueProtocol`] 구현으로 주입합니다.

pub mod auth;
pub mod cache;
pub mod channel;
pub mod checksum;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod orderbook;
pub mod router;
pub mod traits;
pub mod ws;

pub use auth::{
    ChallengeAuthenticator, HmacChallengeSigner, RenewalFailureHook, SignatureEncoding,
    TokenAuthenticator, TokenLease, TokenPolicy,
};
pub use cache::{ArrayCache, ArrayCacheById, ArrayCacheBySide, ArrayCacheByTimestamp, Insertion};
pub use channel::Channel;
pub use checksum::{compute_checksum, ChecksumConfig};
pub use config::StreamConfig;
pub use connection::{Connection, Visibility};
pub use engine::{StreamEngine, StreamUpdate};
pub use error::*;
pub use orderbook::{
    BookConfig, BookDelta, BookSnapshot, DeltaOutcome, LocalOrderBook, OrderBookStore,
    SequenceRule, SyncState,
};
pub use router::SubscriptionRouter;
pub use traits::*;
pub use ws::{FrameHandler, WsOptions, WsTransport};
