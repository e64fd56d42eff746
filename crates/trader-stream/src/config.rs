//! 스트림 엔진 설정.
//!
//! TOML 파일과 `TRADER_STREAM__*` 환경 변수에서 로드합니다.
//! 예: `TRADER_STREAM__TRADES_LIMIT=500`

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::TokenPolicy;
use crate::error::{StreamError, StreamResult};
use crate::ws::WsOptions;

const ENV_PREFIX: &str = "TRADER_STREAM";

/// 캐시 용량, 호가창, 연결/인증 타이밍 설정.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StreamConfig {
    /// 심볼별 공개 체결 캐시 용량
    #[serde(default = "default_cache_limit")]
    pub trades_limit: usize,
    /// (심볼, 타임프레임)별 캔들 캐시 용량
    #[serde(default = "default_cache_limit")]
    pub ohlcv_limit: usize,
    /// 주문/내 체결 캐시 용량
    #[serde(default = "default_cache_limit")]
    pub orders_limit: usize,
    #[serde(default = "default_cache_limit")]
    pub positions_limit: usize,
    /// `watch_order_book` 기본 표시 깊이
    #[serde(default = "default_orderbook_depth")]
    pub orderbook_depth: usize,
    /// 스냅샷 전 보관할 최대 델타 수
    #[serde(default = "default_cache_limit")]
    pub orderbook_buffer_limit: usize,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,
    /// 토큰 만료 이 시간 전에 갱신
    #[serde(default = "default_renewal_margin")]
    pub token_renewal_margin_ms: u64,
    /// 개인 구독 전 토큰 재발급 기준 나이
    #[serde(default)]
    pub token_renewal_threshold_ms: Option<u64>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_cache_limit() -> usize {
    1000
}
fn default_orderbook_depth() -> usize {
    100
}
fn default_heartbeat_timeout() -> u64 {
    30_000
}
fn default_ping_interval() -> u64 {
    15_000
}
fn default_renewal_margin() -> u64 {
    60_000
}
fn default_request_timeout() -> u64 {
    10_000
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            trades_limit: default_cache_limit(),
            ohlcv_limit: default_cache_limit(),
            orders_limit: default_cache_limit(),
            positions_limit: default_cache_limit(),
            orderbook_depth: default_orderbook_depth(),
            orderbook_buffer_limit: default_cache_limit(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            ping_interval_ms: default_ping_interval(),
            token_renewal_margin_ms: default_renewal_margin(),
            token_renewal_threshold_ms: None,
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl StreamConfig {
    /// 파일과 환경 변수에서 설정을 로드합니다.
    pub fn load<P: AsRef<Path>>(path: P) -> StreamResult<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            );

        let loaded: Self = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// 환경 변수만으로 설정을 로드합니다.
    pub fn from_env() -> StreamResult<Self> {
        let loaded: Self = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// 용량/간격이 0이면 설정 에러.
    pub fn validate(&self) -> StreamResult<()> {
        let capacities = [
            ("trades_limit", self.trades_limit),
            ("ohlcv_limit", self.ohlcv_limit),
            ("orders_limit", self.orders_limit),
            ("positions_limit", self.positions_limit),
            ("orderbook_depth", self.orderbook_depth),
            ("orderbook_buffer_limit", self.orderbook_buffer_limit),
        ];
        if let Some((name, _)) = capacities.iter().find(|(_, v)| *v == 0) {
            return Err(StreamError::Config(format!("{} must be positive", name)));
        }

        let intervals = [
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("ping_interval_ms", self.ping_interval_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(StreamError::Config(format!("{} must be positive", name)));
        }
        if self.ping_interval_ms >= self.heartbeat_timeout_ms {
            return Err(StreamError::Config(
                "ping_interval_ms must be shorter than heartbeat_timeout_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ws_options(&self) -> WsOptions {
        WsOptions {
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            ping_payload: None,
        }
    }

    pub fn token_policy(&self) -> TokenPolicy {
        TokenPolicy {
            renewal_margin: Duration::from_millis(self.token_renewal_margin_ms),
            renewal_threshold: self.token_renewal_threshold_ms.map(Duration::from_millis),
        }
    }
}
