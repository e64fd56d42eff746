//! 호가창 체크섬 계산.
//!
//! 상위 K개 호가를 거래소 형식의 문자열로 직렬화한 뒤 CRC32를 계산합니다.
//! 거래소마다 숫자 표기, 레벨 배치, 구분자, 부호 해석이 다르므로
//! [`ChecksumConfig`]로 표현합니다.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use trader_core::OrderBookLevel;

/// 가격/수량의 문자열 표기.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumberFormat {
    /// 수신한 자릿수 그대로 (`1.500` → `1.500`)
    AsReceived,
    /// 끝자리 0 제거 (`1.500` → `1.5`)
    Normalized,
    /// 고정 소수 자릿수로 반올림/패딩
    Fixed(u32),
    /// 소수점 제거 후 앞자리 0 제거 (`0.0500` → `500`)
    DigitsOnly,
}

impl NumberFormat {
    pub fn render(&self, value: Decimal) -> String {
        match self {
            NumberFormat::AsReceived => value.to_string(),
            NumberFormat::Normalized => value.normalize().to_string(),
            NumberFormat::Fixed(dp) => {
                let mut v = value.round_dp_with_strategy(*dp, RoundingStrategy::MidpointAwayFromZero);
                v.rescale(*dp);
                v.to_string()
            }
            NumberFormat::DigitsOnly => {
                let digits: String = value.to_string().chars().filter(|c| *c != '.').collect();
                digits.trim_start_matches('0').to_string()
            }
        }
    }
}

/// 매수/매도 레벨 배치 순서.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelLayout {
    /// bid, ask, bid, ask ... (소진된 쪽은 건너뜀)
    Interleaved,
    BidsThenAsks,
    AsksThenBids,
}

/// CRC32 결과 해석.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Digest {
    /// 부호 있는 32비트
    Signed,
    /// 부호 없는 32비트
    Unsigned,
}

/// 거래소별 체크섬 파라미터.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumConfig {
    /// 체크섬에 포함할 한쪽 호가 레벨 수
    pub depth: usize,
    pub format: NumberFormat,
    pub layout: LevelLayout,
    /// 값 사이 구분자 (빈 문자열이면 이어붙임)
    pub separator: String,
    pub digest: Digest,
}

impl ChecksumConfig {
    /// 상위 25레벨, 교차 배치, `:` 구분, 부호 있는 CRC32. 숫자는 끝자리 0 제거.
    pub fn okx() -> Self {
        Self {
            depth: 25,
            format: NumberFormat::Normalized,
            layout: LevelLayout::Interleaved,
            separator: ":".to_string(),
            digest: Digest::Signed,
        }
    }

    /// `okx`와 같되 수신 문자열 그대로 사용.
    pub fn bitget() -> Self {
        Self {
            format: NumberFormat::AsReceived,
            ..Self::okx()
        }
    }

    /// 상위 10레벨, 매도 먼저, 숫자만 이어붙임, 부호 없는 CRC32.
    pub fn kraken() -> Self {
        Self {
            depth: 10,
            format: NumberFormat::DigitsOnly,
            layout: LevelLayout::AsksThenBids,
            separator: String::new(),
            digest: Digest::Unsigned,
        }
    }
}

/// 체크섬 입력 문자열을 만듭니다.
///
/// `bids`는 가격 내림차순, `asks`는 오름차순이어야 하며
/// 각 쪽에서 앞의 `depth`개만 사용합니다.
pub fn checksum_payload(
    bids: &[OrderBookLevel],
    asks: &[OrderBookLevel],
    config: &ChecksumConfig,
) -> String {
    let bids = &bids[..bids.len().min(config.depth)];
    let asks = &asks[..asks.len().min(config.depth)];

    let ordered: Vec<&OrderBookLevel> = match config.layout {
        LevelLayout::Interleaved => {
            let mut out = Vec::with_capacity(bids.len() + asks.len());
            for i in 0..bids.len().max(asks.len()) {
                out.extend(bids.get(i));
                out.extend(asks.get(i));
            }
            out
        }
        LevelLayout::BidsThenAsks => bids.iter().chain(asks.iter()).collect(),
        LevelLayout::AsksThenBids => asks.iter().chain(bids.iter()).collect(),
    };

    let mut parts = Vec::with_capacity(ordered.len() * 2);
    for level in ordered {
        parts.push(config.format.render(level.price));
        parts.push(config.format.render(level.quantity));
    }
    parts.join(&config.separator)
}

/// 체크섬 값을 계산합니다.
pub fn compute_checksum(
    bids: &[OrderBookLevel],
    asks: &[OrderBookLevel],
    config: &ChecksumConfig,
) -> i64 {
    let payload = checksum_payload(bids, asks, config);
    let crc = crc32fast::hash(payload.as_bytes());
    match config.digest {
        Digest::Signed => crc as i32 as i64,
        Digest::Unsigned => crc as i64,
    }
}

/// 계산한 체크섬이 서버 값과 같은지 확인합니다.
pub fn verify_checksum(
    bids: &[OrderBookLevel],
    asks: &[OrderBookLevel],
    config: &ChecksumConfig,
    expected: i64,
) -> bool {
    compute_checksum(bids, asks, config) == expected
}
