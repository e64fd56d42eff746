//! 캔들스틱 타임프레임.
//!
//! 거래소 간 공통으로 쓰이는 `1m`, `1h`, `1d` 형식의 간격 문자열을 사용합니다.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::TraderError;

/// 캔들스틱 타임프레임.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H12,
    D1,
    W1,
    /// 월봉 (30일 근사)
    MN1,
}

impl Timeframe {
    /// 타임프레임 기간.
    pub fn duration(&self) -> Duration {
        const MIN: u64 = 60;
        const HOUR: u64 = 60 * MIN;
        const DAY: u64 = 24 * HOUR;

        let secs = match self {
            Timeframe::M1 => MIN,
            Timeframe::M3 => 3 * MIN,
            Timeframe::M5 => 5 * MIN,
            Timeframe::M15 => 15 * MIN,
            Timeframe::M30 => 30 * MIN,
            Timeframe::H1 => HOUR,
            Timeframe::H2 => 2 * HOUR,
            Timeframe::H4 => 4 * HOUR,
            Timeframe::H6 => 6 * HOUR,
            Timeframe::H12 => 12 * HOUR,
            Timeframe::D1 => DAY,
            Timeframe::W1 => 7 * DAY,
            Timeframe::MN1 => 30 * DAY,
        };
        Duration::from_secs(secs)
    }

    /// 밀리초 단위 기간.
    pub fn as_millis(&self) -> i64 {
        self.duration().as_millis() as i64
    }

    /// 간격 문자열 (`1m`, `4h`, `1M` 등).
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::H6 => "6h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
            Timeframe::MN1 => "1M",
        }
    }

    /// 주어진 타임스탬프(ms)가 속한 캔들의 시작 시각을 반환합니다.
    pub fn bucket_start(&self, timestamp_ms: i64) -> i64 {
        let width = self.as_millis();
        timestamp_ms - timestamp_ms.rem_euclid(width)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = TraderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tf = match s {
            "1m" => Timeframe::M1,
            "3m" => Timeframe::M3,
            "5m" => Timeframe::M5,
            "15m" => Timeframe::M15,
            "30m" => Timeframe::M30,
            "1h" => Timeframe::H1,
            "2h" => Timeframe::H2,
            "4h" => Timeframe::H4,
            "6h" => Timeframe::H6,
            "12h" => Timeframe::H12,
            "1d" => Timeframe::D1,
            "1w" => Timeframe::W1,
            "1M" => Timeframe::MN1,
            _ => {
                return Err(TraderError::InvalidInput(format!(
                    "지원하지 않는 타임프레임: {}",
                    s
                )))
            }
        };
        Ok(tf)
    }
}

impl TryFrom<String> for Timeframe {
    type Error = TraderError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_parse() {
        assert_eq!("4h".parse::<Timeframe>().unwrap(), Timeframe::H4);
        assert_eq!("1M".parse::<Timeframe>().unwrap(), Timeframe::MN1);
        assert!("7m".parse::<Timeframe>().is_err());
        assert_eq!(Timeframe::M15.to_string(), "15m");
    }

    #[test]
    fn test_bucket_start() {
        let tf = Timeframe::M1;
        assert_eq!(tf.bucket_start(60_000), 60_000);
        assert_eq!(tf.bucket_start(119_999), 60_000);
        assert_eq!(Timeframe::H1.as_millis(), 3_600_000);
    }

    #[test]
    fn test_timeframe_serde() {
        let json = serde_json::to_string(&Timeframe::H1).unwrap();
        assert_eq!(json, "\"1h\"");
        let tf: Timeframe = serde_json::from_str("\"1d\"").unwrap();
        assert_eq!(tf, Timeframe::D1);
    }
}
