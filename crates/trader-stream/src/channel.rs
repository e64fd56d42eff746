//! 논리 스트림 채널과 메시지 해시 이름 규칙.
//!
//! 메시지 해시는 `<채널>` 또는 `<채널>::<심볼>[::<타임프레임>]` 형식입니다.
//! 예: `trade::BTC/USDT`, `ohlcv::ETH/USDT::1m`, `orders`, `orders::BTC/USDT`.

use std::fmt;

use trader_core::{Symbol, Timeframe};

const SEP: &str = "::";

/// 구독 가능한 논리 채널.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Ticker(Symbol),
    Trades(Symbol),
    Ohlcv(Symbol, Timeframe),
    OrderBook(Symbol),
    /// `None`이면 전체 심볼
    Orders(Option<Symbol>),
    MyTrades(Option<Symbol>),
    Positions(Option<Symbol>),
    Balance,
}

impl Channel {
    fn name(&self) -> &'static str {
        match self {
            Channel::Ticker(_) => "ticker",
            Channel::Trades(_) => "trade",
            Channel::Ohlcv(..) => "ohlcv",
            Channel::OrderBook(_) => "orderbook",
            Channel::Orders(_) => "orders",
            Channel::MyTrades(_) => "myTrades",
            Channel::Positions(_) => "positions",
            Channel::Balance => "balance",
        }
    }

    /// 인증이 필요한 개인 채널인지 확인합니다.
    pub fn is_private(&self) -> bool {
        matches!(
            self,
            Channel::Orders(_) | Channel::MyTrades(_) | Channel::Positions(_) | Channel::Balance
        )
    }

    pub fn symbol(&self) -> Option<&Symbol> {
        match self {
            Channel::Ticker(s) | Channel::Trades(s) | Channel::Ohlcv(s, _) | Channel::OrderBook(s) => {
                Some(s)
            }
            Channel::Orders(s) | Channel::MyTrades(s) | Channel::Positions(s) => s.as_ref(),
            Channel::Balance => None,
        }
    }

    /// 이 채널의 메시지 해시.
    pub fn message_hash(&self) -> String {
        self.to_string()
    }

    /// 메시지 해시를 채널로 되돌립니다.
    pub fn parse(hash: &str) -> Option<Channel> {
        let mut parts = hash.split(SEP);
        let name = parts.next()?;
        let symbol = parts.next().map(|s| s.parse::<Symbol>()).transpose().ok()?;
        let extra = parts.next();
        if parts.next().is_some() {
            return None;
        }

        let channel = match (name, symbol, extra) {
            ("ticker", Some(s), None) => Channel::Ticker(s),
            ("trade", Some(s), None) => Channel::Trades(s),
            ("ohlcv", Some(s), Some(tf)) => Channel::Ohlcv(s, tf.parse().ok()?),
            ("orderbook", Some(s), None) => Channel::OrderBook(s),
            ("orders", s, None) => Channel::Orders(s),
            ("myTrades", s, None) => Channel::MyTrades(s),
            ("positions", s, None) => Channel::Positions(s),
            ("balance", None, None) => Channel::Balance,
            _ => return None,
        };
        Some(channel)
    }

    /// 심볼별 채널이면 전체 채널 해시도 함께 돌려줍니다.
    ///
    /// 한 이벤트가 `orders::BTC/USDT`와 `orders`를 같이 깨우는 데 사용합니다.
    pub fn fan_out_hashes(&self) -> Vec<String> {
        let mut hashes = vec![self.message_hash()];
        let aggregate = match self {
            Channel::Orders(Some(_)) => Some(Channel::Orders(None)),
            Channel::MyTrades(Some(_)) => Some(Channel::MyTrades(None)),
            Channel::Positions(Some(_)) => Some(Channel::Positions(None)),
            _ => None,
        };
        hashes.extend(aggregate.map(|c| c.message_hash()));
        hashes
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        if let Some(symbol) = self.symbol() {
            write!(f, "{}{}", SEP, symbol)?;
        }
        if let Channel::Ohlcv(_, tf) = self {
            write!(f, "{}{}", SEP, tf)?;
        }
        Ok(())
    }
}
