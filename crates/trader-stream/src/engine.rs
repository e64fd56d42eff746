//! 거래소 하나의 스트림 엔진.
//!
//! `watch_*` 호출은 채널을 구독하고 다음 업데이트까지 기다린 뒤, 캐시에서
//! 마지막 읽기 이후 새로 들어온 항목을 돌려줍니다. 수신 프레임은
//! [`StreamEngine::handle_frame`]에서 도착 순서대로 처리되며, 캐시와
//! 호가창은 이 경로에서만 변경됩니다.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn, Instrument};
use trader_core::{
    stream_span, Balances, Kline, Order, OrderBook, Position, Symbol, Ticker, Timeframe, TradeTick,
};

use crate::auth::{ChallengeAuthenticator, TokenAuthenticator};
use crate::cache::{
    fold_trade_into_order, merge_order, ArrayCache, ArrayCacheById, ArrayCacheBySide,
    ArrayCacheByTimestamp,
};
use crate::channel::Channel;
use crate::config::StreamConfig;
use crate::connection::{Connection, Visibility};
use crate::error::{StreamError, StreamResult};
use crate::orderbook::{BookDelta, BookSnapshot, DeltaOutcome, OrderBookStore};
use crate::traits::{
    ChallengeSigner, Credential, NormalizedEvent, RequestContext, TokenIssuer, Transport,
    VenueProtocol,
};
use crate::ws::{self, FrameHandler};

/// 인증 챌린지 응답을 기다리는 메시지 해시.
pub const CHALLENGE_HASH: &str = "challenge";

/// 대기자에게 전달되는 값.
///
/// 캐시 기반 채널은 알림만 전달하고, 호출자가 캐시에서 새 항목을 읽습니다.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    Ticker(Ticker),
    Trades,
    Ohlcv,
    OrderBook(OrderBook),
    Orders,
    MyTrades,
    Positions,
    Balance(Balances),
    Challenge(String),
}

/// 수신 경로가 소유하는 캐시와 호가창.
struct MarketState {
    tickers: HashMap<Symbol, Ticker>,
    trades: HashMap<Symbol, ArrayCache<TradeTick>>,
    ohlcv: HashMap<(Symbol, Timeframe), ArrayCacheByTimestamp<Kline>>,
    books: OrderBookStore,
    orders: ArrayCacheById<Order>,
    my_trades: ArrayCacheById<TradeTick>,
    positions: ArrayCacheBySide<Position>,
    balances: Balances,
    /// 해제 확인을 기다리는 토픽 → 정리할 채널
    unwatching: HashMap<String, Vec<Channel>>,
}

impl MarketState {
    fn new(config: &StreamConfig) -> StreamResult<Self> {
        Ok(Self {
            tickers: HashMap::new(),
            trades: HashMap::new(),
            ohlcv: HashMap::new(),
            books: OrderBookStore::new(config.orderbook_buffer_limit),
            orders: ArrayCacheById::new(config.orders_limit)?,
            my_trades: ArrayCacheById::new(config.orders_limit)?,
            positions: ArrayCacheBySide::new(config.positions_limit)?,
            balances: Balances::default(),
            unwatching: HashMap::new(),
        })
    }

    fn purge(&mut self, channel: &Channel) {
        match channel {
            Channel::Ticker(s) => {
                self.tickers.remove(s);
            }
            Channel::Trades(s) => {
                self.trades.remove(s);
            }
            Channel::Ohlcv(s, tf) => {
                self.ohlcv.remove(&(s.clone(), *tf));
            }
            Channel::OrderBook(s) => {
                self.books.remove(s);
            }
            Channel::Orders(Some(s)) => {
                self.orders.remove_symbol(s);
            }
            Channel::Orders(None) => self.orders.clear(),
            Channel::MyTrades(Some(s)) => {
                self.my_trades.remove_symbol(s);
            }
            Channel::MyTrades(None) => self.my_trades.clear(),
            Channel::Positions(Some(s)) => {
                self.positions.remove_symbol(s);
            }
            Channel::Positions(None) => self.positions.clear(),
            Channel::Balance => self.balances = Balances::default(),
        }
    }
}

/// 수신 이벤트 처리 결과. 상태 잠금을 푼 뒤 라우터에 전달합니다.
enum Delivery {
    Resolve(Vec<String>, StreamUpdate),
    /// 실패시키고 토픽을 잊음 (다음 `watch`가 다시 구독)
    Reject(Vec<String>, StreamError),
    RejectAll(StreamError),
    /// 자격 증명을 지우고 개인 대기자를 모두 실패시킴
    AuthFailure(StreamError),
}

/// 거래소 하나의 스트림 엔진.
pub struct StreamEngine<P: VenueProtocol> {
    protocol: Arc<P>,
    config: StreamConfig,
    public: Arc<Connection<StreamUpdate>>,
    private: Arc<Connection<StreamUpdate>>,
    state: Mutex<MarketState>,
    challenge: Option<ChallengeAuthenticator>,
    token: Option<TokenAuthenticator>,
}

impl<P: VenueProtocol + 'static> StreamEngine<P> {
    /// 설정을 검증하고 엔진을 만듭니다.
    pub fn new(protocol: P, config: StreamConfig) -> StreamResult<Self> {
        config.validate()?;
        let venue = protocol.venue().to_string();
        let timeout = config.request_timeout();
        Ok(Self {
            state: Mutex::new(MarketState::new(&config)?),
            public: Arc::new(Connection::new(
                format!("{}:public", venue),
                Visibility::Public,
                timeout,
            )),
            private: Arc::new(Connection::new(
                format!("{}:private", venue),
                Visibility::Private,
                timeout,
            )),
            protocol: Arc::new(protocol),
            config,
            challenge: None,
            token: None,
        })
    }

    /// 챌린지/응답 인증을 사용합니다.
    pub fn with_challenge_signer(mut self, signer: Arc<dyn ChallengeSigner>) -> Self {
        self.challenge = Some(ChallengeAuthenticator::new(signer));
        self
    }

    /// 세션 토큰 인증을 사용합니다.
    ///
    /// 백그라운드 갱신이 실패하면 개인 채널 대기자가 인증 에러로 실패합니다.
    pub fn with_token_issuer(mut self, issuer: Arc<dyn TokenIssuer>) -> Self {
        let token = TokenAuthenticator::new(issuer, self.config.token_policy());
        let private = self.private.clone();
        let venue = self.venue().to_string();
        token.on_renewal_failure(Arc::new(move |error: StreamError| {
            let private = private.clone();
            let error = error.in_venue(&venue);
            async move {
                let rejected = private.reject_private(error).await;
                warn!(rejected, "private waiters rejected after token renewal failure");
            }
            .boxed()
        }));
        self.token = Some(token);
        self
    }

    pub fn venue(&self) -> &str {
        self.protocol.venue()
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn connection(&self, visibility: Visibility) -> &Arc<Connection<StreamUpdate>> {
        match visibility {
            Visibility::Public => &self.public,
            Visibility::Private => &self.private,
        }
    }

    pub fn token_authenticator(&self) -> Option<&TokenAuthenticator> {
        self.token.as_ref()
    }

    pub fn challenge_authenticator(&self) -> Option<&ChallengeAuthenticator> {
        self.challenge.as_ref()
    }

    /// 전송 채널을 직접 연결합니다. 수신 프레임은 `handle_frame`으로 넘겨야 합니다.
    pub async fn attach(&self, visibility: Visibility, transport: Arc<dyn Transport>) {
        self.connection(visibility).attach(transport).await;
    }

    /// WebSocket에 연결하고 수신 루프를 이 엔진에 연결합니다.
    pub async fn connect(self: &Arc<Self>, visibility: Visibility, url: &str) -> StreamResult<()> {
        let handler: Arc<dyn FrameHandler> = Arc::new(EngineFeed {
            engine: Arc::downgrade(self),
            visibility,
        });
        let mut options = self.config.ws_options();
        options.ping_payload = self.protocol.ping_payload();

        let transport = ws::connect(url, handler, options)
            .instrument(stream_span!("connect", self.venue()))
            .await
            .map_err(|e| e.in_venue(self.venue()))?;
        self.attach(visibility, Arc::new(transport)).await;
        info!(venue = %self.venue(), %visibility, "stream connected");
        Ok(())
    }

    // === 구독 ===

    async fn credential(&self) -> StreamResult<Option<Credential>> {
        if let Some(token) = &self.token {
            return Ok(Some(Credential::Token(token.ensure_token().await?)));
        }
        if let Some(challenge) = &self.challenge {
            let conn = &self.private;
            let protocol = &self.protocol;
            let credential = challenge
                .authenticate(|| async move {
                    let ctx = RequestContext {
                        request_id: conn.next_request_id(),
                        credential: None,
                    };
                    let payload = protocol.challenge_request(&ctx)?;
                    match conn.request(CHALLENGE_HASH.to_string(), &payload).await? {
                        StreamUpdate::Challenge(challenge) => Ok(challenge),
                        other => Err(StreamError::Authentication(format!(
                            "unexpected challenge response: {:?}",
                            other
                        ))),
                    }
                })
                .await?;
            return Ok(Some(credential));
        }
        Ok(None)
    }

    /// 채널들을 구독하고 가장 먼저 도착한 업데이트를 반환합니다.
    async fn subscribe(&self, channels: &[Channel]) -> StreamResult<(String, StreamUpdate)> {
        let private = channels.iter().any(Channel::is_private);
        let visibility = if private {
            Visibility::Private
        } else {
            Visibility::Public
        };
        let conn = self.connection(visibility);
        let credential = if private {
            self.credential()
                .await
                .map_err(|e| e.in_venue(self.venue()))?
        } else {
            None
        };

        let hashes: Vec<String> = channels.iter().map(Channel::message_hash).collect();
        let mut topics: Vec<String> = Vec::with_capacity(channels.len());
        for channel in channels {
            let topic = self.protocol.topic(channel);
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }

        let protocol = &self.protocol;
        let request_id = conn.next_request_id();
        conn.watch_multiple(hashes, topics, |new_topics| {
            let pending: Vec<Channel> = channels
                .iter()
                .filter(|c| new_topics.contains(&protocol.topic(c)))
                .cloned()
                .collect();
            let ctx = RequestContext {
                request_id,
                credential: credential.as_ref(),
            };
            protocol.subscribe_payload(&pending, &ctx)
        })
        .await
        .map_err(|e| e.in_venue(self.venue()))
    }

    async fn subscribe_one(&self, channel: Channel) -> StreamResult<StreamUpdate> {
        let (_, update) = self.subscribe(std::slice::from_ref(&channel)).await?;
        Ok(update)
    }

    fn unexpected(&self, update: StreamUpdate) -> StreamError {
        StreamError::Parse(format!("{} unexpected update {:?}", self.venue(), update))
    }

    // === 공개 채널 ===

    pub async fn watch_ticker(&self, symbol: &Symbol) -> StreamResult<Ticker> {
        match self.subscribe_one(Channel::Ticker(symbol.clone())).await? {
            StreamUpdate::Ticker(ticker) => Ok(ticker),
            other => Err(self.unexpected(other)),
        }
    }

    /// 마지막 호출 이후 새로 들어온 공개 체결 (최대 `limit`개).
    pub async fn watch_trades(
        &self,
        symbol: &Symbol,
        limit: Option<usize>,
    ) -> StreamResult<Vec<TradeTick>> {
        self.subscribe_one(Channel::Trades(symbol.clone())).await?;
        Ok(self.read_trades(symbol, limit).await)
    }

    /// 여러 심볼을 한 요청으로 구독하고, 먼저 갱신된 심볼의 체결을 반환합니다.
    pub async fn watch_trades_for_symbols(
        &self,
        symbols: &[Symbol],
        limit: Option<usize>,
    ) -> StreamResult<Vec<TradeTick>> {
        let channels: Vec<Channel> = symbols.iter().cloned().map(Channel::Trades).collect();
        let (hash, _) = self.subscribe(&channels).await?;
        match Channel::parse(&hash) {
            Some(Channel::Trades(symbol)) => Ok(self.read_trades(&symbol, limit).await),
            _ => Err(StreamError::Parse(format!("{} unknown hash {}", self.venue(), hash))),
        }
    }

    async fn read_trades(&self, symbol: &Symbol, limit: Option<usize>) -> Vec<TradeTick> {
        let mut state = self.state.lock().await;
        let Some(cache) = state.trades.get_mut(symbol) else {
            return Vec::new();
        };
        let n = cache.get_limit(Some(symbol), limit).unwrap_or(cache.len());
        cache.limit(n)
    }

    pub async fn watch_ohlcv(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: Option<usize>,
    ) -> StreamResult<Vec<Kline>> {
        self.subscribe_one(Channel::Ohlcv(symbol.clone(), timeframe))
            .await?;
        let mut state = self.state.lock().await;
        let Some(cache) = state.ohlcv.get_mut(&(symbol.clone(), timeframe)) else {
            return Ok(Vec::new());
        };
        let n = cache.get_limit(Some(symbol), limit).unwrap_or(cache.len());
        Ok(cache.limit(n))
    }

    /// 다음 호가 업데이트 후의 호가창 (상위 `limit` 레벨).
    pub async fn watch_order_book(
        &self,
        symbol: &Symbol,
        limit: Option<usize>,
    ) -> StreamResult<OrderBook> {
        match self.subscribe_one(Channel::OrderBook(symbol.clone())).await? {
            StreamUpdate::OrderBook(book) => Ok(truncate_book(book, limit)),
            other => Err(self.unexpected(other)),
        }
    }

    pub async fn watch_order_book_for_symbols(
        &self,
        symbols: &[Symbol],
        limit: Option<usize>,
    ) -> StreamResult<OrderBook> {
        let channels: Vec<Channel> = symbols.iter().cloned().map(Channel::OrderBook).collect();
        match self.subscribe(&channels).await? {
            (_, StreamUpdate::OrderBook(book)) => Ok(truncate_book(book, limit)),
            (_, other) => Err(self.unexpected(other)),
        }
    }

    // === 개인 채널 ===

    /// 마지막 호출 이후 갱신된 주문. `symbol`이 없으면 전체 심볼.
    pub async fn watch_orders(
        &self,
        symbol: Option<&Symbol>,
        limit: Option<usize>,
    ) -> StreamResult<Vec<Order>> {
        self.subscribe_one(Channel::Orders(symbol.cloned())).await?;
        let mut state = self.state.lock().await;
        let n = state.orders.get_limit(symbol, limit).unwrap_or(state.orders.len());
        Ok(state.orders.snapshot(symbol, Some(n)))
    }

    pub async fn watch_my_trades(
        &self,
        symbol: Option<&Symbol>,
        limit: Option<usize>,
    ) -> StreamResult<Vec<TradeTick>> {
        self.subscribe_one(Channel::MyTrades(symbol.cloned())).await?;
        let mut state = self.state.lock().await;
        let n = state
            .my_trades
            .get_limit(symbol, limit)
            .unwrap_or(state.my_trades.len());
        Ok(state.my_trades.snapshot(symbol, Some(n)))
    }

    pub async fn watch_positions(
        &self,
        symbol: Option<&Symbol>,
        limit: Option<usize>,
    ) -> StreamResult<Vec<Position>> {
        self.subscribe_one(Channel::Positions(symbol.cloned())).await?;
        let mut state = self.state.lock().await;
        let n = state
            .positions
            .get_limit(symbol, limit)
            .unwrap_or(state.positions.len());
        Ok(state.positions.snapshot(symbol, Some(n)))
    }

    pub async fn watch_balance(&self) -> StreamResult<Balances> {
        match self.subscribe_one(Channel::Balance).await? {
            StreamUpdate::Balance(balances) => Ok(balances),
            other => Err(self.unexpected(other)),
        }
    }

    /// 채널 구독을 해제합니다.
    ///
    /// 라우팅 상태는 즉시 지우고, 캐시와 호가창은 해제 확인을 받으면 정리합니다.
    /// 거래소에 해제 요청이 없으면 바로 정리합니다.
    pub async fn unwatch(&self, channels: &[Channel]) -> StreamResult<()> {
        for visibility in [Visibility::Public, Visibility::Private] {
            let group: Vec<Channel> = channels
                .iter()
                .filter(|c| c.is_private() == (visibility == Visibility::Private))
                .cloned()
                .collect();
            if group.is_empty() {
                continue;
            }
            self.unwatch_group(visibility, group)
                .await
                .map_err(|e| e.in_venue(self.venue()))?;
        }
        Ok(())
    }

    async fn unwatch_group(&self, visibility: Visibility, group: Vec<Channel>) -> StreamResult<()> {
        let conn = self.connection(visibility);
        let credential = match visibility {
            Visibility::Private => self.current_credential().await,
            Visibility::Public => None,
        };
        let ctx = RequestContext {
            request_id: conn.next_request_id(),
            credential: credential.as_ref(),
        };
        let payload = self.protocol.unsubscribe_payload(&group, &ctx)?;

        let mut topics: Vec<String> = Vec::new();
        {
            let mut state = self.state.lock().await;
            for channel in &group {
                let topic = self.protocol.topic(channel);
                if payload.is_some() {
                    state
                        .unwatching
                        .entry(topic.clone())
                        .or_default()
                        .push(channel.clone());
                } else {
                    state.purge(channel);
                }
                if !topics.contains(&topic) {
                    topics.push(topic);
                }
            }
        }

        debug!(venue = %self.venue(), ?topics, "unwatch");
        conn.unwatch(&topics, payload).await
    }

    async fn current_credential(&self) -> Option<Credential> {
        if let Some(token) = &self.token {
            return token.lease().await.map(|l| Credential::Token(l.token));
        }
        match &self.challenge {
            Some(challenge) => challenge.credential().await,
            None => None,
        }
    }

    // === 수신 경로 ===

    /// 수신 프레임 하나를 처리합니다.
    ///
    /// 파싱할 수 없거나 대기자가 없는 메시지는 조용히 버립니다.
    pub async fn handle_frame(&self, visibility: Visibility, frame: &str) {
        let events = match self.protocol.parse(frame) {
            Ok(events) => events,
            Err(e) => {
                warn!(venue = %self.venue(), error = %e, "unparseable frame dropped");
                return;
            }
        };
        let span = stream_span!("frame", self.venue());
        async {
            for event in events {
                self.handle_event(visibility, event).await;
            }
        }
        .instrument(span)
        .await
    }

    /// 정규화된 이벤트 하나를 반영하고 대기자에게 전달합니다.
    pub async fn handle_event(&self, visibility: Visibility, event: NormalizedEvent) {
        let deliveries = {
            let mut state = self.state.lock().await;
            self.apply_event(&mut state, event)
        };
        let conn = self.connection(visibility);
        for delivery in deliveries {
            match delivery {
                Delivery::Resolve(hashes, update) => {
                    conn.resolve_many(&hashes, update).await;
                }
                Delivery::Reject(hashes, error) => {
                    let rejected = conn.reject_and_forget(&hashes, error.clone()).await;
                    debug!(venue = %self.venue(), ?hashes, rejected, error = %error, "rejected");
                }
                Delivery::RejectAll(error) => {
                    conn.fail(error).await;
                }
                Delivery::AuthFailure(error) => self.reject_credentials(error).await,
            }
        }
    }

    fn apply_event(&self, state: &mut MarketState, event: NormalizedEvent) -> Vec<Delivery> {
        match event {
            NormalizedEvent::Ticker(ticker) => {
                let hash = Channel::Ticker(ticker.symbol.clone()).message_hash();
                state.tickers.insert(ticker.symbol.clone(), ticker.clone());
                vec![Delivery::Resolve(vec![hash], StreamUpdate::Ticker(ticker))]
            }
            NormalizedEvent::Trades(trades) => self.apply_trades(state, trades),
            NormalizedEvent::Ohlcv(klines) => self.apply_ohlcv(state, klines),
            NormalizedEvent::OrderBookSnapshot(snapshot) => {
                self.apply_snapshot(state, snapshot).into_iter().collect()
            }
            NormalizedEvent::OrderBookDelta(delta) => {
                self.apply_delta(state, delta).into_iter().collect()
            }
            NormalizedEvent::Orders(orders) => apply_orders(state, orders),
            NormalizedEvent::MyTrades(trades) => apply_my_trades(state, trades),
            NormalizedEvent::Positions(positions) => apply_positions(state, positions),
            NormalizedEvent::Balance {
                balances,
                timestamp,
            } => {
                state.balances.apply(balances, timestamp);
                vec![Delivery::Resolve(
                    vec![Channel::Balance.message_hash()],
                    StreamUpdate::Balance(state.balances.clone()),
                )]
            }
            NormalizedEvent::Challenge(challenge) => vec![Delivery::Resolve(
                vec![CHALLENGE_HASH.to_string()],
                StreamUpdate::Challenge(challenge),
            )],
            NormalizedEvent::Subscribed { topics } => {
                debug!(venue = %self.venue(), ?topics, "subscription confirmed");
                Vec::new()
            }
            NormalizedEvent::Unsubscribed { topics } => {
                for topic in &topics {
                    for channel in state.unwatching.remove(topic).unwrap_or_default() {
                        state.purge(&channel);
                    }
                }
                debug!(venue = %self.venue(), ?topics, "unsubscribed, caches purged");
                Vec::new()
            }
            NormalizedEvent::Error { hashes, error } => self.apply_error(hashes, error),
            NormalizedEvent::Heartbeat => {
                trace!(venue = %self.venue(), "heartbeat");
                Vec::new()
            }
        }
    }

    fn apply_trades(&self, state: &mut MarketState, trades: Vec<TradeTick>) -> Vec<Delivery> {
        let mut touched: BTreeSet<String> = BTreeSet::new();
        for trade in trades {
            let symbol = trade.symbol.clone();
            let cache = match state.trades.get_mut(&symbol) {
                Some(cache) => cache,
                None => match ArrayCache::new(self.config.trades_limit) {
                    Ok(cache) => state.trades.entry(symbol.clone()).or_insert(cache),
                    Err(e) => {
                        warn!(venue = %self.venue(), error = %e, "trade cache unavailable");
                        continue;
                    }
                },
            };
            cache.append(trade);
            touched.insert(Channel::Trades(symbol).message_hash());
        }
        resolve_each(touched, StreamUpdate::Trades)
    }

    fn apply_ohlcv(&self, state: &mut MarketState, klines: Vec<Kline>) -> Vec<Delivery> {
        let mut touched: BTreeSet<String> = BTreeSet::new();
        for kline in klines {
            let key = (kline.symbol.clone(), kline.timeframe);
            let cache = match state.ohlcv.get_mut(&key) {
                Some(cache) => cache,
                None => match ArrayCacheByTimestamp::new(self.config.ohlcv_limit) {
                    Ok(cache) => state.ohlcv.entry(key.clone()).or_insert(cache),
                    Err(e) => {
                        warn!(venue = %self.venue(), error = %e, "ohlcv cache unavailable");
                        continue;
                    }
                },
            };
            cache.append(kline);
            touched.insert(Channel::Ohlcv(key.0, key.1).message_hash());
        }
        resolve_each(touched, StreamUpdate::Ohlcv)
    }

    fn apply_snapshot(&self, state: &mut MarketState, snapshot: BookSnapshot) -> Option<Delivery> {
        let symbol = snapshot.symbol.clone();
        let protocol = &self.protocol;
        let book = state
            .books
            .get_or_create(&symbol, || protocol.book_config(&symbol));
        match book.reset(snapshot) {
            Ok(()) => self.book_update(state, &symbol),
            Err(e) => Some(self.book_failure(&symbol, e)),
        }
    }

    fn apply_delta(&self, state: &mut MarketState, delta: BookDelta) -> Option<Delivery> {
        let symbol = delta.symbol.clone();
        let protocol = &self.protocol;
        let book = state
            .books
            .get_or_create(&symbol, || protocol.book_config(&symbol));
        match book.apply_delta(delta) {
            Ok(DeltaOutcome::Applied) => self.book_update(state, &symbol),
            Ok(outcome) => {
                trace!(venue = %self.venue(), %symbol, ?outcome, "delta not applied");
                None
            }
            Err(e) => Some(self.book_failure(&symbol, e)),
        }
    }

    fn book_update(&self, state: &MarketState, symbol: &Symbol) -> Option<Delivery> {
        let view = state
            .books
            .get(symbol)?
            .limit(Some(self.config.orderbook_depth));
        Some(Delivery::Resolve(
            vec![Channel::OrderBook(symbol.clone()).message_hash()],
            StreamUpdate::OrderBook(view),
        ))
    }

    /// 무결성 에러. 호가창은 Desynced 상태로 남아 다음 스냅샷을 기다리고,
    /// 대기자는 실패하며 다음 `watch`가 다시 구독합니다.
    fn book_failure(&self, symbol: &Symbol, error: StreamError) -> Delivery {
        warn!(venue = %self.venue(), %symbol, error = %error, "order book discarded");
        Delivery::Reject(
            vec![Channel::OrderBook(symbol.clone()).message_hash()],
            error.in_venue(self.venue()),
        )
    }

    fn apply_error(&self, hashes: Vec<String>, error: StreamError) -> Vec<Delivery> {
        let error = error.in_venue(self.venue());
        let mut deliveries = Vec::with_capacity(2);
        if error.is_auth_error() {
            deliveries.push(Delivery::AuthFailure(error.clone()));
        }
        if hashes.is_empty() {
            deliveries.push(Delivery::RejectAll(error));
        } else {
            deliveries.push(Delivery::Reject(hashes, error));
        }
        deliveries
    }

    /// 인증 에러: 자격 증명을 지우고 개인 구독을 모두 실패시킵니다.
    async fn reject_credentials(&self, error: StreamError) {
        if let Some(token) = &self.token {
            token.invalidate().await;
        }
        if let Some(challenge) = &self.challenge {
            challenge.invalidate().await;
        }
        let rejected = self.private.reject_private(error.clone()).await;
        warn!(venue = %self.venue(), rejected, error = %error, "authentication rejected");
    }

    /// REST로 받은 스냅샷을 반영합니다 (버퍼된 델타 재생 포함).
    pub async fn reset_order_book(&self, snapshot: BookSnapshot) -> StreamResult<OrderBook> {
        let symbol = snapshot.symbol.clone();
        let delivery = {
            let mut state = self.state.lock().await;
            self.apply_snapshot(&mut state, snapshot)
        };
        match delivery {
            Some(Delivery::Resolve(hashes, StreamUpdate::OrderBook(view))) => {
                self.public
                    .resolve_many(&hashes, StreamUpdate::OrderBook(view.clone()))
                    .await;
                Ok(view)
            }
            Some(Delivery::Reject(hashes, error)) => {
                self.public.reject_and_forget(&hashes, error.clone()).await;
                Err(error)
            }
            _ => Err(StreamError::Desync(format!(
                "{} {} order book unavailable",
                self.venue(),
                symbol
            ))),
        }
    }

    /// 연결 실패 처리.
    ///
    /// 모든 대기자를 네트워크 에러로 실패시키고 구독 테이블을 비웁니다.
    /// 공개 연결이면 호가창을 모두 폐기하고, 개인 연결이면 챌린지 서명을 지웁니다.
    /// 재구독은 자동으로 하지 않습니다.
    pub async fn handle_disconnect(&self, visibility: Visibility, error: StreamError) {
        let error = match error {
            StreamError::Network(_) | StreamError::Disconnected(_) => error,
            other => StreamError::Network(other.to_string()),
        }
        .in_venue(self.venue());

        let conn = self.connection(visibility);
        conn.detach().await;
        let rejected = conn.fail(error.clone()).await;

        match visibility {
            Visibility::Public => {
                let discarded = self.state.lock().await.books.clear();
                warn!(venue = %self.venue(), rejected, discarded, error = %error, "public stream lost");
            }
            Visibility::Private => {
                if let Some(challenge) = &self.challenge {
                    challenge.invalidate().await;
                }
                warn!(venue = %self.venue(), rejected, error = %error, "private stream lost");
            }
        }
    }

    /// 현재 호가창 뷰 (구독 없이 조회).
    pub async fn order_book(&self, symbol: &Symbol, limit: Option<usize>) -> Option<OrderBook> {
        self.state
            .lock()
            .await
            .books
            .get(symbol)
            .map(|book| book.limit(limit))
    }
}

fn resolve_each(hashes: BTreeSet<String>, update: StreamUpdate) -> Vec<Delivery> {
    hashes
        .into_iter()
        .map(|hash| Delivery::Resolve(vec![hash], update.clone()))
        .collect()
}

fn fan_out(channels: impl IntoIterator<Item = Channel>) -> Vec<String> {
    let mut hashes: BTreeSet<String> = BTreeSet::new();
    for channel in channels {
        hashes.extend(channel.fan_out_hashes());
    }
    hashes.into_iter().collect()
}

fn apply_orders(state: &mut MarketState, orders: Vec<Order>) -> Vec<Delivery> {
    let mut symbols = Vec::with_capacity(orders.len());
    for order in orders {
        symbols.push(order.symbol.clone());
        let merged = match state.orders.get(&order.symbol, &order.id) {
            Some(previous) => merge_order(previous, order),
            None => order,
        };
        state.orders.append(merged);
    }
    let hashes = fan_out(symbols.into_iter().map(|s| Channel::Orders(Some(s))));
    vec![Delivery::Resolve(hashes, StreamUpdate::Orders)]
}

fn apply_my_trades(state: &mut MarketState, trades: Vec<TradeTick>) -> Vec<Delivery> {
    let mut symbols = Vec::with_capacity(trades.len());
    for trade in trades {
        symbols.push(trade.symbol.clone());
        if let Some(order_id) = &trade.order_id {
            let folded = state
                .orders
                .get(&trade.symbol, order_id)
                .map(|order| fold_trade_into_order(order, &trade));
            if let Some(order) = folded {
                state.orders.patch(order);
            }
        }
        state.my_trades.append(trade);
    }
    let hashes = fan_out(symbols.into_iter().map(|s| Channel::MyTrades(Some(s))));
    vec![Delivery::Resolve(hashes, StreamUpdate::MyTrades)]
}

fn apply_positions(state: &mut MarketState, positions: Vec<Position>) -> Vec<Delivery> {
    let mut symbols = Vec::with_capacity(positions.len());
    for position in positions {
        symbols.push(position.symbol.clone());
        state.positions.append(position);
    }
    let hashes = fan_out(symbols.into_iter().map(|s| Channel::Positions(Some(s))));
    vec![Delivery::Resolve(hashes, StreamUpdate::Positions)]
}

fn truncate_book(mut book: OrderBook, limit: Option<usize>) -> OrderBook {
    if let Some(limit) = limit {
        book.bids.truncate(limit);
        book.asks.truncate(limit);
    }
    book
}

/// WebSocket 수신 루프 → 엔진 연결.
struct EngineFeed<P: VenueProtocol> {
    engine: Weak<StreamEngine<P>>,
    visibility: Visibility,
}

#[async_trait]
impl<P: VenueProtocol + 'static> FrameHandler for EngineFeed<P> {
    async fn on_frame(&self, frame: &str) {
        if let Some(engine) = self.engine.upgrade() {
            engine.handle_frame(self.visibility, frame).await;
        }
    }

    /// 정리는 별도 태스크에서 실행합니다. `detach`가 전송 채널을 버리면
    /// 이 수신 태스크가 중단됩니다.
    async fn on_disconnect(&self, error: StreamError) {
        if let Some(engine) = self.engine.upgrade() {
            let visibility = self.visibility;
            tokio::spawn(async move {
                engine.handle_disconnect(visibility, error).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::RecordingTransport;
    use crate::orderbook::{BookConfig, SequenceRule};
    use crate::traits::IssuedToken;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};
    use std::time::Duration;
    use trader_core::{OrderBookLevel, OrderStatusType, OrderType, Side};

    /// 토픽 = 메시지 해시. 주문 채널은 심볼과 무관하게 하나의 토픽을 공유.
    struct TestVenue;

    impl VenueProtocol for TestVenue {
        fn venue(&self) -> &str {
            "testex"
        }

        fn parse(&self, frame: &str) -> StreamResult<Vec<NormalizedEvent>> {
            let value: Value = serde_json::from_str(frame)?;
            match value["event"].as_str() {
                Some("pong") => Ok(vec![NormalizedEvent::Heartbeat]),
                _ => Ok(Vec::new()),
            }
        }

        fn topic(&self, channel: &Channel) -> String {
            match channel {
                Channel::Orders(_) => "orders".to_string(),
                other => other.message_hash(),
            }
        }

        fn subscribe_payload(
            &self,
            channels: &[Channel],
            ctx: &RequestContext<'_>,
        ) -> StreamResult<Option<Value>> {
            let args: Vec<String> = channels.iter().map(|c| self.topic(c)).collect();
            let auth = match ctx.credential {
                Some(Credential::Token(token)) => json!(token),
                Some(Credential::Challenge { signature, .. }) => json!(signature),
                None => Value::Null,
            };
            Ok(Some(json!({"op": "subscribe", "id": ctx.request_id, "args": args, "auth": auth})))
        }

        fn unsubscribe_payload(
            &self,
            channels: &[Channel],
            ctx: &RequestContext<'_>,
        ) -> StreamResult<Option<Value>> {
            let args: Vec<String> = channels.iter().map(|c| self.topic(c)).collect();
            Ok(Some(json!({"op": "unsubscribe", "id": ctx.request_id, "args": args})))
        }

        fn book_config(&self, _symbol: &Symbol) -> BookConfig {
            BookConfig {
                sequence: SequenceRule::Span,
                ..Default::default()
            }
        }

        fn challenge_request(&self, ctx: &RequestContext<'_>) -> StreamResult<Value> {
            Ok(json!({"event": "challenge", "id": ctx.request_id}))
        }
    }

    struct FixedIssuer;

    #[async_trait]
    impl TokenIssuer for FixedIssuer {
        async fn issue(&self) -> StreamResult<IssuedToken> {
            Ok(IssuedToken {
                token: "listen-key".to_string(),
                ttl: Duration::from_secs(3600),
            })
        }
    }

    struct EchoSigner;

    impl ChallengeSigner for EchoSigner {
        fn sign(&self, challenge: &str) -> StreamResult<String> {
            Ok(format!("signed:{}", challenge))
        }
    }

    fn btc() -> Symbol {
        Symbol::spot("BTC", "USDT")
    }

    fn trade(id: &str) -> TradeTick {
        TradeTick {
            symbol: btc(),
            id: id.to_string(),
            order_id: None,
            price: dec!(42000),
            quantity: dec!(0.1),
            side: Side::Buy,
            timestamp: Utc::now(),
            fee: None,
        }
    }

    fn level(price: rust_decimal::Decimal, quantity: rust_decimal::Decimal) -> OrderBookLevel {
        OrderBookLevel::new(price, quantity)
    }

    async fn engine() -> (Arc<StreamEngine<TestVenue>>, Arc<RecordingTransport>) {
        let engine = StreamEngine::new(TestVenue, StreamConfig::default()).unwrap();
        attach_both(engine).await
    }

    async fn attach_both(
        engine: StreamEngine<TestVenue>,
    ) -> (Arc<StreamEngine<TestVenue>>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        engine.attach(Visibility::Public, transport.clone()).await;
        engine.attach(Visibility::Private, transport.clone()).await;
        (Arc::new(engine), transport)
    }

    async fn wait_pending(engine: &StreamEngine<TestVenue>, visibility: Visibility, n: usize) {
        let conn = engine.connection(visibility);
        while conn.router().lock().await.pending_hashes().len() < n {
            tokio::task::yield_now().await;
        }
    }

    async fn wait_sent(transport: &RecordingTransport, n: usize) {
        while transport.sent.lock().unwrap().len() < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_trades_returned_since_last_read() {
        let (engine, transport) = engine().await;

        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.watch_trades(&btc(), None).await }
        });
        wait_pending(&engine, Visibility::Public, 1).await;
        engine
            .handle_event(Visibility::Public, NormalizedEvent::Trades(vec![trade("1"), trade("2")]))
            .await;
        assert_eq!(first.await.unwrap().unwrap().len(), 2);

        let second = tokio::spawn({
            let engine = engine.clone();
            async move { engine.watch_trades(&btc(), None).await }
        });
        wait_pending(&engine, Visibility::Public, 1).await;
        engine
            .handle_event(Visibility::Public, NormalizedEvent::Trades(vec![trade("3")]))
            .await;
        let trades = second.await.unwrap().unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].id, "3");

        // 이미 구독된 토픽은 다시 요청하지 않음
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_order_update_wakes_symbol_and_aggregate_waiters() {
        let (engine, transport) = engine().await;

        let all = tokio::spawn({
            let engine = engine.clone();
            async move { engine.watch_orders(None, None).await }
        });
        let one = tokio::spawn({
            let engine = engine.clone();
            async move { engine.watch_orders(Some(&btc()), None).await }
        });
        wait_pending(&engine, Visibility::Private, 2).await;

        let order = Order::new("42", btc(), Side::Buy, OrderType::Limit, OrderStatusType::Open);
        engine
            .handle_event(Visibility::Private, NormalizedEvent::Orders(vec![order]))
            .await;

        assert_eq!(all.await.unwrap().unwrap()[0].id, "42");
        assert_eq!(one.await.unwrap().unwrap()[0].id, "42");
        // 두 채널이 "orders" 토픽을 공유
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_my_trade_folds_into_cached_order() {
        let (engine, _) = engine().await;
        let mut order = Order::new("7", btc(), Side::Buy, OrderType::Limit, OrderStatusType::Open);
        order.amount = Some(dec!(1));
        engine
            .handle_event(Visibility::Private, NormalizedEvent::Orders(vec![order]))
            .await;

        let mut fill = trade("t1");
        fill.order_id = Some("7".to_string());
        engine
            .handle_event(Visibility::Private, NormalizedEvent::MyTrades(vec![fill]))
            .await;

        let state = engine.state.lock().await;
        let cached = state.orders.get(&btc(), "7").unwrap();
        assert_eq!(cached.trades.len(), 1);
        assert_eq!(state.my_trades.len(), 1);
    }

    #[tokio::test]
    async fn test_sequence_gap_rejects_book_waiter() {
        let (engine, _) = engine().await;
        let topic = Channel::OrderBook(btc()).message_hash();

        engine
            .handle_event(
                Visibility::Public,
                NormalizedEvent::OrderBookSnapshot(BookSnapshot {
                    symbol: btc(),
                    bids: vec![level(dec!(100), dec!(1))],
                    asks: vec![level(dec!(101), dec!(1))],
                    nonce: Some(1),
                    timestamp: None,
                    checksum: None,
                }),
            )
            .await;

        let delta = |first: u64, last: u64, bid: rust_decimal::Decimal| BookDelta {
            symbol: btc(),
            bids: vec![level(bid, dec!(2))],
            asks: Vec::new(),
            first: Some(first),
            last: Some(last),
            prev: None,
            timestamp: None,
            checksum: None,
        };

        let applied = tokio::spawn({
            let engine = engine.clone();
            async move { engine.watch_order_book(&btc(), Some(5)).await }
        });
        wait_pending(&engine, Visibility::Public, 1).await;
        engine
            .handle_event(Visibility::Public, NormalizedEvent::OrderBookDelta(delta(2, 3, dec!(99))))
            .await;
        let book = applied.await.unwrap().unwrap();
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.nonce, Some(3));

        let gapped = tokio::spawn({
            let engine = engine.clone();
            async move { engine.watch_order_book(&btc(), None).await }
        });
        wait_pending(&engine, Visibility::Public, 1).await;
        engine
            .handle_event(Visibility::Public, NormalizedEvent::OrderBookDelta(delta(5, 5, dec!(98))))
            .await;
        let err = gapped.await.unwrap().unwrap_err();
        assert!(err.is_integrity_error());
        assert!(err.to_string().contains("testex"));

        // 다음 watch가 다시 구독하도록 토픽이 지워짐
        assert!(!engine.public.router().lock().await.is_subscribed(&topic));
        assert!(engine.order_book(&btc(), None).await.unwrap().bids.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_rejects_all_and_discards_books() {
        let (engine, _) = engine().await;
        engine
            .reset_order_book(BookSnapshot {
                symbol: btc(),
                bids: vec![level(dec!(100), dec!(1))],
                asks: Vec::new(),
                nonce: Some(10),
                timestamp: None,
                checksum: None,
            })
            .await
            .unwrap();

        let ticker = tokio::spawn({
            let engine = engine.clone();
            async move { engine.watch_ticker(&btc()).await }
        });
        wait_pending(&engine, Visibility::Public, 1).await;

        engine
            .handle_disconnect(Visibility::Public, StreamError::Disconnected("closed".into()))
            .await;

        let err = ticker.await.unwrap().unwrap_err();
        assert!(matches!(err, StreamError::Disconnected(ref m) if m.starts_with("testex")));
        assert!(engine.order_book(&btc(), None).await.is_none());
        assert!(!engine.public.is_attached().await);
    }

    #[tokio::test]
    async fn test_error_without_hashes_fails_connection() {
        let (engine, _) = engine().await;
        let waiter = tokio::spawn({
            let engine = engine.clone();
            async move { engine.watch_trades(&btc(), None).await }
        });
        wait_pending(&engine, Visibility::Public, 1).await;

        engine
            .handle_event(
                Visibility::Public,
                NormalizedEvent::Error {
                    hashes: Vec::new(),
                    error: StreamError::RateLimitExceeded("too many requests".into()),
                },
            )
            .await;
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, StreamError::RateLimitExceeded(_)));
    }

    #[tokio::test]
    async fn test_unwatch_purges_after_confirmation() {
        let (engine, transport) = engine().await;
        let waiter = tokio::spawn({
            let engine = engine.clone();
            async move { engine.watch_trades(&btc(), None).await }
        });
        wait_pending(&engine, Visibility::Public, 1).await;
        engine
            .handle_event(Visibility::Public, NormalizedEvent::Trades(vec![trade("1")]))
            .await;
        waiter.await.unwrap().unwrap();

        engine.unwatch(&[Channel::Trades(btc())]).await.unwrap();
        assert_eq!(transport.sent.lock().unwrap()[1]["op"], "unsubscribe");
        assert!(engine.state.lock().await.trades.contains_key(&btc()));

        engine
            .handle_event(
                Visibility::Public,
                NormalizedEvent::Unsubscribed {
                    topics: vec![Channel::Trades(btc()).message_hash()],
                },
            )
            .await;
        assert!(!engine.state.lock().await.trades.contains_key(&btc()));
    }

    #[tokio::test]
    async fn test_private_subscribe_carries_token() {
        let engine = StreamEngine::new(TestVenue, StreamConfig::default())
            .unwrap()
            .with_token_issuer(Arc::new(FixedIssuer));
        let (engine, transport) = attach_both(engine).await;

        let waiter = tokio::spawn({
            let engine = engine.clone();
            async move { engine.watch_balance().await }
        });
        wait_sent(&transport, 1).await;
        assert_eq!(transport.sent.lock().unwrap()[0]["auth"], "listen-key");

        engine
            .handle_event(
                Visibility::Private,
                NormalizedEvent::Balance {
                    balances: vec![trader_core::Balance::new("USDT", dec!(100), dec!(0))],
                    timestamp: None,
                },
            )
            .await;
        let balances = waiter.await.unwrap().unwrap();
        assert_eq!(balances.get("USDT").unwrap().free, dec!(100));
    }

    #[tokio::test]
    async fn test_challenge_handshake_before_private_subscribe() {
        let engine = StreamEngine::new(TestVenue, StreamConfig::default())
            .unwrap()
            .with_challenge_signer(Arc::new(EchoSigner));
        let (engine, transport) = attach_both(engine).await;

        let waiter = tokio::spawn({
            let engine = engine.clone();
            async move { engine.watch_balance().await }
        });
        wait_sent(&transport, 1).await;
        assert_eq!(transport.sent.lock().unwrap()[0]["event"], "challenge");
        wait_pending(&engine, Visibility::Private, 1).await;

        engine
            .handle_event(Visibility::Private, NormalizedEvent::Challenge("nonce-1".into()))
            .await;
        wait_sent(&transport, 2).await;
        assert_eq!(transport.sent.lock().unwrap()[1]["auth"], "signed:nonce-1");

        wait_pending(&engine, Visibility::Private, 1).await;
        engine
            .handle_event(
                Visibility::Private,
                NormalizedEvent::Balance {
                    balances: Vec::new(),
                    timestamp: None,
                },
            )
            .await;
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_auth_error_during_handshake_reaches_waiter() {
        let engine = StreamEngine::new(TestVenue, StreamConfig::default())
            .unwrap()
            .with_challenge_signer(Arc::new(EchoSigner));
        let (engine, transport) = attach_both(engine).await;

        let waiter = tokio::spawn({
            let engine = engine.clone();
            async move { engine.watch_balance().await }
        });
        wait_sent(&transport, 1).await;
        wait_pending(&engine, Visibility::Private, 1).await;

        // 챌린지 응답 대신 인증 에러. 수신 경로가 핸드셰이크 뒤에서 막히면 안 됨
        tokio::time::timeout(
            Duration::from_secs(1),
            engine.handle_event(
                Visibility::Private,
                NormalizedEvent::Error {
                    hashes: vec![CHALLENGE_HASH.to_string()],
                    error: StreamError::Authentication("invalid api key".into()),
                },
            ),
        )
        .await
        .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(err.is_auth_error());
        assert!(err.to_string().contains("invalid api key"));
        assert!(engine.challenge_authenticator().unwrap().credential().await.is_none());
        assert!(engine.private.router().lock().await.pending_hashes().is_empty());

        // 공개 경로는 계속 동작
        engine
            .handle_event(Visibility::Public, NormalizedEvent::Trades(vec![trade("1")]))
            .await;
        assert_eq!(engine.state.lock().await.trades[&btc()].len(), 1);
    }

    #[tokio::test]
    async fn test_auth_error_rejects_private_waiters() {
        let engine = StreamEngine::new(TestVenue, StreamConfig::default())
            .unwrap()
            .with_token_issuer(Arc::new(FixedIssuer));
        let (engine, _) = attach_both(engine).await;

        let waiter = tokio::spawn({
            let engine = engine.clone();
            async move { engine.watch_positions(None, None).await }
        });
        wait_pending(&engine, Visibility::Private, 1).await;

        engine
            .handle_event(
                Visibility::Private,
                NormalizedEvent::Error {
                    hashes: vec!["positions".into()],
                    error: StreamError::Authentication("invalid listen key".into()),
                },
            )
            .await;
        assert!(waiter.await.unwrap().unwrap_err().is_auth_error());
        assert!(engine.token_authenticator().unwrap().lease().await.is_none());
    }

    #[tokio::test]
    async fn test_unparseable_frame_is_dropped() {
        let (engine, _) = engine().await;
        engine.handle_frame(Visibility::Public, "not json").await;
        engine.handle_frame(Visibility::Public, r#"{"event":"pong"}"#).await;
        assert!(engine.public.router().lock().await.pending_hashes().is_empty());
    }
}
