//! 다중화된 논리 연결.
//!
//! 거래소 × 공개/개인 단위로 하나씩 존재하며, 여러 구독이 한 전송 채널을
//! 공유합니다. 호출자는 메시지 해시로 대기하고, 수신 루프가 라우터를 통해
//! 값을 전달합니다.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{StreamError, StreamResult};
use crate::router::SubscriptionRouter;
use crate::traits::Transport;

/// 연결 종류.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    Public,
    Private,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Public => write!(f, "public"),
            Visibility::Private => write!(f, "private"),
        }
    }
}

/// 논리 연결.
pub struct Connection<V> {
    name: String,
    visibility: Visibility,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    router: Mutex<SubscriptionRouter<V>>,
    request_id: AtomicU64,
    request_timeout: Duration,
}

impl<V: Clone + Send + 'static> Connection<V> {
    pub fn new(name: impl Into<String>, visibility: Visibility, request_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            visibility,
            transport: RwLock::new(None),
            router: Mutex::new(SubscriptionRouter::new()),
            request_id: AtomicU64::new(0),
            request_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    /// 전송 채널을 연결합니다 (재연결 시 교체).
    pub async fn attach(&self, transport: Arc<dyn Transport>) {
        *self.transport.write().await = Some(transport);
        debug!(connection = %self.name, "transport attached");
    }

    pub async fn detach(&self) -> Option<Arc<dyn Transport>> {
        self.transport.write().await.take()
    }

    pub async fn is_attached(&self) -> bool {
        self.transport.read().await.is_some()
    }

    /// 다음 요청 ID (연결 단위 단조 증가).
    pub fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn router(&self) -> &Mutex<SubscriptionRouter<V>> {
        &self.router
    }

    /// 페이로드를 그대로 전송합니다.
    pub async fn send(&self, payload: &Value) -> StreamResult<()> {
        let transport = self.transport.read().await.clone();
        match transport {
            Some(t) => t.send(payload).await,
            None => Err(StreamError::Disconnected(format!(
                "{} connection is not open",
                self.name
            ))),
        }
    }

    /// 한 메시지 해시의 다음 업데이트를 기다립니다.
    ///
    /// 토픽이 이미 구독되어 있으면 와이어 요청 없이 대기자만 추가합니다.
    pub async fn watch(
        &self,
        hash: String,
        topic: String,
        payload: Option<Value>,
    ) -> StreamResult<V> {
        let (_, value) = self
            .watch_multiple(vec![hash], vec![topic], move |_| Ok(payload))
            .await?;
        Ok(value)
    }

    /// 여러 메시지 해시를 한 요청으로 구독하고, 가장 먼저 도착한 값을 반환합니다.
    ///
    /// `build`는 새로 구독해야 하는 토픽 목록을 받아 요청 페이로드를 만듭니다.
    /// 모든 토픽이 이미 구독되어 있으면 호출되지 않습니다.
    pub async fn watch_multiple<F>(
        &self,
        hashes: Vec<String>,
        topics: Vec<String>,
        build: F,
    ) -> StreamResult<(String, V)>
    where
        F: FnOnce(&[String]) -> StreamResult<Option<Value>>,
    {
        if hashes.is_empty() {
            return Err(StreamError::BadRequest(format!(
                "{} watch requires at least one message hash",
                self.name
            )));
        }

        let private = self.visibility == Visibility::Private;
        let registration = self.router.lock().await.register(&hashes, &topics, private);

        if !registration.new_topics.is_empty() {
            let sent = match build(&registration.new_topics) {
                Ok(Some(payload)) => self.send(&payload).await,
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                warn!(connection = %self.name, topics = ?registration.new_topics, error = %e, "subscribe failed");
                let mut router = self.router.lock().await;
                router.remove_topics(&registration.new_topics);
                router.reject_many(&hashes, e.clone());
                return Err(e);
            }
            debug!(connection = %self.name, topics = ?registration.new_topics, "subscribe sent");
        }

        let closed = self.closed_error();
        let waits = registration.receivers.into_iter().map(|(hash, rx)| {
            Box::pin(async move { (hash, rx.await) })
        });
        let ((hash, received), _, _) = select_all(waits).await;
        match received {
            Ok(result) => result.map(|v| (hash, v)),
            Err(_) => Err(closed),
        }
    }

    /// 응답 하나를 기다리는 요청 (인증 챌린지 등).
    ///
    /// 구독 테이블에 기록하지 않으며 `request_timeout` 안에 응답이 없으면 실패합니다.
    pub async fn request(&self, hash: String, payload: &Value) -> StreamResult<V> {
        let private = self.visibility == Visibility::Private;
        let registration = self
            .router
            .lock()
            .await
            .register(std::slice::from_ref(&hash), &[], private);

        if let Err(e) = self.send(payload).await {
            self.router.lock().await.reject(&hash, e.clone());
            return Err(e);
        }

        let Some((_, rx)) = registration.receivers.into_iter().next() else {
            return Err(self.closed_error());
        };
        self.await_with_timeout(&hash, rx).await
    }

    async fn await_with_timeout(
        &self,
        hash: &str,
        rx: oneshot::Receiver<StreamResult<V>>,
    ) -> StreamResult<V> {
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                self.router.lock().await.reject(
                    hash,
                    StreamError::Timeout(format!("{} {}", self.name, hash)),
                );
                Err(StreamError::Timeout(format!(
                    "{} no response for {} within {:?}",
                    self.name, hash, self.request_timeout
                )))
            }
        }
    }

    /// 토픽 구독을 해제합니다.
    ///
    /// 라우팅 상태는 즉시 제거되고, 캐시 정리는 해제 확인 수신 시 이뤄집니다.
    pub async fn unwatch(&self, topics: &[String], payload: Option<Value>) -> StreamResult<()> {
        {
            let mut router = self.router.lock().await;
            for topic in topics {
                if router.unsubscribe(topic).is_none() {
                    debug!(connection = %self.name, topic = %topic, "unwatch for unknown topic");
                }
            }
        }
        if let Some(payload) = payload {
            self.send(&payload).await?;
        }
        Ok(())
    }

    /// 값을 대기자들에게 전달합니다.
    pub async fn resolve_many(&self, hashes: &[String], value: V) -> usize {
        self.router.lock().await.resolve_many(hashes, value)
    }

    pub async fn reject_many(&self, hashes: &[String], error: StreamError) -> usize {
        self.router.lock().await.reject_many(hashes, error)
    }

    /// 에러 응답을 받은 해시의 대기자를 실패시키고, 해당 토픽을 구독 테이블에서 지웁니다.
    ///
    /// 다음 `watch`가 구독 요청을 다시 보냅니다.
    pub async fn reject_and_forget(&self, hashes: &[String], error: StreamError) -> usize {
        let mut router = self.router.lock().await;
        for hash in hashes {
            router.forget_topics_for(hash);
        }
        router.reject_many(hashes, error)
    }

    /// 개인 채널 대기자만 실패시킵니다 (토큰 갱신 실패 등).
    pub async fn reject_private(&self, error: StreamError) -> usize {
        self.router.lock().await.reject_private(error)
    }

    /// 연결 실패: 모든 대기자를 실패시키고 구독 테이블을 비웁니다.
    pub async fn fail(&self, error: StreamError) -> usize {
        let rejected = self.router.lock().await.reject_all(error.clone());
        warn!(connection = %self.name, rejected, error = %error, "connection failed");
        rejected
    }

    fn closed_error(&self) -> StreamError {
        StreamError::Cancelled(format!("{} waiter dropped", self.name))
    }
}

impl<V> fmt::Debug for Connection<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("visibility", &self.visibility)
            .finish_non_exhaustive()
    }
}
