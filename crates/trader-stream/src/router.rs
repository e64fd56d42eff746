//! 메시지 해시 → 대기자 라우팅.
//!
//! 두 가지 상태를 관리합니다:
//! - 대기자: 메시지 해시마다 다음 업데이트를 기다리는 oneshot 송신자 목록
//! - 구독: 거래소에 보낸 와이어 토픽과 그 토픽이 채우는 메시지 해시
//!
//! 같은 토픽에 대한 두 번째 구독은 와이어 요청 없이 대기자만 추가합니다.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{StreamError, StreamResult};

/// 활성(또는 전송 중) 와이어 구독.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// 이 토픽의 메시지가 채우는 해시
    pub hashes: BTreeSet<String>,
    /// 인증이 필요한 개인 채널 여부
    pub private: bool,
}

/// `register` 결과.
#[derive(Debug)]
pub struct Registration<V> {
    /// 해시별 수신자
    pub receivers: Vec<(String, oneshot::Receiver<StreamResult<V>>)>,
    /// 아직 구독되지 않아 와이어 요청이 필요한 토픽
    pub new_topics: Vec<String>,
}

/// 메시지 해시 라우터.
#[derive(Debug)]
pub struct SubscriptionRouter<V> {
    waiters: HashMap<String, Vec<oneshot::Sender<StreamResult<V>>>>,
    subscriptions: HashMap<String, Subscription>,
}

impl<V> Default for SubscriptionRouter<V> {
    fn default() -> Self {
        Self {
            waiters: HashMap::new(),
            subscriptions: HashMap::new(),
        }
    }
}

impl<V: Clone> SubscriptionRouter<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 해시마다 대기자를 등록하고 토픽을 구독 테이블에 기록합니다.
    pub fn register(&mut self, hashes: &[String], topics: &[String], private: bool) -> Registration<V> {
        let mut receivers = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let (tx, rx) = oneshot::channel();
            let slot = self.waiters.entry(hash.clone()).or_default();
            // 호출자가 취소한 대기자 정리
            slot.retain(|w| !w.is_closed());
            slot.push(tx);
            receivers.push((hash.clone(), rx));
        }

        let mut new_topics = Vec::new();
        for topic in topics {
            match self.subscriptions.get_mut(topic) {
                Some(sub) => {
                    sub.hashes.extend(hashes.iter().cloned());
                    debug!(topic = %topic, "attached to existing subscription");
                }
                None => {
                    self.subscriptions.insert(
                        topic.clone(),
                        Subscription {
                            hashes: hashes.iter().cloned().collect(),
                            private,
                        },
                    );
                    new_topics.push(topic.clone());
                }
            }
        }

        Registration {
            receivers,
            new_topics,
        }
    }

    /// 해시의 모든 대기자에게 값을 전달합니다. 전달된 수를 반환합니다.
    pub fn resolve(&mut self, hash: &str, value: V) -> usize {
        let Some(waiters) = self.waiters.remove(hash) else {
            return 0;
        };
        waiters
            .into_iter()
            .filter(|tx| !tx.is_closed())
            .filter_map(|tx| tx.send(Ok(value.clone())).ok())
            .count()
    }

    /// 한 이벤트로 여러 해시(심볼별 + 전체)를 함께 깨웁니다.
    pub fn resolve_many(&mut self, hashes: &[String], value: V) -> usize {
        let delivered = hashes
            .iter()
            .map(|h| self.resolve(h, value.clone()))
            .sum();
        if delivered > 0 {
            debug!(?hashes, delivered, "resolved");
        }
        delivered
    }

    pub fn reject(&mut self, hash: &str, error: StreamError) -> usize {
        let Some(waiters) = self.waiters.remove(hash) else {
            return 0;
        };
        waiters
            .into_iter()
            .filter_map(|tx| tx.send(Err(error.clone())).ok())
            .count()
    }

    pub fn reject_many(&mut self, hashes: &[String], error: StreamError) -> usize {
        hashes.iter().map(|h| self.reject(h, error.clone())).sum()
    }

    /// 모든 대기자를 실패시키고 구독 테이블을 비웁니다.
    ///
    /// 연결이 끊긴 뒤 다음 `watch`가 처음부터 다시 구독하게 됩니다.
    pub fn reject_all(&mut self, error: StreamError) -> usize {
        let hashes: Vec<String> = self.waiters.keys().cloned().collect();
        let rejected = self.reject_many(&hashes, error);
        self.subscriptions.clear();
        rejected
    }

    /// 개인 채널 대기자만 실패시키고 해당 구독을 제거합니다.
    pub fn reject_private(&mut self, error: StreamError) -> usize {
        let private_topics: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.private)
            .map(|(topic, _)| topic.clone())
            .collect();

        let mut hashes = BTreeSet::new();
        for topic in &private_topics {
            if let Some(sub) = self.subscriptions.remove(topic) {
                hashes.extend(sub.hashes);
            }
        }
        let hashes: Vec<String> = hashes.into_iter().collect();
        self.reject_many(&hashes, error)
    }

    /// 토픽 구독을 제거합니다.
    ///
    /// 다른 토픽이 공유하지 않는 해시의 대기자는 `Cancelled`로 종료합니다.
    pub fn unsubscribe(&mut self, topic: &str) -> Option<Subscription> {
        let sub = self.subscriptions.remove(topic)?;
        let orphaned: Vec<String> = sub
            .hashes
            .iter()
            .filter(|h| !self.subscriptions.values().any(|s| s.hashes.contains(*h)))
            .cloned()
            .collect();
        self.reject_many(
            &orphaned,
            StreamError::Cancelled(format!("unsubscribed from {}", topic)),
        );
        Some(sub)
    }

    /// 해시를 채우는 토픽을 구독 테이블에서 지웁니다 (대기자는 그대로).
    ///
    /// 다음 `watch`가 와이어 요청을 다시 보내도록 할 때 사용합니다.
    pub fn forget_topics_for(&mut self, hash: &str) -> Vec<String> {
        let topics: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.hashes.contains(hash))
            .map(|(topic, _)| topic.clone())
            .collect();
        for topic in &topics {
            self.subscriptions.remove(topic);
        }
        topics
    }

    /// 전송 실패한 토픽을 되돌립니다.
    pub fn remove_topics(&mut self, topics: &[String]) {
        for topic in topics {
            self.subscriptions.remove(topic);
        }
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.contains_key(topic)
    }

    pub fn subscription(&self, topic: &str) -> Option<&Subscription> {
        self.subscriptions.get(topic)
    }

    /// 살아 있는 대기자가 있는 해시 목록.
    pub fn pending_hashes(&self) -> Vec<String> {
        let mut hashes: Vec<String> = self
            .waiters
            .iter()
            .filter(|(_, ws)| ws.iter().any(|w| !w.is_closed()))
            .map(|(h, _)| h.clone())
            .collect();
        hashes.sort();
        hashes
    }
}
