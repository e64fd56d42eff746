//! 세션 토큰 임대 (listen key 등).
//!
//! 토큰은 `ttl - margin` 시점에 백그라운드에서 자동 갱신됩니다. 갱신이
//! 실패하면 등록된 훅으로 개인 채널 대기자를 인증 에러로 실패시키고
//! 캐시된 토큰을 지웁니다.

use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::{StreamError, StreamResult};
use crate::traits::TokenIssuer;

/// 갱신 실패 시 호출되는 훅. 인증 에러를 받습니다.
pub type RenewalFailureHook = Arc<dyn Fn(StreamError) -> BoxFuture<'static, ()> + Send + Sync>;

/// 갱신 시점 정책.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPolicy {
    /// 만료 이 시간 전에 백그라운드 갱신
    pub renewal_margin: Duration,
    /// 개인 구독 전 재발급 기준 나이. 없으면 `ttl - renewal_margin`
    pub renewal_threshold: Option<Duration>,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            renewal_margin: Duration::from_secs(60),
            renewal_threshold: None,
        }
    }
}

impl TokenPolicy {
    /// 발급 후 백그라운드 갱신까지의 대기 시간.
    pub fn renewal_delay(&self, ttl: Duration) -> Duration {
        if ttl > self.renewal_margin {
            ttl - self.renewal_margin
        } else {
            ttl / 2
        }
    }

    pub fn threshold(&self, ttl: Duration) -> Duration {
        self.renewal_threshold
            .unwrap_or_else(|| self.renewal_delay(ttl))
    }
}

/// 캐시된 토큰.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenLease {
    pub token: String,
    pub issued_at: Instant,
    pub ttl: Duration,
}

impl TokenLease {
    pub fn age(&self) -> Duration {
        self.issued_at.elapsed()
    }

    pub fn expires_at(&self) -> Instant {
        self.issued_at + self.ttl
    }
}

struct Inner {
    issuer: Arc<dyn TokenIssuer>,
    policy: TokenPolicy,
    lease: RwLock<Option<TokenLease>>,
    /// 발급/갱신 직렬화
    issuing: Mutex<()>,
    on_failure: OnceLock<RenewalFailureHook>,
}

impl Inner {
    async fn obtain(&self, renew: bool) -> StreamResult<TokenLease> {
        let current = self.lease.read().await.as_ref().map(|l| l.token.clone());
        let issued = match (renew, current) {
            (true, Some(token)) => self.issuer.renew(&token).await,
            _ => self.issuer.issue().await,
        };

        match issued {
            Ok(issued) => {
                let lease = TokenLease {
                    token: issued.token,
                    issued_at: Instant::now(),
                    ttl: issued.ttl,
                };
                *self.lease.write().await = Some(lease.clone());
                Ok(lease)
            }
            Err(e) => {
                *self.lease.write().await = None;
                Err(match e {
                    StreamError::Authentication(_) => e,
                    other => StreamError::Authentication(format!("token issuance failed: {}", other)),
                })
            }
        }
    }

    async fn fail(&self, error: StreamError) {
        error!(error = %error, "token renewal failed");
        *self.lease.write().await = None;
        if let Some(hook) = self.on_failure.get() {
            hook(error).await;
        }
    }
}

/// 세션 토큰 인증기.
pub struct TokenAuthenticator {
    inner: Arc<Inner>,
    renewal: StdMutex<Option<JoinHandle<()>>>,
}

impl TokenAuthenticator {
    pub fn new(issuer: Arc<dyn TokenIssuer>, policy: TokenPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                issuer,
                policy,
                lease: RwLock::new(None),
                issuing: Mutex::new(()),
                on_failure: OnceLock::new(),
            }),
            renewal: StdMutex::new(None),
        }
    }

    /// 갱신 실패 훅을 등록합니다. 이미 등록되어 있으면 false.
    pub fn on_renewal_failure(&self, hook: RenewalFailureHook) -> bool {
        self.inner.on_failure.set(hook).is_ok()
    }

    pub fn policy(&self) -> &TokenPolicy {
        &self.inner.policy
    }

    /// 개인 구독 전에 호출합니다.
    ///
    /// 토큰이 없거나 재발급 기준 나이를 넘었으면 새로 발급하고 갱신을 예약합니다.
    pub async fn ensure_token(&self) -> StreamResult<String> {
        let _issuing = self.inner.issuing.lock().await;
        if let Some(lease) = self.inner.lease.read().await.as_ref() {
            if lease.age() <= self.inner.policy.threshold(lease.ttl) {
                return Ok(lease.token.clone());
            }
            debug!(age = ?lease.age(), "token past renewal threshold, re-issuing");
        }

        let lease = self.inner.obtain(false).await?;
        info!(ttl = ?lease.ttl, "session token issued");
        self.schedule(self.inner.policy.renewal_delay(lease.ttl));
        Ok(lease.token)
    }

    /// 즉시 갱신하고 다음 갱신을 다시 예약합니다.
    pub async fn renew(&self) -> StreamResult<String> {
        let _issuing = self.inner.issuing.lock().await;
        match self.inner.obtain(true).await {
            Ok(lease) => {
                info!(ttl = ?lease.ttl, "session token renewed");
                self.schedule(self.inner.policy.renewal_delay(lease.ttl));
                Ok(lease.token)
            }
            Err(e) => {
                self.cancel_renewal();
                self.inner.fail(e.clone()).await;
                Err(e)
            }
        }
    }

    /// 캐시를 지우고 예약된 갱신을 취소합니다.
    pub async fn invalidate(&self) {
        self.cancel_renewal();
        if self.inner.lease.write().await.take().is_some() {
            debug!("session token invalidated");
        }
    }

    pub async fn lease(&self) -> Option<TokenLease> {
        self.inner.lease.read().await.clone()
    }

    fn schedule(&self, delay: Duration) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut delay = delay;
            loop {
                tokio::time::sleep(delay).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let _issuing = inner.issuing.lock().await;
                match inner.obtain(true).await {
                    Ok(lease) => {
                        info!(ttl = ?lease.ttl, "session token renewed in background");
                        delay = inner.policy.renewal_delay(lease.ttl);
                    }
                    Err(e) => {
                        inner.fail(e).await;
                        return;
                    }
                }
            }
        });

        if let Ok(mut slot) = self.renewal.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    fn cancel_renewal(&self) {
        if let Ok(mut slot) = self.renewal.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for TokenAuthenticator {
    fn drop(&mut self) {
        self.cancel_renewal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::IssuedToken;
    use async_trait::async_trait;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingIssuer {
        issued: AtomicUsize,
        renewed: AtomicUsize,
        fail_renew: AtomicBool,
    }

    #[async_trait]
    impl TokenIssuer for CountingIssuer {
        async fn issue(&self) -> StreamResult<IssuedToken> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(IssuedToken {
                token: format!("key-{}", n),
                ttl: Duration::from_millis(900_000),
            })
        }

        async fn renew(&self, token: &str) -> StreamResult<IssuedToken> {
            if self.fail_renew.load(Ordering::SeqCst) {
                return Err(StreamError::Network("keepalive rejected".into()));
            }
            self.renewed.fetch_add(1, Ordering::SeqCst);
            Ok(IssuedToken {
                token: token.to_string(),
                ttl: Duration::from_millis(900_000),
            })
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_policy_delays() {
        let policy = TokenPolicy::default();
        assert_eq!(policy.renewal_delay(Duration::from_secs(900)), Duration::from_secs(840));
        assert_eq!(policy.renewal_delay(Duration::from_secs(30)), Duration::from_secs(15));
        let custom = TokenPolicy {
            renewal_threshold: Some(Duration::from_secs(10)),
            ..policy
        };
        assert_eq!(custom.threshold(Duration::from_secs(900)), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_renewal_before_expiry() {
        let issuer = Arc::new(CountingIssuer::default());
        let auth = TokenAuthenticator::new(issuer.clone(), TokenPolicy::default());
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        auth.on_renewal_failure(Arc::new(move |_: StreamError| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {}.boxed()
        }));

        assert_eq!(auth.ensure_token().await.unwrap(), "key-1");
        // 갱신 태스크가 타이머를 등록하도록 양보
        settle().await;

        tokio::time::advance(Duration::from_millis(839_000)).await;
        settle().await;
        assert_eq!(issuer.renewed.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        settle().await;
        assert_eq!(issuer.renewed.load(Ordering::SeqCst), 1);
        assert_eq!(issuer.issued.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 0);

        let lease = auth.lease().await.unwrap();
        assert_eq!(lease.token, "key-1");
        assert!(lease.age() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_token_reissued_before_subscribe() {
        let issuer = Arc::new(CountingIssuer::default());
        let policy = TokenPolicy {
            renewal_threshold: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let auth = TokenAuthenticator::new(issuer.clone(), policy);

        auth.ensure_token().await.unwrap();
        assert_eq!(auth.ensure_token().await.unwrap(), "key-1");

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(auth.ensure_token().await.unwrap(), "key-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_failure_clears_token_and_calls_hook() {
        let issuer = Arc::new(CountingIssuer::default());
        let auth = TokenAuthenticator::new(issuer.clone(), TokenPolicy::default());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        auth.on_renewal_failure(Arc::new(move |err: StreamError| {
            sink.lock().unwrap().push(err);
            async {}.boxed()
        }));

        auth.ensure_token().await.unwrap();
        settle().await;
        issuer.fail_renew.store(true, Ordering::SeqCst);

        tokio::time::advance(Duration::from_millis(840_001)).await;
        settle().await;

        let errors = seen.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_auth_error());
        drop(errors);
        assert!(auth.lease().await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_forces_new_token() {
        let issuer = Arc::new(CountingIssuer::default());
        let auth = TokenAuthenticator::new(issuer.clone(), TokenPolicy::default());
        auth.ensure_token().await.unwrap();
        auth.invalidate().await;
        assert!(auth.lease().await.is_none());
        assert_eq!(auth.ensure_token().await.unwrap(), "key-2");
    }
}
