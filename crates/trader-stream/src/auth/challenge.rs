//! 챌린지/응답 인증.

use std::future::Future;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256, Sha512};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{StreamError, StreamResult};
use crate::traits::{ChallengeSigner, Credential};

type HmacSha512 = Hmac<Sha512>;

/// 서명 출력 인코딩.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureEncoding {
    #[default]
    Base64,
    Hex,
}

/// HMAC-SHA512 챌린지 서명기.
///
/// 챌린지를 SHA-256으로 해시한 뒤, base64 디코딩한 시크릿을 키로 HMAC-SHA512 서명합니다.
pub struct HmacChallengeSigner {
    secret: SecretString,
    encoding: SignatureEncoding,
}

impl HmacChallengeSigner {
    pub fn new(secret: SecretString) -> Self {
        Self {
            secret,
            encoding: SignatureEncoding::default(),
        }
    }

    pub fn with_encoding(mut self, encoding: SignatureEncoding) -> Self {
        self.encoding = encoding;
        self
    }
}

impl ChallengeSigner for HmacChallengeSigner {
    fn sign(&self, challenge: &str) -> StreamResult<String> {
        let key = BASE64
            .decode(self.secret.expose_secret())
            .map_err(|e| StreamError::Authentication(format!("invalid secret encoding: {}", e)))?;
        let digest = Sha256::digest(challenge.as_bytes());

        let mut mac = HmacSha512::new_from_slice(&key)
            .map_err(|e| StreamError::Authentication(format!("invalid secret: {}", e)))?;
        mac.update(&digest);
        let signature = mac.finalize().into_bytes();

        Ok(match self.encoding {
            SignatureEncoding::Base64 => BASE64.encode(signature),
            SignatureEncoding::Hex => hex::encode(signature),
        })
    }
}

/// 챌린지 서명을 연결 수명 동안 캐시하는 인증기.
///
/// 동시에 들어온 개인 구독은 하나의 핸드셰이크를 공유합니다.
/// `credential` 잠금은 챌린지 응답을 기다리는 동안 잡지 않으므로,
/// 수신 루프의 `invalidate`가 핸드셰이크 뒤에서 막히지 않습니다.
pub struct ChallengeAuthenticator {
    signer: Arc<dyn ChallengeSigner>,
    credential: Mutex<Option<Credential>>,
    /// 진행 중인 핸드셰이크 (하나만)
    handshake: Mutex<()>,
}

impl ChallengeAuthenticator {
    pub fn new(signer: Arc<dyn ChallengeSigner>) -> Self {
        Self {
            signer,
            credential: Mutex::new(None),
            handshake: Mutex::new(()),
        }
    }

    /// 캐시된 자격 증명을 반환하거나 핸드셰이크를 수행합니다.
    ///
    /// `fetch_challenge`는 서버 챌린지 문자열을 받아옵니다. 실패는 모두
    /// 인증 에러로 보고되며 재시도하지 않습니다.
    pub async fn authenticate<F, Fut>(&self, fetch_challenge: F) -> StreamResult<Credential>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StreamResult<String>>,
    {
        if let Some(credential) = self.credential().await {
            return Ok(credential);
        }

        let _handshake = self.handshake.lock().await;
        // 앞선 핸드셰이크가 끝났으면 그 결과를 사용
        if let Some(credential) = self.credential().await {
            return Ok(credential);
        }

        let challenge = fetch_challenge().await.map_err(as_auth_error)?;
        let signature = self.signer.sign(&challenge).map_err(as_auth_error)?;
        let credential = Credential::Challenge {
            challenge,
            signature,
        };
        *self.credential.lock().await = Some(credential.clone());
        info!("challenge handshake completed");
        Ok(credential)
    }

    pub async fn credential(&self) -> Option<Credential> {
        self.credential.lock().await.clone()
    }

    /// 캐시를 지웁니다. 다음 개인 구독이 처음부터 인증합니다.
    pub async fn invalidate(&self) {
        if self.credential.lock().await.take().is_some() {
            debug!("challenge credential invalidated");
        }
    }
}

fn as_auth_error(error: StreamError) -> StreamError {
    match error {
        StreamError::Authentication(_) => error,
        other => {
            warn!(error = %other, "challenge handshake failed");
            StreamError::Authentication(other.to_string())
        }
    }
}
