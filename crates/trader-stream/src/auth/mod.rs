//! 개인 채널 인증.
//!
//! - [`ChallengeAuthenticator`]: 서버 챌린지에 서명해 연결 수명 동안 캐시
//! - [`TokenAuthenticator`]: 짧은 수명의 세션 토큰을 발급하고 만료 전에 갱신

mod challenge;
mod token;

pub use challenge::{ChallengeAuthenticator, HmacChallengeSigner, SignatureEncoding};
pub use token::{RenewalFailureHook, TokenAuthenticator, TokenLease, TokenPolicy};
