//! tokio-tungstenite 기반 WebSocket 전송 채널.
//!
//! 쓰기 절반은 [`WsTransport`]가 `Transport`로 노출하고, 읽기 절반은 별도
//! 태스크에서 프레임을 [`FrameHandler`]로 넘깁니다. 수신 루프는 프레임을
//! 도착 순서대로 하나씩 처리합니다.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, Stream, StreamExt};
use futures::{Sink, SinkExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::{StreamError, StreamResult};
use crate::traits::Transport;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// 수신 프레임 처리기.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// 텍스트 프레임 하나를 처리합니다.
    async fn on_frame(&self, frame: &str);

    /// 연결이 끊겼을 때 한 번 호출됩니다.
    async fn on_disconnect(&self, error: StreamError);
}

/// 연결 옵션.
#[derive(Debug, Clone)]
pub struct WsOptions {
    /// 이 시간 동안 아무 프레임도 없으면 연결 실패로 처리
    pub heartbeat_timeout: Duration,
    /// ping 전송 간격
    pub ping_interval: Duration,
    /// 앱 수준 ping. `None`이면 WebSocket ping 프레임
    pub ping_payload: Option<Value>,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(15),
            ping_payload: None,
        }
    }
}

/// WebSocket 쓰기 채널.
pub struct WsTransport {
    url: String,
    sink: Arc<Mutex<WsSink>>,
    reader: JoinHandle<()>,
}

impl WsTransport {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// 수신 루프가 아직 돌고 있는지 확인.
    pub fn is_running(&self) -> bool {
        !self.reader.is_finished()
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, payload: &Value) -> StreamResult<()> {
        let text = serde_json::to_string(payload)?;
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(StreamError::from)
    }

    async fn close(&self) -> StreamResult<()> {
        let result = self.sink.lock().await.close().await;
        self.reader.abort();
        result.map_err(StreamError::from)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// WebSocket에 연결하고 수신 루프를 시작합니다.
pub async fn connect(
    url: &str,
    handler: Arc<dyn FrameHandler>,
    options: WsOptions,
) -> StreamResult<WsTransport> {
    info!(url = %url, "WebSocket 연결 중");
    let (stream, _) = connect_async(url)
        .await
        .map_err(|e| StreamError::Network(format!("WebSocket 연결 실패 {}: {}", url, e)))?;
    let (write, read) = stream.split();
    let sink = Arc::new(Mutex::new(write));

    let reader = tokio::spawn(read_loop(read, sink.clone(), handler, options, url.to_string()));
    info!(url = %url, "WebSocket 연결 성공");

    Ok(WsTransport {
        url: url.to_string(),
        sink,
        reader,
    })
}

/// 수신 루프. 연결이 끝나면 `on_disconnect`를 한 번 호출하고 종료합니다.
///
/// 아무 프레임이든 수신하면 하트비트 기한이 연장됩니다. ping 전송은 기한을 바꾸지 않습니다.
async fn read_loop<R, W>(
    mut read: R,
    sink: Arc<Mutex<W>>,
    handler: Arc<dyn FrameHandler>,
    options: WsOptions,
    url: String,
) where
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let mut ping = interval(options.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // 첫 tick은 즉시 완료되므로 소비
    ping.tick().await;
    let mut deadline = Instant::now() + options.heartbeat_timeout;

    let failure = loop {
        tokio::select! {
            received = read.next() => {
                deadline = Instant::now() + options.heartbeat_timeout;
                match received {
                    Some(Ok(Message::Text(text))) => handler.on_frame(&text).await,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => handler.on_frame(&text).await,
                        Err(_) => debug!(url = %url, "non-UTF8 binary frame ignored"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        debug!("Ping 수신, Pong 응답");
                        if let Err(e) = sink.lock().await.send(Message::Pong(data)).await {
                            warn!(url = %url, error = %e, "Pong 전송 실패");
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        warn!(url = %url, ?frame, "서버에서 연결 종료 요청");
                        break StreamError::Disconnected(format!("closed by server: {:?}", frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(url = %url, error = %e, "WebSocket 수신 에러");
                        break StreamError::from(e);
                    }
                    None => {
                        warn!(url = %url, "WebSocket 스트림 종료");
                        break StreamError::Disconnected("stream ended".to_string());
                    }
                }
            }
            _ = sleep_until(deadline) => {
                warn!(url = %url, timeout = ?options.heartbeat_timeout, "heartbeat timeout");
                break StreamError::Network(format!(
                    "no frame within {:?}",
                    options.heartbeat_timeout
                ));
            }
            _ = ping.tick() => {
                let message = match &options.ping_payload {
                    Some(payload) => Message::Text(payload.to_string()),
                    None => Message::Ping(Vec::new()),
                };
                if let Err(e) = sink.lock().await.send(message).await {
                    error!(url = %url, error = %e, "Ping 전송 실패");
                    break StreamError::Network(format!("ping failed: {}", e));
                }
            }
        }
    };

    handler.on_disconnect(failure).await;
}
