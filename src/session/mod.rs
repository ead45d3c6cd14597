//! One logical connection to the recognition service.
//!
//! A session owns the WebSocket for its lifetime: handshake, a send loop
//! draining the audio ring buffer into sequenced frames, a receive loop
//! decoding server frames into commands, and a heartbeat watchdog. On
//! failure it reconnects a bounded number of times with a fixed delay;
//! exhausting the budget is terminal until the user asks to start again.

pub mod response;
pub mod state;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{timeout, MissedTickBehavior};
use http::HeaderValue;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::audio::ring_buffer::AudioConsumer;
use crate::command::CommandInterpreter;
use crate::config::EngineConfig;
use crate::engine::EngineEvent;
use crate::protocol::{DecodeError, Frame, HandshakeRequest};
use response::{interpret_frame, ServerReply};
use state::{SessionState, SessionStateMachine};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type SharedSink = Arc<Mutex<WsSink>>;

/// Consecutive send failures before the connection is declared dead.
const MAX_CONSECUTIVE_SEND_ERRORS: u32 = 5;

/// Consecutive receive timeouts (each answered with a heartbeat) before
/// the connection is declared dead.
const MAX_RECEIVE_TIMEOUTS: u32 = 3;

/// Undecodable frames tolerated on one connection before treating the
/// condition as a transport failure.
const MAX_DECODE_ERRORS: u32 = 5;

/// Every blocking call in the session has one of these bounds.
#[derive(Debug, Clone)]
pub struct SessionTimeouts {
    pub connect: Duration,
    pub handshake: Duration,
    pub send: Duration,
    pub receive: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            handshake: Duration::from_secs(10),
            send: Duration::from_secs(5),
            receive: Duration::from_secs(30),
        }
    }
}

/// Per-connection sequence numbering.
///
/// The handshake carries 1; every audio frame increments before use; the
/// terminal frame increments and negates.
pub(crate) struct SequenceCounter {
    current: i32,
}

impl SequenceCounter {
    pub(crate) fn new() -> Self {
        Self { current: 1 }
    }

    pub(crate) fn handshake(&self) -> i32 {
        self.current
    }

    pub(crate) fn next_audio(&mut self) -> i32 {
        self.current += 1;
        self.current
    }

    pub(crate) fn final_audio(&mut self) -> i32 {
        self.current += 1;
        -self.current
    }
}

/// Drive one session to completion: connect/stream/reconnect until the
/// stop signal fires, the retry budget runs out, or the stream finishes.
#[allow(clippy::too_many_arguments)]
pub async fn run_session(
    cfg: Arc<EngineConfig>,
    timeouts: SessionTimeouts,
    mut audio: AudioConsumer,
    level: Arc<AtomicU8>,
    interpreter: Arc<CommandInterpreter>,
    state: Arc<SessionStateMachine>,
    events: mpsc::UnboundedSender<EngineEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut attempts: u32 = 0;

    loop {
        if *stop_rx.borrow() {
            state.force(SessionState::Idle);
            return;
        }

        state.force(SessionState::Connecting);
        let _ = events.send(EngineEvent::status("Connecting to recognition service..."));

        match stream_once(
            &cfg,
            &timeouts,
            &mut audio,
            &level,
            &interpreter,
            &state,
            &events,
            &mut stop_rx,
        )
        .await
        {
            Ok(()) => {
                // Stop was requested and the stream closed cleanly.
                state.force(SessionState::Idle);
                return;
            }
            Err(e) => {
                attempts += 1;
                if attempts >= cfg.max_reconnect_attempts {
                    state.force(SessionState::Failed);
                    error!(attempts, "Giving up on the recognition service: {e:#}");
                    let _ = events.send(EngineEvent::error(format!(
                        "Connection failed after {attempts} attempts: {e}"
                    )));
                    return;
                }

                state.force(SessionState::Reconnecting);
                warn!(
                    attempts,
                    max = cfg.max_reconnect_attempts,
                    "Session error, reconnecting: {e:#}"
                );
                let _ = events.send(EngineEvent::status(format!(
                    "Connection lost, retrying in {}s ({}/{})",
                    cfg.reconnect_delay_secs, attempts, cfg.max_reconnect_attempts
                )));

                let delay = Duration::from_secs_f64(cfg.reconnect_delay_secs);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wait_for_stop(&mut stop_rx) => {
                        state.force(SessionState::Idle);
                        return;
                    }
                }
            }
        }
    }
}

/// One connection attempt: returns `Ok(())` only when stop was requested,
/// `Err` on any transport/handshake/streaming failure.
#[allow(clippy::too_many_arguments)]
async fn stream_once(
    cfg: &EngineConfig,
    timeouts: &SessionTimeouts,
    audio: &mut AudioConsumer,
    level: &AtomicU8,
    interpreter: &CommandInterpreter,
    state: &SessionStateMachine,
    events: &mpsc::UnboundedSender<EngineEvent>,
    stop_rx: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut seq = SequenceCounter::new();

    let setup = async {
        let (sink, stream) = connect(cfg, timeouts, state).await?;
        let stream = handshake(cfg, timeouts, &sink, stream, &seq).await?;
        Ok::<_, anyhow::Error>((sink, stream))
    };

    let (sink, stream) = tokio::select! {
        r = setup => r?,
        _ = wait_for_stop(stop_rx) => return Ok(()),
    };

    state.transition(SessionState::Handshaking, SessionState::Streaming);
    let _ = events.send(EngineEvent::status("Listening for voice commands"));
    info!("Session streaming");

    let outcome = {
        let send_fut = send_loop(cfg, timeouts, audio, level, &sink, &mut seq, events);
        let recv_fut = recv_loop(stream, &sink, timeouts, interpreter, events);
        tokio::select! {
            e = send_fut => Some(e),
            e = recv_fut => Some(e),
            _ = wait_for_stop(stop_rx) => None,
        }
    };

    match outcome {
        None => {
            state.force(SessionState::Closing);
            finish_stream(&sink, audio, &mut seq, timeouts).await;
            Ok(())
        }
        Some(e) => Err(e),
    }
}

/// Open the WebSocket with the service credentials in the headers.
async fn connect(
    cfg: &EngineConfig,
    timeouts: &SessionTimeouts,
    state: &SessionStateMachine,
) -> anyhow::Result<(SharedSink, WsStream)> {
    let mut request = cfg
        .ws_url
        .as_str()
        .into_client_request()
        .map_err(|e| anyhow!("bad service URL: {e}"))?;

    let connect_id = uuid::Uuid::new_v4().to_string();
    let headers = request.headers_mut();
    headers.insert("X-Api-App-Key", header_value(&cfg.app_id)?);
    headers.insert("X-Api-Access-Key", header_value(&cfg.access_token)?);
    headers.insert("X-Api-Resource-Id", header_value(&cfg.resource_id)?);
    headers.insert("X-Api-Connect-Id", header_value(&connect_id)?);

    debug!(url = %cfg.ws_url, %connect_id, "Connecting");

    let (ws, _response) = match timeout(timeouts.connect, connect_async(request)).await {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => bail!("connect failed: {e}"),
        Err(_) => bail!("connect timed out after {:?}", timeouts.connect),
    };

    info!("WebSocket connection established");
    state.transition(SessionState::Connecting, SessionState::Handshaking);

    let (sink, stream) = ws.split();
    Ok((Arc::new(Mutex::new(sink)), stream))
}

fn header_value(v: &str) -> anyhow::Result<HeaderValue> {
    HeaderValue::from_str(v).map_err(|e| anyhow!("invalid header value: {e}"))
}

/// Send the full client request and wait for the server's first reply.
/// The session must not stream audio until this completes.
async fn handshake(
    cfg: &EngineConfig,
    timeouts: &SessionTimeouts,
    sink: &SharedSink,
    mut stream: WsStream,
    seq: &SequenceCounter,
) -> anyhow::Result<WsStream> {
    let frame = HandshakeRequest::new(&cfg.uid, cfg.sample_rate, cfg.channels)
        .into_frame(seq.handshake())?;
    send_frame(sink, frame, timeouts.send)
        .await
        .map_err(|e| anyhow!("handshake send failed: {e}"))?;

    let first = match timeout(timeouts.handshake, stream.next()).await {
        Ok(Some(Ok(msg))) => msg,
        Ok(Some(Err(e))) => bail!("handshake read failed: {e}"),
        Ok(None) => bail!("connection closed during handshake"),
        Err(_) => bail!("handshake timed out after {:?}", timeouts.handshake),
    };

    match first {
        Message::Binary(bytes) => {
            let frame =
                Frame::decode(&bytes).map_err(|e| anyhow!("handshake reply undecodable: {e}"))?;
            match interpret_frame(&frame) {
                Ok(ServerReply::ServerError { code, message }) => {
                    bail!("handshake rejected by server ({code}): {message}")
                }
                Ok(_) => {
                    debug!("Handshake acknowledged");
                    Ok(stream)
                }
                Err(e) => bail!("handshake reply undecodable: {e}"),
            }
        }
        other => bail!("unexpected handshake reply: {other:?}"),
    }
}

/// Drain audio chunks into sequenced frames on a fixed tick. Never
/// returns unless the connection is declared dead.
async fn send_loop(
    cfg: &EngineConfig,
    timeouts: &SessionTimeouts,
    audio: &mut AudioConsumer,
    level: &AtomicU8,
    sink: &SharedSink,
    seq: &mut SequenceCounter,
    events: &mpsc::UnboundedSender<EngineEvent>,
) -> anyhow::Error {
    let tick = if cfg.low_latency_mode {
        Duration::from_millis(50)
    } else {
        Duration::from_millis(100)
    };
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut consecutive_errors: u32 = 0;
    let mut last_level: Option<u8> = None;
    let mut chunk = vec![0i16; cfg.chunk_size];

    loop {
        interval.tick().await;

        let now_level = level.load(Ordering::Acquire);
        if last_level != Some(now_level) {
            last_level = Some(now_level);
            let _ = events.send(EngineEvent::AudioLevelChanged { percent: now_level });
        }

        // A stalled connection discards the oldest audio first; capture
        // keeps writing the newest.
        let keep = audio.capacity().saturating_sub(cfg.chunk_size * 2);
        let dropped = audio.trim_oldest(keep);
        if dropped > 0 {
            debug!(dropped, "Ring buffer overflow, discarded oldest samples");
        }

        if audio.available() < cfg.chunk_size {
            continue;
        }
        let read = audio.pop_slice(&mut chunk);
        let bytes = pcm16_to_bytes(&chunk[..read]);
        let frame = Frame::audio_only(seq.next_audio(), &bytes, false);

        match send_frame(sink, frame, timeouts.send).await {
            Ok(()) => {
                consecutive_errors = 0;
                debug!(samples = read, "Sent audio frame");
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!(consecutive_errors, "Audio send failed: {e}");
                if consecutive_errors >= MAX_CONSECUTIVE_SEND_ERRORS {
                    return anyhow!("audio send failed {consecutive_errors} times in a row: {e}");
                }
            }
        }
    }
}

/// Read and decode server frames; answer silence with heartbeats. Never
/// returns unless the connection is declared dead.
async fn recv_loop(
    mut stream: WsStream,
    sink: &SharedSink,
    timeouts: &SessionTimeouts,
    interpreter: &CommandInterpreter,
    events: &mpsc::UnboundedSender<EngineEvent>,
) -> anyhow::Error {
    let mut consecutive_timeouts: u32 = 0;
    let mut decode_errors: u32 = 0;

    loop {
        match timeout(timeouts.receive, stream.next()).await {
            Err(_) => {
                consecutive_timeouts += 1;
                warn!(consecutive_timeouts, "No server traffic, sending heartbeat");
                if let Err(e) = sink.lock().await.send(Message::Ping(Vec::new())).await {
                    return anyhow!("heartbeat send failed: {e}");
                }
                if consecutive_timeouts >= MAX_RECEIVE_TIMEOUTS {
                    return anyhow!("server silent through {consecutive_timeouts} heartbeats");
                }
            }
            Ok(None) => return anyhow!("server closed the connection"),
            Ok(Some(Err(e))) => return anyhow!("socket read failed: {e}"),
            Ok(Some(Ok(msg))) => {
                consecutive_timeouts = 0;
                match msg {
                    Message::Binary(bytes) => {
                        if let Err(e) = handle_server_frame(&bytes, interpreter, events) {
                            decode_errors += 1;
                            warn!(decode_errors, "Dropping undecodable frame: {e}");
                            if decode_errors >= MAX_DECODE_ERRORS {
                                return anyhow!(
                                    "too many undecodable frames ({decode_errors}): {e}"
                                );
                            }
                        }
                    }
                    Message::Close(cf) => {
                        return anyhow!("server closed the connection: {cf:?}")
                    }
                    // Pings are answered automatically by tungstenite.
                    Message::Ping(_) | Message::Pong(_) | Message::Text(_) => {}
                    Message::Frame(_) => {}
                }
            }
        }
    }
}

/// Decode one server frame and turn any recognized text into at most one
/// command event. Server-reported errors surface as error events; the
/// session keeps streaming.
fn handle_server_frame(
    bytes: &[u8],
    interpreter: &CommandInterpreter,
    events: &mpsc::UnboundedSender<EngineEvent>,
) -> Result<(), DecodeError> {
    let frame = Frame::decode(bytes)?;
    match interpret_frame(&frame)? {
        ServerReply::Recognized(result) => {
            debug!(text = %result.text, "Recognition result");
            if let Some(cmd) = interpreter.interpret(&result.text) {
                let _ = events.send(EngineEvent::CommandRecognized {
                    category: cmd.category,
                    value: cmd.value,
                    original_text: cmd.original_text,
                });
            }
        }
        ServerReply::ServerError { code, message } => {
            error!(code, "Server error: {message}");
            let _ = events.send(EngineEvent::error(format!(
                "Server error {code}: {message}"
            )));
        }
        ServerReply::Ack | ServerReply::Nothing => {}
    }
    Ok(())
}

/// Flush any buffered tail audio as the terminal negative-sequence frame,
/// then close the socket.
async fn finish_stream(
    sink: &SharedSink,
    audio: &mut AudioConsumer,
    seq: &mut SequenceCounter,
    timeouts: &SessionTimeouts,
) {
    let tail = audio.drain_all();
    let bytes = pcm16_to_bytes(&tail);
    let frame = Frame::audio_only(seq.final_audio(), &bytes, true);
    if let Err(e) = send_frame(sink, frame, timeouts.send).await {
        debug!("Final frame send failed: {e}");
    }
    if let Err(e) = sink.lock().await.close().await {
        debug!("Socket close failed: {e}");
    }
    info!("Session closed");
}

async fn send_frame(sink: &SharedSink, frame: Frame, bound: Duration) -> anyhow::Result<()> {
    let bytes = frame.encode();
    match timeout(bound, async {
        sink.lock().await.send(Message::Binary(bytes)).await
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(anyhow!("socket write failed: {e}")),
        Err(_) => Err(anyhow!("socket write timed out after {bound:?}")),
    }
}

/// Resolve when the stop signal flips true (or its sender is gone).
async fn wait_for_stop(stop_rx: &mut watch::Receiver<bool>) {
    while !*stop_rx.borrow() {
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_starts_at_one_for_the_handshake() {
        let seq = SequenceCounter::new();
        assert_eq!(seq.handshake(), 1);
    }

    #[test]
    fn audio_sequences_are_strictly_increasing() {
        let mut seq = SequenceCounter::new();
        let sent: Vec<i32> = (0..50).map(|_| seq.next_audio()).collect();
        assert_eq!(sent[0], 2);
        assert!(sent.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn final_frame_negates_the_next_sequence() {
        let mut seq = SequenceCounter::new();
        seq.next_audio(); // 2
        seq.next_audio(); // 3
        assert_eq!(seq.final_audio(), -4);
    }

    #[test]
    fn pcm_bytes_are_little_endian() {
        assert_eq!(pcm16_to_bytes(&[0x0102, -2]), vec![0x02, 0x01, 0xFE, 0xFF]);
    }

    #[test]
    fn default_timeouts_are_bounded() {
        let t = SessionTimeouts::default();
        assert!(t.connect <= Duration::from_secs(30));
        assert!(t.handshake <= Duration::from_secs(30));
        assert!(t.send < t.receive);
    }
}
