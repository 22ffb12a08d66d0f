use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, connect_async};

use kiss_voice_chat::audio::AudioInput;
use kiss_voice_chat::config::{Config, Credentials, DEFAULT_CHANNEL};
use kiss_voice_chat::relay::protocol::{ClientFrame, PresenceEvent, ServerFrame};
use kiss_voice_chat::session::{Session, SessionEvent};
use kiss_voice_chat::signal::TOPIC_SIGNAL;

type Members = Arc<Mutex<HashMap<String, HashMap<String, mpsc::UnboundedSender<ServerFrame>>>>>;

/// Minimal in-process stand-in for the managed pub/sub relay: auth, channel
/// attach with presence replay, publish with echo to everyone including the
/// publisher, presence-leave on disconnect.
async fn spawn_relay() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let members: Members = Arc::new(Mutex::new(HashMap::new()));
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(serve_client(stream, members.clone()));
        }
    });
    Ok(format!("ws://{addr}"))
}

async fn serve_client(stream: TcpStream, members: Members) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();

    let Some(Ok(first)) = stream.next().await else {
        return;
    };
    let Ok(ClientFrame::Auth { client_id, .. }) = serde_json::from_slice(&first.into_data()) else {
        return;
    };
    let client_id = client_id.unwrap_or_else(random_client_id);
    let welcome = ServerFrame::Welcome {
        client_id: client_id.clone(),
    };
    if send_frame(&mut sink, &welcome).await.is_err() {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    let mut attached: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break; };
                if send_frame(&mut sink, &frame).await.is_err() {
                    break;
                }
            }
            msg = stream.next() => {
                let msg = match msg {
                    None | Some(Err(_)) => break,
                    Some(Ok(msg)) if msg.is_close() => break,
                    Some(Ok(msg)) => msg,
                };
                let Ok(frame) = serde_json::from_slice::<ClientFrame>(&msg.into_data()) else {
                    continue;
                };
                match frame {
                    ClientFrame::Attach { channel } => {
                        let mut members = members.lock().await;
                        let room = members.entry(channel.clone()).or_default();
                        let _ = tx.send(ServerFrame::Attached { channel: channel.clone() });
                        // replay current membership to the newcomer
                        for existing in room.keys() {
                            let _ = tx.send(ServerFrame::Presence {
                                channel: channel.clone(),
                                event: PresenceEvent::Enter,
                                client_id: existing.clone(),
                            });
                        }
                        for peer_tx in room.values() {
                            let _ = peer_tx.send(ServerFrame::Presence {
                                channel: channel.clone(),
                                event: PresenceEvent::Enter,
                                client_id: client_id.clone(),
                            });
                        }
                        room.insert(client_id.clone(), tx.clone());
                        attached.push(channel);
                    }
                    ClientFrame::Publish { channel, topic, data } => {
                        let members = members.lock().await;
                        if let Some(room) = members.get(&channel) {
                            for peer_tx in room.values() {
                                let _ = peer_tx.send(ServerFrame::Message {
                                    channel: channel.clone(),
                                    topic: topic.clone(),
                                    client_id: client_id.clone(),
                                    data: data.clone(),
                                });
                            }
                        }
                    }
                    ClientFrame::Auth { .. } => {}
                }
            }
        }
    }

    let mut members = members.lock().await;
    for channel in attached {
        if let Some(room) = members.get_mut(&channel) {
            room.remove(&client_id);
            for peer_tx in room.values() {
                let _ = peer_tx.send(ServerFrame::Presence {
                    channel: channel.clone(),
                    event: PresenceEvent::Leave,
                    client_id: client_id.clone(),
                });
            }
        }
    }
}

fn random_client_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

async fn send_frame(
    sink: &mut SplitSink<WebSocketStream<TcpStream>, Message>,
    frame: &ServerFrame,
) -> Result<()> {
    sink.send(Message::binary(serde_json::to_vec(frame)?)).await?;
    Ok(())
}

/// Raw relay participant for driving the session from the outside.
struct TestClient {
    client_id: String,
    channel: String,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    async fn join(url: &str, channel: &str) -> Result<TestClient> {
        let (mut ws, _) = connect_async(url).await?;
        let auth = ClientFrame::Auth {
            token: "test-token".to_string(),
            client_id: None,
        };
        ws.send(Message::binary(serde_json::to_vec(&auth)?)).await?;
        let client_id = match Self::next_raw(&mut ws).await? {
            ServerFrame::Welcome { client_id } => client_id,
            other => bail!("expected welcome, got {other:?}"),
        };
        let attach = ClientFrame::Attach {
            channel: channel.to_string(),
        };
        ws.send(Message::binary(serde_json::to_vec(&attach)?)).await?;
        match Self::next_raw(&mut ws).await? {
            ServerFrame::Attached { .. } => {}
            other => bail!("expected attached, got {other:?}"),
        }
        Ok(TestClient {
            client_id,
            channel: channel.to_string(),
            ws,
        })
    }

    async fn publish(&mut self, topic: &str, data: Value) -> Result<()> {
        let frame = ClientFrame::Publish {
            channel: self.channel.clone(),
            topic: topic.to_string(),
            data,
        };
        self.ws
            .send(Message::binary(serde_json::to_vec(&frame)?))
            .await?;
        Ok(())
    }

    async fn next_raw(ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>) -> Result<ServerFrame> {
        let msg = timeout(Duration::from_secs(15), ws.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("relay closed"))??;
        Ok(serde_json::from_slice(&msg.into_data())?)
    }

    /// Next publication on `topic`, skipping presence and other topics.
    async fn next_message_on(&mut self, topic: &str) -> Result<(String, Value)> {
        loop {
            match Self::next_raw(&mut self.ws).await? {
                ServerFrame::Message {
                    topic: t,
                    client_id,
                    data,
                    ..
                } if t == topic => return Ok((client_id, data)),
                _ => continue,
            }
        }
    }

    /// Fail if any publication at all shows up within `wait`.
    async fn expect_no_messages(&mut self, wait: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            match timeout(remaining, self.ws.next()).await {
                Err(_) => return Ok(()),
                Ok(None) => return Ok(()),
                Ok(Some(msg)) => {
                    let frame: ServerFrame = serde_json::from_slice(&msg?.into_data())?;
                    if let ServerFrame::Message { topic, .. } = frame {
                        bail!("unexpected publication on {topic}");
                    }
                }
            }
        }
    }
}

fn test_config(username: &str, url: &str) -> Config {
    let mut config = Config::new(
        username,
        url,
        Credentials::Static {
            token: "test-token".to_string(),
            client_id: None,
        },
    );
    config.audio.input = AudioInput::Silence;
    config.audio.playback = false;
    config
}

async fn eventually<F, Fut>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = timeout(Duration::from_secs(15), async {
        loop {
            if check().await {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if result.is_err() {
        bail!("timed out waiting for {what}");
    }
    Ok(())
}

async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<SessionEvent>,
    what: &str,
    mut pred: F,
) -> Result<SessionEvent>
where
    F: FnMut(&SessionEvent) -> bool,
{
    let found = timeout(Duration::from_secs(15), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await;
    match found {
        Ok(Some(event)) => Ok(event),
        Ok(None) => bail!("event stream closed while waiting for {what}"),
        Err(_) => bail!("timed out waiting for {what}"),
    }
}

/// Real SDP offer with one audio section, for driving the answering path
/// from outside a session.
async fn audio_offer() -> Result<(Arc<webrtc::peer_connection::RTCPeerConnection>, String)> {
    use webrtc::api::APIBuilder;
    use webrtc::api::interceptor_registry::register_default_interceptors;
    use webrtc::api::media_engine::MediaEngine;
    use webrtc::interceptor::registry::Registry;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();
    let pc = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await?);
    pc.add_transceiver_from_kind(RTPCodecType::Audio, None).await?;
    let offer = pc.create_offer(None).await?;
    let sdp = offer.sdp.clone();
    pc.set_local_description(offer).await?;
    Ok((pc, sdp))
}

#[tokio::test]
async fn two_sessions_negotiate_chat_and_teardown() -> Result<()> {
    let url = spawn_relay().await?;

    let alice = Session::join(test_config("alice", &url)).await?;
    let mut alice_events = alice.lock().await.subscribe_events();

    let bob = Session::join(test_config("bob", &url)).await?;
    let mut bob_events = bob.lock().await.subscribe_events();

    // presence propagates both ways before anyone calls; bob may have seen
    // alice's replayed entry before we subscribed, so poll his roster
    wait_for_event(&mut alice_events, "bob in alice's roster", |e| {
        matches!(e, SessionEvent::PeerJoined(_))
    })
    .await?;
    {
        let bob = bob.clone();
        eventually("alice in bob's roster", move || {
            let bob = bob.clone();
            async move { !bob.lock().await.roster().is_empty() }
        })
        .await?;
    }

    // bob's join announcement lands in alice's history under the system marker
    {
        let alice = alice.clone();
        eventually("bob's join announcement", move || {
            let alice = alice.clone();
            async move {
                let session = alice.lock().await;
                session
                    .history()
                    .iter()
                    .any(|e| e.sender == "system" && e.text.contains("bob"))
            }
        })
        .await?;
    }

    let alice_id = alice.lock().await.client_id().to_string();
    let bob_id = bob.lock().await.client_id().to_string();

    alice.lock().await.connect().await?;
    assert!(alice.lock().await.is_capturing());

    // bob answers the offer without ever calling connect(); both sides end
    // up with exactly one peer entry and an applied remote description
    {
        let (alice, bob) = (alice.clone(), bob.clone());
        let (alice_id, bob_id) = (alice_id.clone(), bob_id.clone());
        eventually("both sides negotiated", move || {
            let (alice, bob) = (alice.clone(), bob.clone());
            let (alice_id, bob_id) = (alice_id.clone(), bob_id.clone());
            async move {
                let a = alice.lock().await;
                let b = bob.lock().await;
                a.peers().len() == 1
                    && b.peers().len() == 1
                    && a.peer_negotiated(&bob_id).await
                    && b.peer_negotiated(&alice_id).await
            }
        })
        .await?;
    }

    alice.lock().await.send_message("hello bob")?;
    wait_for_event(&mut bob_events, "alice's chat line", |e| {
        matches!(e, SessionEvent::Chat(entry) if entry.sender == "alice" && entry.text == "hello bob")
    })
    .await?;

    // the sent line lands in alice's history exactly once, under the self marker
    let history = alice.lock().await.history();
    let sent: Vec<_> = history.iter().filter(|e| e.text == "hello bob").collect();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].sender, "me");

    // teardown: capture stops, peer connections close, and bob prunes his
    // entry when the relay reports alice gone
    alice.lock().await.stop().await;
    assert!(!alice.lock().await.is_capturing());
    assert!(alice.lock().await.peers().is_empty());
    wait_for_event(&mut bob_events, "alice's departure", |e| {
        matches!(e, SessionEvent::PeerLeft(_))
    })
    .await?;
    assert!(bob.lock().await.peers().is_empty());

    bob.lock().await.stop().await;
    Ok(())
}

#[tokio::test]
async fn empty_chat_is_rejected() -> Result<()> {
    let url = spawn_relay().await?;
    let session = Session::join(test_config("carol", &url)).await?;
    let mut observer = TestClient::join(&url, DEFAULT_CHANNEL).await?;

    assert!(session.lock().await.send_message("").is_err());
    assert!(session.lock().await.send_message("   \t ").is_err());
    assert!(session.lock().await.history().is_empty());
    // nothing went over the wire either
    observer.expect_no_messages(Duration::from_millis(300)).await?;

    session.lock().await.stop().await;
    Ok(())
}

#[tokio::test]
async fn self_and_mistargeted_signals_are_ignored() -> Result<()> {
    let url = spawn_relay().await?;
    let session = Session::join(test_config("dave", &url)).await?;
    let session_id = session.lock().await.client_id().to_string();
    let mut client = TestClient::join(&url, DEFAULT_CHANNEL).await?;

    // claims to come from the session itself
    client
        .publish(
            TOPIC_SIGNAL,
            json!({
                "type": "offer",
                "sdp": "v=0",
                "senderClientId": session_id,
                "targetClientId": session_id,
            }),
        )
        .await?;
    // addressed to a third party
    client
        .publish(
            TOPIC_SIGNAL,
            json!({
                "type": "offer",
                "sdp": "v=0",
                "senderClientId": client.client_id,
                "targetClientId": "someone-else",
            }),
        )
        .await?;

    sleep(Duration::from_millis(300)).await;
    assert!(session.lock().await.peers().is_empty());

    session.lock().await.stop().await;
    Ok(())
}

#[tokio::test]
async fn offer_from_unseen_sender_yields_one_answer() -> Result<()> {
    let url = spawn_relay().await?;
    let session = Session::join(test_config("erin", &url)).await?;
    let session_id = session.lock().await.client_id().to_string();
    let mut client = TestClient::join(&url, DEFAULT_CHANNEL).await?;

    let (_pc, sdp) = audio_offer().await?;
    client
        .publish(
            TOPIC_SIGNAL,
            json!({
                "type": "offer",
                "sdp": sdp,
                "senderClientId": client.client_id,
                "targetClientId": session_id,
            }),
        )
        .await?;

    // exactly one answer comes back, addressed to us (the session also
    // trickles candidates; skip those)
    let answer = loop {
        let (publisher, data) = client.next_message_on(TOPIC_SIGNAL).await?;
        if publisher == client.client_id {
            continue; // our own echo
        }
        if data["type"] == "answer" {
            break data;
        }
    };
    assert_eq!(answer["senderClientId"], session_id.as_str());
    assert_eq!(answer["targetClientId"], client.client_id.as_str());
    assert_eq!(session.lock().await.peers().len(), 1);

    // duplicated and repeated candidates are tolerated and create nothing
    let candidate = json!({
        "type": "candidate",
        "candidate": {
            "candidate": "candidate:863018703 1 udp 2130706431 127.0.0.1 44444 typ host",
            "sdpMid": "0",
        },
        "senderClientId": client.client_id,
        "targetClientId": session_id,
    });
    for _ in 0..3 {
        client.publish(TOPIC_SIGNAL, candidate.clone()).await?;
    }
    sleep(Duration::from_millis(300)).await;
    assert_eq!(session.lock().await.peers().len(), 1);
    // the session is still healthy
    session.lock().await.send_message("still here")?;

    session.lock().await.stop().await;
    Ok(())
}

#[tokio::test]
async fn toggle_mute_stays_local() -> Result<()> {
    let url = spawn_relay().await?;
    let session = Session::join(test_config("fay", &url)).await?;
    let mut observer = TestClient::join(&url, DEFAULT_CHANNEL).await?;

    // sessions come up muted
    assert!(session.lock().await.is_muted());
    assert!(!session.lock().await.toggle_mute());
    assert!(session.lock().await.toggle_mute());
    // no chat or signaling traffic resulted
    observer.expect_no_messages(Duration::from_millis(300)).await?;

    session.lock().await.stop().await;
    Ok(())
}
