use std::io::Write;

use anyhow::Result;
use clap::Parser;
use kiss_voice_chat::audio::{AudioInput, Playback};
use kiss_voice_chat::config::{Config, Credentials};
use kiss_voice_chat::session::{Session, SessionEvent};
use rustyline_async::{Readline, ReadlineEvent};
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

#[derive(Debug, Parser)]
struct Args {
    /// Name shown to other participants.
    username: String,
    #[clap(long, short, env = "KISS_RELAY_URL", default_value = "ws://127.0.0.1:2333")]
    relay: String,
    /// Token endpoint issuing relay credentials.
    #[clap(long, short, env = "KISS_TOKEN_URL")]
    token_url: Option<String>,
    /// Pre-issued relay token, used when no token endpoint is given.
    #[clap(long, env = "KISS_TOKEN", default_value = "")]
    token: String,
    #[clap(long, default_value = "kiss-voice-chat")]
    channel: String,
    /// Join without a microphone (sends silence).
    #[clap(long)]
    no_mic: bool,
    /// Do not play remote audio.
    #[clap(long)]
    no_playback: bool,
}

#[derive(Debug, Parser)]
enum Rl {
    /// Start sending audio and call everyone in the room.
    #[clap(alias = "c")]
    Connect,
    /// Toggle the microphone mute flag.
    #[clap(alias = "m")]
    Mute,
    /// Send a chat line.
    #[clap(alias = "s")]
    Say { text: Vec<String> },
    /// List peer connections and their states.
    #[clap(alias = "p")]
    Peers,
    /// Print the chat history.
    #[clap(alias = "h")]
    History,
    #[clap(alias = "q")]
    Quit,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let credentials = match args.token_url {
        Some(url) => Credentials::Endpoint(url),
        None => Credentials::Static {
            token: args.token,
            client_id: None,
        },
    };
    let mut config = Config::new(args.username, args.relay, credentials);
    config.channel = args.channel;
    if args.no_mic {
        config.audio.input = AudioInput::Silence;
    }
    if args.no_playback {
        config.audio.playback = false;
    }
    let playback_enabled = config.audio.playback;

    let session = Session::join(config).await?;
    let mut events = session.lock().await.subscribe_events();
    let mut playbacks = Vec::new();

    let (mut rl, mut stdout) = Readline::new("> ".to_string())?;
    writeln!(stdout, "joined as {}", session.lock().await.client_id())?;
    loop {
        select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                match event {
                    SessionEvent::Chat(entry) => writeln!(stdout, "[{}] {}", entry.sender, entry.text)?,
                    SessionEvent::Connected(false) => writeln!(stdout, "relay connection lost")?,
                    SessionEvent::Connected(true) => {},
                    SessionEvent::PeerJoined(id) => writeln!(stdout, "* {id} is here")?,
                    SessionEvent::PeerLeft(id) => writeln!(stdout, "* {id} left")?,
                    SessionEvent::PeerState { client_id, state } => {
                        writeln!(stdout, "* {client_id}: {state}")?;
                    }
                    SessionEvent::RemoteAudio { client_id, track } => {
                        writeln!(stdout, "* receiving audio from {client_id}")?;
                        if playback_enabled {
                            match Playback::start(track) {
                                Ok(playback) => playbacks.push(playback),
                                Err(err) => warn!("cannot play remote audio: {err}"),
                            }
                        }
                    }
                }
            }
            line = rl.readline() => {
                let line = match line? {
                    ReadlineEvent::Eof => break,
                    ReadlineEvent::Interrupted => {
                        writeln!(stdout, "")?;
                        continue;
                    },
                    ReadlineEvent::Line(line) => line,
                };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                rl.add_history_entry(line.clone());
                let line_args = shellwords::split(&line)
                    .map(|mut args| {
                        args.insert(0, "".to_string());
                        Rl::try_parse_from(args)
                    });
                let cmd = match line_args {
                    Err(err) => {
                        writeln!(stdout, "error parsing command: {}", err)?;
                        continue;
                    },
                    Ok(Err(err)) => {
                        writeln!(stdout, "{}", err)?;
                        continue;
                    },
                    Ok(Ok(cmd)) => cmd,
                };
                match cmd {
                    Rl::Connect => {
                        if let Err(err) = session.lock().await.connect().await {
                            writeln!(stdout, "failed to connect: {}", err)?;
                        }
                    },
                    Rl::Mute => {
                        let muted = session.lock().await.toggle_mute();
                        writeln!(stdout, "{}", if muted { "muted" } else { "unmuted" })?;
                    },
                    Rl::Say { text } => {
                        let text = text.join(" ");
                        if let Err(err) = session.lock().await.send_message(&text) {
                            writeln!(stdout, "failed to send: {}", err)?;
                        }
                    },
                    Rl::Peers => {
                        let peers = session.lock().await.peers();
                        if peers.is_empty() {
                            writeln!(stdout, "no peer connections")?;
                            continue;
                        }
                        for (id, state) in peers {
                            writeln!(stdout, "  - {id}: {state}")?;
                        }
                    },
                    Rl::History => {
                        for entry in session.lock().await.history() {
                            writeln!(stdout, "[{}] {}", entry.sender, entry.text)?;
                        }
                    },
                    Rl::Quit => break,
                }
            }
        }
    }
    session.lock().await.stop().await;
    Ok(())
}
