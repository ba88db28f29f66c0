//! Headless voice chat client.
//!
//! Connects to the chat room, wires the configured speech backend and
//! drives the session from stdin:
//!
//! - `/talk` starts or stops recognition
//! - `/hide` and `/show` simulate the host window visibility
//! - `/quit` exits
//! - any other line is sent as a typed user message
//!
//! Replies and room title changes are printed to stdout. All diagnostic
//! output goes to stderr.
//!
//! Usage: `vrmchat-headless [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use vrmchat::audio::{CaptureFormat, CpalMicrophone, CpalOutput, Player};
use vrmchat::config::{ChatConfig, SpeechBackendKind};
use vrmchat::lipsync::{LipSyncBridge, LoggingExpressions};
use vrmchat::notify::{Notifier, TracingNotifier};
use vrmchat::router::{
    ChangeRoomNameHandler, MessageRouter, SendUserMessageHandler, SharedConversation,
};
use vrmchat::session::VoiceChat;
use vrmchat::speech::{
    AzureRestSynthesizer, AzureStreamingRecognizer, ManagedSpeech, SpeechBackend, TokenClient,
    relayed_speech,
};
use vrmchat::transport::{ConnectionState, Connector, Visibility, WsConnector, chat_channel};

/// Sample rate the managed recognizer streams at.
const MANAGED_SAMPLE_RATE: u32 = 16_000;
/// 100 ms chunks.
const MANAGED_CHUNK_SAMPLES: usize = 1_600;
/// How long to wait for the server to acknowledge the close.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn load_config() -> anyhow::Result<(ChatConfig, PathBuf)> {
    let path = std::env::args_os()
        .nth(1)
        .map_or_else(ChatConfig::default_config_path, PathBuf::from);
    if path.exists() {
        Ok((ChatConfig::from_file(&path)?, path))
    } else {
        Ok((ChatConfig::default(), path))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (config, path) = load_config()?;
    tracing::info!(
        config = %path.display(),
        url = %config.transport.url,
        backend = ?config.speech.backend,
        "vrmchat-headless starting"
    );

    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);
    let connector: Arc<dyn Connector> = Arc::new(WsConnector);
    let microphone = Arc::new(CpalMicrophone::new(&config.audio));
    let player = Arc::new(Player::new(
        Arc::new(CpalOutput::new(&config.audio)),
        config.analyser.clone(),
    ));

    let speech: Arc<dyn SpeechBackend> = match config.speech.backend {
        SpeechBackendKind::Managed => {
            let recognizer = AzureStreamingRecognizer::new(
                microphone,
                CaptureFormat {
                    sample_rate: MANAGED_SAMPLE_RATE,
                    chunk_samples: MANAGED_CHUNK_SAMPLES,
                },
            );
            Arc::new(ManagedSpeech::new(
                &config.managed,
                Arc::new(TokenClient::new(&config.managed)),
                Arc::new(recognizer),
                Arc::new(AzureRestSynthesizer::new()),
                Arc::clone(&player),
                Arc::clone(&notifier),
            ))
        }
        SpeechBackendKind::Relayed => {
            let (speech, worker) = relayed_speech(
                &config.relay,
                Arc::clone(&connector),
                microphone,
                Arc::clone(&player),
                Arc::clone(&notifier),
            );
            tokio::spawn(worker.run());
            Arc::new(speech)
        }
    };

    let (channel, manager, inbound) =
        chat_channel(&config.transport, connector, Arc::clone(&notifier));
    let manager_task = tokio::spawn(manager.run());

    let conversation = Arc::new(SharedConversation::new());
    let router = MessageRouter::new(channel.clone(), Arc::clone(&notifier))
        .with_handler(Arc::new(SendUserMessageHandler::new(
            conversation.clone(),
            Arc::clone(&speech),
        )))
        .with_handler(Arc::new(ChangeRoomNameHandler::new(conversation.clone())));
    tokio::spawn(router.run(inbound));

    let lipsync = Arc::new(LipSyncBridge::new(
        Arc::new(LoggingExpressions),
        config.lipsync.clone(),
    ));
    let chat = Arc::new(VoiceChat::new(
        channel.clone(),
        Arc::clone(&speech),
        conversation.clone(),
        lipsync,
    ));
    chat.start();

    let mut replies = conversation.watch();
    tokio::spawn(async move {
        let mut shown = replies.borrow_and_update().clone();
        while replies.changed().await.is_ok() {
            let current = replies.borrow_and_update().clone();
            if current.room_title != shown.room_title {
                println!("# {}", current.room_title);
            }
            if current.reply != shown.reply && !current.reply.is_empty() {
                println!("< {}", current.reply);
            }
            shown = current;
        }
    });

    channel.connect()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    tracing::info!("stdin closed");
                    break;
                };
                let result = match line.trim() {
                    "" => Ok(()),
                    "/quit" => break,
                    "/talk" => chat.toggle_recognition().await,
                    "/hide" => chat.set_visibility(Visibility::Hidden),
                    "/show" => chat.set_visibility(Visibility::Visible),
                    message => chat.send_message(message),
                };
                if let Err(e) = result {
                    tracing::warn!("{e}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    if speech.is_active()
        && let Err(e) = speech.stop_capture().await
    {
        tracing::debug!("stop on shutdown failed: {e}");
    }
    let mut snapshots = channel.watch();
    channel.close()?;
    let closed = snapshots.wait_for(|s| {
        matches!(s.state, ConnectionState::Closed | ConnectionState::Idle)
    });
    if tokio::time::timeout(SHUTDOWN_GRACE, closed).await.is_err() {
        tracing::debug!("socket did not confirm close");
    }
    manager_task.abort();
    tracing::info!("vrmchat-headless stopped");
    Ok(())
}
