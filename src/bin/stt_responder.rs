//! Stand-in recognizer for local testing.
//!
//! Queue-subscribes to one slot subject, logs every audio chunk and answers
//! every Nth chunk with a canned recognition result.
//!
//! ```text
//! stt-responder --sub voice-0 --every 5
//! ```

use std::path::PathBuf;

use async_nats::{Client, ConnectOptions, Message};
use bytes::Bytes;
use clap::Parser;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use voicegate::config::LogLevel;

// -----------------------------------------------------------------------------
// ----- Args ------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "stt-responder", version, about = "Mock speech backend for voicegate")]
struct Args {
    #[arg(long = "nats", env = "NATS_URL", default_value = "nats://localhost:4222")]
    nats: String,

    /// Slot subject to serve, e.g. voice-0.
    #[arg(long = "sub")]
    subject: String,

    #[arg(long = "queue", default_value = "stt-responders")]
    queue: String,

    #[arg(long = "creds")]
    creds: Option<PathBuf>,

    /// Reply to every Nth chunk.
    #[arg(long = "every", default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    every: u64,

    #[arg(long = "log", default_value = "info")]
    log_level: LogLevel,
}

// -----------------------------------------------------------------------------
// ----- Reply -----------------------------------------------------------------

#[derive(Debug, Serialize)]
struct RecognitionResult {
    err_code: i32,
    state: &'static str,
    recog_result: &'static str,
}

const MOCK_RESULT: RecognitionResult = RecognitionResult {
    err_code: 0,
    state: "result",
    recog_result: "good job",
};

// -----------------------------------------------------------------------------
// ----- Main ------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();

    let mut options = ConnectOptions::new().name("stt-responder");
    if let Some(path) = &args.creds {
        options = options.credentials_file(path).await?;
    }

    let client = options.connect(args.nats.as_str()).await?;
    let mut subscriber = client
        .queue_subscribe(args.subject.clone(), args.queue.clone())
        .await?;
    client.flush().await?;

    info!("listening on [{}] in queue group {}", args.subject, args.queue);

    let reply = Bytes::from(serde_json::to_vec(&MOCK_RESULT)?);
    let mut seen: u64 = 0;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("draining");
                break;
            }

            next = subscriber.next() => {
                let Some(message) = next else {
                    warn!("subscription closed by server");
                    break;
                };
                seen += 1;
                handle_chunk(&client, message, seen, args.every, &reply).await;
            }
        }
    }

    if let Err(e) = subscriber.unsubscribe().await {
        warn!("unsubscribe failed: {e}");
    }
    client.flush().await?;

    info!("exiting after {seen} chunks");
    Ok(())
}

// -----------------------------------------------------------------------------
// ----- Internal --------------------------------------------------------------

async fn handle_chunk(client: &Client, message: Message, seen: u64, every: u64, reply: &Bytes) {
    info!(
        "[#{seen}] received {} bytes on [{}]",
        message.payload.len(),
        message.subject
    );

    if seen % every != 0 {
        return;
    }

    let Some(reply_to) = message.reply else {
        warn!("[#{seen}] chunk has no reply subject; skipping result");
        return;
    };

    if let Err(e) = client.publish(reply_to, reply.clone()).await {
        error!("[#{seen}] reply failed: {e}");
    }
}
