//! Talk - interactive session with a creature.
//!
//! This example demonstrates:
//! - Opening a session with the builder or a JSON config file
//! - Subscribing to state updates
//! - Sending each stdin line as a stimulus
//! - Disposing the session on EOF
//!
//! # Running
//!
//! ```text
//! RUST_LOG=creature_client=debug cargo run --example talk -- https://127.0.0.1:50051
//! cargo run --example talk -- --memory
//! ```
//!
//! `--memory` replaces the server with an in-process transport that answers
//! every stimulus with a canned state.

use clap::Parser;
use creature_client::protocol::AgentState;
use creature_client::transport::MemoryTransport;
use creature_client::{CancellationToken, Emotion, Motion, OutboundMessage, Session, SessionConfig};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(about = "Talk to a creature over a duplex session")]
struct Args {
    /// Endpoint, e.g. https://127.0.0.1:50051
    #[arg(default_value = "https://127.0.0.1:50051")]
    address: String,

    /// Use the in-process transport instead of dialing
    #[arg(long)]
    memory: bool,

    /// Author attached to every stimulus
    #[arg(long)]
    author: Option<String>,

    /// JSON session configuration; overrides the address argument
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

/// Canned reply for the in-process transport.
fn reply_to(text: &str) -> AgentState {
    let (emotion, motion) = match text.to_lowercase().as_str() {
        t if t.contains("hello") || t.contains("morning") => (Emotion::Happy, Motion::Jump),
        t if t.contains("bye") => (Emotion::Sad, Motion::Walk),
        t if t.contains('!') => (Emotion::Surprised, Motion::Run),
        _ => (Emotion::Neutral, Motion::Neutral),
    };
    AgentState {
        emotion: emotion as i32,
        motion: motion as i32,
        auxiliary_signal: text.to_string(),
        affinity: Some(0.5),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("creature_client=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::new(args.address.clone()),
    };
    if args.author.is_some() {
        config.default_author = args.author.clone();
    }

    let memory = args.memory.then(MemoryTransport::new);
    let mut builder = creature_client::SessionBuilder::from_config(config);
    if let Some(transport) = &memory {
        builder = builder.connector(transport.clone());
    }
    let session = builder.open().await?;

    let _subscription = session.subscribe(|state| println!("< {}", state));

    let cancel = CancellationToken::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        session
            .send(OutboundMessage::new(line), &cancel)
            .await?;

        if let Some(transport) = &memory {
            transport.push_state(reply_to(line));
        }

        if session.loop_state().is_stopped() {
            eprintln!("Inbound stream stopped: {:?}", session.loop_state());
            break;
        }
    }

    session.dispose().await;
    Ok(())
}
