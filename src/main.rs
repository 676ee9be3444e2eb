//! CLI entry point for `toolstream`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use clap::Parser;
use colored::Colorize;
use dotenvy::dotenv;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use toolstream::client::ChatCompletionsClient;
use toolstream::config::Config;
use toolstream::core::ChatSession;
use toolstream::logging;
use toolstream::mcp::McpRegistry;
use toolstream::models::ChatMessage;
use toolstream::view::TerminalPresenter;

#[derive(Parser, Debug)]
#[command(
    name = "toolstream",
    author,
    version,
    about = "Chat with an OpenAI-compatible model that can call MCP tools"
)]
struct Cli {
    /// Prompt to send. Without one, prompts are read line by line from stdin.
    prompt: Option<String>,

    /// Path to config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Config profile name
    #[arg(long)]
    profile: Option<String>,

    /// Override the configured model
    #[arg(short, long)]
    model: Option<String>,

    /// Attach a text or image file to the first prompt
    #[arg(short, long = "attach", value_name = "FILE")]
    attachments: Vec<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut config = Config::load(cli.config.clone(), cli.profile.as_deref())?;
    if let Some(model) = cli.model.clone() {
        config.model = Some(model);
    }

    let mcp_path = config.mcp_config_path();
    let registry = tokio::task::spawn_blocking(move || McpRegistry::load(&mcp_path))
        .await
        .context("MCP startup task failed")??;
    tracing::info!(servers = ?registry.server_names(), "Tool clients ready");

    let client = ChatCompletionsClient::new(&config)?;
    let session = ChatSession::new(
        Arc::new(client),
        Arc::new(registry),
        Arc::new(TerminalPresenter::new()),
        config.engine_config(),
    )
    .with_max_follow_up_turns(config.max_follow_up_turns());

    let mut attachments = load_attachments(&cli.attachments)?;
    let interrupts = Interrupts::default();
    interrupts.watch();

    if let Some(prompt) = cli.prompt {
        return send(&session, &interrupts, with_attachments(&prompt, &mut attachments)).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        let message = with_attachments(prompt, &mut attachments);
        if let Err(err) = send(&session, &interrupts, message).await {
            eprintln!("{} {err:#}", "error:".red().bold());
        }
    }
    Ok(())
}

/// Routes Ctrl-C to the running message, or exits when none is running.
#[derive(Clone, Default)]
struct Interrupts {
    active: Arc<Mutex<Option<CancellationToken>>>,
}

impl Interrupts {
    /// Install the process-wide Ctrl-C handler.
    fn watch(&self) {
        let interrupts = self.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if !interrupts.interrupt() {
                    std::process::exit(130);
                }
            }
        });
    }

    fn begin(&self) -> CancellationToken {
        let cancel = CancellationToken::new();
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());
        cancel
    }

    fn end(&self) {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Cancel the running message. Returns false when nothing is running.
    fn interrupt(&self) -> bool {
        match self.active.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }
}

/// Run one user message. Ctrl-C cancels it.
async fn send(session: &ChatSession, interrupts: &Interrupts, message: ChatMessage) -> Result<()> {
    let cancel = interrupts.begin();
    let result = session.send_user_message(message, &cancel).await;
    interrupts.end();

    let report = result?;
    tracing::debug!(
        turns = report.turns,
        tool_calls = report.tool_outcomes.len(),
        "Reply finished"
    );
    Ok(())
}

enum AttachedFile {
    Text { name: String, content: String },
    Image { name: String, mime_type: &'static str, data: String },
}

fn image_mime_type(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

fn load_attachments(paths: &[PathBuf]) -> Result<Vec<AttachedFile>> {
    paths
        .iter()
        .map(|path| {
            let name = path.display().to_string();
            if let Some(mime_type) = image_mime_type(path) {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("Failed to read image {name}"))?;
                return Ok(AttachedFile::Image {
                    name,
                    mime_type,
                    data: STANDARD.encode(bytes),
                });
            }
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read attachment {name}"))?;
            Ok(AttachedFile::Text { name, content })
        })
        .collect()
}

/// Attachments go with the first prompt only.
fn with_attachments(prompt: &str, attachments: &mut Vec<AttachedFile>) -> ChatMessage {
    attachments
        .drain(..)
        .fold(ChatMessage::user(prompt), |message, file| match file {
            AttachedFile::Text { name, content } => message.with_attachment(name, content),
            AttachedFile::Image {
                name,
                mime_type,
                data,
            } => message.with_image(name, mime_type, data),
        })
}
