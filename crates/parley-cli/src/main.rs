//! Parley CLI: a resilient LLM chat gateway for the terminal.

mod analytics;
mod conversation;

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::StreamExt;
use parley_api::{ChatEventStream, Client, ModelCatalog, OpenAiProvider, build_http_client};
use parley_config::{CliOverrides, ParleyConfig};
use parley_core::{StreamPhase, StreamUpdate, StreamingManager};
use parley_types::{CallContext, ChatRequest, Message, StreamEvent};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::analytics::TracingAnalytics;
use crate::conversation::Conversation;

/// Capacity of the REPL's stream update channel.
const UPDATE_CHANNEL_CAPACITY: usize = 64;

#[derive(Parser)]
#[command(name = "parley", version, about = "A resilient LLM chat gateway")]
struct Cli {
    /// Send a single prompt and print the response (non-interactive)
    #[arg(short, long)]
    prompt: Option<String>,

    /// Model to use
    #[arg(long)]
    model: Option<String>,

    /// Base URL of an OpenAI-compatible API
    #[arg(long)]
    base_url: Option<String>,

    /// API key (overrides PARLEY_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    /// Maximum tokens in the response
    #[arg(long)]
    max_tokens: Option<u32>,

    /// Sampling temperature (0.0 to 2.0)
    #[arg(long)]
    temperature: Option<f32>,

    /// System prompt for a new conversation
    #[arg(long)]
    system: Option<String>,

    /// Ask the provider to ground answers with web search
    #[arg(long)]
    web_search: bool,

    /// Wait for the full response instead of streaming it
    #[arg(long)]
    no_stream: bool,

    /// List available models and exit
    #[arg(long)]
    list_models: bool,

    /// Validate the configured credentials and exit
    #[arg(long)]
    check: bool,

    /// Mirror the conversation to a JSON Lines file (resumes if it exists)
    #[arg(long)]
    transcript: Option<PathBuf>,

    /// Enable verbose/debug logging
    #[arg(long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let config = ParleyConfig::load(CliOverrides {
        api_key: cli.api_key.clone(),
        base_url: cli.base_url.clone(),
        model: cli.model.clone(),
        max_tokens: cli.max_tokens,
        temperature: cli.temperature,
    })
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    let http = build_http_client(&config.http).context("Failed to create HTTP client")?;
    let provider = Arc::new(OpenAiProvider::new(
        http.clone(),
        &config.api_key,
        &config.base_url,
    ));
    let client = Client::builder()
        .provider(provider.clone())
        .analytics(Arc::new(TracingAnalytics))
        .http_client(http)
        .retry_config(config.retry.clone())
        .build()
        .context("Failed to create chat client")?;

    let root = CallContext::new();

    if cli.check {
        return check_credentials(&client, &root, &config).await;
    }

    if cli.list_models {
        let catalog = ModelCatalog::new(provider, config.model_ttl);
        return list_models(&catalog, &root).await;
    }

    let conversation = Arc::new(match &cli.transcript {
        Some(path) => Conversation::open(path.clone())
            .await
            .with_context(|| format!("Failed to open transcript {}", path.display()))?,
        None => Conversation::in_memory(),
    });
    if let Some(system) = &cli.system {
        if conversation.len().await == 0 {
            conversation
                .push(Message::system(system))
                .await
                .context("Failed to record system prompt")?;
        }
    }

    let session = Session {
        client,
        config,
        conversation,
        web_search: cli.web_search,
        stream: !cli.no_stream,
    };

    match cli.prompt {
        Some(prompt) => session.one_shot(&root, &prompt).await,
        None => session.repl(root).await,
    }
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn check_credentials(client: &Client, ctx: &CallContext, config: &ParleyConfig) -> Result<()> {
    client
        .validate_credentials(ctx)
        .await
        .with_context(|| format!("Credentials rejected by {}", config.base_url))?;
    eprintln!("Credentials OK ({})", config.base_url);
    Ok(())
}

async fn list_models(catalog: &ModelCatalog, ctx: &CallContext) -> Result<()> {
    let mut models = catalog
        .models(ctx)
        .await
        .context("Failed to list models")?;
    models.sort_by(|a, b| a.id.cmp(&b.id));
    for model in &models {
        match &model.owned_by {
            Some(owner) => println!("{}  ({owner})", model.id),
            None => println!("{}", model.id),
        }
    }
    Ok(())
}

struct Session {
    client: Client,
    config: ParleyConfig,
    conversation: Arc<Conversation>,
    web_search: bool,
    stream: bool,
}

enum SlashResult {
    Continue,
    Break,
    Unknown,
}

impl Session {
    async fn request(&self) -> ChatRequest {
        let mut request = ChatRequest::new(&self.config.model, self.conversation.messages().await);
        request.max_tokens = self.config.max_tokens;
        request.temperature = self.config.temperature;
        request.web_search = self.web_search;
        request
    }

    /// Single prompt, printed to stdout. Ctrl+C cancels the request.
    async fn one_shot(&self, root: &CallContext, prompt: &str) -> Result<()> {
        self.conversation
            .push(Message::user(prompt))
            .await
            .context("Failed to record prompt")?;
        let request = self.request().await;

        let ctx = root.child();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                canceller.cancel();
            }
        });

        if !self.stream {
            let response = self.client.chat(&ctx, &request).await?;
            println!("{}", response.content);
            self.record_reply(&response.content).await;
            return Ok(());
        }

        let mut events = ChatEventStream::new(self.client.chat_stream(ctx, request));
        let mut reply = String::new();
        let stdout = io::stdout();
        let mut out = stdout.lock();
        while let Some(event) = events.next().await {
            match event {
                StreamEvent::Chunk(text) => {
                    let _ = write!(out, "{text}");
                    let _ = out.flush();
                    reply.push_str(&text);
                }
                StreamEvent::Done => {
                    let _ = writeln!(out);
                }
                StreamEvent::Error(e) => {
                    let _ = writeln!(out);
                    return Err(e.into());
                }
            }
        }
        drop(out);
        self.record_reply(&reply).await;
        Ok(())
    }

    async fn record_reply(&self, content: &str) {
        if let Err(e) = self.conversation.push(Message::assistant(content)).await {
            tracing::warn!("Failed to record reply: {e}");
        }
    }

    async fn repl(self, root: CallContext) -> Result<()> {
        let (update_tx, mut updates) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let manager = StreamingManager::new(root.clone())
            .with_client(self.client.clone())
            .with_persistence(self.conversation.clone())
            .with_updates(update_tx);

        let stdin = io::stdin();

        eprintln!(
            "parley v{} (model: {}, endpoint: {})",
            env!("CARGO_PKG_VERSION"),
            self.config.model,
            self.config.base_url
        );
        let resumed = self.conversation.len().await;
        if resumed > 0 {
            eprintln!("Resumed {resumed} messages from transcript.");
        }
        eprintln!("Type your message. Ctrl+C interrupts a reply, Ctrl+D exits.\n");

        loop {
            eprint!("> ");
            io::stderr().flush()?;

            let mut input = String::new();
            let bytes_read = stdin.lock().read_line(&mut input)?;
            if bytes_read == 0 {
                eprintln!();
                break;
            }

            let input = input.trim();
            if input.is_empty() {
                continue;
            }

            if let Some(handled) = self.handle_slash_command(input).await {
                match handled {
                    SlashResult::Continue => continue,
                    SlashResult::Break => break,
                    SlashResult::Unknown => {
                        eprintln!("Unknown command: {input}. Type /help for available commands.");
                        continue;
                    }
                }
            }

            if let Err(e) = self.conversation.push(Message::user(input)).await {
                eprintln!("Warning: failed to record message: {e}");
            }

            if !self.stream {
                match self.client.chat(&root.child(), &self.request().await).await {
                    Ok(response) => {
                        println!("{}", response.content);
                        self.record_reply(&response.content).await;
                    }
                    Err(e) => eprintln!("\nError: {e}"),
                }
                println!();
                continue;
            }

            if let Err(e) = manager.start_streaming(self.request().await) {
                eprintln!("Error: {e}");
                continue;
            }
            render_updates(&manager, &mut updates).await;

            let phase = manager.wait().await;
            tracing::debug!("Stream finished: {phase:?}");
            println!();
        }

        root.cancel();
        Ok(())
    }

    async fn handle_slash_command(&self, input: &str) -> Option<SlashResult> {
        if !input.starts_with('/') {
            return None;
        }

        let cmd = input.split_whitespace().next().unwrap_or(input);
        match cmd {
            "/quit" | "/exit" => Some(SlashResult::Break),
            "/clear" => {
                match self.conversation.clear().await {
                    Ok(()) => eprintln!("Conversation cleared."),
                    Err(e) => eprintln!("Failed to clear conversation: {e}"),
                }
                Some(SlashResult::Continue)
            }
            "/model" => {
                eprintln!("Current model: {}", self.config.model);
                Some(SlashResult::Continue)
            }
            "/history" => {
                eprintln!("{} messages in conversation.", self.conversation.len().await);
                Some(SlashResult::Continue)
            }
            "/help" => {
                print_help();
                Some(SlashResult::Continue)
            }
            _ => Some(SlashResult::Unknown),
        }
    }
}

/// Print stream updates until the stream reaches a terminal update.
/// Ctrl+C interrupts the stream instead of exiting.
async fn render_updates(manager: &StreamingManager, updates: &mut mpsc::Receiver<StreamUpdate>) {
    let stdout = io::stdout();
    loop {
        let update = tokio::select! {
            update = updates.recv() => update,
            _ = tokio::signal::ctrl_c() => {
                manager.interrupt_streaming();
                continue;
            }
        };

        let Some(update) = update else {
            return;
        };
        let mut out = stdout.lock();
        match update {
            StreamUpdate::Chunk(text) => {
                let _ = write!(out, "{text}");
                let _ = out.flush();
            }
            StreamUpdate::Progress {
                chunk_count,
                total_bytes,
            } => {
                tracing::trace!("{chunk_count} chunks, {total_bytes} bytes");
            }
            StreamUpdate::Completed(_) => {
                let _ = writeln!(out);
                return;
            }
            StreamUpdate::Failed(e) => {
                let _ = writeln!(out);
                eprintln!("Error: {e}");
                return;
            }
            StreamUpdate::Interrupted { .. } => {
                let _ = writeln!(out);
                eprintln!("[interrupted]");
                return;
            }
        }
    }
}

fn print_help() {
    eprintln!("Available commands:");
    eprintln!("  /help     — Show this help");
    eprintln!("  /model    — Show current model");
    eprintln!("  /history  — Show conversation length");
    eprintln!("  /clear    — Clear conversation (and transcript)");
    eprintln!("  /quit     — Exit");
    eprintln!();
    eprintln!("Press Ctrl+C while a reply is streaming to interrupt it.");
}
