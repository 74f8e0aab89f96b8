//! `suite-relay`: terminal front end for the AI Dev Suite chat relay.
//!
//! - `suite-relay chat "question"` streams an answer to stdout
//! - `suite-relay tail api ollama` follows the suite logs from now on
//! - `suite-relay health` prints the API / Ollama status

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use relay::health::HealthProbe;
use relay::{dispatch, RelayClient, StreamCallbacks, StreamState};
use services::log_tail::{DebugSession, LogSource};
use shared::agent_api::{ChatMessage, ChatRequest, GenerationOptions};
use shared::settings::RelaySettings;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "suite-relay")]
#[command(about = "Stream chats through the AI Dev Suite API, tail its logs, check its health")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to settings.json in the config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Suite API base URL
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Ollama base URL
    #[arg(long, global = true)]
    ollama_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send one prompt and stream the answer
    Chat(ChatArgs),
    /// Follow log files, printing only lines written after start
    Tail(TailArgs),
    /// Probe the suite API and Ollama
    Health,
}

#[derive(Args)]
struct ChatArgs {
    /// Prompt text; multiple words are joined with spaces
    #[arg(required = true)]
    prompt: Vec<String>,

    #[arg(short, long)]
    model: Option<String>,

    /// Knowledge base to search (repeatable)
    #[arg(long = "kb")]
    knowledge_bases: Vec<String>,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    num_ctx: Option<u32>,

    #[arg(long)]
    num_predict: Option<i32>,

    /// Let the API search the web
    #[arg(long)]
    internet: bool,

    /// Talk to Ollama directly instead of the suite API
    #[arg(long)]
    ollama: bool,

    /// Print reasoning tokens to stderr
    #[arg(long)]
    show_thinking: bool,

    /// Print each event as a JSON line instead of plain text
    #[arg(long)]
    raw: bool,

    /// Cancel after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Args)]
struct TailArgs {
    /// Logs to follow: api, ollama, a2a, rag, electron (default: all)
    #[arg(value_parser = parse_source)]
    sources: Vec<LogSource>,

    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Save the collected lines here on exit
    #[arg(long)]
    save: Option<PathBuf>,
}

fn parse_source(raw: &str) -> Result<LogSource, String> {
    LogSource::ALL
        .into_iter()
        .find(|s| s.label().trim_matches(&['[', ']'][..]).eq_ignore_ascii_case(raw))
        .ok_or_else(|| format!("unknown log '{}'", raw))
}

fn load_settings(cli: &Cli) -> Result<RelaySettings> {
    let mut settings = match &cli.config {
        Some(path) => {
            let mut s = RelaySettings::load_from(path)?;
            s.apply_env(|key| std::env::var(key).ok());
            s
        }
        None => RelaySettings::load()?,
    };
    if let Some(url) = &cli.api_url {
        settings.api_base_url = url.clone();
    }
    if let Some(url) = &cli.ollama_url {
        settings.ollama_base_url = url.clone();
    }
    Ok(settings)
}

fn build_request(settings: &RelaySettings, args: &ChatArgs) -> Result<ChatRequest> {
    let prompt = args.prompt.join(" ");
    if prompt.trim().is_empty() {
        bail!("prompt is empty");
    }
    let model = args
        .model
        .clone()
        .unwrap_or_else(|| settings.default_model.clone());
    let knowledge_bases = if args.knowledge_bases.is_empty() {
        vec![settings.default_knowledge_base.clone()]
    } else {
        args.knowledge_bases.clone()
    };
    let options = GenerationOptions {
        temperature: args.temperature,
        num_ctx: args.num_ctx,
        num_predict: args.num_predict,
        ..Default::default()
    };
    Ok(ChatRequest::new(model, vec![ChatMessage::user(prompt)])
        .with_knowledge_bases(knowledge_bases)
        .with_options(options)
        .with_internet(args.internet))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    cancel
}

async fn run_chat(mut settings: RelaySettings, args: ChatArgs) -> Result<ExitCode> {
    if let Some(secs) = args.timeout_secs {
        settings.chat_timeout_secs = secs;
    }
    let request = build_request(&settings, &args)?;
    let client = RelayClient::new(settings)?;
    let cancel = cancel_on_ctrl_c();

    let stream = if args.ollama {
        client.open_ollama_with_timeout(&request, cancel.clone())
    } else {
        client.open_with_timeout(request, cancel.clone())
    };

    let state = if args.raw {
        let mut stream = stream;
        let mut state = StreamState::Cancelled;
        while let Some(event) = stream.next().await {
            println!("{}", serde_json::to_string(&event)?);
            if event.is_terminal() {
                state = match event {
                    relay::StreamEvent::Done => StreamState::Completed,
                    _ => StreamState::Failed,
                };
            }
        }
        state
    } else {
        let mut callbacks = StreamCallbacks::new(
            |text| {
                print!("{}", text);
                let _ = std::io::stdout().flush();
            },
            || println!(),
            |message| eprintln!("\nerror: {}", message),
        );
        if args.show_thinking {
            callbacks = callbacks.with_thinking(|text| eprint!("{}", text));
        }
        dispatch(stream, &mut callbacks).await
    };

    Ok(match state {
        StreamState::Completed => ExitCode::SUCCESS,
        StreamState::Cancelled => {
            eprintln!("\n[cancelled]");
            ExitCode::from(130)
        }
        _ => ExitCode::FAILURE,
    })
}

async fn run_tail(args: TailArgs) -> Result<ExitCode> {
    let sources = if args.sources.is_empty() {
        LogSource::ALL.to_vec()
    } else {
        args.sources
    };
    let mut session = DebugSession::new();
    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(50)));
    let stop = cancel_on_ctrl_c();

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                for source in &sources {
                    match session.poll(*source) {
                        Ok(lines) => {
                            for line in lines {
                                println!("{} {}", source.label(), line);
                            }
                        }
                        Err(e) => warn!(source = source.label(), error = %e, "log read failed"),
                    }
                }
            }
        }
    }

    if let Some(dir) = args.save {
        match session.save(&dir)? {
            Some(path) => info!(path = %path.display(), "session logs saved"),
            None => info!("no log lines collected, nothing saved"),
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_health(settings: RelaySettings) -> Result<ExitCode> {
    let probe = HealthProbe::new(&settings)?;
    let report = probe.probe().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if probe.check_api_health().await {
        ExitCode::SUCCESS
    } else {
        eprintln!("{}", relay::adapter::API_NOT_RUNNING);
        ExitCode::FAILURE
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Logs go to stderr; stdout carries the chat output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    match cli.command {
        Command::Chat(args) => run_chat(settings, args).await,
        Command::Tail(args) => run_tail(args).await,
        Command::Health => run_health(settings).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_source() {
        assert_eq!(parse_source("api"), Ok(LogSource::Api));
        assert_eq!(parse_source("A2A"), Ok(LogSource::A2a));
        assert!(parse_source("syslog").is_err());
    }

    #[test]
    fn test_build_request_defaults() {
        let cli = Cli::parse_from(["suite-relay", "chat", "hello", "there"]);
        let Command::Chat(args) = cli.command else {
            panic!("expected chat");
        };
        let settings = RelaySettings::default();
        let request = build_request(&settings, &args).unwrap();
        assert_eq!(request.model, settings.default_model);
        assert_eq!(request.messages, vec![ChatMessage::user("hello there")]);
        assert_eq!(request.knowledge_bases, Some(vec!["default".to_string()]));
        assert_eq!(request.options, None);
        assert!(!request.internet_enabled);
    }

    #[test]
    fn test_build_request_flags() {
        let cli = Cli::parse_from([
            "suite-relay",
            "--api-url",
            "http://example:1",
            "chat",
            "-m",
            "qwen3:8b",
            "--kb",
            "docs",
            "--kb",
            "notes",
            "--temperature",
            "0.2",
            "--internet",
            "why?",
        ]);
        assert_eq!(cli.api_url.as_deref(), Some("http://example:1"));
        let Command::Chat(args) = cli.command else {
            panic!("expected chat");
        };
        let request = build_request(&RelaySettings::default(), &args).unwrap();
        assert_eq!(request.model, "qwen3:8b");
        assert_eq!(
            request.knowledge_bases,
            Some(vec!["docs".to_string(), "notes".to_string()])
        );
        assert_eq!(request.options.unwrap().temperature, Some(0.2));
        assert!(request.internet_enabled);
    }

    #[test]
    fn test_blank_prompt_rejected() {
        let cli = Cli::parse_from(["suite-relay", "chat", "  "]);
        let Command::Chat(args) = cli.command else {
            panic!("expected chat");
        };
        assert!(build_request(&RelaySettings::default(), &args).is_err());
    }

    #[test]
    fn test_tail_sources() {
        let cli = Cli::parse_from(["suite-relay", "tail", "api", "rag", "--interval-ms", "200"]);
        let Command::Tail(args) = cli.command else {
            panic!("expected tail");
        };
        assert_eq!(args.sources, vec![LogSource::Api, LogSource::Rag]);
        assert_eq!(args.interval_ms, 200);
    }
}
