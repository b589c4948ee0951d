//! KeyRelay CLI - encrypted provider keys, completions and latency metrics

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use keyrelay_core::TimeWindow;
use keyrelay_runtime::{CompletionRequest, KeyRelay, RuntimeConfig, StreamChunk};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

const MASTER_KEY_VAR: &str = "KEYRELAY_MASTER_KEY";

#[derive(Parser)]
#[command(name = "keyrelay")]
#[command(author, version, about = "Encrypted LLM credential vault and request relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML config file (environment variables override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage provider API keys
    Keys {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Send a prompt to a provider
    Complete {
        /// Provider name (openai, anthropic, gemini)
        provider: String,
        /// Prompt text
        prompt: String,
        /// Model (defaults to the provider's default model)
        #[arg(short, long, default_value = "")]
        model: String,
        /// System prompt
        #[arg(long)]
        system: Option<String>,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        max_tokens: Option<u32>,
        /// Stream the answer as it is generated (Ctrl-C cancels)
        #[arg(long)]
        stream: bool,
        /// User id recorded in the performance log
        #[arg(long)]
        user: Option<String>,
    },

    /// Performance metrics
    Metrics {
        #[command(subcommand)]
        action: MetricsAction,
    },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Store a key (read from stdin when --secret is omitted)
    Store {
        provider: String,
        #[arg(long)]
        secret: Option<String>,
        /// Days until the key expires; negative stores an expired key
        #[arg(long, allow_negative_numbers = true)]
        expires_in_days: Option<i64>,
    },
    /// Show a stored key, masked unless --reveal is given
    Get {
        provider: String,
        #[arg(long)]
        reveal: bool,
    },
    /// Replace a stored key
    Rotate {
        provider: String,
        #[arg(long)]
        secret: Option<String>,
        #[arg(long, allow_negative_numbers = true)]
        expires_in_days: Option<i64>,
    },
    /// Delete a stored key
    Remove { provider: String },
    /// List providers with a stored key
    List,
    /// Check whether a provider has a valid key
    Check { provider: String },
    /// Import {PROVIDER}_API_KEY variables
    Bootstrap,
}

#[derive(Subcommand)]
enum MetricsAction {
    /// Per provider/model/operation latency
    Llm {
        #[arg(long, default_value = "24h")]
        window: TimeWindow,
    },
    /// Per endpoint/method latency
    Api {
        #[arg(long, default_value = "24h")]
        window: TimeWindow,
    },
    /// Dashboard summary
    Dashboard {
        #[arg(long, default_value = "24h")]
        window: TimeWindow,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("keyrelay=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let config = RuntimeConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let master_key = std::env::var(MASTER_KEY_VAR)
        .map(SecretString::from)
        .with_context(|| format!("{MASTER_KEY_VAR} must hold the 64-character hex master key"))?;
    let relay = KeyRelay::from_config(&master_key, &config).context("Failed to open vault")?;

    let result = match cli.command {
        Commands::Keys { action } => cmd_keys(&relay, action, cli.format).await,
        Commands::Complete {
            provider,
            prompt,
            model,
            system,
            temperature,
            max_tokens,
            stream,
            user,
        } => {
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(keyrelay_runtime::ChatMessage::system(system));
            }
            messages.push(keyrelay_runtime::ChatMessage::user(prompt));
            let mut request = CompletionRequest::with_messages(model, messages);
            request.temperature = temperature;
            request.max_tokens = max_tokens;

            if stream {
                cmd_stream(&relay, &provider, &request, user.as_deref(), cli.format).await
            } else {
                cmd_complete(&relay, &provider, &request, user.as_deref(), cli.format).await
            }
        }
        Commands::Metrics { action } => cmd_metrics(&relay, action, cli.format).await,
    };

    relay.flush().await;
    result
}

// ============================================================================
// Command Implementations
// ============================================================================

#[derive(Serialize)]
struct KeyStatus<'a> {
    provider: &'a str,
    valid: bool,
}

async fn cmd_keys(relay: &KeyRelay, action: KeyAction, format: OutputFormat) -> anyhow::Result<()> {
    match action {
        KeyAction::Store {
            provider,
            secret,
            expires_in_days,
        } => {
            let secret = secret_or_stdin(secret)?;
            if !relay.store_key(&provider, secret.expose_secret(), expires_in_days).await {
                bail!("Failed to store key for '{provider}' (see log for details)");
            }
            println!("Stored key for {}", provider.trim().to_lowercase());
        }
        KeyAction::Rotate {
            provider,
            secret,
            expires_in_days,
        } => {
            let secret = secret_or_stdin(secret)?;
            if !relay.rotate_key(&provider, secret.expose_secret(), expires_in_days).await {
                bail!("Failed to rotate key for '{provider}' (see log for details)");
            }
            println!("Rotated key for {}", provider.trim().to_lowercase());
        }
        KeyAction::Get { provider, reveal } => {
            let Some(secret) = relay.get_key(&provider).await else {
                bail!("No valid key stored for '{provider}'");
            };
            if reveal {
                println!("{}", secret.expose_secret());
            } else {
                println!("{}", mask(secret.expose_secret()));
            }
        }
        KeyAction::Remove { provider } => {
            if !relay.remove_key(&provider).await {
                bail!("Failed to remove key for '{provider}' (see log for details)");
            }
            println!("Removed key for {}", provider.trim().to_lowercase());
        }
        KeyAction::List => {
            let providers = relay.list_providers().await;
            let mut statuses = Vec::with_capacity(providers.len());
            for provider in &providers {
                statuses.push(KeyStatus {
                    provider,
                    valid: relay.has_valid_key(provider).await,
                });
            }
            match format {
                OutputFormat::Json => print_json(&statuses)?,
                OutputFormat::Text if statuses.is_empty() => {
                    println!("No keys stored.");
                    println!("\nStore one with: keyrelay keys store <provider>");
                }
                OutputFormat::Text => {
                    for status in statuses {
                        let marker = if status.valid { "" } else { " [expired]" };
                        println!("  {}{}", status.provider, marker);
                    }
                }
            }
        }
        KeyAction::Check { provider } => {
            let valid = relay.has_valid_key(&provider).await;
            match format {
                OutputFormat::Json => print_json(&KeyStatus {
                    provider: &provider,
                    valid,
                })?,
                OutputFormat::Text => println!(
                    "{}: {}",
                    provider,
                    if valid { "valid" } else { "missing or expired" }
                ),
            }
            if !valid {
                std::process::exit(1);
            }
        }
        KeyAction::Bootstrap => {
            let report = relay.bootstrap_from_env().await;
            match format {
                OutputFormat::Json => print_json(&report)?,
                OutputFormat::Text => {
                    println!("Loaded:  {}", list_or_none(&report.loaded));
                    println!("Missing: {}", list_or_none(&report.missing));
                    if !report.failed.is_empty() {
                        println!("Failed:  {}", report.failed.join(", "));
                    }
                }
            }
        }
    }
    Ok(())
}

async fn cmd_complete(
    relay: &KeyRelay,
    provider: &str,
    request: &CompletionRequest,
    user: Option<&str>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let result = relay
        .complete(provider, request, user)
        .await
        .context("Completion failed")?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Text => {
            println!("{}", result.text);
            let seconds = result
                .metrics
                .and_then(|m| m.total_time)
                .map(|t| t.as_secs_f64())
                .unwrap_or_default();
            eprintln!(
                "\n[{} / {}: {} prompt + {} completion tokens in {:.2}s]",
                result.provider,
                result.model,
                result.usage.prompt_tokens,
                result.usage.completion_tokens,
                seconds
            );
        }
    }
    Ok(())
}

async fn cmd_stream(
    relay: &KeyRelay,
    provider: &str,
    request: &CompletionRequest,
    user: Option<&str>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let on_ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let mut stdout = std::io::stdout();
    let mut print_chunk = |chunk: StreamChunk| {
        let line = match format {
            OutputFormat::Text if chunk.is_final => "\n".to_string(),
            OutputFormat::Text => chunk.text,
            OutputFormat::Json => {
                let value = serde_json::json!({
                    "text": chunk.text,
                    "isFinal": chunk.is_final,
                    "error": chunk.error.as_ref().map(|e| e.to_string()),
                });
                format!("{value}\n")
            }
        };
        let _ = stdout.write_all(line.as_bytes());
        let _ = stdout.flush();
    };

    let outcome = relay
        .stream_complete(provider, request, user, &mut print_chunk, &cancel)
        .await;
    on_ctrl_c.abort();

    let usage = outcome.context("Streaming completion failed")?;
    if let (OutputFormat::Text, Some(usage)) = (format, usage) {
        eprintln!(
            "[{} prompt + {} completion tokens]",
            usage.prompt_tokens, usage.completion_tokens
        );
    }
    Ok(())
}

async fn cmd_metrics(relay: &KeyRelay, action: MetricsAction, format: OutputFormat) -> anyhow::Result<()> {
    match action {
        MetricsAction::Llm { window } => {
            let metrics = relay.get_llm_performance_metrics(window).await?;
            if format == OutputFormat::Json {
                return print_json(&metrics);
            }
            if metrics.is_empty() {
                println!("No LLM requests in the last {window}.");
                return Ok(());
            }
            println!(
                "{:<12} {:<28} {:<20} {:>6} {:>7} {:>9} {:>9} {:>9} {:>9}",
                "PROVIDER", "MODEL", "OPERATION", "COUNT", "OK%", "P50ms", "P95ms", "P99ms", "TTFTms"
            );
            for m in metrics {
                println!(
                    "{:<12} {:<28} {:<20} {:>6} {:>6.1}% {:>9.1} {:>9.1} {:>9.1} {:>9}",
                    m.provider,
                    m.model,
                    m.operation.as_str(),
                    m.request_count,
                    m.success_rate * 100.0,
                    m.latency.p50_ms,
                    m.latency.p95_ms,
                    m.latency.p99_ms,
                    m.avg_time_to_first_token_ms
                        .map(|t| format!("{t:.1}"))
                        .unwrap_or_else(|| "-".to_string()),
                );
            }
        }
        MetricsAction::Api { window } => {
            let metrics = relay.get_api_performance_metrics(window).await?;
            if format == OutputFormat::Json {
                return print_json(&metrics);
            }
            if metrics.is_empty() {
                println!("No API requests in the last {window}.");
                return Ok(());
            }
            println!(
                "{:<32} {:<7} {:>6} {:>7} {:>9} {:>9} {:>9}",
                "ENDPOINT", "METHOD", "COUNT", "OK%", "P50ms", "P95ms", "P99ms"
            );
            for m in metrics {
                println!(
                    "{:<32} {:<7} {:>6} {:>6.1}% {:>9.1} {:>9.1} {:>9.1}",
                    m.endpoint,
                    m.method,
                    m.request_count,
                    m.success_rate * 100.0,
                    m.latency.p50_ms,
                    m.latency.p95_ms,
                    m.latency.p99_ms,
                );
            }
        }
        MetricsAction::Dashboard { window } => {
            let data = relay.get_dashboard_data(window).await?;
            if format == OutputFormat::Json {
                return print_json(&data);
            }
            println!("Dashboard ({})", data.window);
            println!("  LLM requests:     {}", data.total_llm_requests);
            println!("  LLM success rate: {:.1}%", data.llm_success_rate * 100.0);
            println!(
                "  LLM latency:      p50 {:.1}ms  p95 {:.1}ms  p99 {:.1}ms",
                data.llm_latency.p50_ms, data.llm_latency.p95_ms, data.llm_latency.p99_ms
            );
            println!("  Tokens:           {}", data.total_tokens);
            println!("  Providers:        {}", data.active_providers);
            println!("  API requests:     {}", data.total_api_requests);
            println!("  API success rate: {:.1}%", data.api_success_rate * 100.0);
            if !data.errors_by_kind.is_empty() {
                println!("\nErrors by kind:");
                for (kind, count) in &data.errors_by_kind {
                    println!("  {kind:<16} {count}");
                }
            }
            if !data.recent_errors.is_empty() {
                println!("\nRecent errors:");
                for e in &data.recent_errors {
                    println!(
                        "  {} {} {} {}",
                        e.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        e.provider,
                        e.error_kind.as_deref().unwrap_or("-"),
                        e.error_message.as_deref().unwrap_or("")
                    );
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// The `--secret` value, or one line read from stdin.
fn secret_or_stdin(secret: Option<String>) -> anyhow::Result<SecretString> {
    let secret = match secret {
        Some(secret) => secret,
        None => {
            eprint!("API key: ");
            let _ = std::io::stderr().flush();
            let mut line = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut line)
                .context("Failed to read key from stdin")?;
            line
        }
    };

    let secret = secret.trim().to_string();
    if secret.is_empty() {
        bail!("Key must not be empty");
    }
    Ok(SecretString::from(secret))
}

/// First and last four characters only.
fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask() {
        assert_eq!(mask("sk-1234567890abcd"), "sk-1...abcd");
        assert_eq!(mask("short"), "*****");
    }

    #[test]
    fn test_cli_parses_metrics_window() {
        let cli = Cli::try_parse_from(["keyrelay", "metrics", "llm", "--window", "7d"]).unwrap();
        match cli.command {
            Commands::Metrics {
                action: MetricsAction::Llm { window },
            } => assert_eq!(window, TimeWindow::LastWeek),
            _ => panic!("expected metrics llm"),
        }
    }

    #[test]
    fn test_cli_parses_negative_expiry() {
        let cli = Cli::try_parse_from([
            "keyrelay",
            "keys",
            "store",
            "openai",
            "--secret",
            "sk-x",
            "--expires-in-days",
            "-1",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Keys {
                action: KeyAction::Store {
                    expires_in_days: Some(-1),
                    ..
                }
            }
        ));
    }

    #[test]
    fn test_cli_verifies() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
