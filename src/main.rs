use anyhow::{bail, Context, Result};
use assistant_models::config::Config;
use assistant_models::models::catalog::suggest;
use assistant_models::models::download::format_bytes;
use assistant_models::models::{DownloadProgress, ModelInfo, ProgressCallback};
use assistant_models::services::{ModelMessage, ServiceStatus};
use assistant_models::AppContext;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "assistant-models")]
#[command(about = "Manage local models and chat with Claude, OpenAI, or local backends", long_about = None)]
struct Cli {
    /// Config file (defaults to $XDG_CONFIG_HOME/ai-assistant/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage local models
    Models {
        #[command(subcommand)]
        command: ModelCommands,
    },
    /// List registered chat services by provider
    Services,
    /// Send a single message to a chat service
    Chat {
        /// Service id, e.g. claude-3-haiku or gpt-4o
        #[arg(short, long)]
        model: String,
        /// System prompt
        #[arg(long)]
        system: Option<String>,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        max_tokens: Option<u32>,
        message: String,
    },
}

#[derive(Subcommand)]
enum ModelCommands {
    /// List known models
    List {
        /// Only show downloaded models
        #[arg(long)]
        local: bool,
    },
    /// Show details for one model
    Info { id: String },
    /// Download a model (Ctrl-C cancels)
    Download { id: String },
    /// Delete a downloaded model
    Delete { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    let mut context = AppContext::bootstrap(config)
        .await
        .context("Failed to start model manager")?;

    let result = match cli.command {
        Commands::Models { command } => run_models(&mut context, command).await,
        Commands::Services => {
            print_services(&context);
            Ok(())
        }
        Commands::Chat {
            model,
            system,
            temperature,
            max_tokens,
            message,
        } => run_chat(&context, &model, system, temperature, max_tokens, message).await,
    };

    context.shutdown();
    result
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_models(context: &mut AppContext, command: ModelCommands) -> Result<()> {
    match command {
        ModelCommands::List { local } => {
            let manager = context.manager();
            let models = if local {
                manager.get_local_models()
            } else {
                manager.get_available_models()
            };

            if models.is_empty() {
                println!("No models found in {}", manager.models_dir().display());
                return Ok(());
            }
            for model in &models {
                let marker = if model.downloaded { "*" } else { " " };
                println!(
                    "{marker} {:<36} {:>10}  {}",
                    model.id,
                    format_bytes(model.size),
                    model.name
                );
            }
            Ok(())
        }
        ModelCommands::Info { id } => {
            let model = find_model(context, &id)?;
            print_model(&model);
            Ok(())
        }
        ModelCommands::Download { id } => download(context, &id).await,
        ModelCommands::Delete { id } => {
            context.manager().delete_model(&id).await?;
            println!("Deleted {id}");
            Ok(())
        }
    }
}

fn find_model(context: &AppContext, id: &str) -> Result<ModelInfo> {
    let manager = context.manager();
    if let Some(model) = manager.get_model(id) {
        return Ok(model);
    }

    let known = manager.get_available_models();
    match suggest(id, known.iter().map(|m| m.id.as_str())) {
        Some(close) => bail!("Model '{id}' not found. Did you mean '{close}'?"),
        None => bail!("Model '{id}' not found. Run 'assistant-models models list' to see known models."),
    }
}

fn print_model(model: &ModelInfo) {
    println!("{} ({})", model.name, model.id);
    println!("  Provider:     {}", model.provider);
    println!("  Size:         {}", format_bytes(model.size));
    println!("  Format:       {}", model.format);
    if model.parameters > 0 {
        println!("  Parameters:   {}", model.parameters);
    }
    if let Some(quantization) = &model.quantization {
        println!("  Quantization: {quantization}");
    }
    if let Some(description) = &model.description {
        println!("  Description:  {description}");
    }
    match &model.path {
        Some(path) if model.downloaded => println!("  Path:         {}", path.display()),
        _ => println!("  Downloaded:   no"),
    }
}

async fn download(context: &mut AppContext, id: &str) -> Result<()> {
    let manager = Arc::clone(context.manager());

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        )?
        .progress_chars("#>-"),
    );
    bar.set_message(id.to_string());

    let callback_bar = bar.clone();
    let model_id = id.to_string();
    let on_progress: ProgressCallback = Arc::new(move |progress: &DownloadProgress| {
        if progress.model_id != model_id {
            return;
        }
        callback_bar.set_length(progress.total_bytes);
        callback_bar.set_position(progress.bytes_downloaded);
    });

    let cancel_manager = Arc::clone(&manager);
    let cancel_id = id.to_string();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_manager.cancel_download(&cancel_id);
        }
    });

    let result = manager.download_model(id, Some(on_progress)).await;
    ctrl_c.abort();

    match result {
        Ok(model) => {
            bar.finish_with_message(format!("{id} done"));
            if let Some(path) = &model.path {
                println!("Saved to {}", path.display());
            }
            let status = context.register_downloaded(id).await?;
            if status != ServiceStatus::Ready {
                tracing::warn!("Local service for {id} is not ready: {status:?}");
            }
            Ok(())
        }
        Err(e) => {
            bar.abandon_with_message(format!("{id} failed"));
            Err(e.into())
        }
    }
}

fn print_services(context: &AppContext) {
    let groups = context.registry().group_by_provider();
    if groups.is_empty() {
        println!("No services registered");
        return;
    }

    for (provider, services) in groups {
        println!("{provider}:");
        for service in services {
            let descriptor = service.descriptor();
            let state = match descriptor.status {
                ServiceStatus::Ready => "ready",
                ServiceStatus::Loading => "loading",
                ServiceStatus::Error => "unavailable",
            };
            println!("  {:<24} {:<12} {}", descriptor.id, state, descriptor.name);
        }
    }
}

async fn run_chat(
    context: &AppContext,
    model: &str,
    system: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    message: String,
) -> Result<()> {
    let Some(service) = context.registry().lookup(model) else {
        let ids = context.registry().iter().map(|s| s.id());
        match suggest(model, ids) {
            Some(close) => bail!("No service '{model}'. Did you mean '{close}'?"),
            None => bail!("No service '{model}'. Run 'assistant-models services' to list them."),
        }
    };

    let mut options = context.default_request_options();
    options.system_prompt = system;
    if temperature.is_some() {
        options.temperature = temperature;
    }
    if max_tokens.is_some() {
        options.max_tokens = max_tokens;
    }

    let response = service
        .send_message(&[ModelMessage::user(message)], &options)
        .await
        .with_context(|| format!("Request to {model} failed"))?;

    println!("{}", response.content);
    if let Some(total) = response.total_tokens {
        tracing::info!(
            "{total} tokens used (finish reason: {})",
            response.finish_reason.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}
