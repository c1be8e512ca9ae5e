use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use quill_core::catalog;
use quill_core::providers::{CodeExecutionResult, WebSearchResult};
use quill_core::{
    ChatCallbacks, ChatOrchestrator, ChatSession, ContentSource, JsonFileStore,
    LocalContentSource, Preferences, Provider, ToolOptions, TurnOutcome, UsageData,
    is_auth_error, provider_for,
};

mod config;

use config::QuillConfig;

#[derive(Parser)]
#[command(name = "quill")]
#[command(version)]
#[command(about = "quill - chat with your notes through Claude, GPT or Gemini")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat session
    Chat {
        /// Model id for this session
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Send a one-shot message
    Ask {
        /// The message to send
        message: String,

        /// Model id for this message
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Manage provider API keys
    Key {
        #[command(subcommand)]
        command: KeyCommand,
    },

    /// Switch the active provider
    Use {
        /// anthropic, openai or gemini
        provider: String,
    },

    /// List available models with pricing
    Models,

    /// Select the model used for a provider
    Model {
        provider: String,
        model_id: String,
    },

    /// Show or change native tool toggles
    Tools {
        #[arg(long)]
        web_search: Option<Toggle>,
        #[arg(long)]
        web_fetch: Option<Toggle>,
        #[arg(long)]
        code_execution: Option<Toggle>,
    },

    /// Show which notes would be auto-loaded for a query
    Relevant {
        query: String,

        #[arg(short, long, default_value_t = 5)]
        limit: usize,
    },

    /// Initialize config directory and default config
    Init,

    /// Show current configuration
    Config,
}

#[derive(Subcommand)]
enum KeyCommand {
    /// Store a key (validated against the provider unless --no-validate)
    Set {
        provider: String,
        key: String,
        #[arg(long)]
        no_validate: bool,
    },
    /// Remove a stored key
    Clear { provider: String },
    /// Show stored keys (masked)
    List,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl From<Toggle> for bool {
    fn from(toggle: Toggle) -> Self {
        matches!(toggle, Toggle::On)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; stderr keeps streamed replies on stdout clean
    let level = if cli.debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Chat { model } => cmd_chat(&cli.config, model).await,
        Commands::Ask { message, model } => cmd_ask(&cli.config, &message, model).await,
        Commands::Key { command } => cmd_key(&cli.config, command).await,
        Commands::Use { provider } => cmd_use(&provider),
        Commands::Models => cmd_models(),
        Commands::Model { provider, model_id } => cmd_model(&provider, &model_id),
        Commands::Tools {
            web_search,
            web_fetch,
            code_execution,
        } => cmd_tools(web_search, web_fetch, code_execution),
        Commands::Relevant { query, limit } => cmd_relevant(&cli.config, &query, limit).await,
    }
}

fn parse_provider(s: &str) -> Result<Provider> {
    Provider::from_id(s)
        .ok_or_else(|| anyhow!("Unknown provider '{}'. Use anthropic, openai or gemini.", s))
}

fn open_prefs() -> Result<Preferences> {
    let store = JsonFileStore::open(config::prefs_path()).context("Failed to open preferences")?;
    let prefs = Preferences::new(Arc::new(store));
    if prefs.migrate()? {
        info!("Migrated preferences to per-provider layout");
    }
    Ok(prefs)
}

fn build_orchestrator(cfg: &QuillConfig) -> Result<Arc<ChatOrchestrator>> {
    let prefs = open_prefs()?;
    let content = cfg.notes_dir().map(|dir| {
        let source = LocalContentSource::new(dir, cfg.notes.extensions.clone());
        Arc::new(source) as Arc<dyn ContentSource>
    });
    if content.is_none() {
        warn!("No [notes] dir configured; chatting without file context");
    }

    let mut orchestrator = ChatOrchestrator::new(prefs, content, cfg.chat_config());
    for provider in Provider::ALL {
        if let Some(url) = cfg.endpoints.for_provider(provider) {
            orchestrator = orchestrator.with_adapter(provider_for(provider, Some(url)));
        }
    }
    Ok(Arc::new(orchestrator))
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        config::write_default_config(&config_path)?;
        info!("Created default config at {}", config_path.display());
    }

    println!("quill initialized at {}", config_dir.display());
    println!("Edit {} to point [notes] dir at your notes.", config_path.display());
    println!("Then add a key: quill key set anthropic <key>");
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = QuillConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg)?);

    let prefs = open_prefs()?;
    let provider = prefs.active_provider();
    println!("# preferences ({})", config::prefs_path().display());
    println!("active_provider = {}", provider);
    let model = prefs
        .selected_model(provider)
        .unwrap_or_else(|| catalog::default_model(provider).id.to_string());
    println!("model = {}", model);
    let tools = prefs.tool_options();
    println!(
        "tools = web_search:{} web_fetch:{} code_execution:{}",
        tools.enable_web_search, tools.enable_web_fetch, tools.enable_code_execution
    );
    Ok(())
}

fn dim(s: &str) -> String {
    format!("\x1b[2m{}\x1b[0m", s)
}

/// Streams tokens to stdout and tool activity to stderr
struct TerminalCallbacks {
    provider: Provider,
    usage: Mutex<Option<UsageData>>,
}

impl TerminalCallbacks {
    fn new(provider: Provider) -> Self {
        Self {
            provider,
            usage: Mutex::new(None),
        }
    }

    fn usage(&self) -> Option<UsageData> {
        self.usage.lock().ok().and_then(|u| *u)
    }
}

impl ChatCallbacks for TerminalCallbacks {
    fn on_token(&self, token: &str) {
        let mut stdout = std::io::stdout();
        let _ = write!(stdout, "{}", token);
        let _ = stdout.flush();
    }

    fn on_usage(&self, usage: &UsageData) {
        if let Ok(mut slot) = self.usage.lock() {
            *slot = Some(*usage);
        }
    }

    fn on_complete(&self, _full_response: &str) {
        println!();
    }

    fn on_error(&self, message: &str) {
        eprintln!("\nError: {}", message);
        if is_auth_error(message) {
            eprintln!(
                "Your {} key was rejected. Set a new one with: quill key set {} <key>",
                self.provider.config().name,
                self.provider
            );
        }
    }

    fn on_web_search_start(&self, query: &str) {
        eprintln!("{}", dim(&format!("[searching the web: {}]", query)));
    }

    fn on_web_search_results(&self, results: &[WebSearchResult]) {
        for result in results.iter().take(5) {
            eprintln!("{}", dim(&format!("  - {} ({})", result.title, result.url)));
        }
    }

    fn on_web_fetch_start(&self, url: &str) {
        eprintln!("{}", dim(&format!("[fetching {}]", url)));
    }

    fn on_web_fetch_result(&self, url: &str, title: Option<&str>) {
        eprintln!("{}", dim(&format!("  fetched {}", title.unwrap_or(url))));
    }

    fn on_code_execution_start(&self, code: &str) {
        eprintln!("{}", dim(&format!("[running code]\n{}", code)));
    }

    fn on_code_execution_result(&self, result: &CodeExecutionResult) {
        let out = if result.stderr.is_empty() { &result.stdout } else { &result.stderr };
        eprintln!("{}", dim(&format!("[exit {}] {}", result.return_code, out.trim_end())));
    }

    fn on_tool_error(&self, tool: &str, message: &str) {
        eprintln!("{}", dim(&format!("[{} failed: {}]", tool, message)));
    }

    fn on_file_load(&self, path: &str) {
        eprintln!("{}", dim(&format!("[loading {}]", path)));
    }

    fn on_file_loaded(&self, path: &str, success: bool) {
        if !success {
            eprintln!("{}", dim(&format!("[could not load {}]", path)));
        }
    }
}

/// One turn with Ctrl-C mapped to cancellation
async fn run_turn(session: &mut ChatSession, provider: Provider, text: &str) -> TurnOutcome {
    let callbacks = TerminalCallbacks::new(provider);
    let cancel = CancellationToken::new();

    let outcome = {
        let turn = session.send(text, &callbacks, cancel.clone());
        tokio::pin!(turn);
        loop {
            tokio::select! {
                outcome = &mut turn => break outcome,
                _ = signal::ctrl_c() => cancel.cancel(),
            }
        }
    };

    match &outcome {
        TurnOutcome::Completed(_) => {
            if let Some(usage) = callbacks.usage() {
                eprintln!("{}", dim(&usage.to_string()));
            }
        }
        TurnOutcome::Cancelled => eprintln!("\n{}", dim("(cancelled)")),
        TurnOutcome::Failed(_) => {}
    }
    outcome
}

fn print_chat_help() {
    println!("  /new            start a new chat");
    println!("  /files          list loaded files");
    println!("  /load <path>    load a file into context");
    println!("  /drop <path>    remove a file from context");
    println!("  /model [id]     show or change the model for this session");
    println!("  /quit           exit");
}

/// Handle a slash command; returns true to quit
async fn handle_command(
    command: &str,
    session: &mut ChatSession,
    orchestrator: &ChatOrchestrator,
) -> Result<bool> {
    let (name, arg) = command
        .split_once(char::is_whitespace)
        .map(|(n, a)| (n, a.trim()))
        .unwrap_or((command, ""));

    match name {
        "quit" | "exit" | "q" => return Ok(true),
        "new" => {
            session.new_chat();
            println!("{}", dim("(new chat)"));
        }
        "files" => {
            let files = session.loaded_files();
            if files.is_empty() {
                println!("No files loaded.");
            }
            for file in files {
                println!("  {} (~{} tokens)", file.path, file.token_estimate);
            }
        }
        "load" if !arg.is_empty() => match session.load_file(arg).await {
            Ok(file) => println!("Loaded {} (~{} tokens)", file.path, file.token_estimate),
            Err(e) => eprintln!("Error: {:#}", e),
        },
        "drop" if !arg.is_empty() => {
            if session.drop_file(arg) {
                println!("Dropped {}", arg);
            } else {
                println!("{} is not loaded", arg);
            }
        }
        "model" => {
            let provider = orchestrator.active_provider();
            if arg.is_empty() {
                println!("{}", orchestrator.resolve_model(provider, session.model_id()));
            } else {
                match catalog::find_model(arg) {
                    Some(model) if model.provider == provider => {
                        session.set_model(Some(model.id.to_string()));
                        println!("Using {} for this session", model.display_name);
                    }
                    Some(model) => eprintln!(
                        "{} is a {} model; active provider is {}",
                        arg, model.provider, provider
                    ),
                    None => eprintln!("Unknown model: {}", arg),
                }
            }
        }
        _ => print_chat_help(),
    }
    Ok(false)
}

async fn cmd_chat(config_path: &Option<PathBuf>, model: Option<String>) -> Result<()> {
    let cfg = QuillConfig::load(config_path)?;
    let orchestrator = build_orchestrator(&cfg)?;
    let mut session = ChatSession::new(orchestrator.clone());
    session.set_model(model);

    let provider = orchestrator.active_provider();
    if !orchestrator.prefs().has_api_key(provider) {
        println!("No API key stored. Add one with: quill key set {} <key>", provider);
    }
    println!(
        "quill chat ({} / {}). /help for commands, Ctrl-C cancels a reply.",
        provider.config().name,
        orchestrator.resolve_model(provider, session.model_id())
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read input")?,
            _ = signal::ctrl_c() => {
                println!();
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        if let Some(command) = text.strip_prefix('/') {
            if handle_command(command, &mut session, &orchestrator).await? {
                break;
            }
            continue;
        }

        let provider = orchestrator.active_provider();
        run_turn(&mut session, provider, text).await;
    }
    Ok(())
}

async fn cmd_ask(
    config_path: &Option<PathBuf>,
    message: &str,
    model: Option<String>,
) -> Result<()> {
    let cfg = QuillConfig::load(config_path)?;
    let orchestrator = build_orchestrator(&cfg)?;
    let mut session = ChatSession::new(orchestrator.clone());
    session.set_model(model);

    match run_turn(&mut session, orchestrator.active_provider(), message).await {
        TurnOutcome::Failed(message) => bail!(message),
        _ => Ok(()),
    }
}

async fn cmd_key(config_path: &Option<PathBuf>, command: KeyCommand) -> Result<()> {
    let prefs = open_prefs()?;
    match command {
        KeyCommand::Set {
            provider,
            key,
            no_validate,
        } => {
            let provider = parse_provider(&provider)?;
            let key = key.trim();
            let expected = provider.config().key_prefix;
            if !key.starts_with(expected) {
                warn!("{} keys usually start with '{}'", provider.config().name, expected);
            }

            if !no_validate {
                let cfg = QuillConfig::load(config_path)?;
                let adapter = provider_for(provider, cfg.endpoints.for_provider(provider));
                let validation = adapter.validate_key(key).await;
                if !validation.valid {
                    bail!(
                        "{} rejected the key: {}",
                        provider.config().name,
                        validation.error.unwrap_or_default()
                    );
                }
            }

            prefs.set_api_key(provider, key)?;
            println!("Stored {} key {}", provider.config().name, config::mask_secret(key));
            if prefs.active_provider() == provider {
                println!("{} is the active provider", provider.config().name);
            }
        }
        KeyCommand::Clear { provider } => {
            let provider = parse_provider(&provider)?;
            prefs.clear_api_key(provider)?;
            println!(
                "Cleared {} key. Active provider: {}",
                provider.config().name,
                prefs.active_provider()
            );
        }
        KeyCommand::List => {
            let active = prefs.active_provider();
            for provider in Provider::ALL {
                let marker = if provider == active { "*" } else { " " };
                let key = prefs.api_key(provider).unwrap_or_default();
                println!(
                    "{} {:<10} {:<18} {}",
                    marker,
                    provider.id(),
                    config::mask_secret(&key),
                    provider.config().console_url
                );
            }
        }
    }
    Ok(())
}

fn cmd_use(provider: &str) -> Result<()> {
    let provider = parse_provider(provider)?;
    let prefs = open_prefs()?;
    if !prefs.set_active_provider(provider)? {
        bail!(
            "No API key stored for {}. Run `quill key set {} <key>` first.",
            provider.config().name,
            provider
        );
    }
    println!("Active provider: {}", provider.config().name);
    Ok(())
}

fn cmd_models() -> Result<()> {
    let prefs = open_prefs()?;
    for provider in Provider::ALL {
        let config = provider.config();
        let selected = prefs
            .selected_model(provider)
            .unwrap_or_else(|| catalog::default_model(provider).id.to_string());
        println!("{}", config.name);
        for model in catalog::models_for(provider) {
            let marker = if model.id == selected { "*" } else { " " };
            println!(
                "  {} {:<28} {:<18} {:?}  ${:.2}/M in  ${:.2}/M out",
                marker,
                model.id,
                model.display_name,
                model.tier,
                model.input_cost_per_million,
                model.output_cost_per_million
            );
        }
    }
    Ok(())
}

fn cmd_model(provider: &str, model_id: &str) -> Result<()> {
    let provider = parse_provider(provider)?;
    let prefs = open_prefs()?;
    prefs.set_selected_model(provider, model_id)?;
    println!("{} will use {}", provider.config().name, model_id);
    Ok(())
}

fn cmd_tools(
    web_search: Option<Toggle>,
    web_fetch: Option<Toggle>,
    code_execution: Option<Toggle>,
) -> Result<()> {
    let prefs = open_prefs()?;
    let mut tools = prefs.tool_options();
    if let Some(toggle) = web_search {
        tools.enable_web_search = toggle.into();
    }
    if let Some(toggle) = web_fetch {
        tools.enable_web_fetch = toggle.into();
    }
    if let Some(toggle) = code_execution {
        tools.enable_code_execution = toggle.into();
    }
    prefs.set_tool_options(tools)?;

    let provider = prefs.active_provider();
    let effective = tools.gated_for(provider);
    let show = |name: &str, on: bool, effective: bool| {
        let note = if on && !effective { " (not supported by active provider)" } else { "" };
        println!("{:<15} {}{}", name, if on { "on" } else { "off" }, note);
    };
    show("web_search", tools.enable_web_search, effective.enable_web_search);
    show("web_fetch", tools.enable_web_fetch, effective.enable_web_fetch);
    show("code_execution", tools.enable_code_execution, effective.enable_code_execution);
    if effective == ToolOptions::default() && tools.any_enabled() {
        println!("{} ignores these toggles", provider.config().name);
    }
    Ok(())
}

async fn cmd_relevant(config_path: &Option<PathBuf>, query: &str, limit: usize) -> Result<()> {
    let cfg = QuillConfig::load(config_path)?;
    let orchestrator = build_orchestrator(&cfg)?;
    let paths = orchestrator.find_relevant_files(query, limit).await?;
    if paths.is_empty() {
        println!("No known source mentioned in the query.");
    }
    for path in paths {
        println!("{}", path);
    }
    Ok(())
}
