use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod config;
mod handler;
mod render;
mod stack;
use crate::render as render_mod;
use anyhow::Context as _;
use config::{ConfigError, Settings};
use handler::{HandlerError, ProxyRequest, RequestHandler};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
#[command(name = "tgw", version, about = "Private token-count gateway: provisioning plan and handler", long_about = None)]
struct Cli {
    /// Directory holding common.yaml and <env>.yaml
    #[arg(long = "config-dir", global = true, default_value = config::CONFIG_DIR)]
    config_dir: PathBuf,

    /// Output JSON instead of human-readable text
    #[arg(long = "json", global = true)]
    json: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(short = 'v', action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Build the deployment plan for an environment
    Synth(SynthArgs),

    /// Run the token-count handler on a single request
    Invoke(InvokeArgs),

    /// Inspect merged settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Args, Debug, Clone, Default)]
struct ContextArgs {
    /// Context parameter, e.g. `-c env=staging`
    #[arg(short = 'c', long = "context", value_name = "KEY=VALUE")]
    context: Vec<String>,
}

#[derive(Args, Debug, Clone)]
struct SynthArgs {
    #[command(flatten)]
    ctx: ContextArgs,
    /// Deployed REST API id to substitute into the endpoint output
    #[arg(long = "rest-api-id")]
    rest_api_id: Option<String>,
    /// Directory to write <stack>.plan.json into
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
struct InvokeArgs {
    /// Path to a JSON event with a `body` field
    #[arg(long, conflicts_with = "body", required_unless_present = "body")]
    event: Option<PathBuf>,
    /// Raw request body, e.g. '{"content": "hello"}'
    #[arg(long)]
    body: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
enum ConfigCommands {
    /// Print every merged setting
    Show(ContextArgs),
    /// Print one setting; fails if the key is absent
    Get {
        key: String,
        #[command(flatten)]
        ctx: ContextArgs,
    },
}

#[derive(Debug, Clone)]
struct GlobalOpts {
    config_dir: PathBuf,
    json: bool,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let Cli { config_dir, json, verbose, command } = cli;
    init_logging(verbose);

    let globals = GlobalOpts { config_dir, json };

    let result = match command {
        Commands::Synth(args) => cmd_synth(&globals, args).await,
        Commands::Invoke(args) => cmd_invoke(&globals, args).await,
        Commands::Config { command } => cmd_config(&globals, command).await,
    };

    if let Err(e) = result {
        let msg = format!("{:#}", e);
        if globals.json {
            let (code, hint) = classify_error(&e);
            render_mod::print_json_error(code, &msg, hint);
        } else {
            eprintln!("{}", msg);
        }
        std::process::exit(1);
    }

    Ok(())
}

fn classify_error(e: &anyhow::Error) -> (&'static str, Option<&'static str>) {
    if let Some(err) = e.downcast_ref::<ConfigError>() {
        return match err {
            ConfigError::MissingFile { .. } => ("file_not_found", Some("create <config-dir>/<env>.yaml for the target environment")),
            ConfigError::KeyNotFound { .. } => ("key_not_found", None),
            ConfigError::InvalidEnvironment { .. } => ("invalid_args", None),
            ConfigError::Read { .. } => ("io_error", None),
            ConfigError::Parse { .. }
            | ConfigError::NotAMapping { .. }
            | ConfigError::InvalidKey { .. }
            | ConfigError::DuplicateKey { .. }
            | ConfigError::InvalidValue { .. } => ("parse_error", None),
        };
    }
    if let Some(err) = e.downcast_ref::<HandlerError>() {
        return match err {
            HandlerError::MissingBody | HandlerError::Decode(_) => ("decode_error", None),
            HandlerError::Tokenizer(_) => ("tokenizer_error", None),
        };
    }
    if let Some(err) = e.downcast_ref::<std::io::Error>() {
        if err.kind() == std::io::ErrorKind::NotFound {
            return ("file_not_found", Some("check the file path"));
        }
    }
    if e.to_string().contains("invalid context") {
        return ("invalid_args", Some("use -c env=<name>"));
    }
    ("unknown", None)
}

/// Extracts the target environment from `-c KEY=VALUE` pairs. Other keys are
/// accepted and ignored.
fn environment_from_context(ctx: &ContextArgs) -> anyhow::Result<Option<String>> {
    let mut env = None;
    for pair in &ctx.context {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("invalid context '{}': expected KEY=VALUE", pair))?;
        if key.trim() == "env" {
            env = Some(value.trim().to_string());
        } else {
            debug!(key = %key, "ignoring context parameter");
        }
    }
    Ok(env)
}

fn load_settings(globals: &GlobalOpts, ctx: &ContextArgs) -> anyhow::Result<Settings> {
    let env = environment_from_context(ctx)?;
    let settings = Settings::load(&globals.config_dir, env.as_deref())?;
    info!(
        environment = %settings.environment(),
        config_dir = %settings.config_dir().display(),
        keys = settings.len(),
        "settings loaded"
    );
    Ok(settings)
}

async fn cmd_synth(globals: &GlobalOpts, args: SynthArgs) -> anyhow::Result<()> {
    let settings = load_settings(globals, &args.ctx)?;
    let plan = stack::synth(&settings, args.rest_api_id.as_deref())?;
    if let Some(output) = plan.output(stack::ENDPOINT_OUTPUT_KEY) {
        info!(endpoint = %output.value, "endpoint output");
    }
    for missing in plan.function.missing_asset_files(std::path::Path::new(".")) {
        warn!(path = %missing.display(), "function code asset file not found");
    }

    let written = match &args.out {
        Some(dir) => Some(stack::write_plan(&plan, dir)?),
        None => None,
    };

    if globals.json {
        render_mod::print_json(&plan);
    } else {
        render_mod::render_plan_text(&plan);
        if let Some(path) = written { println!("\nplan written: {}", path.display()); }
    }
    Ok(())
}

async fn cmd_invoke(_globals: &GlobalOpts, args: InvokeArgs) -> anyhow::Result<()> {
    let request = match (args.event, args.body) {
        (Some(path), _) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading event file: {}", path.display()))?;
            handler::parse_event(&raw)?
        }
        (None, Some(body)) => ProxyRequest { body: Some(body) },
        (None, None) => anyhow::bail!("invalid args: --event or --body is required"),
    };

    let count_token = handler::CountTokenHandler::new()?;
    let response = count_token.call(request).await?;
    render_mod::print_json(&response);
    Ok(())
}

async fn cmd_config(globals: &GlobalOpts, cmd: ConfigCommands) -> anyhow::Result<()> {
    match cmd {
        ConfigCommands::Show(ctx) => {
            let settings = load_settings(globals, &ctx)?;
            if globals.json {
                let map: BTreeMap<&String, &serde_yaml::Value> = settings.iter().collect();
                render_mod::print_json(&serde_json::json!({
                    "environment": settings.environment(),
                    "settings": map,
                }));
            } else {
                render_mod::render_settings_text(&settings);
            }
        }
        ConfigCommands::Get { key, ctx } => {
            let settings = load_settings(globals, &ctx)?;
            let value = settings.get(&key)?;
            if globals.json {
                render_mod::print_json(value);
            } else {
                println!("{}", render_mod::value_text(value));
            }
        }
    }
    Ok(())
}
