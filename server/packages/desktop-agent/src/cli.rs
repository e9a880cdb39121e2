use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use utoipa::OpenApi;

use crate::agent_loop::{LoopOptions, DEFAULT_MAX_TURNS};
use crate::decision::{
    DisplaySize, OpenAiConfig, OpenAiDecisionService, DEFAULT_DISPLAY_HEIGHT,
    DEFAULT_DISPLAY_WIDTH, DEFAULT_MODEL, DEFAULT_OPENAI_BASE_URL,
};
use crate::executor::{ActionExecutor, LocalCommandChannel, DEFAULT_DISPLAY};
use crate::ports::{PortAllocator, DEFAULT_BASE_PORT, DEFAULT_MAX_ATTEMPTS};
use crate::relay::{DisplayRelay, RelayConfig};
use crate::router::{build_router_with_state, shutdown, ApiDoc, AppState, AuthConfig};
use crate::sandbox::{
    DockerRuntime, SandboxConfig, SandboxManager, DEFAULT_API_PORT, DEFAULT_CONTAINER_NAME,
    DEFAULT_IMAGE, DEFAULT_VNC_PORT,
};
use crate::sandbox_api::{build_sandbox_router, SandboxApiState};
use crate::session::{SessionManager, SessionManagerConfig, DEFAULT_PROMPT_SUFFIX};
use crate::telemetry::init_logging;

#[derive(Parser, Debug)]
#[command(name = "desktop-agent")]
#[command(about = "Runs natural-language tasks against a sandboxed virtual desktop", version)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host API: sessions, sandbox lifecycle and progress streams.
    Server(ServerArgs),
    /// Command API run inside the sandbox container.
    #[command(name = "sandbox-api")]
    SandboxApi(SandboxApiArgs),
    /// Print the host API OpenAPI document.
    Openapi(OpenapiArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 5000)]
    port: u16,

    #[arg(long, env = "DESKTOP_AGENT_TOKEN")]
    token: Option<String>,

    #[arg(long)]
    no_token: bool,

    #[arg(long = "cors-allow-origin")]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method")]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header")]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials")]
    cors_allow_credentials: bool,

    #[arg(long, default_value = DEFAULT_CONTAINER_NAME)]
    container_name: String,

    #[arg(long, env = "DESKTOP_AGENT_IMAGE", default_value = DEFAULT_IMAGE)]
    image: String,

    #[arg(long, default_value_t = DEFAULT_VNC_PORT)]
    vnc_port: u16,

    #[arg(long, default_value_t = DEFAULT_API_PORT)]
    api_port: u16,

    /// Delay after starting the container before it is used.
    #[arg(long, default_value_t = 2000)]
    settle_ms: u64,

    #[arg(long, env = "DESKTOP_AGENT_NOVNC_PATH", default_value = "noVNC")]
    novnc_path: PathBuf,

    #[arg(long, default_value_t = DEFAULT_BASE_PORT)]
    novnc_base_port: u16,

    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    novnc_max_attempts: u16,

    #[arg(long, default_value = "localhost")]
    vnc_host: String,

    #[arg(long, default_value = "python")]
    python: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    #[arg(long, env = "OPENAI_MODEL", default_value = DEFAULT_MODEL)]
    openai_model: String,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_OPENAI_BASE_URL)]
    openai_base_url: String,

    #[arg(long, default_value_t = DEFAULT_DISPLAY_WIDTH)]
    display_width: u32,

    #[arg(long, default_value_t = DEFAULT_DISPLAY_HEIGHT)]
    display_height: u32,

    /// Replaces the operator instructions appended to every task.
    #[arg(long, env = "DESKTOP_AGENT_PROMPT_SUFFIX")]
    prompt_suffix: Option<String>,

    #[arg(long, default_value_t = DEFAULT_MAX_TURNS)]
    max_turns: usize,
}

#[derive(Args, Debug)]
pub struct SandboxApiArgs {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = DEFAULT_API_PORT)]
    port: u16,

    #[arg(long, env = "DISPLAY", default_value = DEFAULT_DISPLAY)]
    display: String,
}

#[derive(Args, Debug)]
pub struct OpenapiArgs {
    /// Write to this file instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("missing --token or --no-token for server mode")]
    MissingToken,
    #[error("missing --openai-api-key (or OPENAI_API_KEY)")]
    MissingApiKey,
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("docker error: {0}")]
    Docker(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
}

/// Everything the host server needs, resolved from the command line.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub auth: AuthConfig,
    pub sandbox_name: String,
    pub sandbox: SandboxConfig,
    pub relay: RelayConfig,
    pub novnc_base_port: u16,
    pub novnc_max_attempts: u16,
    pub openai: OpenAiConfig,
    pub sessions: SessionManagerConfig,
}

impl ServerArgs {
    pub fn to_config(&self) -> Result<ServerConfig, CliError> {
        let auth = if self.no_token {
            AuthConfig::disabled()
        } else if let Some(token) = self.token.clone() {
            AuthConfig::with_token(token)
        } else {
            return Err(CliError::MissingToken);
        };
        let api_key = self.openai_api_key.clone().ok_or(CliError::MissingApiKey)?;

        Ok(ServerConfig {
            host: self.host.clone(),
            port: self.port,
            auth,
            sandbox_name: self.container_name.clone(),
            sandbox: SandboxConfig {
                image: self.image.clone(),
                vnc_port: self.vnc_port,
                api_port: self.api_port,
                display: DEFAULT_DISPLAY.to_string(),
                settle_delay: Duration::from_millis(self.settle_ms),
            },
            relay: RelayConfig {
                python: self.python.clone(),
                novnc_path: self.novnc_path.clone(),
                vnc_host: self.vnc_host.clone(),
            },
            novnc_base_port: self.novnc_base_port,
            novnc_max_attempts: self.novnc_max_attempts,
            openai: OpenAiConfig {
                api_key,
                base_url: self.openai_base_url.clone(),
                model: self.openai_model.clone(),
            },
            sessions: SessionManagerConfig {
                sandbox_name: self.container_name.clone(),
                prompt_suffix: self
                    .prompt_suffix
                    .clone()
                    .unwrap_or_else(|| DEFAULT_PROMPT_SUFFIX.to_string()),
                loop_options: LoopOptions {
                    auto_mode: false,
                    max_turns: self.max_turns,
                    display: DisplaySize {
                        width: self.display_width,
                        height: self.display_height,
                    },
                },
                ..SessionManagerConfig::default()
            },
        })
    }
}

pub fn run_desktop_agent() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_logging();

    match cli.command {
        Command::Server(args) => {
            let config = args.to_config()?;
            let cors = build_cors_layer(&args)?;
            run_server(config, cors)
        }
        Command::SandboxApi(args) => run_sandbox_api(&args),
        Command::Openapi(args) => write_openapi(&args),
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("server shutdown requested");
}

fn run_server(config: ServerConfig, cors: Option<CorsLayer>) -> Result<(), CliError> {
    let runtime = build_runtime()?;
    runtime.block_on(async move {
        let docker = DockerRuntime::connect().map_err(|err| CliError::Docker(err.to_string()))?;
        let sandboxes = Arc::new(SandboxManager::new(Arc::new(docker), config.sandbox.clone()));
        let decision = Arc::new(OpenAiDecisionService::new(config.openai.clone()));
        let sessions = SessionManager::new(sandboxes, decision, config.sessions.clone());
        let ports = Arc::new(PortAllocator::new(
            config.novnc_base_port,
            config.novnc_max_attempts,
        ));
        let relay = Arc::new(DisplayRelay::new(config.relay.clone(), ports));

        let state = Arc::new(AppState::new(config.auth.clone(), sessions, relay));
        let (mut router, state) = build_router_with_state(state);
        if let Some(cors) = cors {
            router = router.layer(cors);
        }

        let addr = format!("{}:{}", config.host, config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(%addr, sandbox = %config.sandbox_name, "desktop agent server listening");
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|err| CliError::Server(err.to_string()));

        shutdown(&state).await;
        served
    })
}

fn run_sandbox_api(args: &SandboxApiArgs) -> Result<(), CliError> {
    let executor = ActionExecutor::with_display(Arc::new(LocalCommandChannel), &args.display);
    let router = build_sandbox_router(SandboxApiState::new(executor));
    let addr = format!("{}:{}", args.host, args.port);

    build_runtime()?.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(%addr, display = %args.display, "sandbox command API listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn write_openapi(args: &OpenapiArgs) -> Result<(), CliError> {
    let doc = serde_json::to_string_pretty(&ApiDoc::openapi())?;
    match &args.out {
        Some(path) => std::fs::write(path, doc)?,
        None => println!("{doc}"),
    }
    Ok(())
}

fn build_cors_layer(args: &ServerArgs) -> Result<Option<CorsLayer>, CliError> {
    let has_config = !args.cors_allow_origin.is_empty()
        || !args.cors_allow_method.is_empty()
        || !args.cors_allow_header.is_empty()
        || args.cors_allow_credentials;

    if !has_config {
        return Ok(None);
    }

    let mut cors = CorsLayer::new();

    if args.cors_allow_origin.is_empty() {
        cors = cors.allow_origin(Any);
    } else {
        let mut origins = Vec::new();
        for origin in &args.cors_allow_origin {
            let value = origin
                .parse()
                .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
            origins.push(value);
        }
        cors = cors.allow_origin(origins);
    }

    if args.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &args.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if args.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &args.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if args.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(Some(cors))
}
