use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::Command as OsCommand;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;

use kproxy_common::{ConfigError, ProxyConfig};

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_PORT_IN_USE: i32 = 3;

#[derive(Debug, Parser)]
#[command(name = "kproxy", version, about = "Transparent LLM proxy with accounting and compaction")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "kproxy.toml", env = "KPROXY_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the proxy in the foreground.
    Start {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Re-read the configuration file on restart.
        #[arg(long)]
        reload: bool,
    },
    /// Signal a running instance to terminate.
    Stop,
    /// Stop a running instance, then start a new one.
    Restart {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Report whether an instance is running.
    Status,
    /// Print the tail of the log file.
    Logs {
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },
    /// Validate the configuration and probe a running instance.
    Test,
}

pub fn run() -> i32 {
    let cli = Cli::parse();

    match cli.command {
        Command::Start { host, port, reload } => start(&cli.config, host, port, reload),
        Command::Stop => stop(&cli.config),
        Command::Restart { host, port } => {
            let _ = stop(&cli.config);
            start(&cli.config, host, port, false)
        }
        Command::Status => status(&cli.config),
        Command::Logs { lines } => logs(&cli.config, lines),
        Command::Test => test(&cli.config),
    }
}

fn load_config(path: &Path) -> Result<ProxyConfig, i32> {
    match ProxyConfig::load(path) {
        Ok(config) => Ok(config),
        Err(err @ ConfigError::Io(_)) if !path.exists() => {
            eprintln!("config file {} does not exist: {err}", path.display());
            Err(EXIT_CONFIG)
        }
        Err(err) => {
            eprintln!("config error: {err}");
            Err(EXIT_CONFIG)
        }
    }
}

fn start(config_path: &Path, host: Option<String>, port: Option<u16>, reload: bool) -> i32 {
    let mut config = match load_config(config_path) {
        Ok(config) => config,
        Err(code) => return code,
    };
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    init_tracing(&config);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to build runtime: {err}");
            return EXIT_FAILURE;
        }
    };

    match runtime.block_on(serve(config, reload)) {
        Ok(()) => EXIT_OK,
        Err(ServeError::PortInUse(bind)) => {
            eprintln!("address {bind} already in use");
            EXIT_PORT_IN_USE
        }
        Err(ServeError::Other(err)) => {
            eprintln!("fatal: {err:#}");
            EXIT_FAILURE
        }
    }
}

enum ServeError {
    PortInUse(String),
    Other(anyhow::Error),
}

async fn serve(config: ProxyConfig, reload: bool) -> Result<(), ServeError> {
    let pid_path = pid_file_path(&config);
    let bind = format!("{}:{}", config.server.host, config.server.port);

    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            return Err(ServeError::PortInUse(bind));
        }
        Err(err) => return Err(ServeError::Other(err.into())),
    };

    let boot = kproxy_core::bootstrap(config)
        .await
        .map_err(ServeError::Other)?;
    let app = kproxy_router::app_router(kproxy_router::AppState::from_bootstrap(&boot));

    if let Err(err) = fs::write(&pid_path, std::process::id().to_string()) {
        return Err(ServeError::Other(anyhow::anyhow!(
            "write pid file {}: {err}",
            pid_path.display()
        )));
    }

    info!(event = "listening", bind = %bind, reload = reload);
    println!("listening on {bind}");
    let result = axum::serve(listener, app).await;

    let _ = fs::remove_file(&pid_path);
    result.map_err(|err| ServeError::Other(err.into()))
}

fn init_tracing(config: &ProxyConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if let Some(path) = &config.server.log_file {
        if let Ok(file) = fs::OpenOptions::new().create(true).append(true).open(path) {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
            return;
        }
        eprintln!("could not open log file {path}; logging to stderr");
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn pid_file_path(config: &ProxyConfig) -> PathBuf {
    config
        .server
        .pid_file
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("kproxy.pid"))
}

fn read_pid(config: &ProxyConfig) -> Option<u32> {
    let path = pid_file_path(config);
    let text = fs::read_to_string(path).ok()?;
    text.trim().parse().ok()
}

fn pid_alive(pid: u32) -> bool {
    OsCommand::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn stop(config_path: &Path) -> i32 {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(code) => return code,
    };
    let Some(pid) = read_pid(&config) else {
        eprintln!("no pid file; is kproxy running?");
        return EXIT_FAILURE;
    };

    let terminated = OsCommand::new("kill")
        .arg(pid.to_string())
        .status()
        .map(|status| status.success())
        .unwrap_or(false);
    if !terminated {
        eprintln!("failed to signal pid {pid}");
        return EXIT_FAILURE;
    }

    // Give it a moment to exit, then clean up the pid file.
    for _ in 0..20 {
        if !pid_alive(pid) {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    let _ = fs::remove_file(pid_file_path(&config));
    println!("stopped pid {pid}");
    EXIT_OK
}

fn status(config_path: &Path) -> i32 {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(code) => return code,
    };
    match read_pid(&config) {
        Some(pid) if pid_alive(pid) => {
            println!(
                "running: pid {pid}, listening on {}:{}",
                config.server.host, config.server.port
            );
            EXIT_OK
        }
        Some(pid) => {
            println!("stale pid file (pid {pid} is gone)");
            EXIT_FAILURE
        }
        None => {
            println!("not running");
            EXIT_FAILURE
        }
    }
}

fn logs(config_path: &Path, lines: usize) -> i32 {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(code) => return code,
    };
    let Some(path) = config.server.log_file.as_deref() else {
        eprintln!("no log_file configured under [server]");
        return EXIT_FAILURE;
    };
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("open {path}: {err}");
            return EXIT_FAILURE;
        }
    };

    let all: Vec<String> = BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .collect();
    let start = all.len().saturating_sub(lines);
    for line in &all[start..] {
        println!("{line}");
    }
    EXIT_OK
}

fn test(config_path: &Path) -> i32 {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(code) => return code,
    };
    println!(
        "config ok: {} providers, {} models, {} mcp peers",
        config.providers.len(),
        config.models.len(),
        config.mcp.len()
    );

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to build runtime: {err}");
            return EXIT_FAILURE;
        }
    };
    runtime.block_on(probe_health(&config))
}

/// Hit `/health` on the configured bind and check the body shape, so `test`
/// catches a listener whose router is broken, not just a dead port.
async fn probe_health(config: &ProxyConfig) -> i32 {
    let url = format!(
        "http://{}:{}/health",
        config.server.host, config.server.port
    );
    let client = match wreq::Client::builder()
        .connect_timeout(Duration::from_secs(2))
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            eprintln!("failed to build http client: {err}");
            return EXIT_FAILURE;
        }
    };

    let response = match client.get(&url).send().await {
        Ok(response) => response,
        Err(err) => {
            eprintln!("server: no healthy instance at {url}: {err}");
            return EXIT_FAILURE;
        }
    };
    let status = response.status();
    if !status.is_success() {
        eprintln!("server: {url} answered HTTP {}", status.as_u16());
        return EXIT_FAILURE;
    }

    let body = match response.bytes().await {
        Ok(body) => body,
        Err(err) => {
            eprintln!("server: failed to read health body from {url}: {err}");
            return EXIT_FAILURE;
        }
    };
    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("server: health body from {url} is not JSON: {err}");
            return EXIT_FAILURE;
        }
    };

    let healthy = value.get("status").and_then(|v| v.as_str()) == Some("ok");
    let providers = value.get("providers").and_then(|v| v.as_u64());
    let models = value.get("models").and_then(|v| v.as_u64());
    if !healthy || providers.is_none() || models.is_none() {
        eprintln!("server: unexpected health body from {url}: {value}");
        return EXIT_FAILURE;
    }

    println!(
        "server: healthy at {url} ({} providers, {} models)",
        providers.unwrap_or(0),
        models.unwrap_or(0)
    );
    EXIT_OK
}
