//! FlashRPC - Minimal RPC over a Reliable-Connected Transport
//!
//! This is the main entry point for the `flashrpc` binary. `server` serves
//! the sort handler until Ctrl+C; `client` sends random payloads and logs
//! each response.

use flashrpc::{random_payload, Client, PollMode, RpcConfig, Server, SortHandler};
use std::process;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Which side to run
enum Mode {
    Server,
    Client,
}

/// Command-line configuration
struct Config {
    mode: Mode,
    /// Host to bind to (server) or connect to (client)
    host: String,
    /// Port to listen on or connect to
    port: u16,
    /// Registered pages per connection
    pages: usize,
    /// Server connection limit
    max_connections: usize,
    poll_mode: PollMode,
    /// Requests the client sends
    count: usize,
    /// Payload length of each request
    len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Server,
            host: flashrpc::DEFAULT_HOST.to_string(),
            port: flashrpc::DEFAULT_PORT,
            pages: flashrpc::config::DEFAULT_BUFFER_PAGES,
            max_connections: flashrpc::config::MAX_CONNECTIONS,
            poll_mode: PollMode::Busy,
            count: 100,
            len: 10,
        }
    }
}

fn fail(message: &str) -> ! {
    eprintln!("Error: {message}");
    process::exit(1);
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    match args.get(i + 1) {
        Some(v) => v.as_str(),
        None => fail(&format!("{flag} requires a value")),
    }
}

fn number<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> T {
    value(args, i, flag)
        .parse()
        .unwrap_or_else(|_| fail(&format!("invalid value for {flag}")))
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        match args.get(1).map(String::as_str) {
            Some("server") => config.mode = Mode::Server,
            Some("client") => config.mode = Mode::Client,
            Some("--help") | None => {
                print_help();
                process::exit(0);
            }
            Some("--version") | Some("-v") => {
                println!("FlashRPC version {}", flashrpc::VERSION);
                process::exit(0);
            }
            Some(other) => {
                eprintln!("Unknown command: {other}");
                print_help();
                process::exit(1);
            }
        }

        let mut i = 2;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => config.host = value(&args, i, "--host").to_string(),
                "--port" | "-p" => config.port = number(&args, i, "--port"),
                "--pages" => config.pages = number(&args, i, "--pages"),
                "--max-connections" => {
                    config.max_connections = number(&args, i, "--max-connections")
                }
                "--poll" => {
                    config.poll_mode = value(&args, i, "--poll")
                        .parse()
                        .unwrap_or_else(|e| fail(&format!("{e}")))
                }
                "--count" | "-n" => config.count = number(&args, i, "--count"),
                "--len" | "-l" => config.len = number(&args, i, "--len"),
                "--help" => {
                    print_help();
                    process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {other}");
                    print_help();
                    process::exit(1);
                }
            }
            i += 2;
        }

        config
    }

    fn rpc_config(&self) -> RpcConfig {
        RpcConfig::default()
            .with_buffer_pages(self.pages)
            .with_max_connections(self.max_connections)
            .with_poll_mode(self.poll_mode)
    }
}

fn print_help() {
    println!(
        r#"
FlashRPC - Minimal RPC over a Reliable-Connected Transport

USAGE:
    flashrpc server [OPTIONS]
    flashrpc client [OPTIONS]

SERVER OPTIONS:
    -h, --host <HOST>              Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>              Port to listen on (default: 20079)
        --pages <N>                Registered 64 KiB pages per connection (default: 64)
        --max-connections <N>      Connections served at once (default: 8)
        --poll <busy|backoff>      Poller idle behavior (default: busy)

CLIENT OPTIONS:
    -h, --host <HOST>              Server host (default: 127.0.0.1)
    -p, --port <PORT>              Server port (default: 20079)
    -n, --count <N>                Requests to send (default: 100)
    -l, --len <N>                  Payload bytes per request, at most 64 (default: 10)
        --pages <N>                Registered 64 KiB pages (default: 64)
        --poll <busy|backoff>      Poller idle behavior (default: busy)

OTHER:
    -v, --version                  Print version information
        --help                     Print this help message

EXAMPLES:
    flashrpc server --port 20079
    flashrpc client --port 20079 --count 10 --len 16
"#
    );
}

fn print_banner(config: &Config) {
    println!(
        r#"
FlashRPC v{} - Minimal RPC over a Reliable-Connected Transport
──────────────────────────────────────────────────────────────
Server started on {}:{}
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        flashrpc::VERSION,
        config.host,
        config.port
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    match config.mode {
        Mode::Server => run_server(config).await,
        Mode::Client => {
            tokio::task::spawn_blocking(move || run_client(config)).await??;
            Ok(())
        }
    }
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let server = Server::bind(&config.host, config.port, SortHandler, config.rpc_config())?;
    print_banner(&config);

    let stats = server.stats();
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };
    server.serve_until(shutdown).await?;

    info!(
        accepted = stats.connections_accepted.load(std::sync::atomic::Ordering::Relaxed),
        served = stats.requests_served.load(std::sync::atomic::Ordering::Relaxed),
        "Server stopped"
    );
    Ok(())
}

fn run_client(config: Config) -> anyhow::Result<()> {
    if config.len > flashrpc::MESSAGE_BUF_SIZE {
        anyhow::bail!(
            "payload length {} exceeds {} bytes",
            config.len,
            flashrpc::MESSAGE_BUF_SIZE
        );
    }

    let mut client = Client::new(config.rpc_config())?;
    client.connect(&config.host, config.port)?;

    for i in 0..config.count {
        let payload = random_payload(config.len);
        let response = client.call(&payload)?;
        info!(
            request = i,
            sent = %String::from_utf8_lossy(&payload),
            received = %String::from_utf8_lossy(response.payload()),
            "Response"
        );
    }

    if let Err(e) = client.disconnect() {
        warn!(error = %e, "Disconnect failed");
    }
    Ok(())
}
