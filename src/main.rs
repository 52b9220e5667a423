use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::lookup_host;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use uftp::config::{ClientConfig, RetryPolicy, ServerConfig};
use uftp::{Client, CommandRequest, Config, FileStore, Reply, Server, Verb};

/// Reliable file transfer over UDP.
#[derive(Parser, Debug)]
#[command(name = "uftp", version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the files of a directory
    Server(ServerArgs),
    /// Talk to a server, interactively or with --exec
    Client(ClientArgs),
}

#[derive(Args, Debug)]
struct RetryArgs {
    /// Initial wait for an answer, in milliseconds
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Re-sends before giving up
    #[arg(long)]
    retries: Option<u32>,
}

impl RetryArgs {
    fn apply(&self, retry: &mut RetryPolicy) {
        if let Some(timeout_ms) = self.timeout_ms {
            retry.timeout_ms = timeout_ms;
            retry.max_timeout_ms = retry.max_timeout_ms.max(timeout_ms);
        }
        if let Some(retries) = self.retries {
            retry.max_retries = retries;
        }
    }
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Address to listen on
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Directory to serve
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Transfers allowed at the same time
    #[arg(long)]
    max_sessions: Option<usize>,

    /// STUN server to ask for our public address, e.g. stun.l.google.com:19302
    #[arg(long, value_name = "HOST:PORT")]
    stun: Option<String>,

    #[command(flatten)]
    retry: RetryArgs,
}

impl ServerArgs {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        if let Some(max_sessions) = self.max_sessions {
            config.max_sessions = max_sessions;
        }
        if let Some(stun) = &self.stun {
            config.stun_server = Some(stun.clone());
        }
        self.retry.apply(&mut config.retry);
    }
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Server address, HOST:PORT
    server: String,

    /// Directory downloads are written to and uploads read from
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Run these commands instead of prompting, e.g. -e "get notes.txt"
    #[arg(short, long = "exec", value_name = "COMMAND")]
    exec: Vec<String>,

    #[command(flatten)]
    retry: RetryArgs,
}

impl ClientArgs {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        self.retry.apply(&mut config.retry);
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let mut server = Server::bind(config.clone())
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    let shutdown = server.shutdown_handle();

    tokio::select! {
        served = server.listen() => served.context("server stopped")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("interrupt received, terminating");
            shutdown.send();
        }
    }
    Ok(())
}

async fn run_client(args: &ClientArgs, config: ClientConfig) -> Result<()> {
    let server = lookup_host(args.server.as_str())
        .await
        .with_context(|| format!("failed to resolve {}", args.server))?
        .next()
        .with_context(|| format!("no address for {}", args.server))?;
    let store = FileStore::new(config.root);
    let mut client = Client::connect(server, store, config.retry)
        .await
        .context("failed to open client socket")?;

    if !args.exec.is_empty() {
        for line in &args.exec {
            let request: CommandRequest = line
                .parse()
                .with_context(|| format!("bad command {line:?}"))?;
            let reply = client
                .run(&request)
                .await
                .with_context(|| format!("{} failed", request.verb))?;
            print_reply(&reply);
        }
        return Ok(());
    }
    prompt(&mut client).await
}

async fn prompt(client: &mut Client) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("connected to {}; commands: get, put, delete, list, chat, exit", client.server());
    loop {
        print!("uftp> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }
        let request: CommandRequest = match line.parse() {
            Ok(request) => request,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        match client.run(&request).await {
            Ok(reply) => print_reply(&reply),
            Err(e) => {
                error!(verb = %request.verb, error = %e, "command failed");
                println!("{} failed: {e}", request.verb);
            }
        }
        if request.verb == Verb::Exit {
            return Ok(());
        }
    }
}

fn print_reply(reply: &Reply) {
    match reply {
        Reply::Transferred(report) => println!("{report}"),
        Reply::Deleted(status) => println!("{status:?}"),
        Reply::Listing(names) => {
            for name in names {
                println!("{name}");
            }
        }
        Reply::Sent => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config =
        Config::load_or_default(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    match &cli.command {
        Command::Server(args) => args.apply(&mut config.server),
        Command::Client(args) => args.apply(&mut config.client),
    }
    config.validate().context("invalid options")?;
    init_tracing(&config.log_level);

    match &cli.command {
        Command::Server(_) => run_server(config.server).await,
        Command::Client(args) => run_client(args, config.client).await,
    }
}
