use clap::Parser;
use log::{error, info};
use relay_server::supervisor::{self, spawn_supervised, Shutdown, ShutdownHandle};
use relay_server::{console, Admin, Registry, RelayServer, ServerConfig};
use relay_shared::DEFAULT_PORT;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Main-method of the application.
/// Parses command-line arguments, restores the counters, then runs the
/// listener, maintenance loops and console until the first shutdown request.
#[tokio::main]
async fn main() -> ExitCode {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "0.0.0.0")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// File the server counters are persisted to
        #[clap(short, long, default_value = "stats.json")]
        stats_file: PathBuf,
        /// Start in quiet mode (no per-connection logging)
        #[clap(short, long)]
        quiet: bool,
        /// Do not read operator commands from stdin
        #[clap(long)]
        no_console: bool,
        /// Seconds without activity before a room is evicted
        #[clap(long, default_value = "300")]
        inactivity_timeout_secs: u64,
        /// Seconds a disconnected client stays in its room
        #[clap(long, default_value = "300")]
        session_grace_secs: u64,
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        stats_path: args.stats_file,
        inactivity_timeout: Duration::from_secs(args.inactivity_timeout_secs),
        session_grace: Duration::from_secs(args.session_grace_secs),
        quiet: args.quiet,
        ..ServerConfig::default()
    };
    let stats_path = config.stats_path.clone();

    let registry = Arc::new(Registry::new(&config));
    registry.load_snapshot(&stats_path).await;

    let server = match RelayServer::bind(config, Arc::clone(&registry)).await {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(1);
        }
    };

    let (shutdown, mut reasons) = supervisor::channel();
    let mut tasks = server.spawn_maintenance(&shutdown);
    tasks.push(spawn_supervised("listener", shutdown.clone(), server.run()));

    if !args.no_console {
        let admin = Admin::new(Arc::clone(&registry), shutdown.clone());
        tasks.push(tokio::spawn(console::run(admin)).abort_handle());
    }
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let reason = reasons.recv().await.unwrap_or(Shutdown::Signal);
    match &reason {
        Shutdown::Fatal(cause) => error!("Shutting down after a fatal error: {}", cause),
        other => info!("Shutting down ({:?})", other),
    }

    registry.persist_snapshot(&stats_path).await;
    for task in tasks {
        task.abort();
    }

    ExitCode::from(reason.exit_code())
}

/// Turns Ctrl+C (and SIGTERM on unix) into a graceful shutdown.
async fn wait_for_signal(shutdown: ShutdownHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
                    _ = terminate.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                info!("Received Ctrl+C");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("Received Ctrl+C");
    }

    shutdown.trigger(Shutdown::Signal);
}
