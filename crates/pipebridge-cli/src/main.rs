//! pipebridge: command-line entrypoint.

mod args;

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use pipebridge::{
    Marker, RelayOptions, Server, ServerConfig, WorkerAccess, WorkerConfig, extract_rows, query,
    shutdown_signal, supervisor,
};

use crate::args::{Cli, Commands, QueryArgs, ServeArgs};

/// Initialize tracing with PIPEBRIDGE_LOG and LOG_FORMAT support.
///
/// Logs go to stderr so that `--echo` output and query results own stdout.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("PIPEBRIDGE_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "pipebridge={level},pipebridge_cli={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Query(args) => run_query(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    info!("pipebridge {}", env!("CARGO_PKG_VERSION"));

    let marker = Marker::new(args.marker.clone())
        .context("invalid --marker")?
        .with_anchor(args.anchor());

    let server_config = ServerConfig {
        host: args.host.clone(),
        port: args.port,
        mode: args.accept_mode(),
    };
    // Bind before launching the worker so a taken port fails fast.
    let server = Server::bind(&server_config).await?;

    let (program, worker_args) = args.worker_command();
    let mut worker_config = WorkerConfig::new(program, marker.clone())
        .with_args(worker_args)
        .with_ready_timeout(args.ready_timeout)
        .with_read_buffer_size(args.buffer_size);
    if let Some(dir) = &args.workdir {
        worker_config = worker_config.with_working_dir(dir);
    }

    let worker = supervisor::start(&worker_config)
        .await
        .context("worker startup failed")?;
    let access = Arc::new(WorkerAccess::new(worker));

    let mut options = RelayOptions::new(marker)
        .with_client_idle_timeout(args.idle_timeout)
        .with_response_timeout(args.response_timeout)
        .with_echo(args.echo);
    options.client_buffer_size = args.buffer_size;

    let result = server
        .serve(Arc::clone(&access), options, shutdown_signal())
        .await;

    match Arc::try_unwrap(access) {
        Ok(access) => supervisor::shutdown(access.into_inner(), args.shutdown_grace).await,
        Err(_) => warn!("Worker still referenced at shutdown, relying on kill-on-drop"),
    }

    result.context("bridge stopped")?;
    info!("Shutdown complete");
    Ok(())
}

async fn run_query(args: QueryArgs) -> anyhow::Result<()> {
    let marker = Marker::new(args.marker).context("invalid --marker")?;
    let response = query(args.addr.as_str(), &args.statement, &marker, args.timeout)
        .await
        .with_context(|| format!("query against {} failed", args.addr))?;

    let mut stdout = std::io::stdout().lock();
    if args.rows {
        for row in extract_rows(&String::from_utf8_lossy(&response)) {
            writeln!(stdout, "{row}")?;
        }
    } else {
        stdout.write_all(&response)?;
        writeln!(stdout)?;
    }
    Ok(())
}
