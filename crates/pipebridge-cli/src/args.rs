//! Command-line arguments.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use pipebridge::server::DEFAULT_PORT;
use pipebridge::worker::DEFAULT_READ_BUFFER;
use pipebridge::{AcceptMode, Anchor, DEFAULT_MARKER};

/// Default worker: the SimpleDB parser with its catalog.
pub const DEFAULT_WORKER: [&str; 5] = [
    "java",
    "-jar",
    "../dist/simpledb.jar",
    "parser",
    "../catalog.txt",
];

#[derive(Parser)]
#[command(name = "pipebridge")]
#[command(about = "Relay TCP clients to a single stdin/stdout worker process")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the worker and accept connections
    Serve(ServeArgs),
    /// Send one statement to a running bridge and print the response
    Query(QueryArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "PIPEBRIDGE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "PIPEBRIDGE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Token the worker prints when ready and after every response
    #[arg(long, env = "PIPEBRIDGE_MARKER", default_value = DEFAULT_MARKER)]
    pub marker: String,

    /// Only accept the marker at the start of a line
    #[arg(long)]
    pub line_start_marker: bool,

    /// Accept clients concurrently; worker rounds are still serialized
    #[arg(long)]
    pub concurrent: bool,

    /// Mirror all relayed bytes to stdout
    #[arg(long)]
    pub echo: bool,

    /// Seconds to wait for the worker's first marker (default: forever)
    #[arg(long, value_name = "SECS", value_parser = parse_secs)]
    pub ready_timeout: Option<Duration>,

    /// Seconds the worker may take per response (default: forever)
    #[arg(long, value_name = "SECS", value_parser = parse_secs)]
    pub response_timeout: Option<Duration>,

    /// Seconds a client may stay silent between requests (default: forever)
    #[arg(long, value_name = "SECS", value_parser = parse_secs)]
    pub idle_timeout: Option<Duration>,

    /// Seconds to wait for the worker to exit on shutdown before killing it
    #[arg(long, value_name = "SECS", value_parser = parse_secs, default_value = "5")]
    pub shutdown_grace: Duration,

    /// Bytes read per chunk from the worker and from clients
    #[arg(long, default_value_t = DEFAULT_READ_BUFFER)]
    pub buffer_size: usize,

    /// Working directory for the worker
    #[arg(long)]
    pub workdir: Option<PathBuf>,

    /// Worker command and arguments
    #[arg(last = true, value_name = "WORKER")]
    pub worker: Vec<OsString>,
}

impl ServeArgs {
    pub fn accept_mode(&self) -> AcceptMode {
        if self.concurrent {
            AcceptMode::Concurrent
        } else {
            AcceptMode::Sequential
        }
    }

    pub fn anchor(&self) -> Anchor {
        if self.line_start_marker {
            Anchor::LineStart
        } else {
            Anchor::Anywhere
        }
    }

    /// Program and arguments, falling back to the SimpleDB parser.
    pub fn worker_command(&self) -> (OsString, Vec<OsString>) {
        match self.worker.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => (
                DEFAULT_WORKER[0].into(),
                DEFAULT_WORKER[1..].iter().map(OsString::from).collect(),
            ),
        }
    }
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    /// Bridge address
    #[arg(long, env = "PIPEBRIDGE_ADDR", default_value = "127.0.0.1:51202")]
    pub addr: String,

    /// Token that ends the response
    #[arg(long, env = "PIPEBRIDGE_MARKER", default_value = DEFAULT_MARKER)]
    pub marker: String,

    /// Seconds to wait for the response (default: forever)
    #[arg(long, value_name = "SECS", value_parser = parse_secs)]
    pub timeout: Option<Duration>,

    /// Print only the result rows
    #[arg(long)]
    pub rows: bool,

    /// Statement to send
    pub statement: String,
}

fn parse_secs(raw: &str) -> Result<Duration, String> {
    let secs: f64 = raw
        .parse()
        .map_err(|e| format!("{raw:?} is not a number of seconds: {e}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("{raw:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    fn serve_args(argv: &[&str]) -> ServeArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Commands::Serve(args) => args,
            Commands::Query(_) => panic!("expected serve"),
        }
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_defaults_match_simpledb_deployment() {
        let args = serve_args(&["pipebridge", "serve"]);
        assert_eq!(args.port, 51202);
        assert_eq!(args.host, "0.0.0.0");
        assert_eq!(args.marker, "SimpleDB");
        assert_eq!(args.accept_mode(), AcceptMode::Sequential);
        assert_eq!(args.anchor(), Anchor::Anywhere);
        assert!(args.ready_timeout.is_none());
        assert_eq!(args.shutdown_grace, Duration::from_secs(5));

        let (program, worker_args) = args.worker_command();
        assert_eq!(program, "java");
        assert_eq!(
            worker_args,
            ["-jar", "../dist/simpledb.jar", "parser", "../catalog.txt"]
                .map(OsString::from)
                .to_vec()
        );
    }

    #[test]
    fn serve_takes_worker_after_double_dash() {
        let args = serve_args(&[
            "pipebridge",
            "serve",
            "--concurrent",
            "--line-start-marker",
            "--response-timeout",
            "2.5",
            "--",
            "python3",
            "-u",
            "worker.py",
        ]);
        assert_eq!(args.accept_mode(), AcceptMode::Concurrent);
        assert_eq!(args.anchor(), Anchor::LineStart);
        assert_eq!(args.response_timeout, Some(Duration::from_millis(2500)));

        let (program, worker_args) = args.worker_command();
        assert_eq!(program, "python3");
        assert_eq!(worker_args, vec![OsString::from("-u"), OsString::from("worker.py")]);
    }

    #[test]
    fn negative_timeout_rejected() {
        assert!(Cli::try_parse_from(["pipebridge", "serve", "--ready-timeout", "-1"]).is_err());
        assert!(Cli::try_parse_from(["pipebridge", "serve", "--ready-timeout", "soon"]).is_err());
    }

    #[test]
    fn query_parses_statement() {
        let cli = Cli::try_parse_from(["pipebridge", "query", "--rows", "select 1;"]).unwrap();
        let Commands::Query(args) = cli.command else {
            panic!("expected query");
        };
        assert!(args.rows);
        assert_eq!(args.statement, "select 1;");
        assert_eq!(args.addr, "127.0.0.1:51202");
    }
}
