//! Manual ops/testing front-end for a running `flux-ippc` server: connects
//! to a Unix socket and issues exactly one call, printing the JSON result
//! (or the remote error) to stdout/stderr.

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use flux_ippc::{client::Client, error::ClientError};
use serde_json::{Map, Value};
use tracing::{error, info};

/// Call a dotted-name procedure on a `flux-ippc` server and print the result.
#[derive(Parser)]
#[command(name = "flux-ctl", version, about)]
struct Cli {
    /// Path to the server's Unix domain socket.
    #[arg(long, short)]
    socket: PathBuf,

    /// Dotted procedure name, e.g. `math.add` or bare `echo` for a root service.
    name: String,

    /// Positional argument, as a JSON literal. Repeatable, in order.
    #[arg(long = "arg", value_parser = parse_json_value)]
    args: Vec<Value>,

    /// Keyword argument as `name=value`, value a JSON literal. Repeatable.
    #[arg(long = "kwarg", value_parser = parse_kwarg)]
    kwargs: Vec<(String, Value)>,
}

fn parse_json_value(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON argument `{raw}`: {e}"))
}

fn parse_kwarg(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected `name=value`, got `{raw}`"))?;
    Ok((key.to_string(), parse_json_value(value)?))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let client = match Client::connect(&cli.socket) {
        Ok(client) => client,
        Err(e) => {
            error!(socket = %cli.socket.display(), error = %e, "could not connect");
            eprintln!("flux-ctl: could not connect to {}: {e}", cli.socket.display());
            return ExitCode::FAILURE;
        }
    };
    info!(socket = %cli.socket.display(), name = %cli.name, "connected");

    let kwargs: Map<String, Value> = cli.kwargs.into_iter().collect();
    match client.call(&cli.name, cli.args, kwargs) {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()));
            ExitCode::SUCCESS
        }
        Err(ClientError::Remote(e)) => {
            error!(kind = %e.kind, message = %e.message, "call failed");
            eprintln!("flux-ctl: {} ({})", e.message, e.kind);
            ExitCode::FAILURE
        }
        Err(ClientError::Request(e)) => {
            error!(error = %e, "request failed");
            eprintln!("flux-ctl: request failed: {e}");
            ExitCode::FAILURE
        }
    }
}
