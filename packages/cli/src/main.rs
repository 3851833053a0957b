use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use filewire_client::{ClientConfig, CompletionEvent, Handlers, ProgressEvent, ResourceClient, UserToken};
use filewire_core::{Error, Method, Result, Timeout};

/// filewire - move bytes to and from resources
#[derive(Parser, Debug)]
#[command(name = "filewire")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (default: <config dir>/filewire/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Per-request timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a resource to a file, or to stdout
    Get {
        address: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Upload a file to a resource
    Put {
        address: String,
        #[arg(short, long)]
        input: PathBuf,
        /// Method token (default: POST)
        #[arg(short, long)]
        method: Option<Method>,
    },
    /// Print a resource as text
    Cat { address: String },
}

fn main() {
    let filter = EnvFilter::try_from_env("FILEWIRE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(ms) = args.timeout_ms {
        config.timeout = Timeout::Millis(ms);
    }
    let client = ResourceClient::new(config)?;

    match args.command {
        Command::Get { address, output } => get(&client, &address, output),
        Command::Put {
            address,
            input,
            method,
        } => put(&client, &address, &input, method),
        Command::Cat { address } => {
            let text = client.download_string(&address)?;
            print!("{}", text);
            io::stdout()
                .flush()
                .map_err(|e| Error::transport("write stdout", e))
        }
    }
}

fn load_config(explicit: Option<&Path>) -> Result<ClientConfig> {
    if let Some(path) = explicit {
        return ClientConfig::from_path(path);
    }
    match dirs::config_dir().map(|dir| dir.join("filewire").join("config.json")) {
        Some(path) if path.exists() => {
            tracing::debug!(path = %path.display(), "loading config");
            ClientConfig::from_path(&path)
        }
        _ => Ok(ClientConfig::default()),
    }
}

fn print_progress(event: &ProgressEvent) {
    match event.units_total {
        Some(total) => eprint!("\r{:>3}% {}/{} bytes", event.percentage, event.units_done, total),
        None => eprint!("\r{} bytes", event.units_done),
    }
}

/// Block until the completion arrives and turn it back into a `Result`.
fn finish<R>(rx: mpsc::Receiver<CompletionEvent<R>>) -> Result<R> {
    let event = rx
        .recv()
        .map_err(|_| Error::invalid_state("operation ended without completing"))?;
    eprintln!();
    if event.cancelled {
        return Err(Error::Cancelled);
    }
    match (event.result, event.error) {
        (Some(result), _) => Ok(result),
        (None, Some(error)) => Err(error),
        (None, None) => Err(Error::invalid_state("operation completed without a result")),
    }
}

fn get(client: &ResourceClient, address: &str, output: Option<PathBuf>) -> Result<()> {
    match output {
        Some(path) => {
            let (tx, rx) = mpsc::channel();
            client.download_file_async(
                address,
                &path,
                UserToken::none(),
                Handlers::new()
                    .on_progress(print_progress)
                    .on_complete(move |event| {
                        let _ = tx.send(event);
                    }),
            )?;
            let written = finish(rx)?;
            eprintln!("{} bytes written to {}", written, path.display());
            Ok(())
        }
        None => {
            let (tx, rx) = mpsc::channel();
            client.download_data_async(
                address,
                UserToken::none(),
                Handlers::new()
                    .on_progress(print_progress)
                    .on_complete(move |event| {
                        let _ = tx.send(event);
                    }),
            )?;
            let body = finish(rx)?;
            let mut stdout = io::stdout().lock();
            stdout
                .write_all(&body)
                .and_then(|()| stdout.flush())
                .map_err(|e| Error::transport("write stdout", e))
        }
    }
}

fn put(client: &ResourceClient, address: &str, input: &Path, method: Option<Method>) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    client.upload_file_async(
        address,
        method,
        input,
        UserToken::none(),
        Handlers::new()
            .on_progress(print_progress)
            .on_complete(move |event| {
                let _ = tx.send(event);
            }),
    )?;
    let echoed = finish(rx)?;
    eprintln!("uploaded {}; resource now holds {} bytes", input.display(), echoed.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_put_with_method() {
        let args = Args::try_parse_from([
            "filewire", "put", "out.bin", "-i", "in.bin", "-m", "put", "--timeout-ms", "250",
        ])
        .unwrap();
        assert_eq!(args.timeout_ms, Some(250));
        match args.command {
            Command::Put { address, input, method } => {
                assert_eq!(address, "out.bin");
                assert_eq!(input, PathBuf::from("in.bin"));
                assert_eq!(method, Some(Method::PUT));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_method() {
        assert!(Args::try_parse_from(["filewire", "put", "x", "-i", "y", "-m", "BREW"]).is_err());
    }

    #[test]
    fn explicit_config_must_exist() {
        let err = load_config(Some(Path::new("/nonexistent/filewire.json"))).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
