//! offgrid-chat: ask an OffGrid LLM server one question.
//! Reads config, takes the question from the command line or stdin, and
//! streams the answer to stdout.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use clap::Parser;
use offgrid_client::{config, ChatRequest, Client, ClientConfig, Config};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "offgrid-chat", about = "Stream an answer from an OffGrid LLM server")]
struct Args {
    /// Config file (defaults to ~/.offgrid/config.yaml when present).
    #[arg(long, env = "OFFGRID_CONFIG")]
    config: Option<PathBuf>,
    /// Server address; overrides the config file.
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    system: Option<String>,
    /// Wait for the full reply instead of streaming it.
    #[arg(long)]
    no_stream: bool,
    /// Question; read from stdin when omitted.
    question: Option<String>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {message}");
    process::exit(1);
}

fn load_config(explicit: Option<PathBuf>) -> Config {
    if let Some(path) = explicit {
        return config::load(&path).unwrap_or_else(|e| {
            fail(format_args!("failed to load config from {}: {e}", path.display()))
        });
    }
    match config::default_config_path() {
        Some(path) if path.exists() => config::load(&path).unwrap_or_else(|e| {
            fail(format_args!("failed to load config from {}: {e}", path.display()))
        }),
        _ => Config::default(),
    }
}

fn read_question(arg: Option<String>) -> String {
    let question = match arg {
        Some(q) => q,
        None => {
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line).unwrap_or(0);
            line
        }
    };
    question.trim().to_string()
}

fn main() {
    init_logging();
    let args = Args::parse();

    let cfg = load_config(args.config);
    let mut client_config = ClientConfig::from(&cfg);
    if let Some(host) = args.host.as_deref() {
        client_config.base_url = ClientConfig::new(host).base_url;
    }

    let question = read_question(args.question);
    if question.is_empty() {
        fail("no question provided on stdin");
    }

    let mut request = ChatRequest::new(question);
    if let Some(model) = args.model.or_else(|| cfg.chat.model.clone()) {
        request = request.model(model);
    }
    if let Some(system) = args.system.or_else(|| cfg.chat.system.clone()) {
        request = request.system(system);
    }

    let client = Client::new(client_config).unwrap_or_else(|e| fail(e));
    let stdout = io::stdout();
    let mut out = stdout.lock();

    if args.no_stream {
        let answer = client.chat(request).unwrap_or_else(|e| fail(e));
        let _ = writeln!(out, "{answer}");
        return;
    }

    let stream = client.chat_stream(request).unwrap_or_else(|e| fail(e));
    for fragment in stream {
        match fragment {
            Ok(text) => {
                let _ = write!(out, "{text}");
                let _ = out.flush();
            }
            Err(e) => {
                let _ = writeln!(out);
                fail(e);
            }
        }
    }
    let _ = writeln!(out);
}
