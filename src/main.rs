//! Purpose: `querycache` CLI entry point for inspecting and maintaining cache backends.
//! Role: Binary crate root; parses args, resolves config, runs commands, emits JSON on stdout.
//! Invariants: Commands emit one JSON document on stdout per invocation.
//! Invariants: Errors are JSON on stderr when stderr is not a terminal, human text otherwise.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Diagnostics go through `tracing` on stderr; stdout carries only results.
#![allow(clippy::result_large_err)]
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;

use querycache::api::{BackendKind, Config, Error, ErrorKind, to_exit_code};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse_from(std::env::args_os().collect::<Vec<OsString>>()) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Try `querycache --help`."));
            }
        },
    };

    let config = resolve_config(&cli.global)?;
    command_dispatch::dispatch_command(cli.command, config)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

#[derive(Parser)]
#[command(
    name = "querycache",
    version,
    about = "Inspect and maintain query-result cache backends",
    long_about = None,
    after_help = r#"EXAMPLES
  $ querycache fingerprint 'SELECT 1' --prefix t_
  $ querycache --dir /var/cache/queries get 'SELECT * FROM users'
  $ querycache --backend memcached --host 10.0.0.4 delete --key 3f2a... --timeout 30
  $ querycache sanitize --charset utf8 --hex 636166e282

CONFIG
  --config reads a JSON file; flags override its values.
  RUST_LOG controls diagnostics on stderr (default: warn)."#,
    arg_required_else_help = true
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Default)]
struct GlobalArgs {
    #[arg(long, global = true, value_hint = ValueHint::FilePath, help = "JSON config file")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Cache backend: disk|memcached|redis")]
    backend: Option<String>,
    #[arg(long, global = true, value_hint = ValueHint::DirPath, help = "Disk cache directory")]
    dir: Option<PathBuf>,
    #[arg(long, global = true, help = "Remote cache host (or redis:// URL)")]
    host: Option<String>,
    #[arg(long, global = true, help = "Remote cache port")]
    port: Option<u16>,
    #[arg(long, global = true, help = "Cache key prefix")]
    prefix: Option<String>,
    #[arg(long, global = true, help = "Report cache failures as warnings")]
    show_errors: bool,
}

#[derive(Args, Debug)]
struct KeyArgs {
    #[arg(help = "Query text; the key is derived with the configured prefix")]
    query: Option<String>,
    #[arg(long, conflicts_with = "query", help = "Use a precomputed cache key")]
    key: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Print the cache key for a query")]
    Fingerprint {
        #[arg(help = "Query text, used verbatim")]
        query: String,
    },
    #[command(about = "Show the cached result for a query or key")]
    Get {
        #[command(flatten)]
        target: KeyArgs,
    },
    #[command(about = "Delete a cached result, now or after a delay")]
    Delete {
        #[command(flatten)]
        target: KeyArgs,
        #[arg(long, default_value_t = 0, help = "Seconds until the entry expires; 0 deletes now")]
        timeout: u64,
    },
    #[command(about = "Remove every entry from the backend")]
    Flush,
    #[command(about = "Strip bytes that are malformed for a charset")]
    Sanitize {
        #[arg(help = "Value to check")]
        value: String,
        #[arg(long, help = "Target charset, e.g. utf8 or utf8mb4")]
        charset: String,
        #[arg(long, help = "Treat VALUE as hex-encoded bytes")]
        hex: bool,
    },
    #[command(about = "Generate shell completions")]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn resolve_config(global: &GlobalArgs) -> Result<Config, Error> {
    let mut config = match &global.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };
    if let Some(backend) = &global.backend {
        config.backend = BackendKind::parse(backend).ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("unknown backend {backend:?}"))
                .with_hint("Use one of: disk, memcached, redis.")
        })?;
    }
    if let Some(dir) = &global.dir {
        config.disk.dir = dir.clone();
    }
    if let Some(host) = &global.host {
        config.remote.host = host.clone();
    }
    if let Some(port) = global.port {
        config.remote.port = Some(port);
    }
    if let Some(prefix) = &global.prefix {
        config.cache_prefix = prefix.clone();
    }
    config.show_errors |= global.show_errors;
    Ok(config)
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error",
        ErrorKind::Usage => "usage error",
        ErrorKind::NotFound => "not found",
        ErrorKind::Corrupt => "corrupt data",
        ErrorKind::Io => "i/o error",
        ErrorKind::Unavailable => "backend unavailable",
        ErrorKind::Sanitize => "value could not be sanitized",
        ErrorKind::Driver => "database error",
        ErrorKind::ConnectionLost => "database connection lost",
    }
    .to_string()
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(key) = err.key() {
        inner.insert("key".to_string(), json!(key));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(key) = err.key() {
        lines.push(format!("key: {key}"));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn parse_hex(input: &str) -> Result<Vec<u8>, Error> {
    let digits: Vec<u8> = input
        .bytes()
        .filter(|byte| !byte.is_ascii_whitespace())
        .collect();
    if digits.len() % 2 != 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("hex input must have an even number of digits"));
    }
    digits
        .chunks(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair).ok();
            text.and_then(|text| u8::from_str_radix(text, 16).ok())
                .ok_or_else(|| {
                    Error::new(ErrorKind::Usage)
                        .with_message(format!("invalid hex digits {:?}", String::from_utf8_lossy(pair)))
                })
        })
        .collect()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}
