//! Purpose: Hold top-level CLI command dispatch for `querycache`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: A cache miss is reported as `NotFound`, never as an empty success.

use super::*;

use querycache::api::{
    CacheEntry, Charset, Clock, fingerprint, open_store, sanitize_local, system_clock,
};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub(super) fn dispatch_command(command: Command, config: Config) -> Result<RunOutcome, Error> {
    let clock = system_clock();
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "querycache", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Fingerprint { query } => {
            let key = fingerprint(&config.cache_prefix, &query);
            emit_json(json!({
                "key": key.as_str(),
                "prefix": config.cache_prefix,
            }));
            Ok(RunOutcome::ok())
        }
        Command::Get { target } => {
            let key = resolve_key(&config, target)?;
            let mut store = open_store(&config, clock.clone());
            let Some(entry) = store.get(&key) else {
                return Err(Error::new(ErrorKind::NotFound)
                    .with_message("no live cache entry")
                    .with_key(key)
                    .with_hint("The entry may be missing, expired, or unreadable."));
            };
            emit_json(entry_json(&key, config.backend, &entry, clock.as_ref())?);
            Ok(RunOutcome::ok())
        }
        Command::Delete { target, timeout } => {
            let key = resolve_key(&config, target)?;
            let mut store = open_store(&config, clock);
            let deleted = store.delete(&key, timeout);
            emit_json(json!({
                "key": key,
                "backend": config.backend.as_str(),
                "deleted": deleted,
                "timeout": timeout,
            }));
            Ok(RunOutcome::ok())
        }
        Command::Flush => {
            let mut store = open_store(&config, clock);
            if !store.flush() {
                return Err(Error::new(ErrorKind::Unavailable)
                    .with_message(format!("failed to flush {} cache", config.backend))
                    .with_hint("Rerun with --show-errors or RUST_LOG=debug for details."));
            }
            emit_json(json!({ "backend": config.backend.as_str(), "flushed": true }));
            Ok(RunOutcome::ok())
        }
        Command::Sanitize {
            value,
            charset,
            hex,
        } => {
            let input = if hex {
                parse_hex(&value)?
            } else {
                value.into_bytes()
            };
            let charset = Charset::parse(&charset);
            let output = sanitize_local(&input, &charset).ok_or_else(|| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("charset {charset} has no local validator"))
                    .with_hint("Local validation covers utf8, utf8mb4, latin1 and binary.")
            })?;
            emit_json(json!({
                "charset": charset.as_str(),
                "changed": output.as_slice() != input.as_slice(),
                "ascii": input.is_ascii(),
                "value": output.to_string(),
                "hex": to_hex(&output),
            }));
            Ok(RunOutcome::ok())
        }
    }
}

fn resolve_key(config: &Config, target: KeyArgs) -> Result<String, Error> {
    match (target.query, target.key) {
        (_, Some(key)) => Ok(key),
        (Some(query), None) => Ok(fingerprint(&config.cache_prefix, &query).into_string()),
        (None, None) => Err(Error::new(ErrorKind::Usage)
            .with_message("a query or --key is required")
            .with_hint("Pass the query text, or --key <fingerprint>.")),
    }
}

fn entry_json(
    key: &str,
    backend: BackendKind,
    entry: &CacheEntry,
    clock: &dyn Clock,
) -> Result<Value, Error> {
    let mut value = serde_json::to_value(entry).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode cache entry")
            .with_source(err)
    })?;
    if let Value::Object(map) = &mut value {
        map.insert("key".to_string(), json!(key));
        map.insert("backend".to_string(), json!(backend.as_str()));
        map.insert(
            "ttlRemaining".to_string(),
            json!(entry.remaining_ttl(clock.now())),
        );
        if let Some(stamp) = format_unix(entry.expires_at) {
            map.insert("expiresAtRfc3339".to_string(), json!(stamp));
        }
    }
    Ok(value)
}

fn format_unix(secs: f64) -> Option<String> {
    let nanos = (secs * 1_000_000_000.0) as i128;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()?
        .format(&Rfc3339)
        .ok()
}
