//! Thin CLI layer over tempdylib-core: compute, write, and load library images.
//! Crash-proof: panic caught and reported; all errors return Result.

use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::Colorize;
use std::env;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempdylib_core::{Config, LazyLibrary, RetryPolicy};

// ---- UI helpers (no-op when stdout isn't a TTY) ----

fn use_color() -> bool {
    std::io::stdout().is_terminal() && env::var("NO_COLOR").unwrap_or_default().is_empty()
}

fn success(msg: &str) {
    if use_color() {
        println!("{}", msg.green());
    } else {
        println!("{}", msg);
    }
}

fn error(msg: &str) {
    if use_color() {
        eprintln!("{}", msg.red());
    } else {
        eprintln!("{}", msg);
    }
}

fn dim(msg: &str) {
    if use_color() {
        println!("{}", msg.dimmed());
    } else {
        println!("{}", msg);
    }
}

fn image_args(cmd: Command) -> Command {
    cmd.arg(Arg::new("image").required(true).help("Library image file"))
        .arg(
            Arg::new("name")
                .long("name")
                .help("Logical name used as the file name suffix (default: image file name)"),
        )
        .arg(
            Arg::new("dir")
                .long("dir")
                .help("Directory to write into (default: TEMPDYLIB_DIR or the temp dir)"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .help("JSON config file with temp_dir and retry settings"),
        )
}

/// Config file, then env, then flags.
fn resolve_config(m: &ArgMatches) -> Config {
    let mut cfg = match m.get_one::<String>("config") {
        Some(path) => tempdylib_core::load_config(Path::new(path)),
        None => Config::from_env(),
    };
    if let Some(dir) = m.get_one::<String>("dir") {
        cfg = cfg.with_temp_dir(dir);
    }
    if let Ok(Some(retries)) = m.try_get_one::<u32>("retries") {
        cfg.retry = RetryPolicy::new(*retries, cfg.retry.delay);
    }
    if let Ok(Some(ms)) = m.try_get_one::<u64>("delay-ms") {
        cfg.retry = RetryPolicy::new(cfg.retry.retries, Duration::from_millis(*ms));
    }
    cfg
}

fn read_image(m: &ArgMatches) -> Result<(Vec<u8>, String), String> {
    let image = m
        .get_one::<String>("image")
        .ok_or_else(|| "missing image path".to_string())?;
    let path = PathBuf::from(image);
    let bytes = fs::read(&path).map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    let name = match m.get_one::<String>("name") {
        Some(n) => n.clone(),
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| format!("Cannot derive a name from {}; pass --name", path.display()))?,
    };
    if !tempdylib_core::cas::is_valid_logical_name(&name) {
        return Err(format!("Logical name must be a plain file name: {}", name));
    }
    Ok((bytes, name))
}

fn run() -> Result<(), String> {
    let matches = Command::new("tempdylib")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Write embedded library images to content-addressed temp files and load them")
        .after_help(
            "Examples:\n  tempdylib path plugin.so\n  tempdylib extract plugin.so --retries 5\n  tempdylib load plugin.so --symbol plugin_init --json",
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(image_args(
            Command::new("path").about("Print the content-addressed path for an image"),
        ))
        .subcommand(
            image_args(Command::new("extract").about("Write and verify the image, print its path"))
                .arg(
                    Arg::new("retries")
                        .long("retries")
                        .value_parser(clap::value_parser!(u32))
                        .help("Extra verify/rewrite rounds (default 60)"),
                )
                .arg(
                    Arg::new("delay-ms")
                        .long("delay-ms")
                        .value_parser(clap::value_parser!(u64))
                        .help("Pause between rounds in milliseconds (default 1000)"),
                ),
        )
        .subcommand(
            image_args(Command::new("load").about("Write, load, and resolve symbols"))
                .arg(
                    Arg::new("symbol")
                        .long("symbol")
                        .short('s')
                        .action(ArgAction::Append)
                        .help("Export to resolve; may be repeated"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output machine-readable JSON"),
                ),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("path", m)) => {
            let (bytes, name) = read_image(m)?;
            let cfg = resolve_config(m);
            println!("{}", tempdylib_core::target_path(&cfg.temp_dir(), &bytes, &name).display());
        }
        Some(("extract", m)) => {
            let (bytes, name) = read_image(m)?;
            let cfg = resolve_config(m);
            let path = tempdylib_core::target_path(&cfg.temp_dir(), &bytes, &name);
            let done = tempdylib_core::safe_write_file(&path, &bytes, &cfg.retry)
                .map_err(|e| e.to_string())?;
            println!("{}", path.display());
            dim(&format!(
                "{} round(s), {} write(s)",
                done.attempts, done.writes
            ));
        }
        Some(("load", m)) => {
            let (bytes, name) = read_image(m)?;
            let cfg = resolve_config(m);
            let symbols: Vec<String> = m
                .get_many::<String>("symbol")
                .map(|it| it.cloned().collect())
                .unwrap_or_default();
            let lib = Arc::new(LazyLibrary::new(bytes, name).with_config(cfg));
            let handle = lib.raw_handle()?;
            let path = lib
                .file_name()
                .map(|p| p.display().to_string())
                .unwrap_or_default();

            let mut resolved = Vec::new();
            for symbol in &symbols {
                let addr = lib.new_routine(symbol.as_str()).address()?;
                resolved.push((symbol.clone(), addr));
            }

            if m.get_flag("json") {
                let symbols: serde_json::Map<String, serde_json::Value> = resolved
                    .iter()
                    .map(|(s, a)| (s.clone(), serde_json::Value::String(a.to_string())))
                    .collect();
                let out = serde_json::json!({
                    "path": path,
                    "handle": format!("{:#x}", handle),
                    "symbols": symbols,
                });
                println!(
                    "{}",
                    serde_json::to_string_pretty(&out).unwrap_or_else(|_| "{}".to_string())
                );
            } else {
                success(&format!("Loaded {} (handle {:#x})", path, handle));
                for (symbol, addr) in resolved {
                    println!("  {} = {}", symbol, addr);
                }
            }
        }
        _ => return Err("Unknown command; see tempdylib --help".to_string()),
    }
    Ok(())
}

fn main() {
    if !use_color() {
        colored::control::set_override(false);
    }

    let code = match std::panic::catch_unwind(run) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error(&e);
            1
        }
        Err(_) => {
            error("An unexpected error occurred. Please report this issue.");
            1
        }
    };
    std::process::exit(code);
}
