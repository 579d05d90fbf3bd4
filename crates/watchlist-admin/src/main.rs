//! watchlist-admin: inspect or reset the bot's watchlist collection.
//!
//! Usage:
//!   cargo run -p watchlist-admin -- list
//!   cargo run -p watchlist-admin -- count
//!   cargo run -p watchlist-admin -- clear --yes
//!   cargo run -p watchlist-admin -- watch 2330 台積電
//!   cargo run -p watchlist-admin -- --db sqlite:bot.db --namespace staging repl
//!
//! Connection settings come from `WATCHLIST_*` variables (see `.env`);
//! flags override them.

use anyhow::{bail, Context, Result};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use watchlist_store::{ListMode, Metadata, StoreConfig, WatchOutcome, WatchlistStore};

#[derive(Debug, Clone, PartialEq)]
enum Command {
    List,
    Count,
    Clear { confirmed: bool },
    Watch { symbol: String, name: Option<String> },
    Unwatch { symbol: String },
    Repl,
    Help,
    /// No command given at all
    Missing,
}

#[derive(Debug, Default)]
struct Cli {
    db: Option<String>,
    namespace: Option<String>,
    collection: Option<String>,
    strict: bool,
    json: bool,
    words: Vec<String>,
}

fn parse_args(args: &[String]) -> Result<Cli> {
    let mut cli = Cli::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--db" | "--namespace" | "--collection" => {
                let value = iter
                    .next()
                    .with_context(|| format!("{} needs a value", arg))?
                    .clone();
                match arg.as_str() {
                    "--db" => cli.db = Some(value),
                    "--namespace" => cli.namespace = Some(value),
                    _ => cli.collection = Some(value),
                }
            }
            "--strict" => cli.strict = true,
            "--json" => cli.json = true,
            _ => cli.words.push(arg.clone()),
        }
    }

    Ok(cli)
}

fn parse_command(words: &[String]) -> Result<Command> {
    let confirmed = words.iter().any(|w| w == "--yes" || w == "-y");
    let positional: Vec<&str> = words
        .iter()
        .map(String::as_str)
        .filter(|w| !w.starts_with('-'))
        .collect();

    let command = match positional.as_slice() {
        [] => Command::Missing,
        ["help"] => Command::Help,
        ["list"] => Command::List,
        ["count"] => Command::Count,
        ["clear"] => Command::Clear { confirmed },
        ["watch", symbol] => Command::Watch {
            symbol: symbol.to_string(),
            name: None,
        },
        ["watch", symbol, name @ ..] => Command::Watch {
            symbol: symbol.to_string(),
            name: Some(name.join(" ")),
        },
        ["unwatch", symbol] => Command::Unwatch {
            symbol: symbol.to_string(),
        },
        ["repl"] => Command::Repl,
        other => bail!("unknown command: {}", other.join(" ")),
    };
    Ok(command)
}

fn print_usage(out: &mut impl Write) -> Result<()> {
    writeln!(out, "Usage: watchlist-admin [options] <command>")?;
    writeln!(out)?;
    writeln!(out, "Commands:")?;
    writeln!(out, "  list                  Print every watched symbol")?;
    writeln!(out, "  count                 Print the number of watched symbols")?;
    writeln!(out, "  clear --yes           Delete every watched symbol")?;
    writeln!(out, "  watch SYMBOL [NAME]   Start watching a symbol")?;
    writeln!(out, "  unwatch SYMBOL        Stop watching a symbol")?;
    writeln!(out, "  repl                  Interactive prompt")?;
    writeln!(out)?;
    writeln!(out, "Options:")?;
    writeln!(out, "  --db URL              sqlite:<path>, memory: or mongodb://... (default: $WATCHLIST_DATABASE_URL)")?;
    writeln!(out, "  --namespace NAME      Logical database (default: linebot)")?;
    writeln!(out, "  --collection NAME     Collection (default: watchlist)")?;
    writeln!(out, "  --strict              Fail the listing on malformed documents")?;
    writeln!(out, "  --json                Print JSON instead of a table")?;
    Ok(())
}

async fn run(
    store: &WatchlistStore,
    command: &Command,
    json: bool,
    out: &mut impl Write,
) -> Result<()> {
    match command {
        Command::List => {
            let outcome = store.list().collect().await?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&outcome.items)?)?;
            } else if outcome.is_empty() {
                writeln!(out, "(watchlist is empty)")?;
            } else {
                writeln!(out, "{:<10} {:<20} {}", "SYMBOL", "ADDED", "METADATA")?;
                for item in &outcome.items {
                    let metadata = item
                        .metadata
                        .iter()
                        .map(|(k, v)| format!("{}={}", k, v))
                        .collect::<Vec<_>>()
                        .join(", ");
                    writeln!(
                        out,
                        "{:<10} {:<20} {}",
                        item.symbol,
                        item.added_at.format("%Y-%m-%d %H:%M:%S"),
                        metadata
                    )?;
                }
            }
            if outcome.skipped > 0 {
                tracing::warn!("{} malformed documents were skipped", outcome.skipped);
            }
        }
        Command::Count => {
            writeln!(out, "{}", store.count().await?)?;
        }
        Command::Clear { confirmed } => {
            if !confirmed {
                bail!("refusing to clear {} without --yes", store.collection());
            }
            let removed = store.clear_all().await?;
            writeln!(out, "Removed {} items", removed)?;
        }
        Command::Watch { symbol, name } => {
            let mut metadata = Metadata::new();
            if let Some(name) = name {
                metadata.insert("name".to_string(), name.as_str().into());
            }
            match store.watch(symbol, metadata).await? {
                WatchOutcome::Added(item) => writeln!(out, "Now watching {}", item.symbol)?,
                WatchOutcome::AlreadyWatched => {
                    writeln!(out, "{} is already on the watchlist", symbol.trim())?
                }
            }
        }
        Command::Unwatch { symbol } => {
            if store.unwatch(symbol).await? {
                writeln!(out, "Stopped watching {}", symbol.trim())?;
            } else {
                writeln!(out, "{} is not on the watchlist", symbol.trim())?;
            }
        }
        Command::Help => print_usage(out)?,
        Command::Missing => bail!("no command given, try 'help'"),
        Command::Repl => bail!("already in the REPL"),
    }
    Ok(())
}

async fn repl(store: &WatchlistStore, json: bool) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = std::io::stdout();

    loop {
        write!(stdout, "{}> ", store.collection())?;
        stdout.flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let words: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        if matches!(words.first().map(String::as_str), Some("exit" | "quit")) {
            break;
        }
        if words.is_empty() {
            continue;
        }

        // A failed command leaves the store usable, so report and keep going
        let result = match parse_command(&words) {
            Ok(command) => run(store, &command, json, &mut stdout).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            writeln!(stdout, "error: {:#}", e)?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "watchlist_admin=info,watchlist_store=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_args(&args)?;
    let command = parse_command(&cli.words)?;

    match command {
        Command::Help => return print_usage(&mut std::io::stdout()),
        Command::Missing => {
            print_usage(&mut std::io::stderr())?;
            std::process::exit(1);
        }
        _ => {}
    }

    let mut config = StoreConfig::from_env()?;
    if let Some(db) = cli.db {
        config.database_url = db;
    }
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }
    if let Some(collection) = cli.collection {
        config.collection = collection;
    }
    if cli.strict {
        config.list_mode = ListMode::Strict;
    }

    tracing::info!(
        "watchlist-admin: db={}, collection={}.{}",
        config.database_url,
        config.namespace,
        config.collection
    );

    let store = config
        .open()
        .await
        .with_context(|| format!("could not open {}", config.database_url))?;

    let result = match command {
        Command::Repl => repl(&store, cli.json).await,
        command => run(&store, &command, cli.json, &mut std::io::stdout()).await,
    };

    store.close().await;
    result
}
