use clap::{Parser, Subcommand, ValueEnum};
use docstore::{Data, Filter, Store, StoreConfig};
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

mod editions;

/// docstore CLI: load and query a document store of edition records
#[derive(Parser)]
#[command(name = "docstore", version, about)]
struct Cli {
    /// YAML config file (table, database, compression)
    #[arg(long, conflicts_with_all = ["db", "table"])]
    config: Option<PathBuf>,

    /// SQLite database file
    #[arg(long)]
    db: Option<PathBuf>,

    /// Primary table name (with --db)
    #[arg(long, default_value = "editions")]
    table: String,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Load documents from a file with one JSON record per line
    Load {
        /// Input file
        file: PathBuf,
        /// Documents per transaction
        #[arg(long, default_value_t = 100)]
        chunk_size: usize,
    },

    /// Get a single document by key
    Get {
        /// Document key
        key: String,
    },

    /// Query a view
    Query {
        /// View name
        view: String,
        /// Column filters (e.g. --filter value=isbn:9780230013384, or a JSON array for membership)
        #[arg(long = "filter", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,
        /// Attach the full document to each row under `_doc`
        #[arg(long)]
        include_docs: bool,
    },

    /// Recompute every view from the stored documents
    Rebuild,

    /// Show document and view row counts
    Status,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(&cli)?;

    match cli.command {
        Command::Load { file, chunk_size } => {
            let loaded = load(&store, &file, chunk_size)?;
            print_output(
                &serde_json::json!({ "ok": true, "loaded": loaded }),
                &cli.format,
            )?;
        }

        Command::Get { key } => {
            let doc = store
                .get(&key)?
                .ok_or_else(|| format!("Document not found: {key}"))?;
            print_output(&doc.into_value(), &cli.format)?;
        }

        Command::Query {
            view,
            filters,
            include_docs,
        } => {
            let filters = parse_filters(&filters);
            let rows = store.query(&view, &filters, include_docs)?;
            let rows = Value::Array(rows.into_iter().map(Value::Object).collect());
            print_output(&rows, &cli.format)?;
        }

        Command::Rebuild => {
            store.rebuild_views()?;
            print_output(&serde_json::json!({ "ok": true, "rebuilt": store.view_names() }), &cli.format)?;
        }

        Command::Status => {
            print_output(&store.status()?, &cli.format)?;
        }
    }

    Ok(())
}

fn open_store(cli: &Cli) -> Result<Store, Box<dyn std::error::Error>> {
    let config = match (&cli.config, &cli.db) {
        (Some(path), _) => StoreConfig::from_path(path)?,
        (None, Some(db)) => StoreConfig::with_database(&cli.table, db),
        (None, None) => return Err("either --config or --db is required".into()),
    };
    log::info!(
        "Opening store '{}' at {}",
        config.table,
        config
            .database
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ":memory:".to_string())
    );
    Ok(Store::open(&config, editions::views())?)
}

/// A filter value that parses as JSON is used as such (arrays become
/// membership filters); anything else is a plain string.
fn parse_filters(pairs: &[(String, String)]) -> Vec<Filter> {
    pairs
        .iter()
        .map(|(column, raw)| {
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
            Filter::from_value(column, value)
        })
        .collect()
}

/// Load one JSON document per line, keyed by its `key` field, in chunks of
/// `chunk_size` documents per transaction. Returns the number loaded.
fn load(store: &Store, file: &Path, chunk_size: usize) -> Result<usize, Box<dyn std::error::Error>> {
    if chunk_size == 0 {
        return Err("--chunk-size must be at least 1".into());
    }
    let reader = BufReader::new(
        File::open(file).map_err(|e| format!("Failed to open '{}': {e}", file.display()))?,
    );

    let started = Instant::now();
    let mut total = 0;
    let mut chunk: Vec<(String, Data)> = Vec::with_capacity(chunk_size);

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let doc: Data = serde_json::from_str(&line)
            .map_err(|e| format!("line {}: invalid JSON record: {e}", index + 1))?;
        let key = doc
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("line {}: record has no string 'key' field", index + 1))?
            .to_string();
        chunk.push((key, doc));

        if chunk.len() >= chunk_size {
            total += write_chunk(store, &mut chunk, total)?;
        }
    }
    if !chunk.is_empty() {
        total += write_chunk(store, &mut chunk, total)?;
    }

    let elapsed = started.elapsed().as_secs_f64();
    log::info!(
        "Loaded {total} documents in {elapsed:.3}s ({:.1} docs/s)",
        total as f64 / elapsed.max(f64::EPSILON)
    );
    Ok(total)
}

fn write_chunk(
    store: &Store,
    chunk: &mut Vec<(String, Data)>,
    offset: usize,
) -> docstore::Result<usize> {
    let count = chunk.len();
    let started = Instant::now();
    store.put_many(chunk.drain(..))?;
    let elapsed = started.elapsed().as_secs_f64();
    log::info!(
        "{offset} {elapsed:.3}s {:.1} docs/s",
        count as f64 / elapsed.max(f64::EPSILON)
    );
    Ok(count)
}

fn print_output(value: &Value, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}
