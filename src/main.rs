//! SPDB CLI
//!
//! Command-line interface for SPDB databases:
//! - Put and erase chunks
//! - Run any query and print or save the results
//! - Inspect day headers and database time spans
//! - Hash short IDs into data types

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use spdb::config::{generate_default_config, Config};
use spdb::storage::*;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "spdb")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Symbolic Products Data Base: time-tagged chunk storage")]
#[command(long_about = "SPDB stores time-tagged binary chunks in one index + data file pair per UTC day.\nTimes are accepted as \"now\", Unix seconds or RFC 3339.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database directory (default: data_dir from the config)
    #[arg(short, long, global = true)]
    pub dir: Option<PathBuf>,

    /// Config file (default: SPDB_CONFIG or the standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Store a chunk read from a file or stdin
    Put {
        /// Valid time
        time: String,
        /// Expire time (default: the valid time)
        #[arg(short, long)]
        expire: Option<String>,
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        data_type: i32,
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        data_type2: i32,
        /// Free-form chunk tag
        #[arg(short, long)]
        tag: Option<String>,
        /// Put mode (over, once, add, add_unique)
        #[arg(short, long, default_value = "over")]
        mode: String,
        /// Compression (none, gzip, bzip2)
        #[arg(long, default_value = "none")]
        compress: String,
        #[arg(long, default_value_t = 0)]
        prod_id: i32,
        #[arg(long, default_value = "")]
        prod_label: String,
        /// Payload file (default: stdin)
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Query chunks
    Get {
        #[command(subcommand)]
        query: GetQuery,
        #[command(flatten)]
        opts: GetArgs,
    },

    /// Erase chunks at a valid time
    Erase {
        time: String,
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        data_type: i32,
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        data_type2: i32,
        /// Match type 0 literally
        #[arg(long)]
        respect_zero: bool,
    },

    /// Show the first and last times in the database
    Times {
        /// Ignore chunks written after this time
        #[arg(long)]
        written_before: Option<String>,
    },

    /// List valid times in a range
    TimeList {
        start: String,
        end: String,
        /// 0 keeps duplicates, 1 removes them, N thins to N seconds apart
        #[arg(short, long, default_value_t = 0)]
        min_interval: i64,
    },

    /// Show the header of the day containing a time
    Header { time: String },

    /// Hash a short ID into a data type
    Hash {
        id: String,
        /// Use the 5-character [-0-9A-Za-z] scheme
        #[arg(long)]
        five: bool,
    },

    /// Recover the ID from a hashed data type
    Dehash {
        #[arg(allow_negative_numbers = true)]
        value: i32,
        /// Use the 5-character scheme (default for negative values)
        #[arg(long)]
        five: bool,
    },

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum GetQuery {
    /// Chunks at exactly this time
    Exact { time: String },
    /// Chunks at the stored time nearest this one
    Closest {
        time: String,
        /// Search margin in seconds (negative: unbounded)
        #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
        margin: i64,
    },
    /// Chunks in [start, end]
    Interval { start: String, end: String },
    /// Chunks valid at this time
    Valid { time: String },
    /// Chunks within margin of the latest time
    Latest {
        #[arg(short, long, default_value_t = 0)]
        margin: i64,
    },
    /// Chunks at the latest time at or before this one
    Before {
        time: String,
        #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
        margin: i64,
    },
    /// Chunks at the earliest time at or after this one
    After {
        time: String,
        #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
        margin: i64,
    },
}

#[derive(Args)]
pub struct GetArgs {
    #[arg(long, default_value_t = 0, global = true, allow_negative_numbers = true)]
    data_type: i32,
    #[arg(long, default_value_t = 0, global = true, allow_negative_numbers = true)]
    data_type2: i32,
    /// Match type 0 literally
    #[arg(long, global = true)]
    respect_zero: bool,
    /// Read refs only, never the data file
    #[arg(long, global = true)]
    refs_only: bool,
    /// Collapse each data type to its latest or earliest chunk
    #[arg(long, global = true)]
    unique: Option<String>,
    /// Ignore chunks written after this time
    #[arg(long, global = true)]
    written_before: Option<String>,
    /// Write each payload to a file in this directory
    #[arg(long, global = true)]
    save: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => match Config::load_explicit(path) {
            Ok(loaded) => loaded,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        },
        None => Config::discover(),
    };
    init_logging(&loaded.config);
    loaded.log();
    let config = loaded.config;

    if let Err(e) = run(cli, &config) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("spdb={}", config.logging.level)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.logging.format == "json" {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn run(cli: Cli, config: &Config) -> anyhow::Result<()> {
    let dir = cli
        .dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.spdb.data_dir));
    let json = match cli.format.as_str() {
        "json" => true,
        "table" => false,
        other => bail!("Invalid output format: {}. Use: table, json", other),
    };
    let mut db = Spdb::with_config(config.engine_config());

    match cli.command {
        Commands::Put {
            time,
            expire,
            data_type,
            data_type2,
            tag,
            mode,
            compress,
            prod_id,
            prod_label,
            file,
        } => {
            let valid_time = parse_time(&time)?;
            let expire_time = match expire {
                Some(e) => parse_time(&e)?,
                None => valid_time,
            };
            let data = read_payload(file.as_deref())?;

            db.set_put_mode(mode.parse().map_err(anyhow::Error::msg)?);
            db.set_chunk_compress_on_put(compress.parse()?);

            let mut chunk = PutChunk::new(valid_time, expire_time, data)
                .data_type(data_type)
                .data_type2(data_type2);
            if let Some(tag) = tag {
                chunk = chunk.tag(tag);
            }
            let len = chunk.data.len();
            db.put_chunk(&dir, prod_id, &prod_label, chunk)
                .with_context(|| format!("put to {:?}", dir))?;

            if json {
                let out = serde_json::json!({
                    "valid_time": valid_time,
                    "bytes": len,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("Stored {} bytes at {}", len, format_time(valid_time));
            }
        }

        Commands::Get { query, opts } => {
            let query = build_query(query)?;
            let mut get_opts = GetOptions::new()
                .data_type(opts.data_type)
                .data_type2(opts.data_type2);
            if opts.refs_only {
                get_opts = get_opts.refs_only();
            }
            if opts.respect_zero {
                get_opts = get_opts.respect_zero_types();
            }
            db.set_unique(parse_unique(opts.unique.as_deref())?);
            if let Some(t) = opts.written_before {
                db.set_check_write_time_on_get(parse_time(&t)?);
            }

            db.get(&dir, query, get_opts)?;

            if let Some(out_dir) = &opts.save {
                save_payloads(out_dir, db.chunks())?;
            }
            if json {
                let out = serde_json::json!({
                    "query": query,
                    "chunks": db.chunks(),
                    "failed_days": db.failed_days(),
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                print_chunks(db.chunks());
                for failed in db.failed_days() {
                    eprintln!("Skipped day {}: {}", format_time(failed.day_start), failed.error);
                }
            }
        }

        Commands::Erase {
            time,
            data_type,
            data_type2,
            respect_zero,
        } => {
            let valid_time = parse_time(&time)?;
            db.set_respect_zero_types_on_put(respect_zero);
            let erased = db.erase(&dir, valid_time, data_type, data_type2)?;

            if json {
                println!("{}", serde_json::json!({ "erased": erased }));
            } else {
                println!("Erased {} chunks at {}", erased, format_time(valid_time));
            }
        }

        Commands::Times { written_before } => {
            if let Some(t) = written_before {
                db.set_check_write_time_on_get(parse_time(&t)?);
            }
            let times = db.get_times(&dir)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&times)?);
            } else {
                println!("First time:      {}", format_opt_time(times.first_time));
                println!("Last time:       {}", format_opt_time(times.last_time));
                println!("Last valid time: {}", format_opt_time(times.last_valid_time));
            }
        }

        Commands::TimeList {
            start,
            end,
            min_interval,
        } => {
            let (start, end) = (parse_time(&start)?, parse_time(&end)?);
            let times = db.compile_time_list(&dir, start, end, min_interval)?;

            if json {
                println!("{}", serde_json::to_string_pretty(times)?);
            } else if times.is_empty() {
                println!("No times in range");
            } else {
                for t in times {
                    println!("{:<22} {}", format_time(*t), t);
                }
            }
        }

        Commands::Header { time } => {
            let t = parse_time(&time)?;
            let Some(header) = db.header_info(&dir, t)? else {
                eprintln!("No day file for {} in {:?}", format_time(t), dir);
                std::process::exit(1);
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&header)?);
            } else {
                print_header(&header);
            }
        }

        Commands::Hash { id, five } => {
            let value = if five {
                hash_5chars_to_i32(&id)
            } else {
                hash_4chars_to_i32(&id)
            };
            println!("{}", value);
        }

        Commands::Dehash { value, five } => {
            let id = if five || value < 0 {
                dehash_i32_to_5chars(value)
            } else {
                dehash_i32_to_4chars(value)
            };
            println!("{}", id);
        }

        Commands::Config { output } => {
            let config = generate_default_config();

            match output {
                Some(path) => {
                    // Create parent directory if needed
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, &config)?;
                    println!("Config written to {:?}", path);
                }
                None => {
                    print!("{}", config);
                }
            }
        }
    }

    Ok(())
}

fn build_query(query: GetQuery) -> anyhow::Result<Query> {
    Ok(match query {
        GetQuery::Exact { time } => Query::Exact {
            time: parse_time(&time)?,
        },
        GetQuery::Closest { time, margin } => Query::Closest {
            time: parse_time(&time)?,
            margin,
        },
        GetQuery::Interval { start, end } => Query::Interval {
            start: parse_time(&start)?,
            end: parse_time(&end)?,
        },
        GetQuery::Valid { time } => Query::Valid {
            time: parse_time(&time)?,
        },
        GetQuery::Latest { margin } => Query::Latest { margin },
        GetQuery::Before { time, margin } => Query::FirstBefore {
            time: parse_time(&time)?,
            margin,
        },
        GetQuery::After { time, margin } => Query::FirstAfter {
            time: parse_time(&time)?,
            margin,
        },
    })
}

/// "now", Unix seconds or RFC 3339
fn parse_time(s: &str) -> anyhow::Result<i64> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("now") {
        Ok(Utc::now().timestamp())
    } else if let Ok(ts) = s.parse::<i64>() {
        Ok(ts)
    } else if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        Ok(dt.timestamp())
    } else {
        bail!("Invalid time format: {}. Use: now, Unix seconds, or RFC 3339", s)
    }
}

fn parse_unique(s: Option<&str>) -> anyhow::Result<UniqueMode> {
    match s.map(|s| s.to_ascii_lowercase()).as_deref() {
        None | Some("off") => Ok(UniqueMode::Off),
        Some("latest") => Ok(UniqueMode::Latest),
        Some("earliest") => Ok(UniqueMode::Earliest),
        Some(other) => bail!("Invalid unique mode: {}. Use: off, latest, earliest", other),
    }
}

fn read_payload(path: Option<&Path>) -> anyhow::Result<Vec<u8>> {
    match path {
        Some(p) if p != Path::new("-") => {
            std::fs::read(p).with_context(|| format!("reading payload {:?}", p))
        }
        _ => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            Ok(buf)
        }
    }
}

fn save_payloads(out_dir: &Path, chunks: &[Chunk]) -> anyhow::Result<()> {
    std::fs::create_dir_all(out_dir)?;
    for (i, chunk) in chunks.iter().enumerate() {
        let name = format!(
            "{}_{}_{}_{}.bin",
            chunk.valid_time(),
            chunk.chunk_ref.data_type,
            chunk.chunk_ref.data_type2,
            i
        );
        std::fs::write(out_dir.join(&name), &chunk.data)?;
    }
    tracing::info!("Saved {} payloads to {:?}", chunks.len(), out_dir);
    Ok(())
}

fn format_time(t: i64) -> String {
    chrono::DateTime::from_timestamp(t, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| t.to_string())
}

fn format_opt_time(t: Option<i64>) -> String {
    t.map(format_time).unwrap_or_else(|| "-".to_string())
}

fn print_chunks(chunks: &[Chunk]) {
    if chunks.is_empty() {
        println!("No chunks found");
        return;
    }

    println!(
        "{:<22} {:<22} {:>11} {:>11} {:>8} {:<6} {}",
        "Valid", "Expire", "Type", "Type2", "Bytes", "Comp", "Tag"
    );
    println!("{}", "-".repeat(95));
    for chunk in chunks {
        let r = &chunk.chunk_ref;
        println!(
            "{:<22} {:<22} {:>11} {:>11} {:>8} {:<6} {}",
            format_time(r.valid_time),
            format_time(r.expire_time),
            r.data_type,
            r.data_type2,
            r.len,
            chunk.aux.compression,
            chunk.aux.tag.as_deref().unwrap_or("-")
        );
    }
}

fn print_header(header: &Header) {
    println!("Revision:          {}.{}", header.major_revision, header.minor_revision);
    println!("Product:           {} ({})", header.prod_label, header.prod_id);
    if !header.info.is_empty() {
        println!("Info:              {}", header.info);
    }
    println!("Lead time storage: {:?}", header.lead_time_storage);
    println!("Day:               {} .. {}", format_time(header.start_of_day), format_time(header.end_of_day));
    println!("Valid:             {} .. {}", format_time(header.start_valid), format_time(header.end_valid));
    println!("Latest expire:     {}", format_time(header.latest_expire));
    println!("Latest write:      {}", format_time(header.latest_write));
    println!("Max duration:      {}s", header.max_duration);
    println!("Data bytes:        {}", header.nbytes_data);
    println!("Fragmented bytes:  {}", header.nbytes_frag);
}
