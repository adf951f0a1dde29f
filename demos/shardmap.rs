use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde_json::Value;
use shardmap::{Error, ReadOptions, Result, ShardMap, ShardMapBuilder, SHARD_COUNT};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Demo(args) => run_demo(args),
        Command::Info(args) => run_info(args),
        Command::Convert(args) => run_convert(args),
    }
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "shardmap utility for creating and inspecting shardmap files",
    subcommand_required = true,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a few words mapped to their lengths, then read them back
    Demo(DemoArgs),
    /// Inspect a shardmap file and print basic information
    Info(InfoArgs),
    /// Convert a JSON key-value file into a shardmap file
    Convert(ConvertArgs),
}

#[derive(clap::Args)]
struct DemoArgs {
    /// Path of the shardmap file to write
    #[arg(value_name = "FILE", default_value = "wow.db")]
    output: PathBuf,
}

#[derive(clap::Args)]
struct InfoArgs {
    /// Path to the shardmap file
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Optional key to look up
    #[arg(short, long)]
    key: Option<String>,

    /// Optional shard index whose slots are printed
    #[arg(short, long)]
    shard: Option<usize>,

    /// Verify every index entry before answering
    #[arg(long)]
    verify: bool,
}

#[derive(clap::Args)]
struct ConvertArgs {
    /// Path to the source JSON file containing key-value pairs
    #[arg(short, long, value_name = "FILE")]
    input: PathBuf,

    /// Path to the shardmap file to produce
    #[arg(short, long, value_name = "FILE")]
    output: PathBuf,

    /// Optional override for writer buffer size in bytes
    #[arg(long, value_name = "BYTES", default_value_t = 16 << 20)]
    buffer_size: usize,

    /// Sync the file to disk before returning
    #[arg(long)]
    sync: bool,
}

fn run_demo(args: DemoArgs) -> Result<()> {
    let words = [
        "wow",
        "boomshakalakaboomshakalakaboomshakalakalaka",
        "kowloon",
        "pancake",
        "oyster",
        "latitude",
    ];

    {
        let mut session = ShardMapBuilder::default().create(&args.output)?;
        for word in words {
            session.put(word, word.len().to_string())?;
        }
    }

    let map = ShardMap::open(&args.output)?;
    for word in words {
        let value = map.get(word)?.unwrap_or_default();
        println!("size of {}: {}", word, String::from_utf8_lossy(&value));
    }
    Ok(())
}

fn run_info(args: InfoArgs) -> Result<()> {
    let map = ShardMap::open_with_options(
        &args.input,
        ReadOptions {
            verify: args.verify,
        },
    )?;
    println!("{}", to_json(&map.info())?);

    if let Some(key) = args.key {
        match map.get_ref(&key)? {
            Some(value) => println!("{}: {}", key, String::from_utf8_lossy(value)),
            None => println!("{}: not found", key),
        }
    }

    if let Some(shard) = args.shard {
        if shard >= SHARD_COUNT {
            return Err(Error::InvalidArgument(format!(
                "Shard index {} out of range >= {}",
                shard, SHARD_COUNT
            )));
        }
        let slots: Vec<_> = map.shard_table(shard).slots().collect();
        println!("Shard {} slots:\n{}", shard, to_json(&slots)?);
    }

    Ok(())
}

fn run_convert(args: ConvertArgs) -> Result<()> {
    let entries = load_entries_from_json(&args.input)?;
    let writer = File::create(&args.output)?;

    let info = ShardMapBuilder::default()
        .with_writer_buffer_size(args.buffer_size)
        .with_sync(args.sync)
        .build(&writer, entries.iter())?;
    println!("{}", to_json(&info)?);

    Ok(())
}

fn to_json(value: &impl serde::Serialize) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| Error::Io(std::io::Error::other(format!("Failed to format JSON: {e}"))))
}

fn load_entries_from_json(path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let value: Value = serde_json::from_reader(reader)
        .map_err(|e| invalid_json(format!("Failed to parse JSON input: {e}")))?;
    extract_entries(value)
}

fn extract_entries(value: Value) -> Result<Vec<(String, Vec<u8>)>> {
    match value {
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(key, value)| (key, value_bytes(value)))
            .collect()),
        Value::Array(items) => {
            let mut entries = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                match item {
                    Value::Object(mut obj) => {
                        let key = obj.remove("key").ok_or_else(|| {
                            invalid_json(format!("entry {index} missing 'key' field"))
                        })?;
                        let value = obj.remove("value").ok_or_else(|| {
                            invalid_json(format!("entry {index} missing 'value' field"))
                        })?;
                        entries.push((expect_string(key, index)?, value_bytes(value)));
                    }
                    Value::Array(pair) => {
                        let [key, value]: [Value; 2] = pair.try_into().map_err(|_| {
                            invalid_json(format!("entry {index} expected array of length 2"))
                        })?;
                        entries.push((expect_string(key, index)?, value_bytes(value)));
                    }
                    other => {
                        return Err(invalid_json(format!(
                            "unsupported entry format at index {index}: {other}"
                        )));
                    }
                }
            }
            Ok(entries)
        }
        other => Err(invalid_json(format!(
            "unsupported JSON top-level type: {other}"
        ))),
    }
}

/// Strings are stored raw, anything else as its JSON text.
fn value_bytes(value: Value) -> Vec<u8> {
    match value {
        Value::String(s) => s.into_bytes(),
        other => other.to_string().into_bytes(),
    }
}

fn expect_string(value: Value, index: usize) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(invalid_json(format!(
            "entry {index} expects string key, found {other}"
        ))),
    }
}

fn invalid_json(message: String) -> Error {
    Error::InvalidArgument(message)
}
