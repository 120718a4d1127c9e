use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use calicodb::env::{DiskEnv, SharedEnv};
use calicodb::wal::reader::WalReader;
use calicodb::wal::record::Payload;

use clap::{Parser, ValueEnum};

const EXIT_OK: i32 = 0;
const EXIT_NO_SEGMENTS: i32 = 10;
const EXIT_FATAL_ERROR: i32 = 20;

#[derive(Clone, Debug, ValueEnum)]
enum OutputFormatArg {
    Text,
    Json,
}

#[derive(Parser)]
#[command(
    name = "calicodb-wal-inspect",
    about = "Inspect CalicoDB WAL segments and summarize their records"
)]
struct Cli {
    /// Segment prefix, e.g. /data/wal-test.db- (segment files append the
    /// first LSN in hex)
    prefix: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormatArg,

    /// Print every record instead of just the summary
    #[arg(long)]
    verbose: bool,
}

fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

struct Summary {
    segments: usize,
    data_records: usize,
    commit_records: usize,
    delta_bytes: usize,
    last_commit_lsn: Option<u64>,
}

fn fatal(format: &OutputFormatArg, msg: &str) -> ! {
    match format {
        OutputFormatArg::Text => eprintln!("ERROR: {msg}"),
        OutputFormatArg::Json => println!(
            "{{\"status\":\"fatal\",\"error\":\"{}\",\"exit_code\":{EXIT_FATAL_ERROR}}}",
            json_escape(msg)
        ),
    }
    process::exit(EXIT_FATAL_ERROR);
}

fn main() {
    let cli = Cli::parse();
    let prefix = cli.prefix.to_string_lossy().to_string();

    let env: SharedEnv = Arc::new(DiskEnv::new());
    let mut reader = match WalReader::open(env, &prefix) {
        Ok(reader) => reader,
        Err(err) => fatal(&cli.format, &format!("cannot list segments: {err}")),
    };
    if reader.is_empty() {
        match cli.format {
            OutputFormatArg::Text => println!("no WAL segments match {prefix}"),
            OutputFormatArg::Json => println!(
                "{{\"status\":\"empty\",\"segments\":0,\"exit_code\":{EXIT_NO_SEGMENTS}}}"
            ),
        }
        process::exit(EXIT_NO_SEGMENTS);
    }
    let segments = reader.segment_paths().count();

    let records = match reader.read_all() {
        Ok(records) => records,
        Err(err) => fatal(&cli.format, &format!("WAL is corrupted: {err}")),
    };

    let mut summary = Summary {
        segments,
        data_records: 0,
        commit_records: 0,
        delta_bytes: 0,
        last_commit_lsn: None,
    };
    for record in &records {
        match &record.payload {
            Payload::PageDeltas { pid, entries } => {
                summary.data_records += 1;
                let bytes: usize = entries.iter().map(|e| e.after.len()).sum();
                summary.delta_bytes += bytes;
                if cli.verbose {
                    if let OutputFormatArg::Text = cli.format {
                        println!(
                            "lsn {:>8}  page {:>6}  deltas {:>3}  bytes {:>6}",
                            record.lsn,
                            pid,
                            entries.len(),
                            bytes
                        );
                    }
                }
            }
            Payload::Commit => {
                summary.commit_records += 1;
                summary.last_commit_lsn = Some(record.lsn);
                if cli.verbose {
                    if let OutputFormatArg::Text = cli.format {
                        println!("lsn {:>8}  commit", record.lsn);
                    }
                }
            }
        }
    }

    match cli.format {
        OutputFormatArg::Text => {
            println!("WAL summary:");
            println!("  segments: {}", summary.segments);
            println!("  data records: {}", summary.data_records);
            println!("  commit records: {}", summary.commit_records);
            println!("  after-image bytes: {}", summary.delta_bytes);
            match summary.last_commit_lsn {
                Some(lsn) => println!("  last commit LSN: {lsn}"),
                None => println!("  last commit LSN: none (nothing committed)"),
            }
        }
        OutputFormatArg::Json => {
            let last_commit = summary
                .last_commit_lsn
                .map(|lsn| lsn.to_string())
                .unwrap_or_else(|| "null".to_string());
            println!(
                "{{\"status\":\"ok\",\"segments\":{},\"data_records\":{},\"commit_records\":{},\
                 \"after_image_bytes\":{},\"last_commit_lsn\":{},\"exit_code\":{EXIT_OK}}}",
                summary.segments,
                summary.data_records,
                summary.commit_records,
                summary.delta_bytes,
                last_commit
            );
        }
    }
    process::exit(EXIT_OK);
}
