use atomic_write_file::AtomicWriteFile;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::EnvFilter;

pub fn setup_logging(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(LocalTime::new(time::macros::format_description!(
            "[hour]:[minute]:[second].[subsecond digits:3]"
        )))
        .with_target(false)
        .compact()
        .init();
}

pub fn format_number(num: u64) -> String {
    let digits = num.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Writes `path` through a hidden temp file that replaces it on commit.
/// Readers see either the old content or the new one, never a partial file.
pub fn write_atomic<F>(path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut file = AtomicWriteFile::open(path)?;
    {
        let mut writer = BufWriter::new(&mut file);
        write(&mut writer)?;
        writer.flush()?;
    }
    file.commit()
}

pub fn validate_args(args: &crate::args::Args) -> anyhow::Result<()> {
    use crate::args::Command;

    match &args.command {
        Command::Backfill(backfill) => {
            if backfill.chunk_days == Some(0) {
                anyhow::bail!("--chunk-days must be greater than 0");
            }
            if backfill.chunk_rows == Some(0) {
                anyhow::bail!("--chunk-rows must be greater than 0");
            }
            if backfill.workers == Some(0) {
                anyhow::bail!("--workers must be greater than 0");
            }
            if let (Some(start), Some(end)) = (backfill.start, backfill.end) {
                if start > end {
                    anyhow::bail!("--start {} is after --end {}", start, end);
                }
            }
        }
        Command::Analyze(analyze) => {
            if analyze.top == 0 {
                anyhow::bail!("--top must be greater than 0");
            }
            if analyze.start.is_some() != analyze.end.is_some() {
                anyhow::bail!("--start and --end must be given together");
            }
        }
        Command::Export(export) => {
            if export.split_size == 0 {
                anyhow::bail!("--split-size must be greater than 0");
            }
        }
        Command::Update(_) | Command::Status => {}
    }

    Ok(())
}
