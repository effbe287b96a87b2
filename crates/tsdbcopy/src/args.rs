use std::{
    path::PathBuf,
    sync::LazyLock,
    time::Duration,
};

use anyhow::Context;
use chrono::{
    DateTime,
    Local,
    NaiveDateTime,
    TimeZone,
};
use clap::{
    Args,
    Parser,
    Subcommand,
};
use cmd_util::{
    env::env_config,
    keyvalue::parse_key_value,
};
use copier::CopyOptions;
use timeseries::{
    Label,
    Labels,
    Matcher,
};
use url::Url;

/// Seconds before an in-flight remote read is declared dead.
static READ_TIMEOUT_SECS: LazyLock<u64> = LazyLock::new(|| {
    env_config(
        "COPYER_READ_TIMEOUT_SECS",
        copier::DEFAULT_READ_TIMEOUT.as_secs(),
    )
});

#[derive(Parser)]
#[command(
    name = "tsdbcopy",
    version,
    about = "Copies Prometheus-style time series between block databases and remote read endpoints"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Copy a time interval from a local TSDB or a remote read endpoint into
    /// a new block database, optionally split by a tenant label
    Copy(CopyArgs),
    /// Regroup the blocks of existing databases into a target duration
    Compact(CompactArgs),
}

#[derive(Args)]
pub struct CopyArgs {
    /// Source TSDB directory, or an http(s):// remote read endpoint
    pub from: String,
    /// Target directory; tenants become subdirectories
    pub to_dir: PathBuf,

    /// Copy data from this time, `YYYY-MM-DD HH:MM:SS.sss` with optional
    /// `±HH:MM` zone (local time otherwise)
    #[arg(long, short = 'S', env = "COPYER_START_TIME")]
    pub start_time: String,
    /// Copy data up to this time, same format as --start-time
    #[arg(long, short = 'E', env = "COPYER_END_TIME")]
    pub end_time: String,
    /// Width of one source query, e.g. 30m, 1h
    #[arg(long, short = 'Q', env = "COPYER_QUERY_SPLIT", default_value = "1h", value_parser = parse_duration_ms)]
    pub query_split: i64,
    /// Width of produced blocks, e.g. 24h; 0 disables regrouping
    #[arg(long, short = 'B', env = "COPYER_BLOCK_SPLIT", default_value = "24h", value_parser = parse_duration_ms)]
    pub block_split: i64,
    /// Recount samples in the target after the copy and fail on mismatch
    #[arg(long, env = "COPYER_VERIFY")]
    pub verify: bool,
    /// Write Thanos object-store metadata into each produced block
    #[arg(long, env = "COPYER_THANOS_METADATA")]
    pub thanos_metadata: bool,
    /// Parallel append workers; 0 means one per CPU (watch memory)
    #[arg(long = "write-thread", short = 'T', env = "COPYER_MULTI_THREAD", default_value_t = 1)]
    pub write_thread: usize,
    /// Series selector `k<op>v` with op one of `=`, `!=`, `=~`, `!~`; repeatable
    #[arg(long = "label-query", short = 'l', env = "COPYER_LABEL_QUERY")]
    pub label_query: Vec<String>,
    /// Label `k=v` appended to every copied series (or to the Thanos
    /// metadata); repeatable, no duplicate check
    #[arg(long = "label-append", short = 'L', env = "COPYER_LABEL_APPEND")]
    pub label_append: Vec<String>,
    /// Samples per append transaction before committing
    #[arg(long = "commit-count", env = "COPYER_COMMIT_COUNT", default_value_t = copier::DEFAULT_COMMIT_COUNT)]
    pub commit_count: u64,
    /// Label whose value partitions output into tenants
    #[arg(long = "tenant", env = "COPYER_TENANT_KEY")]
    pub tenant: Option<String>,
    /// Tenant for series missing the tenant label
    #[arg(long = "default-tenant", env = "COPYER_DEFAULT_TENANT", default_value = "")]
    pub default_tenant: String,
    /// Label-values API base (e.g. http://prom:9090/api/v1/label), required
    /// when tenant-splitting a remote source
    #[arg(long = "label-api", env = "COPYER_LABEL_API")]
    pub label_api: Option<Url>,
    /// Release retired write buffers after each append job (slower, smaller
    /// resident set)
    #[arg(long = "manual-gc", short = 'G', env = "COPYER_MANUAL_GC")]
    pub manual_gc: bool,
    /// Wait for all flushes before starting the next block range
    #[arg(long, short = 'W', env = "COPYER_WAIT")]
    pub wait: bool,
}

impl CopyArgs {
    pub fn into_options(self) -> anyhow::Result<CopyOptions> {
        let start_time_ms = parse_time_ms(&self.start_time)
            .with_context(|| format!("parsing --start-time {:?}", self.start_time))?;
        let end_time_ms = parse_time_ms(&self.end_time)
            .with_context(|| format!("parsing --end-time {:?}", self.end_time))?;
        let matchers = self
            .label_query
            .iter()
            .map(|s| s.parse::<Matcher>())
            .collect::<anyhow::Result<Vec<_>>>()?;
        let append_labels = self
            .label_append
            .iter()
            .map(|s| parse_key_value(s).map(Label::from))
            .collect::<anyhow::Result<Labels>>()?;
        CopyOptions {
            source: self.from,
            target_dir: self.to_dir,
            start_time_ms,
            end_time_ms,
            query_split_ms: self.query_split,
            block_split_ms: self.block_split,
            commit_count: self.commit_count,
            write_threads: self.write_thread,
            matchers,
            append_labels,
            tenant_label: self.tenant.unwrap_or_default(),
            default_tenant: self.default_tenant,
            label_api: self.label_api,
            read_timeout: Duration::from_secs(*READ_TIMEOUT_SECS),
            thanos_metadata: self.thanos_metadata,
            manual_gc: self.manual_gc,
            wait_each_block: self.wait,
            verify: self.verify,
        }
        .validated()
    }
}

#[derive(Args)]
pub struct CompactArgs {
    /// Block database directories, compacted in place
    #[arg(required = true)]
    pub dirs: Vec<PathBuf>,
    /// Width of produced blocks; 0 merges everything into one block
    #[arg(long, short = 'B', env = "COPYER_BLOCK_SPLIT", default_value = "24h", value_parser = parse_duration_ms)]
    pub block_split: i64,
    /// Directories compacted in parallel; -1 sequential, 0 one per CPU
    #[arg(long = "multi-thread", short = 'T', env = "COPYER_MULTI_THREAD", default_value_t = -1, allow_negative_numbers = true)]
    pub multi_thread: i64,
}

const ZONED_LAYOUT: &str = "%Y-%m-%d %H:%M:%S%.f%:z";
const LOCAL_LAYOUT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Wall-clock argument to UTC milliseconds, assuming the local zone when the
/// argument carries none.
fn parse_time_ms(s: &str) -> anyhow::Result<i64> {
    if let Ok(zoned) = DateTime::parse_from_str(s, ZONED_LAYOUT) {
        return Ok(zoned.timestamp_millis());
    }
    let naive = NaiveDateTime::parse_from_str(s, LOCAL_LAYOUT)
        .context("expected YYYY-MM-DD HH:MM:SS[.sss][±HH:MM]")?;
    let local = Local
        .from_local_datetime(&naive)
        .single()
        .context("ambiguous local time, add an explicit ±HH:MM zone")?;
    Ok(local.timestamp_millis())
}

/// `90m`-style durations to milliseconds. Supports ms, s, m, h, d.
fn parse_duration_ms(s: &str) -> Result<i64, String> {
    let (number, unit_ms) = if let Some(v) = s.strip_suffix("ms") {
        (v, 1)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1_000)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60_000)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 3_600_000)
    } else if let Some(v) = s.strip_suffix('d') {
        (v, 86_400_000)
    } else {
        return Err(format!("duration {s:?} needs a unit: ms, s, m, h or d"));
    };
    let number: i64 = number
        .parse()
        .map_err(|e| format!("bad duration {s:?}: {e}"))?;
    Ok(number * unit_ms)
}
