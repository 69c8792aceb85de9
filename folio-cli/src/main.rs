/*!
Folio CLI - command-line interface for Folio workspace backups.

Runs snapshot cycles against the configured storage targets and inspects,
verifies, compares and deletes the snapshots they produce.
*/

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use folio_core::crawler::{Crawler, NotionApi};
use folio_core::observability::{init_observability_with, DEFAULT_LOG_DIRECTIVE, FolioMetrics};
use folio_core::storage::BackendStatus;
use folio_core::{
    build_storage, diff, ChangeType, DiffResult, FolioConfig, FolioError, JsonLinesRecorder, SnapshotPipeline,
    SimilarityProvider, SnapshotReader, SnapshotRecord, SnapshotTrigger, StaticVectors, StorageAdapter,
};
use folio_retry::RetryPolicy;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{Table, Tabled};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "folio")]
#[command(about = "Backups and change analysis for Notion workspaces")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "FOLIO_CONFIG", default_value = "folio.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one snapshot cycle for a tenant
    Snapshot {
        #[arg(short, long)]
        tenant: String,
        /// Snapshot identifier; a random one is generated when omitted
        #[arg(long)]
        snapshot_id: Option<String>,
        /// Notion integration token
        #[arg(long, env = "NOTION_TOKEN", hide_env_values = true)]
        token: String,
        /// Append the cycle record to this JSON lines file
        #[arg(long)]
        record_file: Option<PathBuf>,
        /// Print Prometheus metrics after the cycle
        #[arg(long)]
        print_metrics: bool,
    },
    /// Compare two snapshots of a tenant
    Diff {
        #[arg(short, long)]
        tenant: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        /// JSON file mapping vector keys to content vectors
        #[arg(long)]
        vectors: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
    /// List stored snapshots of a tenant
    List {
        #[arg(short, long)]
        tenant: String,
    },
    /// Verify integrity of a snapshot
    Verify {
        #[arg(short, long)]
        tenant: String,
        #[arg(short, long)]
        snapshot: String,
    },
    /// Delete a snapshot
    Delete {
        #[arg(short, long)]
        tenant: String,
        #[arg(short, long)]
        snapshot: String,
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Tabled)]
struct SnapshotInfo {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Items")]
    items: usize,
}

#[derive(Tabled)]
struct BackendRow {
    #[tabled(rename = "Backend")]
    backend: String,
    #[tabled(rename = "Role")]
    role: String,
    #[tabled(rename = "Status")]
    status: String,
}

#[derive(Tabled)]
struct ChangeRow {
    #[tabled(rename = "Item")]
    id: String,
    #[tabled(rename = "Change")]
    change: String,
    #[tabled(rename = "Similarity")]
    similarity: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let directive = if cli.verbose { "folio=debug" } else { DEFAULT_LOG_DIRECTIVE };
    init_observability_with(directive, cli.json_logs)?;

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Snapshot {
            tenant,
            snapshot_id,
            token,
            record_file,
            print_metrics,
        } => run_snapshot(&config, tenant, snapshot_id, &token, record_file, print_metrics).await?,
        Commands::Diff {
            tenant,
            from,
            to,
            vectors,
            format,
        } => diff_snapshots(&config, &tenant, &from, &to, vectors.as_deref(), format).await?,
        Commands::List { tenant } => list_snapshots(&config, &tenant).await?,
        Commands::Verify { tenant, snapshot } => verify_snapshot(&config, &tenant, &snapshot).await?,
        Commands::Delete { tenant, snapshot, force } => delete_snapshot(&config, &tenant, &snapshot, force).await?,
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<FolioConfig, anyhow::Error> {
    let config = FolioConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

async fn open_reader(config: &FolioConfig) -> Result<SnapshotReader, anyhow::Error> {
    let storage: Arc<dyn StorageAdapter> = Arc::new(build_storage(config, RetryPolicy::default()).await?);
    Ok(SnapshotReader::new(storage))
}

async fn run_snapshot(
    config: &FolioConfig,
    tenant: String,
    snapshot_id: Option<String>,
    token: &str,
    record_file: Option<PathBuf>,
    print_metrics: bool,
) -> Result<(), anyhow::Error> {
    let storage = Arc::new(build_storage(config, RetryPolicy::default()).await?);
    let api = NotionApi::new(token, &config.crawler)?;
    let crawler = Crawler::new(Arc::new(api), config.crawler.clone());

    let mut pipeline = SnapshotPipeline::new(crawler, storage, config.pipeline.clone());
    if let Some(path) = record_file {
        pipeline = pipeline.with_recorder(Arc::new(JsonLinesRecorder::new(path)));
    }

    let mut trigger = SnapshotTrigger::new(tenant);
    if let Some(id) = snapshot_id {
        trigger = trigger.with_snapshot_id(id);
    }

    info!(tenant_id = %trigger.tenant_id, "starting snapshot cycle");
    let record = pipeline.run(trigger).await?;
    print_record(&record);

    if print_metrics {
        match FolioMetrics::global() {
            Some(metrics) => println!("{}", metrics.gather_metrics()?),
            None => warn!("metrics registry unavailable"),
        }
    }

    if !record.is_completed() {
        bail!(
            "snapshot {} failed: {}",
            record.snapshot_id,
            record.error.as_deref().unwrap_or("no items captured")
        );
    }
    Ok(())
}

fn print_record(record: &SnapshotRecord) {
    let mark = if record.is_completed() { "✓" } else { "✗" };
    println!("{mark} Snapshot {} ({:?})", record.snapshot_id, record.status);
    println!("  Tenant: {}", record.tenant_id);
    println!("  Requested: {}", format_timestamp(record.requested_at));
    println!("  Finished: {}", format_timestamp(record.finished_at));
    println!("  Items: {}", record.item_count);
    println!("  Size: {}", format_size(record.size_bytes));
    if let Some(digest) = &record.content_digest {
        println!("  Content Hash: {digest}");
    }
    if !record.flags.is_empty() {
        let flags: Vec<String> = record.flags.iter().map(|f| format!("{f:?}")).collect();
        println!("  Flags: {}", flags.join(", "));
    }
    for failure in &record.partial_failures {
        println!("  Partial: {} ({})", failure.item_id, failure.message);
    }

    if !record.per_backend_status.is_empty() {
        let rows: Vec<BackendRow> = record.per_backend_status.iter().map(backend_row).collect();
        println!("{}", Table::new(rows));
    }
}

fn backend_row(status: &BackendStatus) -> BackendRow {
    BackendRow {
        backend: status.backend.clone(),
        role: format!("{:?}", status.role).to_lowercase(),
        status: match &status.error {
            None if status.ok => "ok".to_string(),
            Some(e) => format!("failed: {e}"),
            None => "failed".to_string(),
        },
    }
}

async fn diff_snapshots(
    config: &FolioConfig,
    tenant: &str,
    from: &str,
    to: &str,
    vectors: Option<&Path>,
    format: OutputFormat,
) -> Result<(), anyhow::Error> {
    let reader = open_reader(config).await?;
    let from_manifest = reader.load_manifest(tenant, from).await?;
    let to_manifest = reader.load_manifest(tenant, to).await?;

    let provider = vectors.map(StaticVectors::from_json_file).transpose()?;
    let result = diff(
        &from_manifest,
        &to_manifest,
        provider.as_ref().map(|p| p as &dyn SimilarityProvider),
        &config.diff,
    )
    .await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Table => print_diff(&result),
    }
    Ok(())
}

fn print_diff(result: &DiffResult) {
    let summary = result.summary();
    println!("Diff {} -> {}", result.from_snapshot, result.to_snapshot);
    println!(
        "  Added: {}  Deleted: {}  Changed: {}",
        summary.added, summary.deleted, summary.changed
    );

    if result.is_empty() {
        println!("No changes");
        return;
    }

    let mut rows: Vec<ChangeRow> = Vec::new();
    rows.extend(result.added.iter().map(|id| ChangeRow {
        id: id.clone(),
        change: "added".to_string(),
        similarity: "-".to_string(),
    }));
    rows.extend(result.deleted.iter().map(|id| ChangeRow {
        id: id.clone(),
        change: "deleted".to_string(),
        similarity: "-".to_string(),
    }));
    rows.extend(result.changed.iter().map(|item| ChangeRow {
        id: item.id.clone(),
        change: change_label(item.change_type).to_string(),
        similarity: item
            .similarity_score
            .map(|score| format!("{score:.3}"))
            .unwrap_or_else(|| "-".to_string()),
    }));
    println!("{}", Table::new(rows));
}

fn change_label(change: ChangeType) -> &'static str {
    match change {
        ChangeType::HashOnlySimilar => "hash_only_similar",
        ChangeType::SemanticDivergence => "semantic_divergence",
        ChangeType::NoEmbeddingsFound => "no_embeddings_found",
    }
}

async fn list_snapshots(config: &FolioConfig, tenant: &str) -> Result<(), anyhow::Error> {
    let reader = open_reader(config).await?;
    let ids = reader.list_snapshots(tenant).await?;

    let mut snapshots = Vec::new();
    for id in ids {
        match reader.load_manifest(tenant, &id).await {
            Ok(manifest) => snapshots.push(SnapshotInfo {
                id,
                created: format_timestamp(manifest.created_at),
                items: manifest.len(),
            }),
            Err(e) => warn!("Failed to load manifest for {}: {}", id, e),
        }
    }

    if snapshots.is_empty() {
        println!("No snapshots found for tenant '{tenant}'");
    } else {
        snapshots.sort_by(|a, b| a.created.cmp(&b.created));
        println!("{}", Table::new(snapshots));
    }
    Ok(())
}

async fn verify_snapshot(config: &FolioConfig, tenant: &str, snapshot: &str) -> Result<(), anyhow::Error> {
    info!("Verifying snapshot: {}", snapshot);
    let reader = open_reader(config).await?;

    match reader.verify_snapshot(tenant, snapshot).await {
        Ok(metadata) => {
            println!("✓ Snapshot is valid and integrity check passed");
            println!("  Items: {}", metadata.item_count);
            println!("  Created: {}", format_timestamp(metadata.timestamp));
            println!("  Payload Hash: {}", metadata.payload_hash);
            println!("  Size: {}", format_size(metadata.uncompressed_size as u64));
            Ok(())
        }
        Err(FolioError::IntegrityCheckFailed { expected, actual }) => {
            error!("✗ Integrity check failed:");
            error!("  Expected hash: {}", expected);
            error!("  Actual hash: {}", actual);
            Err(anyhow!("Integrity check failed"))
        }
        Err(e) => {
            error!("✗ Failed to verify snapshot: {}", e);
            Err(e.into())
        }
    }
}

async fn delete_snapshot(config: &FolioConfig, tenant: &str, snapshot: &str, force: bool) -> Result<(), anyhow::Error> {
    if !force {
        print!("Are you sure you want to delete snapshot '{snapshot}' of '{tenant}'? (y/N): ");
        use std::io::{self, Write};
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().to_lowercase().starts_with('y') {
            println!("Deletion cancelled");
            return Ok(());
        }
    }

    let reader = open_reader(config).await?;
    reader.delete_snapshot(tenant, snapshot).await?;
    println!("✓ Snapshot deleted successfully");
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(timestamp: chrono::DateTime<chrono::Utc>) -> String {
    timestamp.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string()
}
