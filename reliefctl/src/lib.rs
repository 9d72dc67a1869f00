use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use relief_core::events::EventDisposition;
use relief_core::{
    load_relief_config, load_seed_dir, AllocationPlan, CoordinatorOptions, DisasterEvent,
    FlushReport, PlanningCoordinator, Quantities, ReliefConfig, RejectedEvent, ReplanTicket,
    SqliteEntityStore, SubmitReceipt, ZoneStatus,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub mod server;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] relief_core::ConfigError),
    #[error("store error: {0}")]
    Store(#[from] relief_core::StoreError),
    #[error("event error: {0}")]
    Reconcile(#[from] relief_core::ReconcileError),
    #[error("planning error: {0}")]
    Plan(#[from] relief_core::PlanError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Relief dispatch planning control interface", long_about = None)]
pub struct Cli {
    /// Path to relief.toml
    #[arg(long, default_value = "configs/relief.toml")]
    pub config: PathBuf,
    /// Override for the SQLite store (replaces paths.store_file)
    #[arg(long)]
    pub store: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the HTTP API and the background event flush
    Serve(ServeArgs),
    /// Shows depots, zones and the event log summary
    Status,
    /// Computes an allocation plan and applies it
    Plan(PlanArgs),
    /// Event ingestion
    #[command(subcommand)]
    Event(EventCommands),
    /// Loads reference data from a seed directory
    Seed(SeedArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Listen address (defaults to server.bind)
    #[arg(long)]
    pub bind: Option<String>,
}

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Print the plan without applying it
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug)]
pub enum EventCommands {
    /// Submits one event or a JSON array of events and applies them
    Submit(EventSubmitArgs),
}

#[derive(Args, Debug)]
pub struct EventSubmitArgs {
    /// JSON file holding the event(s)
    #[arg(long)]
    pub file: PathBuf,
}

#[derive(Args, Debug)]
pub struct SeedArgs {
    /// Seed directory (defaults to paths.seed_dir)
    #[arg(long)]
    pub from: Option<PathBuf>,
}

pub fn run(cli: Cli) -> Result<()> {
    let config = load_relief_config(&cli.config)?;
    init_tracing(&config.system.log_level);
    let context = AppContext::new(&cli, config)?;

    match &cli.command {
        Commands::Serve(args) => {
            let bind = args
                .bind
                .clone()
                .unwrap_or_else(|| context.config.server.bind.clone());
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(server::serve(
                Arc::clone(&context.coordinator),
                &bind,
                context.config.flush_interval(),
            ))?;
        }
        Commands::Status => {
            let status = context.gather_status();
            render(&status, cli.format)?;
        }
        Commands::Plan(args) => {
            let outcome = context.plan(args)?;
            render(&outcome, cli.format)?;
        }
        Commands::Event(EventCommands::Submit(args)) => {
            let report = context.submit_file(&args.file)?;
            render(&report, cli.format)?;
        }
        Commands::Seed(args) => {
            let report = context.seed(args.from.as_deref())?;
            render(&report, cli.format)?;
        }
    }

    Ok(())
}

/// Installs the fmt subscriber once; `RUST_LOG` wins over `system.log_level`.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: ReliefConfig,
    store_path: PathBuf,
    coordinator: Arc<PlanningCoordinator>,
}

impl AppContext {
    fn new(cli: &Cli, config: ReliefConfig) -> Result<Self> {
        let store_path = cli.store.clone().unwrap_or_else(|| config.store_path());

        let store = SqliteEntityStore::builder()
            .path(&store_path)
            .create_if_missing(true)
            .build()?;
        store.initialize()?;
        let coordinator =
            PlanningCoordinator::open(Arc::new(store), CoordinatorOptions::from_config(&config))?;

        Ok(Self {
            config,
            store_path,
            coordinator: Arc::new(coordinator),
        })
    }

    fn gather_status(&self) -> StatusReport {
        let store = self.coordinator.read();
        let depots = store
            .depots()
            .map(|depot| DepotLine {
                id: depot.id.clone(),
                name: depot.name.clone(),
                inventory: depot.inventory.clone(),
                capacity: depot.capacity.clone(),
            })
            .collect();
        let zones = store
            .zones()
            .map(|zone| ZoneLine {
                id: zone.id.clone(),
                name: zone.name.clone(),
                severity: zone.severity.as_str().to_string(),
                status: zone.status,
                demand: zone.demand.values().fold(0, |sum: u64, q| sum.saturating_add(*q)),
                fulfilled: zone.fulfilled.values().fold(0, |sum: u64, q| sum.saturating_add(*q)),
                unfulfilled: zone.total_unfulfilled(),
            })
            .collect();
        let events = store.events();

        StatusReport {
            node: NodeStatus {
                node_name: self.config.system.node_name.clone(),
                environment: self.config.system.environment.clone(),
            },
            store_path: self.store_path.display().to_string(),
            version: store.version(),
            asset_types: store.asset_types().map(|asset| asset.id.clone()).collect(),
            depots,
            zones,
            events_applied: events.count(EventDisposition::Applied),
            events_rejected: events.count(EventDisposition::Rejected),
        }
    }

    fn plan(&self, args: &PlanArgs) -> Result<PlanOutcome> {
        let now = Utc::now();
        if args.dry_run {
            return Ok(PlanOutcome::Preview {
                plan: self.coordinator.preview(now),
            });
        }
        let ticket = self.coordinator.request_replan(now)?;
        Ok(PlanOutcome::Applied { ticket })
    }

    /// Submits every event in the file, then applies all staged events in
    /// timestamp order since a one-shot process cannot wait out the window.
    fn submit_file(&self, path: &Path) -> Result<EventBatchReport> {
        let content = fs::read_to_string(path)?;
        let events = match serde_json::from_str::<EventFile>(&content)? {
            EventFile::Many(events) => events,
            EventFile::One(event) => vec![event],
        };

        let now = Utc::now();
        let mut report = EventBatchReport::default();
        for event in events {
            let event_id = event.id.clone();
            match self.coordinator.submit(event, now) {
                Ok(receipt) => report.submitted.push(receipt),
                Err(err) => report.refused.push(RejectedEvent {
                    event_id,
                    code: err.code(),
                    reason: err.to_string(),
                }),
            }
        }
        report.flush = self.coordinator.drain(now)?;
        info!(
            target: "reliefctl",
            file = %path.display(),
            submitted = report.submitted.len(),
            refused = report.refused.len(),
            "event file processed"
        );
        Ok(report)
    }

    fn seed(&self, from: Option<&Path>) -> Result<SeedReport> {
        let dir = from
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.seed_dir());
        let seed = load_seed_dir(&dir)?;
        let changes = self.coordinator.seed(seed)?;
        Ok(SeedReport {
            dir: dir.display().to_string(),
            asset_types: changes.asset_types.len(),
            depots: changes.depots.len(),
            zones: changes.zones.len(),
            version: self.coordinator.read().version(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EventFile {
    Many(Vec<DisasterEvent>),
    One(DisasterEvent),
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub node: NodeStatus,
    pub store_path: String,
    pub version: u64,
    pub asset_types: Vec<String>,
    pub depots: Vec<DepotLine>,
    pub zones: Vec<ZoneLine>,
    pub events_applied: usize,
    pub events_rejected: usize,
}

#[derive(Debug, Serialize)]
pub struct NodeStatus {
    pub node_name: String,
    pub environment: String,
}

#[derive(Debug, Serialize)]
pub struct DepotLine {
    pub id: String,
    pub name: String,
    pub inventory: Quantities,
    pub capacity: Quantities,
}

#[derive(Debug, Serialize)]
pub struct ZoneLine {
    pub id: String,
    pub name: String,
    pub severity: String,
    pub status: ZoneStatus,
    pub demand: u64,
    pub fulfilled: u64,
    pub unfulfilled: u64,
}

impl DisplayFallback for StatusReport {
    fn display(&self) -> String {
        let mut lines = vec![
            format!(
                "Node: {} (env: {})",
                self.node.node_name, self.node.environment
            ),
            format!("Store: {} @ version {}", self.store_path, self.version),
        ];
        if self.depots.is_empty() && self.zones.is_empty() {
            lines.push("Store is empty; run `reliefctl seed` first".to_string());
            return lines.join("\n");
        }
        lines.push(format!("Asset types: {}", self.asset_types.join(", ")));
        lines.push("Depots:".to_string());
        for depot in &self.depots {
            let stock: Vec<String> = depot
                .inventory
                .iter()
                .map(|(asset_type, quantity)| {
                    let capacity = depot.capacity.get(asset_type).copied().unwrap_or(0);
                    format!("{asset_type} {quantity}/{capacity}")
                })
                .collect();
            lines.push(format!("  - {} ({}): {}", depot.id, depot.name, stock.join(", ")));
        }
        lines.push("Zones:".to_string());
        for zone in &self.zones {
            lines.push(format!(
                "  - {} [{} | {}] fulfilled {}/{} (open {})",
                zone.id, zone.severity, zone.status, zone.fulfilled, zone.demand, zone.unfulfilled
            ));
        }
        lines.push(format!(
            "Events: {} applied, {} rejected",
            self.events_applied, self.events_rejected
        ));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PlanOutcome {
    Preview { plan: AllocationPlan },
    Applied { ticket: ReplanTicket },
}

impl DisplayFallback for PlanOutcome {
    fn display(&self) -> String {
        match self {
            PlanOutcome::Preview { plan } => format!("[dry run]\n{}", plan.display()),
            PlanOutcome::Applied { ticket } => ticket.display(),
        }
    }
}

impl DisplayFallback for ReplanTicket {
    fn display(&self) -> String {
        match self {
            ReplanTicket::Completed {
                plan: Some(plan),
                passes,
            } => format!("{}\n({passes} pass(es))", plan.display()),
            ReplanTicket::Completed { plan: None, .. } => "No plan produced".to_string(),
            ReplanTicket::Scheduled => "Planning already running; request coalesced".to_string(),
        }
    }
}

impl DisplayFallback for AllocationPlan {
    fn display(&self) -> String {
        let mut out = format!(
            "Plan {} (version {}, {} line items, total cost {:.2})",
            self.plan_id,
            self.snapshot_version,
            self.line_items.len(),
            self.total_cost
        );
        for (item, rationale) in self.line_items.iter().zip(&self.rationales) {
            let _ = write!(out, "\n  - {item} | {rationale}");
        }
        for (zone_id, missing) in &self.shortfall {
            let parts: Vec<String> = missing
                .iter()
                .map(|(asset_type, quantity)| format!("{asset_type} {quantity}"))
                .collect();
            let _ = write!(out, "\n  ! shortfall {zone_id}: {}", parts.join(", "));
        }
        let _ = write!(
            out,
            "\nCoverage {:.1}% | fairness {:.1}% | median unit cost {:.2}",
            self.kpis.coverage_percent, self.kpis.fairness_percent, self.kpis.median_unit_cost
        );
        out
    }
}

#[derive(Debug, Default, Serialize)]
pub struct EventBatchReport {
    pub submitted: Vec<SubmitReceipt>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub refused: Vec<RejectedEvent>,
    pub flush: FlushReport,
}

impl DisplayFallback for EventBatchReport {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for receipt in &self.submitted {
            lines.push(format!("{} accepted ({:?})", receipt.event_id, receipt.status));
        }
        for refused in self.refused.iter().chain(&self.flush.rejected) {
            lines.push(format!(
                "{} rejected [{}]: {}",
                refused.event_id, refused.code, refused.reason
            ));
        }
        lines.push(format!("{} event(s) applied", self.flush.applied.len()));
        if let Some(ticket) = &self.flush.replan {
            lines.push(ticket.display());
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct SeedReport {
    pub dir: String,
    pub asset_types: usize,
    pub depots: usize,
    pub zones: usize,
    pub version: u64,
}

impl DisplayFallback for SeedReport {
    fn display(&self) -> String {
        format!(
            "Seeded from {}: {} asset types, {} depots, {} zones (version {})",
            self.dir, self.asset_types, self.depots, self.zones, self.version
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn prepare_test_context() -> Result<(TempDir, AppContext)> {
        let temp = TempDir::new().unwrap();
        let cli = Cli {
            config: PathBuf::from("../configs/relief.toml"),
            store: Some(temp.path().join("data").join("relief.sqlite")),
            format: OutputFormat::Json,
            command: Commands::Status,
        };
        let config = load_relief_config(&cli.config)?;
        let context = AppContext::new(&cli, config)?;
        context.seed(Some(Path::new("../data/seed")))?;
        Ok((temp, context))
    }

    #[test]
    fn status_lists_seeded_entities() {
        let (_temp, context) = prepare_test_context().unwrap();
        let status = context.gather_status();
        assert_eq!(status.node.node_name, "relief-primary");
        assert_eq!(status.depots.len(), 3);
        assert_eq!(status.zones.len(), 4);
        assert_eq!(status.asset_types, vec!["food", "medical", "water"]);
        assert!(status.zones.iter().all(|zone| zone.fulfilled == 0));
    }

    #[test]
    fn dry_run_leaves_the_store_alone() {
        let (_temp, context) = prepare_test_context().unwrap();
        let version = context.coordinator.read().version();

        let outcome = context.plan(&PlanArgs { dry_run: true }).unwrap();
        assert!(matches!(outcome, PlanOutcome::Preview { ref plan } if !plan.is_empty()));
        assert_eq!(context.coordinator.read().version(), version);

        let outcome = context.plan(&PlanArgs { dry_run: false }).unwrap();
        assert!(matches!(
            outcome,
            PlanOutcome::Applied {
                ticket: ReplanTicket::Completed { plan: Some(_), .. }
            }
        ));
        assert_eq!(context.coordinator.read().version(), version + 1);
    }

    #[test]
    fn event_file_is_submitted_and_applied() {
        let (temp, context) = prepare_test_context().unwrap();
        let path = temp.path().join("events.json");
        let body = serde_json::json!([
            {
                "id": "evt-spike",
                "timestamp": Utc::now(),
                "kind": "ZONE_UPDATED",
                "zone_id": "zone-taguig",
                "additional_demand": {"water": 250}
            },
            {
                "id": "evt-ghost",
                "timestamp": Utc::now(),
                "kind": "ZONE_RESOLVED",
                "zone_id": "zone-nowhere"
            }
        ]);
        fs::write(&path, serde_json::to_string(&body).unwrap()).unwrap();

        let report = context.submit_file(&path).unwrap();
        assert_eq!(report.submitted.len(), 2);
        assert_eq!(report.flush.applied.len(), 1);
        assert_eq!(report.flush.rejected.len(), 1);
        assert_eq!(report.flush.rejected[0].code, "unknown_zone");

        let store = context.coordinator.read();
        assert_eq!(
            store.zone("zone-taguig").unwrap().demand_of("water"),
            1500 + 250
        );
    }
}
