//! Operator command surface for the assessment toolkit: catalog diagnosis,
//! CSV reconciliation preview/import, round-trip export, and per-client
//! history management.
//!
//! Data-quality findings (unmatched rows, duplicate keys, catalog key
//! collisions) are reported, never raised; only structural failures (empty
//! catalog, no data rows, zero matches, blank client name) abort a command.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use assessment_core::{
    average_score, normalize_date, now_utc, reconcile, unix_millis, AssessmentRecord, BasicInfo,
    CatalogIndex, CatalogItem, ClientKey, CompositeKey, ImportRow, KeyCollision, Reconciliation,
    Score,
};
use assessment_store_sqlite::SqliteHistoryStore;
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub mod csv;

#[derive(Debug, Parser)]
#[command(name = "assess")]
#[command(about = "Assessment reconciliation and client history CLI")]
pub struct Cli {
    #[arg(long, default_value = "./assessments.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = "./items.json")]
    items: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
    Reconcile {
        #[command(subcommand)]
        command: ReconcileCommand,
    },
    Import(ImportArgs),
    Export(ExportArgs),
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum CatalogCommand {
    Check(CatalogCheckArgs),
}

#[derive(Debug, Args)]
pub struct CatalogCheckArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ReconcileCommand {
    Preview(ReconcilePreviewArgs),
}

#[derive(Debug, Args)]
pub struct ReconcilePreviewArgs {
    #[arg(long)]
    csv: PathBuf,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[arg(long)]
    csv: PathBuf,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    #[arg(long)]
    client: String,
    #[arg(long)]
    id: i64,
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum HistoryCommand {
    List(HistoryListArgs),
    Show(HistoryShowArgs),
    Delete(HistoryDeleteArgs),
}

#[derive(Debug, Args)]
pub struct HistoryListArgs {
    #[arg(long)]
    client: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct HistoryShowArgs {
    #[arg(long)]
    client: String,
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
pub struct HistoryDeleteArgs {
    #[arg(long)]
    client: String,
    #[arg(long)]
    id: i64,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when catalog loading, CSV parsing, reconciliation
/// preconditions, or store access fail.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Catalog { command } => run_catalog(command, &cli.items),
        Command::Reconcile { command } => run_reconcile(command, &cli.items),
        Command::Import(args) => {
            let mut store = open_store(&cli.db)?;
            run_import(&args, &cli.items, &mut store)
        }
        Command::Export(args) => {
            let store = open_store(&cli.db)?;
            run_export(&args, &store)
        }
        Command::History { command } => {
            let mut store = open_store(&cli.db)?;
            run_history(command, &mut store)
        }
    }
}

fn open_store(path: &Path) -> Result<SqliteHistoryStore> {
    let store = SqliteHistoryStore::open(path)?;
    store.migrate()?;
    Ok(store)
}

/// Loads the ordered item catalog from `items.json`, accepting either a
/// bare array of items or an object carrying an `items` array.
///
/// # Errors
/// Returns an error for unreadable files, malformed JSON, and empty
/// catalogs (an empty catalog is a structural failure, not a warning).
pub fn load_catalog(path: &Path) -> Result<Vec<CatalogItem>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read catalog at {}", path.display()))?;
    let parsed: CatalogFile = serde_json::from_str(&raw)
        .with_context(|| format!("catalog at {} is not valid JSON", path.display()))?;

    let items = match parsed {
        CatalogFile::Wrapped { items } => items,
        CatalogFile::Bare(items) => items,
    };

    if items.is_empty() {
        return Err(anyhow!("catalog at {} contains no items", path.display()));
    }
    Ok(items)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CatalogFile {
    Wrapped { items: Vec<CatalogItem> },
    Bare(Vec<CatalogItem>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogCheckReport {
    pub contract_version: String,
    pub item_count: usize,
    pub distinct_keys: usize,
    pub healthy: bool,
    pub collisions: Vec<KeyCollision>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignmentView {
    pub position: usize,
    pub category: String,
    pub name: String,
    pub score: Option<Score>,
    pub memo: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconcileReport {
    pub contract_version: String,
    pub match_count: usize,
    pub total_rows: usize,
    pub unmatched_rows: usize,
    pub duplicate_keys: Vec<CompositeKey>,
    pub catalog_collisions: Vec<KeyCollision>,
    pub average_score: f64,
    pub assignments: Vec<AssignmentView>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportReport {
    pub contract_version: String,
    pub client_key: String,
    pub record_id: i64,
    pub match_count: usize,
    pub total_rows: usize,
    pub unmatched_rows: usize,
    pub duplicate_keys: Vec<CompositeKey>,
    pub average_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistorySummary {
    pub id: i64,
    pub entry_date: String,
    pub client_name: String,
    pub management_number: String,
    pub evaluator_name: String,
    pub start_date: String,
    pub end_date: String,
    pub average_score: f64,
    pub scored_items: usize,
    pub item_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryListReport {
    pub contract_version: String,
    pub client_key: String,
    pub records: Vec<HistorySummary>,
}

fn run_catalog(command: CatalogCommand, items: &Path) -> Result<()> {
    match command {
        CatalogCommand::Check(args) => {
            let catalog = load_catalog(items)?;
            let index = CatalogIndex::build(&catalog).map_err(|err| anyhow!(err.to_string()))?;

            for collision in index.collisions() {
                warn!(
                    key = %collision.key,
                    first_position = collision.first_position,
                    duplicate_position = collision.duplicate_position,
                    "catalog items normalize to the same composite key"
                );
            }

            let report = CatalogCheckReport {
                contract_version: "catalog_check.v1".to_string(),
                item_count: catalog.len(),
                distinct_keys: index.len(),
                healthy: index.collisions().is_empty(),
                collisions: index.collisions().to_vec(),
            };

            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_catalog_check(&report);
            }

            if !report.healthy {
                return Err(anyhow!(
                    "catalog check failed: {} composite key collision(s); later items can never be matched",
                    report.collisions.len()
                ));
            }
            Ok(())
        }
    }
}

fn run_reconcile(command: ReconcileCommand, items: &Path) -> Result<()> {
    match command {
        ReconcileCommand::Preview(args) => {
            let catalog = load_catalog(items)?;
            let rows = read_rows(&args.csv)?;
            let outcome = reconcile_with_warnings(&catalog, &rows)?;
            let report = build_reconcile_report(&catalog, &outcome);

            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_reconcile_report(&report);
            }
            Ok(())
        }
    }
}

fn run_import(args: &ImportArgs, items: &Path, store: &mut SqliteHistoryStore) -> Result<()> {
    let catalog = load_catalog(items)?;
    let rows = read_rows(&args.csv)?;
    let outcome = reconcile_with_warnings(&catalog, &rows)?;

    if outcome.match_count == 0 {
        return Err(anyhow!(
            "no row matched the catalog; refusing to create a record \
             (check that カテゴリ/項目 values match the current catalog)"
        ));
    }

    let basic_info = basic_info_from_rows(&rows)?;
    let client = ClientKey::derive(&basic_info.client_name).map_err(|err| anyhow!(err.to_string()))?;

    let history = store.list(&client)?;
    let timestamp = now_utc();
    let record = AssessmentRecord {
        id: allocate_record_id(&history, unix_millis(timestamp)),
        basic_info,
        scores: outcome.scores.clone(),
        memos: outcome.memos.clone(),
        items_snapshot: catalog,
        timestamp,
    };
    store.append(&client, &record)?;

    let report = ImportReport {
        contract_version: "import_report.v1".to_string(),
        client_key: client.as_str().to_string(),
        record_id: record.id,
        match_count: outcome.match_count,
        total_rows: outcome.total_rows,
        unmatched_rows: outcome.unmatched_rows,
        duplicate_keys: outcome.duplicate_keys.iter().cloned().collect(),
        average_score: average_score(&outcome.scores),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "imported record {} for client {} ({}/{} rows matched, average {:.2})",
            report.record_id,
            report.client_key,
            report.match_count,
            report.total_rows,
            report.average_score
        );
    }
    Ok(())
}

fn run_export(args: &ExportArgs, store: &SqliteHistoryStore) -> Result<()> {
    let client = ClientKey::derive(&args.client).map_err(|err| anyhow!(err.to_string()))?;
    let Some(record) = store.find(&client, args.id)? else {
        return Err(anyhow!(
            "record {} not found for client {}",
            args.id,
            client
        ));
    };

    let rendered = csv::render_record(&record);
    match &args.output {
        Some(path) => {
            fs::write(path, rendered)
                .with_context(|| format!("failed to write csv to {}", path.display()))?;
            println!("exported record {} to {}", args.id, path.display());
        }
        None => print!("{rendered}"),
    }
    Ok(())
}

fn run_history(command: HistoryCommand, store: &mut SqliteHistoryStore) -> Result<()> {
    match command {
        HistoryCommand::List(args) => {
            let client = ClientKey::derive(&args.client).map_err(|err| anyhow!(err.to_string()))?;
            let records = store.list(&client)?;

            let report = HistoryListReport {
                contract_version: "history_list.v1".to_string(),
                client_key: client.as_str().to_string(),
                records: records.iter().map(summarize).collect(),
            };

            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_history_list(&report);
            }
            Ok(())
        }
        HistoryCommand::Show(args) => {
            let client = ClientKey::derive(&args.client).map_err(|err| anyhow!(err.to_string()))?;
            let Some(record) = store.find(&client, args.id)? else {
                return Err(anyhow!(
                    "record {} not found for client {}",
                    args.id,
                    client
                ));
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        HistoryCommand::Delete(args) => {
            let client = ClientKey::derive(&args.client).map_err(|err| anyhow!(err.to_string()))?;
            if store.remove(&client, args.id)? {
                println!("removed record {} for client {}", args.id, client);
            } else {
                println!("no record {} for client {}", args.id, client);
            }
            Ok(())
        }
    }
}

fn read_rows(path: &Path) -> Result<Vec<ImportRow>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read csv at {}", path.display()))?;
    csv::parse_rows(&text)
}

fn reconcile_with_warnings(
    catalog: &[CatalogItem],
    rows: &[ImportRow],
) -> Result<Reconciliation> {
    let outcome = reconcile(catalog, rows).map_err(|err| anyhow!(err.to_string()))?;

    for collision in &outcome.catalog_collisions {
        warn!(
            key = %collision.key,
            first_position = collision.first_position,
            duplicate_position = collision.duplicate_position,
            "catalog items normalize to the same composite key"
        );
    }
    if outcome.unmatched_rows > 0 {
        warn!(
            unmatched_rows = outcome.unmatched_rows,
            total_rows = outcome.total_rows,
            "rows did not match any catalog item"
        );
    }
    for key in &outcome.duplicate_keys {
        warn!(%key, "duplicate key within one import; the later row wins");
    }

    Ok(outcome)
}

fn basic_info_from_rows(rows: &[ImportRow]) -> Result<BasicInfo> {
    let first = rows
        .first()
        .ok_or_else(|| anyhow!("csv has no data rows"))?;

    if first.client_name.trim().is_empty() {
        return Err(anyhow!("利用者名 is missing from the first data row"));
    }

    Ok(BasicInfo {
        client_name: first.client_name.trim().to_string(),
        management_number: first.management_number.trim().to_string(),
        evaluator_name: first.evaluator_name.trim().to_string(),
        entry_date: normalize_date(&first.entry_date),
        start_date: normalize_date(&first.period_start),
        end_date: normalize_date(&first.period_end),
    })
}

// Ids are creation-time milliseconds, bumped past the newest existing id so
// two imports inside the same millisecond stay unique within a history.
fn allocate_record_id(history: &[AssessmentRecord], now_ms: i64) -> i64 {
    let max_existing = history.iter().map(|record| record.id).max().unwrap_or(0);
    now_ms.max(max_existing + 1)
}

fn build_reconcile_report(catalog: &[CatalogItem], outcome: &Reconciliation) -> ReconcileReport {
    let assignments = catalog
        .iter()
        .enumerate()
        .map(|(position, item)| AssignmentView {
            position,
            category: item.category.clone(),
            name: item.name.clone(),
            score: outcome.scores.get(position),
            memo: outcome.memos.get(position).map(str::to_string),
        })
        .collect();

    ReconcileReport {
        contract_version: "reconcile_report.v1".to_string(),
        match_count: outcome.match_count,
        total_rows: outcome.total_rows,
        unmatched_rows: outcome.unmatched_rows,
        duplicate_keys: outcome.duplicate_keys.iter().cloned().collect(),
        catalog_collisions: outcome.catalog_collisions.clone(),
        average_score: average_score(&outcome.scores),
        assignments,
    }
}

fn summarize(record: &AssessmentRecord) -> HistorySummary {
    HistorySummary {
        id: record.id,
        entry_date: record.basic_info.entry_date.clone(),
        client_name: record.basic_info.client_name.clone(),
        management_number: record.basic_info.management_number.clone(),
        evaluator_name: record.basic_info.evaluator_name.clone(),
        start_date: record.basic_info.start_date.clone(),
        end_date: record.basic_info.end_date.clone(),
        average_score: average_score(&record.scores),
        scored_items: record.scores.scored_count(),
        item_count: record.items_snapshot.len(),
    }
}

fn print_catalog_check(report: &CatalogCheckReport) {
    println!(
        "contract={} items={} distinct_keys={} healthy={}",
        report.contract_version,
        report.item_count,
        report.distinct_keys,
        if report.healthy { "yes" } else { "no" }
    );
    for collision in &report.collisions {
        println!(
            "collision key={} first_position={} duplicate_position={}",
            collision.key, collision.first_position, collision.duplicate_position
        );
    }
}

fn print_reconcile_report(report: &ReconcileReport) {
    println!(
        "contract={} matched={}/{} unmatched={} duplicates={} average={:.2}",
        report.contract_version,
        report.match_count,
        report.total_rows,
        report.unmatched_rows,
        report.duplicate_keys.len(),
        report.average_score
    );
    println!("{:<5} {:<14} {:<22} {:<6} memo", "pos", "category", "item", "score");
    println!("{}", "-".repeat(70));
    for assignment in &report.assignments {
        println!(
            "{:<5} {:<14} {:<22} {:<6} {}",
            assignment.position,
            assignment.category,
            assignment.name,
            assignment
                .score
                .map_or_else(|| "-".to_string(), |score| score.value().to_string()),
            assignment.memo.as_deref().unwrap_or("")
        );
    }
}

fn print_history_list(report: &HistoryListReport) {
    println!(
        "client={} records={}",
        report.client_key,
        report.records.len()
    );
    println!(
        "{:<15} {:<12} {:<14} {:<24} {:<8} scored",
        "id", "entry_date", "evaluator", "period", "average"
    );
    println!("{}", "-".repeat(90));
    for summary in &report.records {
        println!(
            "{:<15} {:<12} {:<14} {:<24} {:<8.2} {}/{}",
            summary.id,
            summary.entry_date,
            summary.evaluator_name,
            format!("{} - {}", summary.start_date, summary.end_date),
            summary.average_score,
            summary.scored_items,
            summary.item_count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_row() -> ImportRow {
        ImportRow {
            entry_date: "2026/4/1".to_string(),
            client_name: " 山田太郎 ".to_string(),
            management_number: "A-012".to_string(),
            evaluator_name: "佐藤".to_string(),
            period_start: "2026-3-1".to_string(),
            period_end: "2026-03-31".to_string(),
            ..ImportRow::default()
        }
    }

    #[test]
    fn basic_info_comes_from_the_first_row_with_normalized_dates() {
        let info = must(basic_info_from_rows(&[fixture_row()]));
        assert_eq!(info.client_name, "山田太郎");
        assert_eq!(info.entry_date, "2026-04-01");
        assert_eq!(info.start_date, "2026-03-01");
        assert_eq!(info.end_date, "2026-03-31");
    }

    #[test]
    fn basic_info_requires_a_client_name() {
        let mut row = fixture_row();
        row.client_name = "  ".to_string();
        assert!(basic_info_from_rows(&[row]).is_err());
        assert!(basic_info_from_rows(&[]).is_err());
    }

    #[test]
    fn record_ids_stay_unique_within_one_millisecond() {
        assert_eq!(allocate_record_id(&[], 1_700_000_000_000), 1_700_000_000_000);

        let mut record_ids = Vec::new();
        let mut history = Vec::new();
        for _ in 0..3 {
            let id = allocate_record_id(&history, 1_700_000_000_000);
            record_ids.push(id);
            history.push(fixture_record(id));
        }
        assert_eq!(
            record_ids,
            vec![1_700_000_000_000, 1_700_000_000_001, 1_700_000_000_002]
        );
    }

    fn fixture_record(id: i64) -> AssessmentRecord {
        use assessment_core::{parse_rfc3339_utc, MemoMap, ScoreMap};

        let catalog = vec![CatalogItem {
            category: "職業生活".to_string(),
            name: "欠席等の連絡".to_string(),
            description: None,
        }];
        let mut scores = ScoreMap::for_catalog(1);
        scores.set(0, Score::Good);

        AssessmentRecord {
            id,
            basic_info: BasicInfo {
                client_name: "山田太郎".to_string(),
                management_number: String::new(),
                evaluator_name: "佐藤".to_string(),
                entry_date: "2026-04-01".to_string(),
                start_date: "2026-03-01".to_string(),
                end_date: "2026-03-31".to_string(),
            },
            scores,
            memos: MemoMap::for_catalog(1),
            items_snapshot: catalog,
            timestamp: must(
                parse_rfc3339_utc("2026-04-01T09:00:00Z").map_err(|err| anyhow!(err.to_string())),
            ),
        }
    }

    #[test]
    fn import_report_contract_is_stable_v1() {
        let report = ImportReport {
            contract_version: "import_report.v1".to_string(),
            client_key: "___".to_string(),
            record_id: 1_700_000_000_000,
            match_count: 2,
            total_rows: 3,
            unmatched_rows: 1,
            duplicate_keys: vec![CompositeKey::from_parts("職業生活", "欠席等の連絡")],
            average_score: 4.0,
        };

        let value = must(serde_json::to_value(report).map_err(Into::into));
        assert_eq!(
            value,
            json!({
                "contract_version": "import_report.v1",
                "client_key": "___",
                "record_id": 1_700_000_000_000_i64,
                "match_count": 2,
                "total_rows": 3,
                "unmatched_rows": 1,
                "duplicate_keys": ["職業生活__欠席等の連絡"],
                "average_score": 4.0
            })
        );
    }

    #[test]
    fn reconcile_report_lists_every_catalog_position() {
        let catalog = vec![
            CatalogItem {
                category: "職業生活".to_string(),
                name: "欠席等の連絡".to_string(),
                description: None,
            },
            CatalogItem {
                category: "作業力".to_string(),
                name: "正確性".to_string(),
                description: None,
            },
        ];
        let rows = vec![ImportRow {
            category: "作業力".to_string(),
            item_name: "正確性".to_string(),
            raw_score: "５".to_string(),
            ..ImportRow::default()
        }];

        let outcome = must(reconcile(&catalog, &rows).map_err(|err| anyhow!(err.to_string())));
        let report = build_reconcile_report(&catalog, &outcome);

        assert_eq!(report.assignments.len(), 2);
        assert_eq!(report.assignments[0].score, None);
        assert_eq!(report.assignments[1].score, Some(Score::Excellent));
        assert!((report.average_score - 5.0).abs() < f64::EPSILON);
    }
}
