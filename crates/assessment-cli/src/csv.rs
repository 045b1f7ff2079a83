//! Line-based codec for the eleven-column assessment CSV shape.
//!
//! Parsing associates fields with columns by header *name*, never by
//! position, and yields an empty row sequence (not an error) for header-only
//! input. Writing is the exact inverse: leading BOM, every field
//! double-quoted with embedded quotes doubled, one row per scored position.

use anyhow::{anyhow, Result};
use assessment_core::{AssessmentRecord, ImportRow};

pub const BOM: char = '\u{FEFF}';

pub const HEADER: [&str; 11] = [
    "記入日",
    "利用者名",
    "管理番号",
    "評価実施者名",
    "評価期間開始",
    "評価期間終了",
    "カテゴリ",
    "項目",
    "スコア",
    "評価",
    "メモ",
];

/// Parses CSV text into named-field rows.
///
/// # Errors
/// Returns an error when the header row is missing or lacks one of the
/// required columns (カテゴリ, 項目, スコア). Missing optional columns
/// resolve to empty strings per row.
pub fn parse_rows(text: &str) -> Result<Vec<ImportRow>> {
    let text = text.strip_prefix(BOM).unwrap_or(text);
    let lines: Vec<&str> = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.trim().is_empty())
        .collect();

    let Some(header_line) = lines.first() else {
        return Err(anyhow!("csv input is empty (a header row is required)"));
    };

    let header = parse_line(header_line);
    let columns = ColumnMap::from_header(&header)?;

    Ok(lines[1..]
        .iter()
        .map(|line| columns.row(&parse_line(line)))
        .collect())
}

/// Renders a stored record back to the CSV shape: one row per catalog
/// position with a non-null score, memo line breaks flattened to spaces.
#[must_use]
pub fn render_record(record: &AssessmentRecord) -> String {
    let mut rows: Vec<String> = Vec::with_capacity(record.scores.scored_count() + 1);
    rows.push(render_line(&HEADER.map(str::to_string)));

    for (position, score) in record.scores.scored() {
        let Some(item) = record.items_snapshot.get(position) else {
            continue;
        };
        let memo = record
            .memos
            .get(position)
            .unwrap_or("")
            .replace(['\r', '\n'], " ");

        rows.push(render_line(&[
            record.basic_info.entry_date.clone(),
            record.basic_info.client_name.clone(),
            record.basic_info.management_number.clone(),
            record.basic_info.evaluator_name.clone(),
            record.basic_info.start_date.clone(),
            record.basic_info.end_date.clone(),
            item.category.clone(),
            item.name.clone(),
            score.value().to_string(),
            score.label().to_string(),
            memo,
        ]));
    }

    format!("{BOM}{}", rows.join("\n"))
}

struct ColumnMap {
    entry_date: Option<usize>,
    client_name: Option<usize>,
    management_number: Option<usize>,
    evaluator_name: Option<usize>,
    period_start: Option<usize>,
    period_end: Option<usize>,
    category: usize,
    item_name: usize,
    raw_score: usize,
    rating_label: Option<usize>,
    memo: Option<usize>,
}

impl ColumnMap {
    fn from_header(header: &[String]) -> Result<Self> {
        let find = |name: &str| header.iter().position(|cell| cell.trim() == name);
        let require = |name: &str| {
            find(name).ok_or_else(|| anyhow!("csv is missing the required column {name}"))
        };

        Ok(Self {
            entry_date: find("記入日"),
            client_name: find("利用者名"),
            management_number: find("管理番号"),
            evaluator_name: find("評価実施者名"),
            period_start: find("評価期間開始"),
            period_end: find("評価期間終了"),
            category: require("カテゴリ")?,
            item_name: require("項目")?,
            raw_score: require("スコア")?,
            rating_label: find("評価"),
            memo: find("メモ"),
        })
    }

    fn row(&self, fields: &[String]) -> ImportRow {
        let take = |index: Option<usize>| {
            index
                .and_then(|value| fields.get(value))
                .cloned()
                .unwrap_or_default()
        };

        ImportRow {
            entry_date: take(self.entry_date),
            client_name: take(self.client_name),
            management_number: take(self.management_number),
            evaluator_name: take(self.evaluator_name),
            period_start: take(self.period_start),
            period_end: take(self.period_end),
            category: take(Some(self.category)),
            item_name: take(Some(self.item_name)),
            raw_score: take(Some(self.raw_score)),
            rating_label: take(self.rating_label),
            memo: take(self.memo),
        }
    }
}

// Quote-aware field scanner; "" inside a quoted field is a literal quote.
fn parse_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                if in_quote && chars.peek() == Some(&'"') {
                    current.push('"');
                    let _ = chars.next();
                } else {
                    in_quote = !in_quote;
                }
            }
            ',' if !in_quote => fields.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }

    fields.push(current);
    fields
}

fn render_line(fields: &[String]) -> String {
    fields
        .iter()
        .map(|field| format!("\"{}\"", field.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(",")
}
