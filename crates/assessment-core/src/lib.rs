use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AssessmentError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("catalog error: {0}")]
    Catalog(String),
}

/// One evaluator-facing rating on the fixed 1..=5 scale.
///
/// The numeric value is the persisted form; the label is the human-readable
/// rating text carried in exports for review, never consulted when scoring.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(into = "u8", try_from = "u8")]
pub enum Score {
    SevereDifficulty,
    NeedsSupport,
    Average,
    Good,
    Excellent,
}

impl Score {
    #[must_use]
    pub fn value(self) -> u8 {
        match self {
            Self::SevereDifficulty => 1,
            Self::NeedsSupport => 2,
            Self::Average => 3,
            Self::Good => 4,
            Self::Excellent => 5,
        }
    }

    #[must_use]
    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::SevereDifficulty),
            2 => Some(Self::NeedsSupport),
            3 => Some(Self::Average),
            4 => Some(Self::Good),
            5 => Some(Self::Excellent),
            _ => None,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::SevereDifficulty => "非常に困難",
            Self::NeedsSupport => "支援が必要",
            Self::Average => "普通",
            Self::Good => "良好",
            Self::Excellent => "非常に良好",
        }
    }
}

impl From<Score> for u8 {
    fn from(score: Score) -> Self {
        score.value()
    }
}

impl TryFrom<u8> for Score {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_value(value).ok_or_else(|| format!("score value MUST be in [1,5], got {value}"))
    }
}

impl Display for Score {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// One entry of the externally supplied, ordered item catalog.
///
/// A catalog item's durable identity is its position (index) in catalog
/// order; category and name only matter for matching imported rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogItem {
    pub category: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Normalized `category + name` join key between catalog items and
/// imported rows.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct CompositeKey(String);

const COMPOSITE_KEY_SEPARATOR: &str = "__";

impl CompositeKey {
    #[must_use]
    pub fn from_parts(category: &str, name: &str) -> Self {
        Self(format!(
            "{}{COMPOSITE_KEY_SEPARATOR}{}",
            normalize_text(category),
            normalize_text(name)
        ))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CompositeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonicalizes free text for matching: trims, converts every Unicode
/// whitespace character (including the full-width space U+3000) to an ASCII
/// space, collapses runs, and strips line breaks. Idempotent.
#[must_use]
pub fn normalize_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Maps full-width digits (U+FF10..=U+FF19) to their ASCII equivalents;
/// every other character passes through unchanged.
#[must_use]
pub fn normalize_digits(input: &str) -> String {
    input
        .chars()
        .map(|ch| match ch {
            '\u{FF10}'..='\u{FF19}' => {
                let offset = u32::from(ch) - u32::from('\u{FF10}');
                char::from(b'0' + u8::try_from(offset).unwrap_or(0))
            }
            other => other,
        })
        .collect()
}

/// Parses a raw score field into the 1..=5 domain.
///
/// Full-width digits and surrounding whitespace are tolerated; fractional,
/// out-of-range, and non-numeric input all yield `None`. `None` is the
/// first-class "no score" state and is never coerced to zero downstream.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn normalize_score(raw: &str) -> Option<Score> {
    let cleaned = normalize_digits(raw);
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return None;
    }

    let parsed: f64 = trimmed.parse().ok()?;
    if !parsed.is_finite() || parsed.fract() != 0.0 {
        return None;
    }
    if !(1.0..=5.0).contains(&parsed) {
        return None;
    }

    Score::from_value(parsed as u8)
}

/// Canonicalizes a date field to `YYYY-MM-DD`.
///
/// Already-canonical input is returned unchanged; `YYYY[/-]M[/-]D` with one-
/// or two-digit month/day is zero-padded; anything else yields an empty
/// string as the explicit unparseable signal. Never guesses.
#[must_use]
pub fn normalize_date(raw: &str) -> String {
    let trimmed = raw.trim();
    if is_iso_date(trimmed) {
        return trimmed.to_string();
    }

    let parts: Vec<&str> = trimmed.split(['/', '-']).collect();
    if parts.len() == 3
        && parts[0].len() == 4
        && (1..=2).contains(&parts[1].len())
        && (1..=2).contains(&parts[2].len())
        && parts
            .iter()
            .all(|part| part.chars().all(|ch| ch.is_ascii_digit()))
    {
        return format!("{}-{:0>2}-{:0>2}", parts[0], parts[1], parts[2]);
    }

    String::new()
}

fn is_iso_date(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && [0_usize, 1, 2, 3, 5, 6, 8, 9]
            .iter()
            .all(|&index| bytes[index].is_ascii_digit())
}

/// Sanitized storage identity derived from a raw client name.
///
/// Characters outside `[A-Za-z0-9._-]` become `_`. Distinct raw names can
/// sanitize to the same key; callers that need to disambiguate must keep the
/// raw name in the record itself (and do, via `BasicInfo`).
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ClientKey(String);

impl ClientKey {
    /// Derives the storage key for a raw client name.
    ///
    /// # Errors
    /// Returns [`AssessmentError::Validation`] when the name is blank; a
    /// blank name is an invalid key and every store operation refuses it.
    pub fn derive(raw_name: &str) -> Result<Self, AssessmentError> {
        let trimmed = raw_name.trim();
        if trimmed.is_empty() {
            return Err(AssessmentError::Validation(
                "client name MUST NOT be blank".to_string(),
            ));
        }

        let sanitized = trimmed
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        Ok(Self(sanitized))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ClientKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position-keyed score assignments covering every catalog position.
///
/// `None` means "explicitly unset" and is distinct from an absent entry;
/// [`ScoreMap::for_catalog`] seeds the full position range so downstream
/// consumers can render "not yet scored" without guessing at holes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ScoreMap(BTreeMap<usize, Option<Score>>);

impl ScoreMap {
    #[must_use]
    pub fn for_catalog(catalog_len: usize) -> Self {
        Self((0..catalog_len).map(|position| (position, None)).collect())
    }

    pub fn set(&mut self, position: usize, score: Score) {
        self.0.insert(position, Some(score));
    }

    #[must_use]
    pub fn get(&self, position: usize) -> Option<Score> {
        self.0.get(&position).copied().flatten()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Positions that carry a score, in position order.
    pub fn scored(&self) -> impl Iterator<Item = (usize, Score)> + '_ {
        self.0
            .iter()
            .filter_map(|(position, score)| score.map(|value| (*position, value)))
    }

    #[must_use]
    pub fn scored_count(&self) -> usize {
        self.scored().count()
    }
}

/// Position-keyed free-text notes, same coverage contract as [`ScoreMap`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct MemoMap(BTreeMap<usize, Option<String>>);

impl MemoMap {
    #[must_use]
    pub fn for_catalog(catalog_len: usize) -> Self {
        Self((0..catalog_len).map(|position| (position, None)).collect())
    }

    pub fn set(&mut self, position: usize, memo: String) {
        self.0.insert(position, Some(memo));
    }

    #[must_use]
    pub fn get(&self, position: usize) -> Option<&str> {
        self.0
            .get(&position)
            .and_then(|memo| memo.as_deref())
            .filter(|memo| !memo.is_empty())
    }

    /// Positions that carry a non-empty note, in position order.
    pub fn noted(&self) -> impl Iterator<Item = (usize, &str)> + '_ {
        self.0.iter().filter_map(|(position, memo)| {
            memo.as_deref()
                .filter(|value| !value.is_empty())
                .map(|value| (*position, value))
        })
    }
}

/// Mean of all non-null scores; `0.0` when nothing is scored yet. The zero
/// convention keeps history listings renderable without a sentinel.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn average_score(scores: &ScoreMap) -> f64 {
    let mut total = 0.0_f64;
    let mut count = 0_usize;
    for (_, score) in scores.scored() {
        total += f64::from(score.value());
        count += 1;
    }

    if count == 0 {
        return 0.0;
    }
    total / count as f64
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BasicInfo {
    pub client_name: String,
    #[serde(default)]
    pub management_number: String,
    pub evaluator_name: String,
    pub entry_date: String,
    pub start_date: String,
    pub end_date: String,
}

/// One completed assessment for a client.
///
/// Immutable once created; `items_snapshot` preserves the catalog the record
/// was scored against so the record stays interpretable even if the live
/// catalog later changes order or content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssessmentRecord {
    pub id: i64,
    pub basic_info: BasicInfo,
    pub scores: ScoreMap,
    pub memos: MemoMap,
    pub items_snapshot: Vec<CatalogItem>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl AssessmentRecord {
    /// Validates a record before it is handed to the store.
    ///
    /// # Errors
    /// Returns [`AssessmentError::Validation`] when required basic-info
    /// fields are blank, nothing is scored, or the score map does not cover
    /// the snapshot.
    pub fn validate(&self) -> Result<(), AssessmentError> {
        if self.id < 1 {
            return Err(AssessmentError::Validation(
                "record id MUST be >= 1".to_string(),
            ));
        }

        if self.basic_info.client_name.trim().is_empty() {
            return Err(AssessmentError::Validation(
                "client name MUST be provided".to_string(),
            ));
        }

        if self.basic_info.evaluator_name.trim().is_empty() {
            return Err(AssessmentError::Validation(
                "evaluator name MUST be provided".to_string(),
            ));
        }

        for (field, value) in [
            ("entry_date", &self.basic_info.entry_date),
            ("start_date", &self.basic_info.start_date),
            ("end_date", &self.basic_info.end_date),
        ] {
            if value.trim().is_empty() {
                return Err(AssessmentError::Validation(format!(
                    "{field} MUST be provided"
                )));
            }
        }

        if self.items_snapshot.is_empty() {
            return Err(AssessmentError::Validation(
                "items snapshot MUST NOT be empty".to_string(),
            ));
        }

        if self.scores.len() != self.items_snapshot.len() {
            return Err(AssessmentError::Validation(
                "score map MUST cover every snapshot position".to_string(),
            ));
        }

        if self.scores.scored_count() == 0 {
            return Err(AssessmentError::Validation(
                "at least one item MUST be scored".to_string(),
            ));
        }

        Ok(())
    }
}

/// Two catalog positions whose composite keys normalize to the same value.
/// A catalog-authoring defect: rows matching the key can only ever resolve
/// to the first position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyCollision {
    pub key: CompositeKey,
    pub first_position: usize,
    pub duplicate_position: usize,
}

/// Composite-key lookup over one ordered catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogIndex {
    positions: BTreeMap<CompositeKey, usize>,
    collisions: Vec<KeyCollision>,
}

impl CatalogIndex {
    /// Builds the key-to-position index in one pass over the catalog.
    ///
    /// Colliding keys keep their first-seen position and are reported via
    /// [`CatalogIndex::collisions`] rather than silently overwritten.
    ///
    /// # Errors
    /// Returns [`AssessmentError::Catalog`] when the catalog is empty.
    pub fn build(catalog: &[CatalogItem]) -> Result<Self, AssessmentError> {
        if catalog.is_empty() {
            return Err(AssessmentError::Catalog(
                "catalog MUST contain at least one item".to_string(),
            ));
        }

        let mut positions = BTreeMap::new();
        let mut collisions = Vec::new();

        for (position, item) in catalog.iter().enumerate() {
            let key = CompositeKey::from_parts(&item.category, &item.name);
            match positions.get(&key) {
                Some(&first_position) => collisions.push(KeyCollision {
                    key,
                    first_position,
                    duplicate_position: position,
                }),
                None => {
                    positions.insert(key, position);
                }
            }
        }

        Ok(Self {
            positions,
            collisions,
        })
    }

    #[must_use]
    pub fn position_of(&self, key: &CompositeKey) -> Option<usize> {
        self.positions.get(key).copied()
    }

    #[must_use]
    pub fn collisions(&self) -> &[KeyCollision] {
        &self.collisions
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// One already-parsed tabular row, fields associated by header name.
///
/// Missing optional columns resolve to empty strings at the parser boundary,
/// never to an absent field here. `raw_score` is the only field consulted
/// for scoring; `rating_label` is the human-readable rating text and is
/// carried for diagnostics only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportRow {
    pub entry_date: String,
    pub client_name: String,
    pub management_number: String,
    pub evaluator_name: String,
    pub period_start: String,
    pub period_end: String,
    pub category: String,
    pub item_name: String,
    pub raw_score: String,
    pub rating_label: String,
    pub memo: String,
}

/// Complete reconciliation result: total-coverage score/memo maps plus the
/// data-quality diagnostics the caller decides on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reconciliation {
    pub scores: ScoreMap,
    pub memos: MemoMap,
    pub match_count: usize,
    pub total_rows: usize,
    pub unmatched_rows: usize,
    pub duplicate_keys: BTreeSet<CompositeKey>,
    pub catalog_collisions: Vec<KeyCollision>,
}

/// Maps every imported row onto catalog positions and produces score/memo
/// maps covering the full catalog.
///
/// Data-quality problems never fail the call: rows whose key is unknown are
/// counted in `unmatched_rows`, rows whose score fails validation leave the
/// matched position unset, and a key assigned twice within one import lands
/// in `duplicate_keys` with the later row's values winning (last-write-wins).
/// `match_count` counts rows that both matched an item and carried a valid
/// score; callers treat `match_count == 0` as a rejection before any record
/// is created.
///
/// # Errors
/// Returns [`AssessmentError::Catalog`] when the catalog is empty and
/// [`AssessmentError::Validation`] when the row sequence is empty; both are
/// structural preconditions, not data-quality findings.
pub fn reconcile(
    catalog: &[CatalogItem],
    rows: &[ImportRow],
) -> Result<Reconciliation, AssessmentError> {
    let index = CatalogIndex::build(catalog)?;
    if rows.is_empty() {
        return Err(AssessmentError::Validation(
            "at least one data row is required".to_string(),
        ));
    }

    let mut scores = ScoreMap::for_catalog(catalog.len());
    let mut memos = MemoMap::for_catalog(catalog.len());
    let mut assigned: BTreeSet<CompositeKey> = BTreeSet::new();
    let mut duplicate_keys = BTreeSet::new();
    let mut match_count = 0_usize;
    let mut unmatched_rows = 0_usize;

    for row in rows {
        let key = CompositeKey::from_parts(&row.category, &row.item_name);
        let Some(position) = index.position_of(&key) else {
            unmatched_rows += 1;
            continue;
        };

        if !assigned.insert(key.clone()) {
            duplicate_keys.insert(key);
        }

        if let Some(score) = normalize_score(&row.raw_score) {
            scores.set(position, score);
            match_count += 1;
        }

        if !row.memo.is_empty() {
            memos.set(position, row.memo.clone());
        }
    }

    Ok(Reconciliation {
        scores,
        memos,
        match_count,
        total_rows: rows.len(),
        unmatched_rows,
        duplicate_keys,
        catalog_collisions: index.collisions().to_vec(),
    })
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`AssessmentError::Validation`] when parsing fails or the input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, AssessmentError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| AssessmentError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(AssessmentError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`AssessmentError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, AssessmentError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            AssessmentError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Milliseconds since the Unix epoch, the raw material for record ids.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn unix_millis(value: OffsetDateTime) -> i64 {
    (value.unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_catalog() -> Vec<CatalogItem> {
        vec![
            CatalogItem {
                category: "職業生活".to_string(),
                name: "欠席等の連絡".to_string(),
                description: Some("欠席・遅刻・早退を事前に連絡できる".to_string()),
            },
            CatalogItem {
                category: "職業生活".to_string(),
                name: "身だしなみ".to_string(),
                description: None,
            },
            CatalogItem {
                category: "作業力".to_string(),
                name: "正確性".to_string(),
                description: None,
            },
        ]
    }

    fn fixture_row(category: &str, item_name: &str, raw_score: &str) -> ImportRow {
        ImportRow {
            entry_date: "2026-04-01".to_string(),
            client_name: "山田太郎".to_string(),
            evaluator_name: "佐藤".to_string(),
            period_start: "2026-03-01".to_string(),
            period_end: "2026-03-31".to_string(),
            category: category.to_string(),
            item_name: item_name.to_string(),
            raw_score: raw_score.to_string(),
            ..ImportRow::default()
        }
    }

    #[test]
    fn normalize_text_trims_and_collapses() {
        assert_eq!(normalize_text("  a  b "), "a b");
        assert_eq!(normalize_text("a\u{3000}b"), "a b");
        assert_eq!(normalize_text("\u{3000}職業生活\u{3000}"), "職業生活");
        assert_eq!(normalize_text("line\nbreak\r\ngone"), "line break gone");
        assert_eq!(normalize_text(""), "");
        assert_eq!(normalize_text("   "), "");
    }

    #[test]
    fn normalize_digits_maps_full_width_only() {
        assert_eq!(normalize_digits("１２３４５"), "12345");
        assert_eq!(normalize_digits("score５点"), "score5点");
        assert_eq!(normalize_digits("abc"), "abc");
    }

    #[test]
    fn normalize_score_accepts_full_width_and_padding() {
        assert_eq!(normalize_score("3"), Some(Score::Average));
        assert_eq!(normalize_score("３"), Some(Score::Average));
        assert_eq!(normalize_score(" 4 "), Some(Score::Good));
        assert_eq!(normalize_score("\u{3000}５\u{3000}"), Some(Score::Excellent));
        assert_eq!(normalize_score("1"), Some(Score::SevereDifficulty));
    }

    #[test]
    fn normalize_score_rejects_out_of_domain_input() {
        assert_eq!(normalize_score("0"), None);
        assert_eq!(normalize_score("6"), None);
        assert_eq!(normalize_score("3.7"), None);
        assert_eq!(normalize_score("-2"), None);
        assert_eq!(normalize_score("abc"), None);
        assert_eq!(normalize_score(""), None);
        assert_eq!(normalize_score("   "), None);
    }

    #[test]
    fn normalize_date_pads_and_rejects() {
        assert_eq!(normalize_date("2026-04-01"), "2026-04-01");
        assert_eq!(normalize_date(" 2026-04-01 "), "2026-04-01");
        assert_eq!(normalize_date("2026/4/1"), "2026-04-01");
        assert_eq!(normalize_date("2026-4-12"), "2026-04-12");
        assert_eq!(normalize_date("04/01/2026"), "");
        assert_eq!(normalize_date("April 1"), "");
        assert_eq!(normalize_date(""), "");
    }

    #[test]
    fn score_labels_follow_the_rating_table() {
        assert_eq!(Score::SevereDifficulty.label(), "非常に困難");
        assert_eq!(Score::Excellent.label(), "非常に良好");
        assert_eq!(Score::from_value(0), None);
        assert_eq!(Score::from_value(6), None);
        assert_eq!(Score::from_value(2), Some(Score::NeedsSupport));
    }

    #[test]
    fn client_key_sanitizes_and_refuses_blank() {
        let key = must_ok(ClientKey::derive("Alice.B-2_c"));
        assert_eq!(key.as_str(), "Alice.B-2_c");

        let key = must_ok(ClientKey::derive(" 山田 太郎 "));
        assert_eq!(key.as_str(), "_____");

        assert!(ClientKey::derive("").is_err());
        assert!(ClientKey::derive("   ").is_err());
    }

    #[test]
    fn catalog_index_refuses_empty_catalog() {
        assert!(CatalogIndex::build(&[]).is_err());
    }

    #[test]
    fn catalog_index_reports_collisions_first_seen_wins() {
        let mut catalog = fixture_catalog();
        catalog.push(CatalogItem {
            category: "職業生活\u{3000}".to_string(),
            name: " 欠席等の連絡".to_string(),
            description: None,
        });

        let index = must_ok(CatalogIndex::build(&catalog));
        let key = CompositeKey::from_parts("職業生活", "欠席等の連絡");

        assert_eq!(index.position_of(&key), Some(0));
        assert_eq!(index.collisions().len(), 1);
        assert_eq!(index.collisions()[0].first_position, 0);
        assert_eq!(index.collisions()[0].duplicate_position, 3);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn reconcile_covers_every_position() {
        let catalog = fixture_catalog();
        let rows = vec![fixture_row("職業生活", "欠席等の連絡", "4")];

        let result = must_ok(reconcile(&catalog, &rows));
        assert_eq!(result.scores.len(), catalog.len());
        assert_eq!(result.memos.noted().count(), 0);
        assert_eq!(result.scores.get(0), Some(Score::Good));
        assert_eq!(result.scores.get(1), None);
        assert_eq!(result.scores.get(2), None);
    }

    #[test]
    fn reconcile_tolerates_whitespace_and_width_variants() {
        let catalog = fixture_catalog();
        let rows = vec![fixture_row("職業生活\u{3000}", " 欠席等の連絡", "３")];

        let result = must_ok(reconcile(&catalog, &rows));
        assert_eq!(result.match_count, 1);
        assert_eq!(result.scores.get(0), Some(Score::Average));
    }

    #[test]
    fn reconcile_skips_unmatched_rows_without_failing() {
        let catalog = fixture_catalog();
        let rows = vec![
            fixture_row("未知カテゴリ", "未知項目", "3"),
            fixture_row("作業力", "正確性", "5"),
        ];

        let result = must_ok(reconcile(&catalog, &rows));
        assert_eq!(result.match_count, 1);
        assert_eq!(result.unmatched_rows, 1);
        assert_eq!(result.total_rows, 2);
        assert_eq!(result.scores.get(2), Some(Score::Excellent));
    }

    #[test]
    fn reconcile_counts_matched_row_with_invalid_score_as_unscored() {
        let catalog = fixture_catalog();
        let rows = vec![fixture_row("職業生活", "身だしなみ", "9")];

        let result = must_ok(reconcile(&catalog, &rows));
        assert_eq!(result.match_count, 0);
        assert_eq!(result.unmatched_rows, 0);
        assert_eq!(result.scores.get(1), None);
    }

    #[test]
    fn reconcile_ignores_rating_label_for_scoring() {
        let catalog = fixture_catalog();
        let mut row = fixture_row("作業力", "正確性", "2");
        row.rating_label = "非常に良好".to_string();

        let result = must_ok(reconcile(&catalog, &[row]));
        assert_eq!(result.scores.get(2), Some(Score::NeedsSupport));
    }

    #[test]
    fn reconcile_duplicate_key_last_write_wins() {
        let catalog = fixture_catalog();
        let mut first = fixture_row("職業生活", "欠席等の連絡", "3");
        first.memo = "最初のメモ".to_string();
        let mut second = fixture_row("職業生活", "欠席等の連絡", "5");
        second.memo = "後のメモ".to_string();

        let result = must_ok(reconcile(&catalog, &[first, second]));
        let key = CompositeKey::from_parts("職業生活", "欠席等の連絡");

        assert_eq!(result.scores.get(0), Some(Score::Excellent));
        assert_eq!(result.memos.get(0), Some("後のメモ"));
        assert!(result.duplicate_keys.contains(&key));
    }

    #[test]
    fn reconcile_keeps_memo_for_matched_row_without_score() {
        let catalog = fixture_catalog();
        let mut row = fixture_row("職業生活", "身だしなみ", "");
        row.memo = "所見のみ".to_string();

        let result = must_ok(reconcile(&catalog, &[row]));
        assert_eq!(result.scores.get(1), None);
        assert_eq!(result.memos.get(1), Some("所見のみ"));
    }

    #[test]
    fn reconcile_zero_match_is_reported_not_raised() {
        let catalog = fixture_catalog();
        let rows = vec![fixture_row("別カテゴリ", "別項目", "3")];

        let result = must_ok(reconcile(&catalog, &rows));
        assert_eq!(result.match_count, 0);
        assert_eq!(result.unmatched_rows, 1);
    }

    #[test]
    fn reconcile_refuses_structural_absences() {
        let catalog = fixture_catalog();
        assert!(reconcile(&[], &[fixture_row("職業生活", "身だしなみ", "3")]).is_err());
        assert!(reconcile(&catalog, &[]).is_err());
    }

    #[test]
    fn average_score_conventions() {
        let empty = ScoreMap::default();
        assert!((average_score(&empty) - 0.0).abs() < f64::EPSILON);

        let mut scores = ScoreMap::for_catalog(3);
        scores.set(0, Score::Average);
        scores.set(2, Score::Excellent);
        assert!((average_score(&scores) - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn score_map_serde_round_trip() {
        let mut scores = ScoreMap::for_catalog(2);
        scores.set(1, Score::Good);

        let json = must_ok(serde_json::to_string(&scores));
        assert_eq!(json, r#"{"0":null,"1":4}"#);

        let back: ScoreMap = must_ok(serde_json::from_str(&json));
        assert_eq!(back, scores);
    }

    #[test]
    fn record_validation_requires_basic_info_and_scores() {
        let catalog = fixture_catalog();
        let mut scores = ScoreMap::for_catalog(catalog.len());
        scores.set(0, Score::Good);

        let record = AssessmentRecord {
            id: 1_700_000_000_000,
            basic_info: BasicInfo {
                client_name: "山田太郎".to_string(),
                management_number: String::new(),
                evaluator_name: "佐藤".to_string(),
                entry_date: "2026-04-01".to_string(),
                start_date: "2026-03-01".to_string(),
                end_date: "2026-03-31".to_string(),
            },
            scores,
            memos: MemoMap::for_catalog(catalog.len()),
            items_snapshot: catalog,
            timestamp: must_ok(parse_rfc3339_utc("2026-04-01T09:00:00Z")),
        };
        must_ok(record.validate());

        let mut blank_client = record.clone();
        blank_client.basic_info.client_name = "  ".to_string();
        assert!(blank_client.validate().is_err());

        let mut nothing_scored = record.clone();
        nothing_scored.scores = ScoreMap::for_catalog(nothing_scored.items_snapshot.len());
        assert!(nothing_scored.validate().is_err());

        let mut short_map = record;
        short_map.scores = ScoreMap::for_catalog(1);
        assert!(short_map.validate().is_err());
    }

    proptest! {
        #[test]
        fn normalize_text_is_idempotent(input in ".*") {
            let once = normalize_text(&input);
            prop_assert_eq!(normalize_text(&once), once.clone());
        }

        #[test]
        fn normalize_score_is_total(input in ".*") {
            let _ = normalize_score(&input);
        }

        #[test]
        fn normalize_date_yields_iso_or_empty(input in ".*") {
            let normalized = normalize_date(&input);
            prop_assert!(normalized.is_empty() || normalized.len() == 10);
        }

        #[test]
        fn full_width_scores_match_ascii(value in 1_u8..=5) {
            let ascii = value.to_string();
            let full_width: String = ascii
                .chars()
                .map(|ch| {
                    let Some(digit) = ch.to_digit(10) else { return ch };
                    char::from_u32(0xFF10 + digit).unwrap_or(ch)
                })
                .collect();
            prop_assert_eq!(normalize_score(&full_width), normalize_score(&ascii));
            prop_assert_eq!(normalize_score(&ascii), Score::from_value(value));
        }

        #[test]
        fn reconcile_always_covers_catalog(row_count in 0_usize..8) {
            let catalog = fixture_catalog();
            let rows: Vec<ImportRow> = (0..row_count)
                .map(|index| fixture_row("職業生活", "欠席等の連絡", &index.to_string()))
                .collect();
            let result = reconcile(&catalog, &rows);
            if rows.is_empty() {
                prop_assert!(result.is_err());
            } else {
                prop_assert!(result.is_ok());
                if let Ok(outcome) = result {
                    prop_assert_eq!(outcome.scores.len(), catalog.len());
                    prop_assert_eq!(outcome.total_rows, rows.len());
                }
            }
        }
    }
}
