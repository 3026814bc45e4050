//! In-process gateway evaluating the query DSL subset built by [`crate::query`].
//!
//! Scores are not BM25; they only preserve the orderings the search layer
//! relies on (verbatim matches above fuzzy ones, more matched tokens above
//! fewer).

use crate::engine::{IndexStats, SearchGateway};
use crate::error::{Result, SearchEngineError};
use crate::schema::{IndexSchema, SearchDocument};
use crate::types::IndexName;
use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Map, Value, json};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Longest edge n-gram produced by the autocomplete analyzer
const MAX_GRAM: usize = 20;
/// Hit totals above this are reported as a lower bound
const TRACK_TOTAL_HITS: usize = 10_000;
const DEFAULT_TERMS_SIZE: usize = 10;

#[derive(Debug, Clone)]
struct StoredDoc {
    id: String,
    seq: u64,
    source: Map<String, Value>,
}

#[derive(Debug, Default)]
struct MemoryIndex {
    settings: Map<String, Value>,
    mappings: Value,
    open: bool,
    docs: Vec<StoredDoc>,
    positions: FxHashMap<String, usize>,
}

impl MemoryIndex {
    fn upsert(&mut self, id: String, seq: u64, source: Map<String, Value>) {
        match self.positions.get(&id) {
            Some(&pos) => {
                self.docs[pos].source = source;
            }
            None => {
                self.positions.insert(id.clone(), self.docs.len());
                self.docs.push(StoredDoc { id, seq, source });
            }
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    indices: FxHashMap<IndexName, MemoryIndex>,
    next_seq: u64,
    settings_history: Vec<(IndexName, Value)>,
    force_merges: usize,
    failing_ids: FxHashSet<String>,
}

/// Gateway keeping every index in memory
#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: RwLock<MemoryState>,
    timed_out: AtomicBool,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gateway with both indexes created from their schemas.
    pub fn with_schemas() -> Self {
        let gateway = Self::new();
        if let Ok(mut state) = gateway.state.write() {
            for index in IndexName::ALL {
                let body = IndexSchema::for_index(index).create_body(1, 0);
                state.indices.insert(index, new_index(&body));
            }
        }
        gateway
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| SearchEngineError::engine("memory gateway lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| SearchEngineError::engine("memory gateway lock poisoned"))
    }

    /// Reject any bulk request carrying one of these document ids.
    pub fn fail_bulk_for_ids<I, S>(&self, ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.write()?;
        state.failing_ids.extend(ids.into_iter().map(Into::into));
        Ok(())
    }

    /// Make every following search report `timed_out: true`.
    pub fn set_timed_out(&self, timed_out: bool) {
        self.timed_out.store(timed_out, AtomicOrdering::SeqCst);
    }

    pub fn settings(&self, index: IndexName) -> Result<Option<Map<String, Value>>> {
        Ok(self.read()?.indices.get(&index).map(|i| i.settings.clone()))
    }

    pub fn mappings(&self, index: IndexName) -> Result<Option<Value>> {
        Ok(self.read()?.indices.get(&index).map(|i| i.mappings.clone()))
    }

    /// Every settings update applied so far, in order.
    pub fn settings_history(&self) -> Result<Vec<(IndexName, Value)>> {
        Ok(self.read()?.settings_history.clone())
    }

    pub fn force_merge_count(&self) -> Result<usize> {
        Ok(self.read()?.force_merges)
    }

    pub fn is_open(&self, index: IndexName) -> Result<bool> {
        Ok(self.read()?.indices.get(&index).is_some_and(|i| i.open))
    }

    pub fn document(&self, index: IndexName, id: &str) -> Result<Option<Map<String, Value>>> {
        let state = self.read()?;
        Ok(state.indices.get(&index).and_then(|i| {
            i.positions
                .get(id)
                .map(|&pos| i.docs[pos].source.clone())
        }))
    }
}

fn new_index(body: &Value) -> MemoryIndex {
    let settings = body
        .get("settings")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    MemoryIndex {
        settings,
        mappings: body.get("mappings").cloned().unwrap_or(Value::Null),
        open: true,
        ..MemoryIndex::default()
    }
}

fn missing(index: IndexName) -> SearchEngineError {
    SearchEngineError::engine(format!("no such index [{}]", index))
}

fn open_index_mut(state: &mut MemoryState, index: IndexName) -> Result<&mut MemoryIndex> {
    let stored = state.indices.get_mut(&index).ok_or_else(|| missing(index))?;
    if !stored.open {
        return Err(SearchEngineError::engine(format!("index [{}] is closed", index)));
    }
    Ok(stored)
}

#[async_trait]
impl SearchGateway for MemoryGateway {
    async fn search(&self, indices: &[IndexName], body: &Value) -> Result<Value> {
        let state = self.read()?;
        let mut docs = Vec::new();
        for index in indices {
            let stored = state.indices.get(index).ok_or_else(|| missing(*index))?;
            if !stored.open {
                return Err(SearchEngineError::engine(format!("index [{}] is closed", index)));
            }
            docs.extend(stored.docs.iter().map(|doc| (*index, doc)));
        }
        let mut response = execute_search(&docs, body)?;
        if self.timed_out.load(AtomicOrdering::SeqCst) {
            response["timed_out"] = Value::Bool(true);
        }
        Ok(response)
    }

    async fn bulk(&self, index: IndexName, documents: &[SearchDocument]) -> Result<()> {
        let mut state = self.write()?;
        if let Some(id) = documents
            .iter()
            .filter_map(SearchDocument::id)
            .find(|id| state.failing_ids.contains(*id))
        {
            return Err(SearchEngineError::engine(format!(
                "bulk request rejected document '{}'",
                id
            )));
        }
        // Bulk writes create a missing index like the real engine does.
        state
            .indices
            .entry(index)
            .or_insert_with(|| new_index(&Value::Null));
        let first_seq = state.next_seq;
        state.next_seq += documents.len() as u64;
        let stored = open_index_mut(&mut state, index)?;
        for (offset, doc) in documents.iter().enumerate() {
            let seq = first_seq + offset as u64;
            let id = doc.id().map(str::to_string).unwrap_or_else(|| format!("auto-{}", seq));
            stored.upsert(id, seq, doc.source().clone());
        }
        Ok(())
    }

    async fn index_exists(&self, index: IndexName) -> Result<bool> {
        Ok(self.read()?.indices.contains_key(&index))
    }

    async fn create_index(&self, index: IndexName, body: &Value) -> Result<()> {
        let mut state = self.write()?;
        if state.indices.contains_key(&index) {
            return Err(SearchEngineError::engine(format!(
                "index [{}] already exists",
                index
            )));
        }
        state.indices.insert(index, new_index(body));
        Ok(())
    }

    async fn delete_index(&self, index: IndexName) -> Result<()> {
        self.write()?
            .indices
            .remove(&index)
            .map(|_| ())
            .ok_or_else(|| missing(index))
    }

    async fn put_settings(&self, index: IndexName, settings: &Value) -> Result<()> {
        let mut state = self.write()?;
        let stored = state.indices.get_mut(&index).ok_or_else(|| missing(index))?;
        let updates = settings
            .as_object()
            .ok_or_else(|| SearchEngineError::engine("settings must be an object"))?;
        for (key, value) in updates {
            if key == "analysis" && stored.open {
                return Err(SearchEngineError::engine(
                    "analysis settings can only be updated on a closed index",
                ));
            }
            if value.is_null() {
                stored.settings.remove(key);
            } else {
                stored.settings.insert(key.clone(), value.clone());
            }
        }
        state.settings_history.push((index, settings.clone()));
        Ok(())
    }

    async fn put_mapping(&self, index: IndexName, mappings: &Value) -> Result<()> {
        let mut state = self.write()?;
        let stored = state.indices.get_mut(&index).ok_or_else(|| missing(index))?;
        stored.mappings = mappings.clone();
        Ok(())
    }

    async fn open_index(&self, index: IndexName) -> Result<()> {
        let mut state = self.write()?;
        state
            .indices
            .get_mut(&index)
            .ok_or_else(|| missing(index))?
            .open = true;
        Ok(())
    }

    async fn close_index(&self, index: IndexName) -> Result<()> {
        let mut state = self.write()?;
        state
            .indices
            .get_mut(&index)
            .ok_or_else(|| missing(index))?
            .open = false;
        Ok(())
    }

    async fn refresh(&self, index: IndexName) -> Result<()> {
        self.read()?
            .indices
            .get(&index)
            .map(|_| ())
            .ok_or_else(|| missing(index))
    }

    async fn force_merge(&self, index: IndexName) -> Result<()> {
        let mut state = self.write()?;
        open_index_mut(&mut state, index)?;
        state.force_merges += 1;
        Ok(())
    }

    async fn stats(&self, index: IndexName) -> Result<IndexStats> {
        let state = self.read()?;
        let stored = state.indices.get(&index).ok_or_else(|| missing(index))?;
        let size_in_bytes = stored
            .docs
            .iter()
            .map(|doc| serde_json::to_vec(&doc.source).map(|v| v.len() as u64))
            .sum::<std::result::Result<u64, _>>()?;
        Ok(IndexStats {
            doc_count: stored.docs.len() as u64,
            size_in_bytes,
        })
    }

    async fn count(&self, index: IndexName) -> Result<u64> {
        let state = self.read()?;
        let stored = state.indices.get(&index).ok_or_else(|| missing(index))?;
        Ok(stored.docs.len() as u64)
    }
}

/// A document that matched the query, with its score
#[derive(Clone, Copy)]
struct Matched<'a> {
    index: IndexName,
    doc: &'a StoredDoc,
    score: f64,
}

impl Matched<'_> {
    fn to_hit(self, with_score: bool) -> Value {
        json!({
            "_index": self.index.as_str(),
            "_id": self.doc.id,
            "_score": if with_score { json!(self.score) } else { Value::Null },
            "_source": self.doc.source,
        })
    }
}

fn execute_search(docs: &[(IndexName, &StoredDoc)], body: &Value) -> Result<Value> {
    let query = body.get("query").cloned().unwrap_or(json!({"match_all": {}}));
    let mut matched = Vec::new();
    for (index, doc) in docs {
        if let Some(score) = eval_query(&query, &doc.source)? {
            matched.push(Matched {
                index: *index,
                doc: *doc,
                score,
            });
        }
    }

    let sort = body.get("sort");
    let scored = sort.is_none_or(sorts_by_score);
    sort_matched(&mut matched, sort)?;

    let from = usize_param(body, "from", 0);
    let size = usize_param(body, "size", 10);
    let hits: Vec<Value> = matched
        .iter()
        .skip(from)
        .take(size)
        .map(|m| m.to_hit(scored))
        .collect();
    let max_score = if scored {
        matched
            .iter()
            .map(|m| m.score)
            .reduce(f64::max)
            .map_or(Value::Null, |s| json!(s))
    } else {
        Value::Null
    };

    let track_all = body.get("track_total_hits") == Some(&Value::Bool(true));
    let total = if !track_all && matched.len() > TRACK_TOTAL_HITS {
        json!({"value": TRACK_TOTAL_HITS, "relation": "gte"})
    } else {
        json!({"value": matched.len(), "relation": "eq"})
    };

    let mut response = json!({
        "took": 1,
        "timed_out": false,
        "hits": {"total": total, "max_score": max_score, "hits": hits},
    });
    if let Some(aggs) = aggs_of(body) {
        response["aggregations"] = Value::Object(eval_aggs(aggs, &matched)?);
    }
    Ok(response)
}

fn usize_param(body: &Value, key: &str, default: usize) -> usize {
    body.get(key)
        .and_then(Value::as_u64)
        .map_or(default, |v| v as usize)
}

fn aggs_of(body: &Value) -> Option<&Map<String, Value>> {
    body.get("aggs")
        .or_else(|| body.get("aggregations"))
        .and_then(Value::as_object)
}

fn single_entry<'a>(value: &'a Value, what: &str) -> Result<(&'a String, &'a Value)> {
    value
        .as_object()
        .and_then(|obj| obj.iter().next())
        .ok_or_else(|| SearchEngineError::engine(format!("malformed {} clause: {}", what, value)))
}

// ---------------------------------------------------------------------------
// Field access and analysis

/// Values of `field` in a source document; `.norm` and `.sort` sub-fields are
/// derived from the parent value.
fn field_values(source: &Map<String, Value>, field: &str) -> Vec<Value> {
    let (base, derived) = match field.rsplit_once('.') {
        Some((base, sub @ ("norm" | "sort"))) => (base, Some(sub)),
        _ => (field, None),
    };
    let raw: Vec<&Value> = match source.get(base) {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(v) => vec![v],
    };
    raw.into_iter()
        .filter(|v| !v.is_null())
        .map(|v| match (derived, v) {
            (Some(_), Value::String(s)) => Value::String(s.to_lowercase()),
            _ => v.clone(),
        })
        .collect()
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn tokenize(text: &str) -> Vec<Vec<char>> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase().chars().collect())
        .collect()
}

/// Edit distance allowed by `fuzziness: AUTO` for a term of `len` characters
fn auto_fuzziness(len: usize) -> usize {
    match len {
        0..=2 => 0,
        3..=5 => 1,
        _ => 2,
    }
}

/// Optimal string alignment distance (adjacent transpositions count as one edit)
fn edit_distance(a: &[char], b: &[char]) -> usize {
    let (n, m) = (a.len(), b.len());
    let mut d = vec![vec![0usize; m + 1]; n + 1];
    for (i, row) in d.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=m {
        d[0][j] = j;
    }
    for i in 1..=n {
        for j in 1..=m {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            d[i][j] = (d[i - 1][j] + 1)
                .min(d[i][j - 1] + 1)
                .min(d[i - 1][j - 1] + cost);
            if i > 1 && j > 1 && a[i - 1] == b[j - 2] && a[i - 2] == b[j - 1] {
                d[i][j] = d[i][j].min(d[i - 2][j - 2] + 1);
            }
        }
    }
    d[n][m]
}

/// Best score of query term `q` against the edge n-grams of doc token `t`.
fn term_score(q: &[char], t: &[char], max_edits: usize, prefix_len: usize) -> Option<f64> {
    if q.len() <= MAX_GRAM && t.starts_with(q) {
        // Whole-word matches outrank prefix matches.
        return Some(if q.len() == t.len() { 1.5 } else { 1.0 });
    }
    if max_edits == 0 {
        return None;
    }
    let shared = prefix_len.min(q.len());
    let longest = t.len().min(MAX_GRAM);
    let shortest = q.len().saturating_sub(max_edits).max(shared).max(1);
    (shortest..=longest.min(q.len() + max_edits))
        .filter(|&len| t[..len].starts_with(&q[..shared]))
        .map(|len| edit_distance(q, &t[..len]))
        .filter(|&edits| edits <= max_edits)
        .min()
        .map(|edits| 1.0 / (1.0 + edits as f64))
}

// ---------------------------------------------------------------------------
// Queries

/// `Some(score)` when the document matches.
fn eval_query(query: &Value, source: &Map<String, Value>) -> Result<Option<f64>> {
    let (kind, params) = single_entry(query, "query")?;
    match kind.as_str() {
        "match_all" => Ok(Some(1.0)),
        "bool" => eval_bool(params, source),
        "term" => {
            let (field, spec) = single_entry(params, "term")?;
            let expected = spec.get("value").unwrap_or(spec);
            let normalized = field.ends_with(".norm");
            let hit = field_values(source, field)
                .iter()
                .any(|v| values_equal(v, expected, normalized));
            Ok(hit.then_some(1.0))
        }
        "terms" => {
            let (field, options) = single_entry(params, "terms")?;
            let options = options.as_array().cloned().unwrap_or_default();
            let normalized = field.ends_with(".norm");
            let hit = field_values(source, field)
                .iter()
                .any(|v| options.iter().any(|o| values_equal(v, o, normalized)));
            Ok(hit.then_some(1.0))
        }
        "match" => eval_match(params, source),
        "prefix" => {
            let (field, spec) = single_entry(params, "prefix")?;
            let value = as_text(spec.get("value").unwrap_or(spec));
            let insensitive = spec
                .get("case_insensitive")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let hit = field_values(source, field).iter().any(|v| {
                let text = as_text(v);
                if insensitive {
                    text.to_lowercase().starts_with(&value.to_lowercase())
                } else {
                    text.starts_with(&value)
                }
            });
            Ok(hit.then_some(1.0))
        }
        "range" => {
            let (field, bounds) = single_entry(params, "range")?;
            let hit = field_values(source, field)
                .iter()
                .any(|v| in_range(v, bounds));
            Ok(hit.then_some(1.0))
        }
        "exists" => {
            let field = params.get("field").and_then(Value::as_str).unwrap_or("");
            Ok((!field_values(source, field).is_empty()).then_some(1.0))
        }
        other => Err(SearchEngineError::engine(format!(
            "unsupported query type [{}]",
            other
        ))),
    }
}

fn clauses(params: &Value, key: &str) -> Vec<Value> {
    match params.get(key) {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(single) => vec![single.clone()],
    }
}

fn eval_bool(params: &Value, source: &Map<String, Value>) -> Result<Option<f64>> {
    let must = clauses(params, "must");
    let filter = clauses(params, "filter");
    let should = clauses(params, "should");
    let must_not = clauses(params, "must_not");

    let mut score = 0.0;
    for clause in &must {
        match eval_query(clause, source)? {
            Some(s) => score += s,
            None => return Ok(None),
        }
    }
    for clause in &filter {
        if eval_query(clause, source)?.is_none() {
            return Ok(None);
        }
    }
    for clause in &must_not {
        if eval_query(clause, source)?.is_some() {
            return Ok(None);
        }
    }
    let mut should_hits = 0;
    for clause in &should {
        if let Some(s) = eval_query(clause, source)? {
            score += s;
            should_hits += 1;
        }
    }
    let min_should = params
        .get("minimum_should_match")
        .and_then(Value::as_u64)
        .map_or_else(
            || usize::from(must.is_empty() && filter.is_empty() && !should.is_empty()),
            |v| v as usize,
        );
    if should_hits < min_should {
        return Ok(None);
    }
    if must.is_empty() && should.is_empty() && filter.is_empty() && must_not.is_empty() {
        return Ok(Some(1.0));
    }
    Ok(Some(score))
}

fn eval_match(params: &Value, source: &Map<String, Value>) -> Result<Option<f64>> {
    let (field, spec) = single_entry(params, "match")?;
    let text = as_text(spec.get("query").unwrap_or(spec));
    let fuzzy = spec
        .get("fuzziness")
        .and_then(Value::as_str)
        .is_some_and(|f| f.eq_ignore_ascii_case("auto"));
    let and = spec
        .get("operator")
        .and_then(Value::as_str)
        .is_some_and(|o| o.eq_ignore_ascii_case("and"));
    let prefix_len = spec
        .get("prefix_length")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;
    let boost = spec.get("boost").and_then(Value::as_f64).unwrap_or(1.0);

    let query_terms = tokenize(&text);
    if query_terms.is_empty() {
        return Ok(None);
    }
    let doc_terms: Vec<Vec<char>> = field_values(source, field)
        .iter()
        .flat_map(|v| tokenize(&as_text(v)))
        .collect();

    let mut score = 0.0;
    let mut matched = 0;
    for q in &query_terms {
        let max_edits = if fuzzy { auto_fuzziness(q.len()) } else { 0 };
        let best = doc_terms
            .iter()
            .filter_map(|t| term_score(q, t, max_edits, prefix_len))
            .reduce(f64::max);
        if let Some(s) = best {
            score += s;
            matched += 1;
        }
    }
    let accepted = if and {
        matched == query_terms.len()
    } else {
        matched > 0
    };
    Ok(accepted.then_some(score * boost))
}

fn values_equal(actual: &Value, expected: &Value, normalized: bool) -> bool {
    match (actual, expected) {
        (Value::String(a), Value::String(e)) if normalized => *a == e.to_lowercase(),
        (Value::Number(a), Value::Number(e)) => a.as_f64() == e.as_f64(),
        (a, e) if a == e => true,
        (a, e) => as_text(a) == as_text(e),
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => match (a, b) {
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            _ => {
                let (x, y) = (as_text(a), as_text(b));
                match (x.parse::<f64>(), y.parse::<f64>()) {
                    (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                    _ => x.cmp(&y),
                }
            }
        },
    }
}

fn in_range(value: &Value, bounds: &Value) -> bool {
    let check = |key: &str, ok: fn(Ordering) -> bool| {
        bounds
            .get(key)
            .is_none_or(|bound| ok(compare_values(value, bound)))
    };
    check("gte", |o| o != Ordering::Less)
        && check("gt", |o| o == Ordering::Greater)
        && check("lte", |o| o != Ordering::Greater)
        && check("lt", |o| o == Ordering::Less)
}

// ---------------------------------------------------------------------------
// Sorting

enum SortKey {
    Score(bool),
    Doc(bool),
    Field(String, bool),
}

fn parse_sort(sort: Option<&Value>) -> Result<Vec<SortKey>> {
    let entries = match sort {
        None => return Ok(vec![SortKey::Score(true)]),
        Some(Value::Array(items)) => items.clone(),
        Some(single) => vec![single.clone()],
    };
    entries
        .iter()
        .map(|entry| {
            let (field, desc) = match entry {
                Value::String(field) => (field.clone(), field == "_score"),
                other => {
                    let (field, spec) = single_entry(other, "sort")?;
                    let order = spec
                        .get("order")
                        .unwrap_or(spec)
                        .as_str()
                        .unwrap_or(if field == "_score" { "desc" } else { "asc" });
                    (field.clone(), order.eq_ignore_ascii_case("desc"))
                }
            };
            Ok(match field.as_str() {
                "_score" => SortKey::Score(desc),
                "_doc" => SortKey::Doc(desc),
                _ => SortKey::Field(field, desc),
            })
        })
        .collect()
}

fn sorts_by_score(sort: &Value) -> bool {
    matches!(parse_sort(Some(sort)).as_deref(), Ok([SortKey::Score(_), ..]))
}

fn sort_matched(matched: &mut [Matched<'_>], sort: Option<&Value>) -> Result<()> {
    let keys = parse_sort(sort)?;
    matched.sort_by(|a, b| {
        for key in &keys {
            let ordering = match key {
                SortKey::Score(desc) => {
                    let o = a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal);
                    if *desc { o.reverse() } else { o }
                }
                SortKey::Doc(desc) => {
                    let o = a.doc.seq.cmp(&b.doc.seq);
                    if *desc { o.reverse() } else { o }
                }
                SortKey::Field(field, desc) => {
                    let x = field_values(&a.doc.source, field).into_iter().next();
                    let y = field_values(&b.doc.source, field).into_iter().next();
                    // Missing values sort last in either direction.
                    match (x, y) {
                        (Some(x), Some(y)) => {
                            let o = compare_values(&x, &y);
                            if *desc { o.reverse() } else { o }
                        }
                        (Some(_), None) => Ordering::Less,
                        (None, Some(_)) => Ordering::Greater,
                        (None, None) => Ordering::Equal,
                    }
                }
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        a.doc.seq.cmp(&b.doc.seq)
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// Aggregations

fn eval_aggs(aggs: &Map<String, Value>, docs: &[Matched<'_>]) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for (name, spec) in aggs {
        let kind = spec
            .as_object()
            .and_then(|obj| {
                obj.keys()
                    .find(|k| k.as_str() != "aggs" && k.as_str() != "aggregations")
            })
            .ok_or_else(|| SearchEngineError::engine(format!("aggregation [{}] has no type", name)))?;
        let params = &spec[kind.as_str()];
        let sub = aggs_of(spec);
        let result = match kind.as_str() {
            "terms" => terms_agg(params, sub, docs)?,
            "composite" => composite_agg(params, sub, docs)?,
            "cardinality" => {
                let field = str_param(params, "field")?;
                let distinct: FxHashSet<String> = docs
                    .iter()
                    .flat_map(|m| field_values(&m.doc.source, field))
                    .map(|v| as_text(&v))
                    .collect();
                json!({"value": distinct.len()})
            }
            "max" => {
                let by_score = params.pointer("/script/source").and_then(Value::as_str)
                    == Some("_score");
                let max = if by_score {
                    docs.iter().map(|m| m.score).reduce(f64::max)
                } else {
                    let field = str_param(params, "field")?;
                    docs.iter()
                        .flat_map(|m| field_values(&m.doc.source, field))
                        .filter_map(|v| v.as_f64().or_else(|| as_text(&v).parse().ok()))
                        .reduce(f64::max)
                };
                json!({"value": max})
            }
            "top_hits" => {
                let mut group = docs.to_vec();
                let sort = params.get("sort");
                sort_matched(&mut group, sort)?;
                let scored = sort.is_none_or(sorts_by_score);
                let size = usize_param(params, "size", 3);
                let hits: Vec<Value> = group
                    .iter()
                    .take(size)
                    .map(|m| m.to_hit(scored))
                    .collect();
                let max_score = group.iter().map(|m| m.score).reduce(f64::max);
                json!({"hits": {
                    "total": {"value": group.len(), "relation": "eq"},
                    "max_score": if scored { json!(max_score) } else { Value::Null },
                    "hits": hits,
                }})
            }
            other => {
                return Err(SearchEngineError::engine(format!(
                    "unsupported aggregation type [{}]",
                    other
                )));
            }
        };
        out.insert(name.clone(), result);
    }
    Ok(out)
}

fn str_param<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| SearchEngineError::engine(format!("aggregation requires [{}]", key)))
}

/// Group documents by the values of `field`, keeping first-seen key order.
fn group_by<'a>(docs: &[Matched<'a>], field: &str) -> Vec<(Value, Vec<Matched<'a>>)> {
    let mut positions: FxHashMap<String, usize> = FxHashMap::default();
    let mut groups: Vec<(Value, Vec<Matched<'a>>)> = Vec::new();
    for m in docs {
        let mut seen = FxHashSet::default();
        for value in field_values(&m.doc.source, field) {
            let key = as_text(&value);
            if !seen.insert(key.clone()) {
                continue;
            }
            match positions.get(&key) {
                Some(&pos) => groups[pos].1.push(*m),
                None => {
                    positions.insert(key, groups.len());
                    groups.push((value, vec![*m]));
                }
            }
        }
    }
    groups
}

fn bucket(key: Value, group: &[Matched<'_>], sub: Option<&Map<String, Value>>) -> Result<Value> {
    let mut bucket = Map::new();
    bucket.insert("key".to_string(), key);
    bucket.insert("doc_count".to_string(), json!(group.len()));
    if let Some(sub) = sub {
        bucket.extend(eval_aggs(sub, group)?);
    }
    Ok(Value::Object(bucket))
}

fn order_entries(order: Option<&Value>) -> Vec<(String, bool)> {
    let entries = match order {
        Some(Value::Array(items)) => items.clone(),
        Some(single @ Value::Object(_)) => vec![single.clone()],
        _ => vec![json!({"_count": "desc"})],
    };
    entries
        .iter()
        .filter_map(Value::as_object)
        .flat_map(|obj| obj.iter())
        .map(|(key, dir)| (key.clone(), dir.as_str() == Some("desc")))
        .collect()
}

fn bucket_metric(bucket: &Value, path: &str) -> Value {
    let name = path.split('.').next().unwrap_or(path);
    match bucket.get(name) {
        Some(agg) => agg.get("value").cloned().unwrap_or(Value::Null),
        None => Value::Null,
    }
}

fn terms_agg(
    params: &Value,
    sub: Option<&Map<String, Value>>,
    docs: &[Matched<'_>],
) -> Result<Value> {
    let field = str_param(params, "field")?;
    let size = usize_param(params, "size", DEFAULT_TERMS_SIZE);
    let mut order = order_entries(params.get("order"));
    if !order.iter().any(|(key, _)| key == "_key") {
        order.push(("_key".to_string(), false));
    }

    let mut buckets = group_by(docs, field)
        .into_iter()
        .map(|(key, group)| bucket(key, &group, sub))
        .collect::<Result<Vec<_>>>()?;
    buckets.sort_by(|a, b| {
        for (key, desc) in &order {
            let o = match key.as_str() {
                "_count" => a["doc_count"].as_u64().cmp(&b["doc_count"].as_u64()),
                "_key" => compare_values(&a["key"], &b["key"]),
                metric => compare_values(&bucket_metric(a, metric), &bucket_metric(b, metric)),
            };
            let o = if *desc { o.reverse() } else { o };
            if o != Ordering::Equal {
                return o;
            }
        }
        Ordering::Equal
    });

    let other: u64 = buckets
        .iter()
        .skip(size)
        .filter_map(|b| b["doc_count"].as_u64())
        .sum();
    buckets.truncate(size);
    Ok(json!({
        "doc_count_error_upper_bound": 0,
        "sum_other_doc_count": other,
        "buckets": buckets,
    }))
}

fn composite_agg(
    params: &Value,
    sub: Option<&Map<String, Value>>,
    docs: &[Matched<'_>],
) -> Result<Value> {
    let size = usize_param(params, "size", DEFAULT_TERMS_SIZE);
    let sources = params
        .get("sources")
        .and_then(Value::as_array)
        .ok_or_else(|| SearchEngineError::engine("composite aggregation requires [sources]"))?;
    let mut columns = Vec::new();
    for source in sources {
        let (name, spec) = single_entry(source, "composite source")?;
        let terms = spec
            .get("terms")
            .ok_or_else(|| SearchEngineError::engine("only terms composite sources are supported"))?;
        let field = str_param(terms, "field")?.to_string();
        let desc = terms.get("order").and_then(Value::as_str) == Some("desc");
        columns.push((name.clone(), field, desc));
    }

    // Documents missing any source value produce no bucket.
    let mut keyed: Vec<(Vec<Value>, Vec<Matched<'_>>)> = Vec::new();
    for m in docs {
        let mut key = Vec::with_capacity(columns.len());
        for (_, field, _) in &columns {
            match field_values(&m.doc.source, field).into_iter().next() {
                Some(v) => key.push(v),
                None => break,
            }
        }
        if key.len() != columns.len() {
            continue;
        }
        match keyed.iter_mut().find(|(k, _)| *k == key) {
            Some((_, group)) => group.push(*m),
            None => keyed.push((key, vec![*m])),
        }
    }

    let cmp_keys = |a: &[Value], b: &[Value]| {
        for (i, (_, _, desc)) in columns.iter().enumerate() {
            let o = compare_values(&a[i], &b[i]);
            let o = if *desc { o.reverse() } else { o };
            if o != Ordering::Equal {
                return o;
            }
        }
        Ordering::Equal
    };
    keyed.sort_by(|a, b| cmp_keys(a.0.as_slice(), b.0.as_slice()));

    if let Some(after) = params.get("after") {
        let after: Vec<Value> = columns
            .iter()
            .map(|(name, _, _)| after.get(name).cloned().unwrap_or(Value::Null))
            .collect();
        keyed.retain(|(key, _)| cmp_keys(key.as_slice(), after.as_slice()) == Ordering::Greater);
    }
    keyed.truncate(size);

    let key_object = |key: &[Value]| -> Value {
        let obj: Map<String, Value> = columns
            .iter()
            .zip(key)
            .map(|((name, _, _), v)| (name.clone(), v.clone()))
            .collect();
        Value::Object(obj)
    };
    let buckets = keyed
        .iter()
        .map(|(key, group)| bucket(key_object(key.as_slice()), group, sub))
        .collect::<Result<Vec<_>>>()?;

    let mut result = json!({ "buckets": buckets });
    if let Some((key, _)) = keyed.last() {
        result["after_key"] = key_object(key.as_slice());
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, fields: Value) -> SearchDocument {
        let mut doc = SearchDocument::with_id(id);
        if let Value::Object(map) = fields {
            for (k, v) in map {
                doc.insert(k, v);
            }
        }
        doc
    }

    async fn seeded() -> MemoryGateway {
        let gateway = MemoryGateway::with_schemas();
        gateway
            .bulk(
                IndexName::Epf,
                &[
                    doc("1", json!({"song_name": "Amen Corner", "artist_name": "Queen", "release_year_released": 1975})),
                    doc("2", json!({"song_name": "Amen", "artist_name": "QUEEN", "release_year_released": 1980})),
                    doc("3", json!({"song_name": "Corner Shop", "artist_name": "Blur", "release_year_released": 1995})),
                ],
            )
            .await
            .unwrap();
        gateway
    }

    #[test]
    fn test_fuzziness_bounds() {
        let q: Vec<char> = "qeen".chars().collect();
        let t: Vec<char> = "queen".chars().collect();
        assert!(term_score(&q, &t, 1, 0).is_some());
        assert!(term_score(&q, &t, 1, 2).is_none());
        assert_eq!(edit_distance(&['a', 'b'], &['b', 'a']), 1);
        assert_eq!(auto_fuzziness(2), 0);
        assert_eq!(auto_fuzziness(7), 2);
    }

    #[tokio::test]
    async fn test_match_and_operator() {
        let gateway = seeded().await;
        let body = json!({"query": {"match": {"song_name": {"query": "amen co", "operator": "and"}}}});
        let response = gateway.search(&[IndexName::Epf], &body).await.unwrap();
        let ids: Vec<&str> = response["hits"]["hits"]
            .as_array()
            .unwrap()
            .iter()
            .map(|h| h["_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["1"]);
    }

    #[tokio::test]
    async fn test_norm_terms_aggregation() {
        let gateway = seeded().await;
        let body = json!({
            "size": 0,
            "aggs": {"groups": {"terms": {"field": "artist_name.norm"}}}
        });
        let response = gateway.search(&[IndexName::Epf], &body).await.unwrap();
        let buckets = response["aggregations"]["groups"]["buckets"].as_array().unwrap();
        assert_eq!(buckets[0]["key"], "queen");
        assert_eq!(buckets[0]["doc_count"], 2);
        assert_eq!(buckets[1]["key"], "blur");
    }

    #[tokio::test]
    async fn test_composite_after() {
        let gateway = seeded().await;
        let body = json!({
            "size": 0,
            "aggs": {"groups": {"composite": {
                "size": 1,
                "sources": [{"artist_name": {"terms": {"field": "artist_name.norm"}}}],
                "after": {"artist_name": "blur"}
            }}}
        });
        let response = gateway.search(&[IndexName::Epf], &body).await.unwrap();
        let groups = &response["aggregations"]["groups"];
        assert_eq!(groups["buckets"][0]["key"]["artist_name"], "queen");
        assert_eq!(groups["after_key"]["artist_name"], "queen");
    }

    #[tokio::test]
    async fn test_range_and_upsert() {
        let gateway = seeded().await;
        gateway
            .bulk(IndexName::Epf, &[doc("3", json!({"song_name": "Parklife", "release_year_released": 1994}))])
            .await
            .unwrap();
        assert_eq!(gateway.count(IndexName::Epf).await.unwrap(), 3);

        let body = json!({"query": {"range": {"release_year_released": {"gte": 1980, "lte": 1994}}}});
        let response = gateway.search(&[IndexName::Epf], &body).await.unwrap();
        assert_eq!(response["hits"]["total"]["value"], 2);
    }

    #[tokio::test]
    async fn test_closed_index_rejects_search() {
        let gateway = seeded().await;
        gateway.close_index(IndexName::Epf).await.unwrap();
        assert!(gateway.search(&[IndexName::Epf], &json!({})).await.is_err());
        gateway.open_index(IndexName::Epf).await.unwrap();
        assert!(gateway.search(&[IndexName::Epf], &json!({})).await.is_ok());
    }
}
