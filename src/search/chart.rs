use crate::engine::{Bucket, Hit, RawEngineResponse};
use crate::error::{Result, SearchEngineError};
use crate::query::{self, GROUP_AGG, GroupStrategy, MAX_TERMS_WINDOW, TOP_HIT_AGG};
use crate::schema::{self, GENRE_FIELDS, LABEL_FIELD, UID_FIELD, YEAR_FIELD};
use crate::search::SearchService;
use crate::types::{AcField, IndexName, SortOrder, SortSpec, TotalHits};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::str::FromStr;
use strum_macros::{AsRefStr, Display, EnumString};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 1000;
const TOTAL_AGG: &str = "total";
/// Sort value selecting most-documents-first grouping
const COUNT_SORT: &str = "count";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ChartType {
    #[strum(serialize = "songs", serialize = "song")]
    Songs,
    #[strum(serialize = "artists", serialize = "artist")]
    Artists,
    #[strum(serialize = "releases", serialize = "release")]
    Releases,
}

impl ChartType {
    pub fn parse(raw: &str) -> Result<Self> {
        ChartType::from_str(raw.trim())
            .map_err(|_| SearchEngineError::argument(format!("Unknown chart type '{}'", raw)))
    }

    /// Field grouped on, `None` for the flat song listing.
    pub fn group_field(&self) -> Option<AcField> {
        match self {
            ChartType::Songs => None,
            ChartType::Artists => Some(AcField::ArtistName),
            ChartType::Releases => Some(AcField::ReleaseTitle),
        }
    }

    /// Side attributes whose distinct values are collected per group
    fn attributes(&self) -> Vec<&'static str> {
        let mut attributes = vec![LABEL_FIELD];
        attributes.extend(GENRE_FIELDS);
        if *self == ChartType::Releases {
            attributes.push(YEAR_FIELD);
        }
        attributes
    }
}

/// Tabular chart request
#[derive(Debug, Clone, PartialEq)]
pub struct ChartRequest {
    pub chart_type: ChartType,
    /// Field -> raw filter text, from `query[field]` parameters
    pub filters: BTreeMap<String, String>,
    pub page: usize,
    pub page_size: usize,
    pub after: Option<String>,
    pub sort: Option<String>,
    pub index: Option<IndexName>,
}

impl ChartRequest {
    pub fn new(chart_type: ChartType) -> Self {
        Self {
            chart_type,
            filters: BTreeMap::new(),
            page: 0,
            page_size: DEFAULT_PAGE_SIZE,
            after: None,
            sort: None,
            index: None,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    pub fn page(mut self, page: usize, page_size: usize) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    pub fn after(mut self, after: Option<String>) -> Self {
        self.after = after;
        self
    }

    pub fn sort(mut self, sort: Option<String>) -> Self {
        self.sort = sort;
        self
    }

    pub fn index(mut self, index: Option<IndexName>) -> Self {
        self.index = index;
        self
    }

    fn is_count_sort(&self) -> bool {
        self.sort
            .as_deref()
            .and_then(|raw| SortSpec::parse(raw).ok())
            .is_some_and(|spec| spec.field == COUNT_SORT)
    }

    /// Query part shared by all chart types: full-text on autocomplete
    /// fields, filters on attributes.
    fn query(&self) -> Result<Value> {
        let mut must = Vec::new();
        let mut filter = Vec::new();
        for (field, value) in &self.filters {
            let clause = query::full_text_or_filter(field, value)?;
            must.extend(clause.full_text);
            filter.extend(clause.filter);
        }
        Ok(query::bool_query(must, filter))
    }

    fn validate_page_size(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(SearchEngineError::argument(format!(
                "\"pageSize\" must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        Ok(())
    }

    fn song_sort(&self) -> Result<SortSpec> {
        let spec = match self.sort.as_deref() {
            Some(raw) if !raw.trim().is_empty() => SortSpec::parse(raw)?,
            _ => SortSpec::new(AcField::SongName.as_str(), SortOrder::Asc),
        };
        if schema::sort_key(&spec.field).is_none() {
            return Err(SearchEngineError::invalid_field(spec.field));
        }
        Ok(spec)
    }

    fn group_strategy(&self, field: AcField) -> Result<GroupStrategy> {
        if self.is_count_sort() {
            return Ok(GroupStrategy::TopN {
                page: self.page,
                page_size: self.page_size,
            });
        }
        let order = match self.sort.as_deref() {
            Some(raw) if !raw.trim().is_empty() => {
                let spec = SortSpec::parse(raw)?;
                if spec.field != field.as_str() {
                    return Err(SearchEngineError::invalid_field(spec.field));
                }
                spec.order
            }
            _ => SortOrder::Asc,
        };
        let after = self
            .after
            .as_deref()
            .filter(|token| !token.is_empty())
            .map(|token| query::decode_cursor(token, field))
            .transpose()?;
        Ok(GroupStrategy::Cursor {
            page_size: self.page_size,
            order,
            after,
        })
    }

    /// Engine body for this request; every validation error surfaces here.
    pub fn body(&self) -> Result<Value> {
        self.validate_page_size()?;
        let filter_query = self.query()?;
        match self.chart_type.group_field() {
            None => {
                let spec = self.song_sort()?;
                let from = self
                    .page
                    .checked_mul(self.page_size)
                    .filter(|from| from.saturating_add(self.page_size) <= MAX_TERMS_WINDOW);
                let Some(from) = from else {
                    return Err(SearchEngineError::argument(format!(
                        "Page too deep: at most {} songs can be paged through",
                        MAX_TERMS_WINDOW
                    )));
                };
                let sort_key = schema::sort_key(&spec.field)
                    .ok_or_else(|| SearchEngineError::invalid_field(spec.field.as_str()))?;
                Ok(json!({
                    "query": filter_query,
                    "from": from,
                    "size": self.page_size,
                    "sort": [
                        { sort_key: { "order": spec.order.as_str() } },
                        { UID_FIELD: { "order": "asc" } }
                    ],
                    "track_total_hits": true,
                    "aggs": { TOTAL_AGG: query::cardinality(UID_FIELD) }
                }))
            }
            Some(field) => {
                let strategy = self.group_strategy(field)?;
                let attributes = self.chart_type.attributes();
                Ok(json!({
                    "query": filter_query,
                    "size": 0,
                    "aggs": {
                        GROUP_AGG: query::group_aggregation(field, &strategy, &attributes)?,
                        TOTAL_AGG: query::cardinality(&field.norm_field())
                    }
                }))
            }
        }
    }
}

/// One song or spin document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SongRow {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_index")]
    pub index: String,
    #[serde(flatten)]
    pub source: Map<String, Value>,
}

impl From<Hit> for SongRow {
    fn from(hit: Hit) -> Self {
        Self {
            id: hit.id,
            index: hit.index,
            source: hit.source,
        }
    }
}

/// One artist or release with the attribute variants seen across its documents
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRow {
    pub value: String,
    pub count: u64,
    pub labels: Vec<String>,
    pub genres: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub years: Option<Vec<i64>>,
    pub exemplar_id: String,
    pub exemplar_index: String,
    pub exemplar: Map<String, Value>,
}

impl GroupRow {
    fn from_bucket(bucket: &Bucket, field: AcField, chart_type: ChartType) -> Result<Self> {
        let hit = bucket.top_hit(TOP_HIT_AGG)?;
        let value = hit
            .as_ref()
            .and_then(|h| h.source_str(field.as_str()))
            .map(str::to_string)
            .unwrap_or_else(|| bucket.key_str());

        let labels = string_values(bucket.distinct_values(LABEL_FIELD)?);
        let mut genres = Vec::new();
        for genre_field in GENRE_FIELDS {
            for genre in string_values(bucket.distinct_values(genre_field)?) {
                if !genres.contains(&genre) {
                    genres.push(genre);
                }
            }
        }
        let years = match chart_type {
            ChartType::Releases => Some(
                bucket
                    .distinct_values(YEAR_FIELD)?
                    .iter()
                    .filter_map(Value::as_i64)
                    .collect(),
            ),
            _ => None,
        };

        let (exemplar_id, exemplar_index, exemplar) = hit
            .map(|h| (h.id, h.index, h.source))
            .unwrap_or_default();
        Ok(Self {
            value,
            count: bucket.doc_count,
            labels,
            genres,
            years,
            exemplar_id,
            exemplar_index,
            exemplar,
        })
    }
}

fn string_values(values: Vec<Value>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| match v {
            Value::String(s) => s,
            other => other.to_string(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChartRow {
    Song(SongRow),
    Group(GroupRow),
}

/// Paging state returned with a chart page
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum Pagination {
    Offset {
        page: usize,
        page_size: usize,
        sort: Option<String>,
        /// Groups reachable by paging under count ordering; the total may be larger
        #[serde(skip_serializing_if = "Option::is_none")]
        reachable: Option<u64>,
    },
    Cursor {
        /// Token for the next page, absent on the last page
        after: Option<String>,
        /// Token this page was requested with
        prev: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartPage {
    pub took: u64,
    /// Approximate distinct songs or groups matching the filters
    pub total: TotalHits,
    pub rows: Vec<ChartRow>,
    pub pagination: Pagination,
}

impl SearchService {
    pub async fn chart(&self, request: &ChartRequest) -> Result<ChartPage> {
        let body = request.body()?;
        let (_, response) = self.run(&IndexName::targets(request.index), body).await?;

        let hits_total = response.total();
        let total = TotalHits {
            value: response.metric(TOTAL_AGG)?.unwrap_or(0.0) as u64,
            relation: hits_total.relation,
        };

        let (rows, pagination) = match request.chart_type.group_field() {
            None => {
                let spec = request.song_sort()?;
                let rows = response
                    .hits
                    .hits
                    .into_iter()
                    .map(|hit| ChartRow::Song(hit.into()))
                    .collect();
                let pagination = Pagination::Offset {
                    page: request.page,
                    page_size: request.page_size,
                    sort: Some(spec.to_string()),
                    reachable: None,
                };
                (rows, pagination)
            }
            Some(field) => {
                let groups = response.buckets(GROUP_AGG)?;
                let strategy = request.group_strategy(field)?;
                let skip = match strategy {
                    GroupStrategy::TopN { page, page_size } => page.saturating_mul(page_size),
                    GroupStrategy::Cursor { .. } => 0,
                };
                let rows = groups
                    .buckets
                    .iter()
                    .skip(skip)
                    .map(|bucket| {
                        GroupRow::from_bucket(bucket, field, request.chart_type).map(ChartRow::Group)
                    })
                    .collect::<Result<Vec<_>>>()?;

                let pagination = match strategy {
                    GroupStrategy::TopN { page, page_size } => Pagination::Offset {
                        page,
                        page_size,
                        sort: Some(COUNT_SORT.to_string()),
                        reachable: Some(total.value.min(MAX_TERMS_WINDOW as u64)),
                    },
                    GroupStrategy::Cursor { page_size, .. } => {
                        let after = match &groups.after_key {
                            Some(key) if groups.buckets.len() == page_size => {
                                Some(query::encode_cursor(key)?)
                            }
                            _ => None,
                        };
                        Pagination::Cursor {
                            after,
                            prev: request.after.clone(),
                        }
                    }
                };
                (rows, pagination)
            }
        };

        Ok(ChartPage {
            took: response.took,
            total,
            rows,
            pagination,
        })
    }

    pub async fn chart_raw(&self, request: &ChartRequest) -> Result<RawEngineResponse> {
        let body = request.body()?;
        self.run_raw(&IndexName::targets(request.index), body).await
    }
}
