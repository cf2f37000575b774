use serde::{Deserialize, Serialize};

use crate::errors::{MinbarError, Result};

/// Most sub-queries a single search request may carry.
pub const MAX_SUB_QUERIES: usize = 3;

/// Index label offsets. Surah and ayah numbers share one label space with
/// content types and sources, so they are shifted into disjoint ranges.
pub const SURAH_LABEL_OFFSET: i64 = 1000;
pub const AYAH_LABEL_OFFSET: i64 = 2000;

/// Final result size handed back from reranking.
pub const TOP_K_DOCUMENTS: usize = 20;

/// A retrievable corpus unit. Immutable and read-only to the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: u32,
    /// Parent document. Non-owning back-reference.
    pub doc_id: u32,
    pub text: String,
    pub source: String,
    pub locator: Option<Locator>,
}

/// Position of a chunk within the corpus hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub surah: u16,
    pub ayah_start: u16,
    pub ayah_end: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Tafsir,
}

impl ContentType {
    pub fn label(self) -> i64 {
        match self {
            Self::Tafsir => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceName {
    IbnKathir,
}

impl SourceName {
    pub fn label(self) -> i64 {
        match self {
            Self::IbnKathir => 101,
        }
    }
}

/// Filters attached to one sub-query, as supplied by the model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Filters {
    #[serde(default)]
    pub surahs: Vec<u16>,
    #[serde(default)]
    pub ayahs: Vec<u16>,
    #[serde(default)]
    pub content_types: Vec<ContentType>,
    #[serde(default)]
    pub sources: Vec<SourceName>,
}

impl Filters {
    pub fn is_empty(&self) -> bool {
        self.surahs.is_empty()
            && self.ayahs.is_empty()
            && self.content_types.is_empty()
            && self.sources.is_empty()
    }

    /// Flatten into the shared index label space.
    pub fn to_labels(&self) -> Vec<i64> {
        let mut labels = Vec::new();
        labels.extend(self.content_types.iter().map(|ct| ct.label()));
        labels.extend(self.sources.iter().map(|s| s.label()));
        labels.extend(self.surahs.iter().map(|s| i64::from(*s) + SURAH_LABEL_OFFSET));
        labels.extend(self.ayahs.iter().map(|a| i64::from(*a) + AYAH_LABEL_OFFSET));
        labels
    }
}

/// A search request as it arrives from the model's function call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchQuery {
    /// The user's question verbatim, used for the final rerank.
    pub query: String,
    pub sub_queries: Vec<QueryWithFilters>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryWithFilters {
    pub query: String,
    #[serde(default)]
    pub filters: Filters,
}

/// One validated sub-query moving through the search pipeline. The
/// embedding stays empty until the embedding stage fills it.
#[derive(Clone, Debug)]
pub struct SubQuery {
    pub text: String,
    pub labels: Vec<i64>,
    pub embedding: Option<Vec<f32>>,
}

/// Validate a search request and translate its filters to index labels.
///
/// An ayah filter only makes sense inside a single surah; with more than
/// one surah the ayah filter is dropped rather than rejected.
pub fn validate_query(query: &SearchQuery) -> Result<Vec<SubQuery>> {
    if query.sub_queries.is_empty() {
        return Err(MinbarError::invalid_input("search requires at least one sub-query"));
    }
    if query.sub_queries.len() > MAX_SUB_QUERIES {
        return Err(MinbarError::invalid_input(format!(
            "search accepts at most {MAX_SUB_QUERIES} sub-queries"
        )));
    }

    let mut out = Vec::with_capacity(query.sub_queries.len());
    for item in &query.sub_queries {
        let mut filters = item.filters.clone();
        if !filters.ayahs.is_empty() && filters.surahs.len() != 1 {
            if filters.surahs.len() > 1 {
                filters.ayahs.clear();
            } else {
                return Err(MinbarError::invalid_input(
                    "ayah filters require exactly one surah filter",
                ));
            }
        }
        out.push(SubQuery {
            text: item.query.clone(),
            labels: filters.to_labels(),
            embedding: None,
        });
    }
    Ok(out)
}

/// A (chunk, score) pair. Scores are comparable only within one ranking
/// batch.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rank {
    pub chunk_id: u32,
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(query: &str, surahs: Vec<u16>, ayahs: Vec<u16>) -> QueryWithFilters {
        QueryWithFilters {
            query: query.into(),
            filters: Filters {
                surahs,
                ayahs,
                ..Default::default()
            },
        }
    }

    fn request(sub_queries: Vec<QueryWithFilters>) -> SearchQuery {
        SearchQuery {
            query: "full question".into(),
            sub_queries,
        }
    }

    #[test]
    fn empty_request_rejected() {
        let err = validate_query(&request(vec![])).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn too_many_sub_queries_rejected() {
        let subs = (0..4).map(|i| sub(&format!("q{i}"), vec![], vec![])).collect();
        let err = validate_query(&request(subs)).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn unfiltered_sub_query_passes() {
        let out = validate_query(&request(vec![sub("q", vec![], vec![])])).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].labels.is_empty());
        assert!(out[0].embedding.is_none());
    }

    #[test]
    fn ayah_without_surah_rejected() {
        let err = validate_query(&request(vec![sub("q", vec![], vec![255])])).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn ayah_with_one_surah_passes() {
        let out = validate_query(&request(vec![sub("q", vec![2], vec![255])])).unwrap();
        assert_eq!(out[0].labels, vec![1002, 2255]);
    }

    #[test]
    fn multiple_surahs_clear_ayahs() {
        let out = validate_query(&request(vec![sub("q", vec![2, 3], vec![255])])).unwrap();
        assert_eq!(out[0].labels, vec![1002, 1003]);
    }

    #[test]
    fn content_type_and_source_labels() {
        let q = QueryWithFilters {
            query: "q".into(),
            filters: Filters {
                content_types: vec![ContentType::Tafsir],
                sources: vec![SourceName::IbnKathir],
                ..Default::default()
            },
        };
        let out = validate_query(&request(vec![q])).unwrap();
        assert_eq!(out[0].labels, vec![1, 101]);
    }
}
