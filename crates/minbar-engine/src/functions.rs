use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::instrument;

use minbar_core::domain::{ContentType, Filters, QueryWithFilters, SearchQuery, SourceName};
use minbar_core::errors::{MinbarError, Result};
use minbar_core::window::{FunctionCall, FunctionResponse};
use minbar_llm::FUNCTION_SEARCH;

use crate::search::SearchSvc;

/// A tool the Caller profile may invoke by name.
#[async_trait]
pub trait AgentFn: Send + Sync {
    fn name(&self) -> &str;
    async fn call(&self, args: &serde_json::Value) -> Result<FunctionResponse>;
}

/// Name-keyed dispatch for agent functions.
#[derive(Default)]
pub struct FnRegistry {
    functions: HashMap<String, Arc<dyn AgentFn>>,
}

impl FnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, function: Arc<dyn AgentFn>) -> Self {
        self.functions.insert(function.name().to_string(), function);
        self
    }

    /// Dispatch a function call from the model. An unknown name is the
    /// model's mistake, not ours, so it maps to invalid input.
    pub async fn dispatch(&self, call: &FunctionCall) -> Result<FunctionResponse> {
        let function = self.functions.get(&call.name).ok_or_else(|| {
            MinbarError::invalid_input(format!("unknown function: {}", call.name))
        })?;
        function.call(&call.args).await
    }
}

/// Wire shape of the Search tool's arguments, as declared to the model.
#[derive(Debug, Deserialize)]
struct SearchArgs {
    full_prompt: String,
    #[serde(default)]
    prompts_with_filters: Vec<SubPromptArgs>,
}

#[derive(Debug, Deserialize)]
struct SubPromptArgs {
    prompt: String,
    #[serde(default)]
    content_type_filters: Vec<ContentType>,
    #[serde(default)]
    source_filters: Vec<SourceName>,
    #[serde(default)]
    surah_ayah_filters: Option<SurahAyahArgs>,
}

#[derive(Debug, Deserialize)]
struct SurahAyahArgs {
    #[serde(default)]
    surahs: Vec<u16>,
    #[serde(default)]
    ayahs: Vec<u16>,
}

impl SearchArgs {
    fn into_query(self) -> SearchQuery {
        let sub_queries = self
            .prompts_with_filters
            .into_iter()
            .map(|sub| {
                let (surahs, ayahs) = sub
                    .surah_ayah_filters
                    .map_or((Vec::new(), Vec::new()), |sa| (sa.surahs, sa.ayahs));
                QueryWithFilters {
                    query: sub.prompt,
                    filters: Filters {
                        surahs,
                        ayahs,
                        content_types: sub.content_type_filters,
                        sources: sub.source_filters,
                    },
                }
            })
            .collect();
        SearchQuery {
            query: self.full_prompt,
            sub_queries,
        }
    }
}

/// The hybrid search tool. Parses the model's arguments, runs the search,
/// and hands the retrieved documents back as the function response.
pub struct SearchFn {
    search: Arc<SearchSvc>,
}

impl SearchFn {
    pub fn new(search: Arc<SearchSvc>) -> Self {
        Self { search }
    }
}

#[async_trait]
impl AgentFn for SearchFn {
    fn name(&self) -> &str {
        FUNCTION_SEARCH
    }

    #[instrument(skip_all)]
    async fn call(&self, args: &serde_json::Value) -> Result<FunctionResponse> {
        let args: SearchArgs = serde_json::from_value(args.clone())?;
        let query = args.into_query();
        let chunks = self.search.search(&query).await?;

        let documents: Vec<serde_json::Value> = chunks
            .iter()
            .map(|c| {
                serde_json::json!({
                    "text": c.text,
                    "source": c.source,
                    "locator": c.locator,
                })
            })
            .collect();
        Ok(FunctionResponse {
            name: FUNCTION_SEARCH.to_string(),
            response: serde_json::json!({ "documents": documents }),
        })
    }
}
