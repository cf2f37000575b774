use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use minbar_core::gateway::{FunctionDecl, GenerationConfig};

use crate::schema::Schema;

/// Name the Caller's search tool is registered under.
pub const FUNCTION_SEARCH: &str = "Search";

/// Memory ops below this confidence are discarded.
pub const MEMORY_CONFIDENCE_FLOOR: f64 = 0.75;

const MODEL_FLASH: &str = "gemini-2.5-flash";
const MODEL_FLASH_LITE: &str = "gemini-2.5-flash-lite";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentName {
    Caller,
    Generator,
    Summarizer,
    Memorizer,
}

/// One agent's model binding and generation settings.
#[derive(Clone, Debug)]
pub struct AgentProfile {
    pub name: AgentName,
    pub model: String,
    pub config: GenerationConfig,
}

/// All four profiles, built once at startup.
pub struct AgentRegistry {
    profiles: HashMap<AgentName, AgentProfile>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        let mut profiles = HashMap::new();
        for profile in [
            build_caller(),
            build_generator(),
            build_summarizer(),
            build_memorizer(),
        ] {
            profiles.insert(profile.name, profile);
        }
        Self { profiles }
    }

    pub fn get(&self, name: AgentName) -> &AgentProfile {
        // The constructor installs every variant.
        &self.profiles[&name]
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Structured output of the Summarizer profile.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SummarizerOutput {
    pub summary: String,
}

/// One memory upsert proposed by the Memorizer profile.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryOp {
    pub unique_key: String,
    pub content: String,
    pub confidence: f64,
    pub source_msg: String,
}

/// Structured output of the Memorizer profile.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemorizerOutput {
    #[serde(default)]
    pub memories: Vec<MemoryOp>,
    #[serde(default)]
    pub delete_keys: Vec<String>,
}

/// Tool declaration for the hybrid search function.
pub fn build_search_decl() -> FunctionDecl {
    let content_type_filter = Schema::array_of(
        Schema::string_enum(["tafsir"]).docs("Content Type", ""),
    )
    .docs(
        "Optional Content Types Filter",
        "Filter for content types. Use only when the user's intent explicitly matches one of \
         the available options; otherwise leave empty for a broader result set.",
    );

    let source_filter = Schema::array_of(
        Schema::string_enum(["ibn_kathir"]).docs("Source", ""),
    )
    .docs(
        "Optional Sources Filter",
        "Filter for sources. Use only when the user clearly refers to a specific source or \
         author; otherwise leave empty for a broader result set.",
    );

    let surah_ayah_filter = Schema::object_with(
        [
            (
                "surahs",
                Schema::array_of(Schema::integer_range(1.0, 114.0))
                    .items_bounds(Some(1), None)
                    .docs(
                        "Surah Numbers",
                        "Surah numbers to filter by. With more than one, ayah filtering is ignored.",
                    ),
            ),
            (
                "ayahs",
                Schema::array_of(Schema::integer_range(1.0, 286.0)).docs(
                    "Ayah Numbers",
                    "Specific ayah numbers. Only allowed when exactly one surah is selected.",
                ),
            ),
        ],
        &["surahs"],
    )
    .docs(
        "Optional Surah and Ayah Filters",
        "Use only when the prompt shows interest in a specific part of the Quran; otherwise \
         leave empty for a broader result set.",
    );

    let sub_prompt = Schema::object_with(
        [
            (
                "prompt",
                Schema::string().docs(
                    "Sub-Prompt",
                    "One logical unit of the full prompt. With a single entry this is typically \
                     the full prompt itself.",
                ),
            ),
            ("content_type_filters", content_type_filter),
            ("source_filters", source_filter),
            ("surah_ayah_filters", surah_ayah_filter),
        ],
        &["prompt"],
    )
    .docs(
        "Prompt With Optional Filters",
        "A prompt string with optional filters to constrain the context.",
    );

    let parameters = Schema::object_with(
        [
            (
                "full_prompt",
                Schema::string().docs(
                    "Full Prompt",
                    "The fully transformed prompt: translated into Arabic, normalized from \
                     question to statement form, typos corrected. The canonical semantic base \
                     for search.",
                ),
            ),
            (
                "prompts_with_filters",
                Schema::array_of(sub_prompt)
                    .items_bounds(Some(1), Some(3))
                    .docs(
                        "Prompts With Filters",
                        "Logical subunits of the full prompt. Usually one entry; split into \
                         multiple focused sub-prompts only when the prompt is clearly \
                         multi-part.",
                    ),
            ),
        ],
        &["full_prompt", "prompts_with_filters"],
    )
    .docs(
        "Search Parameters",
        "Input for a hybrid search combining semantic similarity and keyword matching over \
         the transformed prompt.",
    );

    FunctionDecl {
        name: FUNCTION_SEARCH.to_string(),
        description: "Performs a hybrid search over Quranic content using a fully normalized \
                      prompt, optionally split into filtered sub-prompts."
            .to_string(),
        parameters: parameters.into_value(),
    }
}

fn build_caller() -> AgentProfile {
    let system = "\
You are Shaikh, a helpful, multilingual, scholarly assistant making Quran study accessible \
and structured for learners of all backgrounds.

Role and behavior:
- Always respond in the same language as the user's prompt.
- Use rich Markdown formatting: headers, bold text, lists, and tables.
- Answer only from documents already present in the conversation history. If they do not \
sufficiently answer the question, call the Search function instead of guessing.

Search usage:
- Provide full_prompt as a self-contained Arabic rendition of the user's query, folding in \
any clarifying context from earlier turns.
- Provide at least one prompts_with_filters entry. Split into multiple focused sub-prompts \
with filters only when the user's intent clearly supports it.";

    AgentProfile {
        name: AgentName::Caller,
        model: MODEL_FLASH.to_string(),
        config: GenerationConfig {
            system: system.to_string(),
            tools: vec![build_search_decl()],
            response_schema: None,
            temperature: Some(0.0),
        },
    }
}

fn build_generator() -> AgentProfile {
    let system = "\
You are Shaikh, a helpful, multilingual, scholarly assistant making Quran study accessible \
and structured for learners of all backgrounds.

Role and behavior:
- Always respond in the same language as the user's prompt.
- Use rich Markdown formatting: headers, bold text, lists, and tables.
- Answer only from the retrieved documents provided after the final prompt. They are the \
results of your previous search call and the most relevant evidence available.
- Do not guess or fabricate. If the context is insufficient, say so clearly and humbly.";

    AgentProfile {
        name: AgentName::Generator,
        model: MODEL_FLASH_LITE.to_string(),
        config: GenerationConfig {
            system: system.to_string(),
            tools: Vec::new(),
            response_schema: None,
            temperature: Some(0.0),
        },
    }
}

fn build_summarizer() -> AgentProfile {
    let response_schema = Schema::object_with(
        [(
            "summary",
            Schema::string().docs(
                "Session Summary",
                "Concise, structured summary capturing goals, questions, stylistic guidance, \
                 and next steps.",
            ),
        )],
        &["summary"],
    )
    .docs(
        "Response Schema",
        "The structured session summary to persist for continuity between conversations.",
    );

    let system = "\
You are Shaikh, an assistant helping learners make Quran study accessible. Summarize the \
most recent session into a compact, structured form that maximizes continuity for the next \
conversation.

Capture learning goals, references to scholars or tafsir, unresolved questions, stylistic \
and tone preferences, and concrete next steps. Be concise, bullet-like sentences without \
fluff; do not repeat the conversation. Frame the summary as durable context for the next \
session.

Output a JSON object matching the schema with a single summary string. If nothing \
substantial happened, still produce a compact but faithful summary.";

    AgentProfile {
        name: AgentName::Summarizer,
        model: MODEL_FLASH.to_string(),
        config: GenerationConfig {
            system: system.to_string(),
            tools: Vec::new(),
            response_schema: Some(response_schema.into_value()),
            temperature: Some(0.0),
        },
    }
}

fn build_memorizer() -> AgentProfile {
    let memory_item = Schema::object_with(
        [
            (
                "unique_key",
                Schema::string().docs(
                    "Unique Key",
                    "Stable kebab-case key (3-64 chars). Reuse existing keys when updating.",
                ),
            ),
            (
                "content",
                Schema::string().docs(
                    "Memory Content",
                    "One durable fact, preference, or constraint (at most 200 chars). No \
                     secrets or credentials.",
                ),
            ),
            (
                "confidence",
                Schema::number_range(0.0, 1.0).docs(
                    "Confidence",
                    "Confidence from the provided messages only. Must be at least 0.75 to \
                     include.",
                ),
            ),
            (
                "source_msg",
                Schema::string().docs(
                    "Source Message",
                    "Short quote or paraphrase (at most 160 chars) supporting this memory.",
                ),
            ),
        ],
        &["unique_key", "content", "confidence", "source_msg"],
    );

    let response_schema = Schema::object_with(
        [
            (
                "memories",
                Schema::array_of(memory_item).items_bounds(Some(0), Some(7)),
            ),
            (
                "delete_keys",
                Schema::array_of(
                    Schema::string().docs("Unique Key", "Existing key to delete."),
                )
                .items_bounds(Some(0), Some(10)),
            ),
        ],
        &["memories", "delete_keys"],
    )
    .docs(
        "Response Schema",
        "Return upserts in memories and removals in delete_keys. Use empty arrays when \
         nothing changes.",
    );

    let system = "\
You are Shaikh, an assistant helping learners make Quran study accessible. You receive the \
user's existing memories (key and content) and a window of recent messages. Produce only \
durable, reusable items that help future guidance on recitation, memorization, \
understanding, and practice.

When an existing memory is still correct, do nothing. When it needs refinement, return an \
updated item with the same unique_key. When it is clearly wrong or obsolete, put its key in \
delete_keys. When you find a new durable memory, return it under a new unique_key.

Rules: include only items likely valid for weeks or months; omit ephemeral one-offs; no \
secrets or identifiers; base every item on explicit text in the given messages; one concise \
content per concept; include items only with confidence at or above 0.75. Zero to seven \
items is normal. Keys are kebab-case, 3-64 chars, stable per concept (for example \
goal-memorize-juz-amma, pref-tafsir-ibn-kathir).

Output exactly {\"memories\":[...], \"delete_keys\":[...]} with no text outside the JSON.";

    AgentProfile {
        name: AgentName::Memorizer,
        model: MODEL_FLASH.to_string(),
        config: GenerationConfig {
            system: system.to_string(),
            tools: Vec::new(),
            response_schema: Some(response_schema.into_value()),
            temperature: Some(0.1),
        },
    }
}
