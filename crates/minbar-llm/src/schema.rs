use serde::Serialize;

/// A small JSON Schema builder for tool parameters and structured
/// response formats. Only the subset the agent profiles need.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Schema {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub r#enum: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub required: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Schema>>,
    #[serde(rename = "minItems", skip_serializing_if = "Option::is_none")]
    pub min_items: Option<u64>,
    #[serde(rename = "maxItems", skip_serializing_if = "Option::is_none")]
    pub max_items: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<serde_json::Value>,
}

impl Schema {
    pub fn string() -> Self {
        Self {
            schema_type: Some("string"),
            ..Default::default()
        }
    }

    pub fn string_enum<I, S>(options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            schema_type: Some("string"),
            r#enum: options.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn integer_range(min: f64, max: f64) -> Self {
        Self {
            schema_type: Some("integer"),
            minimum: Some(min),
            maximum: Some(max),
            ..Default::default()
        }
    }

    pub fn number_range(min: f64, max: f64) -> Self {
        Self {
            schema_type: Some("number"),
            minimum: Some(min),
            maximum: Some(max),
            ..Default::default()
        }
    }

    pub fn array_of(item: Schema) -> Self {
        Self {
            schema_type: Some("array"),
            items: Some(Box::new(item)),
            ..Default::default()
        }
    }

    pub fn object_with<const N: usize>(props: [(&str, Schema); N], required: &[&str]) -> Self {
        let mut map = serde_json::Map::new();
        for (name, schema) in props {
            map.insert(name.to_string(), schema.into_value());
        }
        Self {
            schema_type: Some("object"),
            properties: Some(map),
            required: required.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn docs(mut self, title: &str, description: &str) -> Self {
        if !title.is_empty() {
            self.title = Some(title.to_string());
        }
        if !description.is_empty() {
            self.description = Some(description.to_string());
        }
        self
    }

    pub fn items_bounds(mut self, min: Option<u64>, max: Option<u64>) -> Self {
        self.min_items = min;
        self.max_items = max;
        self
    }

    pub fn example(mut self, example: serde_json::Value) -> Self {
        self.example = Some(example);
        self
    }

    pub fn into_value(self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
