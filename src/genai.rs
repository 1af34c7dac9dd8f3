//! Generative REST glue: mind-map expansion and image generation/editing.
//!
//! Thin call/response wrappers over the HTTP generateContent endpoint. The
//! only logic here is request shaping and response field extraction; errors
//! surface to the caller, nothing is retried.

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const TEXT_MODEL: &str = "gemini-2.5-flash";
const IMAGE_MODEL: &str = "gemini-3-pro-image-preview";
const IMAGE_EDIT_MODEL: &str = "gemini-2.5-flash-image";

#[derive(Debug, Error)]
pub enum GenAiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("endpoint returned status {0}")]
    Status(u16),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("response missing {0}")]
    MissingField(&'static str),
}

pub type Result<T> = std::result::Result<T, GenAiError>;

/// One generated mind-map node, possibly with pre-generated children.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawNode {
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub children: Option<Vec<RawNode>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSize {
    K1,
    K2,
    K4,
}

impl ImageSize {
    fn as_str(&self) -> &'static str {
        match self {
            Self::K1 => "1K",
            Self::K2 => "2K",
            Self::K4 => "4K",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    /// Base64 image bytes.
    pub data: String,
    pub mime_type: String,
}

pub struct GenAiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GenAiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: BASE_URL.to_string(),
        }
    }

    /// Point the client somewhere else (test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Generate the next level of children for a mind-map node, given the
    /// label path from the root for context.
    pub async fn expand_node(&self, topic: &str, path: &[&str]) -> Result<Vec<RawNode>> {
        let response = self
            .generate(TEXT_MODEL, expand_request_body(topic, path))
            .await?;
        let text = response
            .first_text()
            .ok_or(GenAiError::MissingField("text part"))?;
        parse_expansion(text)
    }

    pub async fn generate_image(&self, prompt: &str, size: ImageSize) -> Result<GeneratedImage> {
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "imageConfig": { "aspectRatio": "1:1", "imageSize": size.as_str() }
            }
        });
        let response = self.generate(IMAGE_MODEL, body).await?;
        response
            .first_image()
            .ok_or(GenAiError::MissingField("inline image data"))
    }

    pub async fn edit_image(
        &self,
        prompt: &str,
        image_b64: &str,
        mime_type: &str,
    ) -> Result<GeneratedImage> {
        let body = json!({
            "contents": [{ "parts": [
                { "inlineData": { "data": image_b64, "mimeType": mime_type } },
                { "text": prompt }
            ] }]
        });
        let response = self.generate(IMAGE_EDIT_MODEL, body).await?;
        response
            .first_image()
            .ok_or(GenAiError::MissingField("inline image data"))
    }

    async fn generate(
        &self,
        model: &str,
        body: serde_json::Value,
    ) -> Result<GenerateContentResponse> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );
        let response = self.http.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(GenAiError::Status(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<ContentOut>,
}

#[derive(Debug, Deserialize)]
struct ContentOut {
    #[serde(default)]
    parts: Vec<PartOut>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartOut {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

impl GenerateContentResponse {
    fn parts(&self) -> impl Iterator<Item = &PartOut> {
        self.candidates
            .iter()
            .filter_map(|c| c.content.as_ref())
            .flat_map(|c| c.parts.iter())
    }

    fn first_text(&self) -> Option<&str> {
        self.parts().find_map(|p| p.text.as_deref())
    }

    fn first_image(&self) -> Option<GeneratedImage> {
        self.parts().find_map(|p| {
            p.inline_data.as_ref().map(|d| GeneratedImage {
                data: d.data.clone(),
                mime_type: d.mime_type.clone(),
            })
        })
    }
}

fn expand_request_body(topic: &str, path: &[&str]) -> serde_json::Value {
    let context = if path.is_empty() {
        "Root".to_string()
    } else {
        path.join(" > ")
    };

    let system = "You are an expert mind-map builder. Generate the next level of \
        child nodes for the current node, strictly within its scope and consistent \
        with the full path; do not repeat ancestor content. Children must be \
        mutually exclusive and collectively exhaustive. Generate two levels at \
        once so the structure is immediately useful. Keep labels short and \
        descriptions under fifteen words. Return JSON only.";

    let prompt = format!(
        "Current node: \"{topic}\"\nFull path context: {context} > {topic}\n\n\
         Generate 4-6 core sub-directions for \"{topic}\", each with 2-3 \
         pre-generated key children where applicable."
    );

    json!({
        "contents": [{ "parts": [{ "text": prompt }] }],
        "systemInstruction": { "parts": [{ "text": system }] },
        "generationConfig": {
            "responseMimeType": "application/json",
            "responseSchema": {
                "type": "OBJECT",
                "properties": {
                    "children": {
                        "type": "ARRAY",
                        "items": {
                            "type": "OBJECT",
                            "properties": {
                                "label": { "type": "STRING" },
                                "description": { "type": "STRING" },
                                "children": {
                                    "type": "ARRAY",
                                    "items": {
                                        "type": "OBJECT",
                                        "properties": {
                                            "label": { "type": "STRING" },
                                            "description": { "type": "STRING" }
                                        },
                                        "required": ["label", "description"]
                                    }
                                }
                            },
                            "required": ["label", "description"]
                        }
                    }
                }
            }
        }
    })
}

fn parse_expansion(text: &str) -> Result<Vec<RawNode>> {
    #[derive(Deserialize)]
    struct Expansion {
        #[serde(default)]
        children: Vec<RawNode>,
    }

    let parsed: Expansion = serde_json::from_str(text)?;
    Ok(parsed.children)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expansion_parses_nested_children() {
        let text = r#"{
            "children": [
                { "label": "Harmony", "description": "How chords relate",
                  "children": [ { "label": "Cadences", "description": "Phrase endings" } ] },
                { "label": "Rhythm", "description": "Time organization" }
            ]
        }"#;

        let children = parse_expansion(text).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].label, "Harmony");
        assert_eq!(
            children[0].children.as_ref().unwrap()[0].label,
            "Cadences"
        );
        assert!(children[1].children.is_none());
    }

    #[test]
    fn expansion_tolerates_missing_children_key() {
        assert!(parse_expansion("{}").unwrap().is_empty());
        assert!(parse_expansion("not json").is_err());
    }

    #[test]
    fn expand_request_carries_path_context_and_schema() {
        let body = expand_request_body("Scales", &["Music", "Theory"]);

        let prompt = body["contents"][0]["parts"][0]["text"].as_str().unwrap();
        assert!(prompt.contains("Music > Theory > Scales"));
        assert_eq!(
            body["generationConfig"]["responseMimeType"],
            "application/json"
        );
        let required = &body["generationConfig"]["responseSchema"]["properties"]["children"]
            ["items"]["required"];
        assert_eq!(required[0], "label");

        // No ancestors: context falls back to Root.
        let body = expand_request_body("Scales", &[]);
        let prompt = body["contents"][0]["parts"][0]["text"].as_str().unwrap();
        assert!(prompt.contains("Root > Scales"));
    }

    #[test]
    fn image_extraction_finds_inline_data() {
        let response: GenerateContentResponse = serde_json::from_str(
            r#"{
                "candidates": [{ "content": { "parts": [
                    { "text": "Here is your image." },
                    { "inlineData": { "mimeType": "image/png", "data": "aW1n" } }
                ] } }]
            }"#,
        )
        .unwrap();

        let image = response.first_image().unwrap();
        assert_eq!(image.mime_type, "image/png");
        assert_eq!(image.data, "aW1n");
        assert_eq!(response.first_text(), Some("Here is your image."));
    }

    #[test]
    fn empty_candidates_yield_nothing() {
        let response: GenerateContentResponse = serde_json::from_str("{}").unwrap();
        assert!(response.first_text().is_none());
        assert!(response.first_image().is_none());
    }

    #[test]
    fn image_sizes_serialize_to_labels() {
        assert_eq!(ImageSize::K1.as_str(), "1K");
        assert_eq!(ImageSize::K2.as_str(), "2K");
        assert_eq!(ImageSize::K4.as_str(), "4K");
    }
}
