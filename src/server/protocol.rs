//! Wire schema for the service endpoints. Optional fields carry their
//! defaults here, in the schema, rather than in the handler bodies.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;

fn default_prompt() -> String {
    "Describe this image in detail.".to_string()
}

fn default_max_length() -> usize {
    crate::config::ANALYZE_MAX_TOKENS
}

#[derive(Deserialize)]
pub struct CaptionRequest {
    /// Base64-encoded raster image
    pub image: Option<String>,
    /// Informational label echoed back; does not select a model
    pub model: Option<String>,
}

impl Debug for CaptionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CaptionRequest {{ image: <data>, model: {:?} }}",
            self.model
        )
    }
}

#[derive(Deserialize)]
pub struct AnalyzeRequest {
    pub image: Option<String>,
    #[serde(default = "default_prompt")]
    pub prompt: String,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    pub model: Option<String>,
}

impl Debug for AnalyzeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "AnalyzeRequest {{ image: <data>, prompt: {:?}, max_length: {}, model: {:?} }}",
            self.prompt, self.max_length, self.model
        )
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model_loaded: bool,
    pub service: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct CaptionResponse {
    pub caption: String,
    pub model: String,
}

#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub description: String,
    pub prompt: String,
    pub model: String,
}
