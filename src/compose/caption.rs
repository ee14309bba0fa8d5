//! Caption styles

use serde::{Deserialize, Serialize};

/// How a phrase becomes a caption. Picked once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptionStyle {
    /// "わぁい{t} あかり{t}大好き"
    #[default]
    Akari,
    /// The phrase as-is
    Plain,
}

impl CaptionStyle {
    pub fn render(&self, text: &str) -> String {
        match self {
            CaptionStyle::Akari => {
                // keep hashtags searchable once embedded in the caption
                let text = if text.starts_with('#') {
                    format!(" {}", text)
                } else {
                    text.to_string()
                };
                format!("わぁい{0} あかり{0}大好き", text)
            }
            CaptionStyle::Plain => text.to_string(),
        }
    }
}
