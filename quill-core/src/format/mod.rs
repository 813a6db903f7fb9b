pub mod json;
pub mod srt;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Client-selectable output formats derived from a raw transcript.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Srt,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Srt => "srt",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(OutputFormat::Json),
            "srt" => Ok(OutputFormat::Srt),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

/// Request metadata threaded into formatted documents.
#[derive(Debug, Clone)]
pub struct FormatMeta {
    pub task_id: String,
    pub file_name: String,
    pub file_hash: String,
}
