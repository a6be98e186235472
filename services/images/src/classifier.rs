//! Image type classification from the object key suffix.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Image formats accepted by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Jpeg,
    Png,
}

impl ImageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageType::Jpeg => "jpeg",
            ImageType::Png => "png",
        }
    }

    /// Parse a lowercased suffix
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "jpeg" => Some(ImageType::Jpeg),
            "png" => Some(ImageType::Png),
            _ => None,
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an object key by the text after the last `.` of its final path
/// segment, case-insensitively.
///
/// `.jpg` is not accepted.
pub fn classify(key: &str) -> Result<ImageType, PipelineError> {
    let file_name = key.rsplit('/').next().unwrap_or(key);
    let (_, suffix) = file_name
        .rsplit_once('.')
        .ok_or_else(|| PipelineError::UnknownImageType {
            key: key.to_string(),
        })?;

    let suffix = suffix.to_lowercase();
    ImageType::from_suffix(&suffix).ok_or_else(|| PipelineError::UnsupportedImageType {
        key: key.to_string(),
        suffix,
    })
}
