//! Validation of the generation job input accepted by the worker.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::manifest::InputManifest;

/// Input keys that hold image references, in processing order.
pub const IMAGE_KEYS: [&str; 3] = ["base_image", "reference_image", "mask_image"];

/// Boolean switch for the background-removal branch of the workflow.
pub const BACKGROUND_REMOVE_KEY: &str = "use_background_remove";

/// A validated generation job input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInput {
    pub base_image: String,
    pub reference_image: String,
    pub mask_image: String,
    pub use_background_remove: bool,
}

impl JobInput {
    /// The image references as a manifest keyed by input name.
    pub fn image_manifest(&self) -> InputManifest {
        [
            ("base_image", self.base_image.as_str()),
            ("reference_image", self.reference_image.as_str()),
            ("mask_image", self.mask_image.as_str()),
        ]
        .into_iter()
        .collect()
    }

    /// Copy of this input with image references taken from `manifest`.
    ///
    /// Keys absent from the manifest keep their current value.
    pub fn with_manifest(&self, manifest: &InputManifest) -> Self {
        let pick = |key: &str, current: &str| manifest.get(key).unwrap_or(current).to_string();
        Self {
            base_image: pick("base_image", &self.base_image),
            reference_image: pick("reference_image", &self.reference_image),
            mask_image: pick("mask_image", &self.mask_image),
            use_background_remove: self.use_background_remove,
        }
    }
}

/// Validate a raw job input.
///
/// A string input is parsed as JSON first. All three image keys must be
/// non-blank strings and [`BACKGROUND_REMOVE_KEY`] must be a boolean.
pub fn validate_input(raw: Option<&Value>) -> Result<JobInput, CoreError> {
    let parsed;
    let value = match raw {
        None | Some(Value::Null) => {
            return Err(CoreError::Validation("Please provide input".into()));
        }
        Some(Value::String(text)) => {
            parsed = serde_json::from_str::<Value>(text)
                .map_err(|_| CoreError::Validation("Invalid JSON format in input".into()))?;
            &parsed
        }
        Some(other) => other,
    };

    let obj = value
        .as_object()
        .ok_or_else(|| CoreError::Validation("Input must be a JSON object".into()))?;

    for key in IMAGE_KEYS.iter().copied().chain([BACKGROUND_REMOVE_KEY]) {
        if !obj.contains_key(key) {
            return Err(CoreError::Validation(format!("Missing '{key}' in input")));
        }
    }

    let image = |key: &str| -> Result<String, CoreError> {
        match obj.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
            _ => Err(CoreError::Validation(format!(
                "'{key}' must be a non-empty string representing an image URL"
            ))),
        }
    };
    let base_image = image("base_image")?;
    let reference_image = image("reference_image")?;
    let mask_image = image("mask_image")?;

    let use_background_remove = obj
        .get(BACKGROUND_REMOVE_KEY)
        .and_then(Value::as_bool)
        .ok_or_else(|| {
            CoreError::Validation(format!("'{BACKGROUND_REMOVE_KEY}' must be a boolean"))
        })?;

    Ok(JobInput {
        base_image,
        reference_image,
        mask_image,
        use_background_remove,
    })
}
