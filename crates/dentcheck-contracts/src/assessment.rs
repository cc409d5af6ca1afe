use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AssessError;

/// A validated bounding box in absolute pixel space.
///
/// Construction happens in the engine's validator; once built the box
/// satisfies `width > 0`, `height > 0`, `x + width <= image_width` and
/// `y + height <= image_height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DamageDetected {
    Yes,
    No,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
}

/// Typed response model for a damage assessment.
///
/// This is the schema layer the assembler hands its merged map to. Enum
/// fields reject values outside the contract; `bboxes` defaults to empty.
/// `damage_detected = No` alongside non-empty `bboxes` is tolerated: that
/// combination is a quality expectation of the upstream model, not an
/// invariant enforced here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentRecord {
    pub damage_detected: DamageDetected,
    pub damage_type: Vec<String>,
    pub damage_location: String,
    pub severity: Severity,
    pub description: String,
    #[serde(default)]
    pub bboxes: Vec<BBox>,
    pub image_width: u32,
    pub image_height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotated_image_base64: Option<String>,
}

impl AssessmentRecord {
    pub fn from_value(value: Value) -> Result<Self, AssessError> {
        serde_json::from_value(value).map_err(|err| AssessError::SchemaViolation(err.to_string()))
    }

    pub fn to_map(&self) -> Map<String, Value> {
        serde_json::to_value(self)
            .ok()
            .and_then(|value| value.as_object().cloned())
            .unwrap_or_default()
    }
}
