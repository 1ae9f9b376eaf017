use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumCount, EnumIter, FromRepr, IntoStaticStr};

/// Diabetic-retinopathy grade. Discriminants are the model's class indices.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    IntoStaticStr,
    EnumIter,
    EnumCount,
    FromRepr,
)]
#[repr(u8)]
pub enum DrGrade {
    #[serde(rename = "No DR")]
    #[strum(serialize = "No DR")]
    NoDr = 0,
    Mild = 1,
    Moderate = 2,
    Severe = 3,
    Proliferative = 4,
}

impl DrGrade {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        u8::try_from(index).ok().and_then(Self::from_repr)
    }

    pub fn label(self) -> &'static str {
        self.into()
    }

    /// Index -> label table in class order.
    pub fn label_table() -> BTreeMap<u8, String> {
        DrGrade::iter()
            .map(|grade| (grade as u8, grade.label().to_string()))
            .collect()
    }
}

/// Per-class probabilities, serialized in class order under the display labels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradeProbabilities {
    #[serde(rename = "No DR")]
    pub no_dr: f32,
    #[serde(rename = "Mild")]
    pub mild: f32,
    #[serde(rename = "Moderate")]
    pub moderate: f32,
    #[serde(rename = "Severe")]
    pub severe: f32,
    #[serde(rename = "Proliferative")]
    pub proliferative: f32,
}

impl GradeProbabilities {
    pub fn from_array(values: &[f32; 5]) -> Self {
        Self {
            no_dr: values[0],
            mild: values[1],
            moderate: values[2],
            severe: values[3],
            proliferative: values[4],
        }
    }

    pub fn get(&self, grade: DrGrade) -> f32 {
        match grade {
            DrGrade::NoDr => self.no_dr,
            DrGrade::Mild => self.mild,
            DrGrade::Moderate => self.moderate,
            DrGrade::Severe => self.severe,
            DrGrade::Proliferative => self.proliferative,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub status: String,
    pub diagnosis: DrGrade,
    pub severity: String,
    pub confidence: f32,
    pub probabilities: GradeProbabilities,
    pub recommended_action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: String,
    pub detail: String,
}

impl ErrorResponse {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub model_loaded: bool,
    pub service: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub strategy: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfoResponse {
    pub model_name: String,
    pub architecture: String,
    pub input_shape: [usize; 3],
    pub num_classes: usize,
    pub classes: BTreeMap<u8, String>,
    pub total_parameters: u64,
    pub trainable_parameters: u64,
    pub artifact: ArtifactInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_weights: Option<BTreeMap<String, f32>>,
}
