use std::fmt;

use crate::model::ProbabilityVector;
use shared::{DrGrade, GradeProbabilities, PredictionResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn label(self) -> &'static str {
        match self {
            RiskTier::Low => "Low Risk",
            RiskTier::Medium => "Medium Risk",
            RiskTier::High => "High Risk",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

struct GradeGuidance {
    tier: RiskTier,
    recommendation: &'static str,
}

// Indexed by class index.
const GUIDANCE: [GradeGuidance; 5] = [
    GradeGuidance {
        tier: RiskTier::Low,
        recommendation: "No diabetic retinopathy detected. Continue regular checkups annually.",
    },
    GradeGuidance {
        tier: RiskTier::Medium,
        recommendation: "Mild DR detected. Schedule comprehensive eye exam within 3 months.",
    },
    GradeGuidance {
        tier: RiskTier::High,
        recommendation: "Moderate DR detected. Urgent referral to ophthalmologist recommended.",
    },
    GradeGuidance {
        tier: RiskTier::High,
        recommendation: "Severe DR detected. Immediate ophthalmologist consultation required.",
    },
    GradeGuidance {
        tier: RiskTier::High,
        recommendation: "Proliferative DR detected. URGENT - Refer to retinal specialist immediately.",
    },
];

fn guidance(grade: DrGrade) -> &'static GradeGuidance {
    &GUIDANCE[grade.index()]
}

pub fn risk_tier(grade: DrGrade) -> RiskTier {
    guidance(grade).tier
}

pub fn recommendation(grade: DrGrade) -> &'static str {
    guidance(grade).recommendation
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
    pub probabilities: ProbabilityVector,
    pub diagnosis: DrGrade,
    pub confidence: f32,
    pub severity: RiskTier,
    pub recommendation: &'static str,
}

impl PredictionResult {
    pub fn to_response(&self) -> PredictionResponse {
        PredictionResponse {
            status: "success".to_string(),
            diagnosis: self.diagnosis,
            severity: self.severity.label().to_string(),
            confidence: round_to(self.confidence, 4),
            probabilities: GradeProbabilities::from_array(self.probabilities.as_array()),
            recommended_action: self.recommendation.to_string(),
        }
    }
}

fn round_to(value: f32, places: i32) -> f32 {
    let scale = 10f64.powi(places);
    ((f64::from(value) * scale).round() / scale) as f32
}

/// Turns a probability vector into a diagnosis with its clinical guidance.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultFormatter;

impl ResultFormatter {
    pub fn new() -> Self {
        Self
    }

    pub fn format(&self, probabilities: &ProbabilityVector) -> PredictionResult {
        let values = probabilities.as_array();
        // Strict comparison keeps the lowest index on ties.
        let (index, confidence) = values
            .iter()
            .copied()
            .enumerate()
            .fold((0, values[0]), |best, (idx, p)| if p > best.1 { (idx, p) } else { best });
        let diagnosis = DrGrade::from_index(index).unwrap_or(DrGrade::NoDr);

        PredictionResult {
            probabilities: *probabilities,
            diagnosis,
            confidence,
            severity: risk_tier(diagnosis),
            recommendation: recommendation(diagnosis),
        }
    }
}
