//! Standardized risk-level enumeration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Canonical risk level every source is normalized into.
///
/// The string forms are a downstream contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    NormalPrecautions,
    ExerciseCaution,
    ReconsiderTravel,
    AvoidAllTravel,
    /// Legal obligation framing: the requirement is compulsory.
    Mandatory,
    /// Legal obligation framing: advised but not enforced.
    Recommended,
    /// Legal obligation framing: forbidden by the destination.
    Prohibited,
    /// Legal obligation framing: differs by region or traveller.
    Mixed,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 8] = [
        RiskLevel::NormalPrecautions,
        RiskLevel::ExerciseCaution,
        RiskLevel::ReconsiderTravel,
        RiskLevel::AvoidAllTravel,
        RiskLevel::Mandatory,
        RiskLevel::Recommended,
        RiskLevel::Prohibited,
        RiskLevel::Mixed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::NormalPrecautions => "NORMAL_PRECAUTIONS",
            RiskLevel::ExerciseCaution => "EXERCISE_CAUTION",
            RiskLevel::ReconsiderTravel => "RECONSIDER_TRAVEL",
            RiskLevel::AvoidAllTravel => "AVOID_ALL_TRAVEL",
            RiskLevel::Mandatory => "MANDATORY",
            RiskLevel::Recommended => "RECOMMENDED",
            RiskLevel::Prohibited => "PROHIBITED",
            RiskLevel::Mixed => "MIXED",
        }
    }

    /// Position on the 4-tier scale, `None` for auxiliary categories.
    pub fn tier(&self) -> Option<u8> {
        match self {
            RiskLevel::NormalPrecautions => Some(1),
            RiskLevel::ExerciseCaution => Some(2),
            RiskLevel::ReconsiderTravel => Some(3),
            RiskLevel::AvoidAllTravel => Some(4),
            _ => None,
        }
    }

    pub fn is_auxiliary(&self) -> bool {
        self.tier().is_none()
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        RiskLevel::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| AppError::validation(format!("unknown risk level '{wanted}'")))
    }
}
