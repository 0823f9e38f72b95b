use crate::error::AppError;
use crate::models::classify_types::Prediction;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Loading,
    Failed,
    Ready,
    Decoding,
    ImageSelected,
    Classifying,
    ResultsAvailable,
}

/// Everything the UI needs to render one frame of the workflow.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSnapshot {
    pub phase: Phase,
    pub loading: bool,
    pub image_name: Option<String>,
    pub image_uri: Option<String>,
    pub predictions: Option<Vec<Prediction>>,
    pub error: Option<AppError>,
}

impl Default for WorkflowSnapshot {
    fn default() -> Self {
        Self {
            phase: Phase::Loading,
            loading: true,
            image_name: None,
            image_uri: None,
            predictions: None,
            error: None,
        }
    }
}
