use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ErrorKind;
use crate::models::job::JobId;

/// Number of working stages reported as `step / total_steps`.
pub const TOTAL_STEPS: u32 = 5;

/// Pipeline stage of a job. Terminal variants carry their own payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum ProcessingStage {
    /// Waiting for a concurrency slot and rate-limit quota.
    Queued { position: usize },
    Initializing,
    Validating,
    Preprocessing,
    /// Prompt assembly from the user prompt and markers.
    Analyzing,
    ModelCall { attempt: u32 },
    PostProcessing,
    Completed,
    Cancelled,
    Error { kind: ErrorKind, detail: String },
}

impl ProcessingStage {
    /// Overall progress range allotted to this stage.
    pub fn range(&self) -> (f64, f64) {
        match self {
            Self::Queued { .. } | Self::Initializing => (0.0, 0.0),
            Self::Validating => (0.0, 0.10),
            Self::Preprocessing => (0.10, 0.30),
            Self::Analyzing => (0.30, 0.60),
            Self::ModelCall { .. } => (0.60, 0.85),
            Self::PostProcessing => (0.85, 1.0),
            Self::Completed => (1.0, 1.0),
            // Terminal failures freeze progress where it was.
            Self::Cancelled | Self::Error { .. } => (0.0, 0.0),
        }
    }

    /// Compose a per-stage fraction into overall progress.
    pub fn overall(&self, fraction: f64) -> f64 {
        let (start, end) = self.range();
        start + (end - start) * fraction.clamp(0.0, 1.0)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Error { .. })
    }

    pub fn step(&self) -> Option<u32> {
        match self {
            Self::Validating => Some(1),
            Self::Preprocessing => Some(2),
            Self::Analyzing => Some(3),
            Self::ModelCall { .. } => Some(4),
            Self::PostProcessing => Some(5),
            _ => None,
        }
    }

    /// Short name used for SSE event types and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::Initializing => "initializing",
            Self::Validating => "validating",
            Self::Preprocessing => "preprocessing",
            Self::Analyzing => "analyzing",
            Self::ModelCall { .. } => "model_call",
            Self::PostProcessing => "post_processing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error { .. } => "error",
        }
    }
}

/// One snapshot of a job's progress as seen by observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingProgress {
    pub job_id: JobId,
    #[serde(flatten)]
    pub stage: ProcessingStage,
    pub progress: f64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_seconds_remaining: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
    pub can_cancel: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub emitted_at: DateTime<Utc>,
}

impl ProcessingProgress {
    pub fn new(job_id: JobId, stage: ProcessingStage, progress: f64, message: impl Into<String>) -> Self {
        let step = stage.step();
        Self {
            job_id,
            progress: progress.clamp(0.0, 1.0),
            message: message.into(),
            estimated_seconds_remaining: None,
            total_steps: step.map(|_| TOTAL_STEPS),
            step,
            can_cancel: !stage.is_terminal(),
            metadata: BTreeMap::new(),
            emitted_at: Utc::now(),
            stage,
        }
    }

    pub fn queued(job_id: JobId, position: usize) -> Self {
        Self::new(
            job_id,
            ProcessingStage::Queued { position },
            0.0,
            format!("Waiting in queue (position {})", position + 1),
        )
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_stage_ranges_are_contiguous() {
        let stages = [
            ProcessingStage::Validating,
            ProcessingStage::Preprocessing,
            ProcessingStage::Analyzing,
            ProcessingStage::ModelCall { attempt: 0 },
            ProcessingStage::PostProcessing,
        ];
        let mut previous_end = 0.0;
        for stage in &stages {
            let (start, end) = stage.range();
            assert!((start - previous_end).abs() < f64::EPSILON, "{stage:?}");
            assert!(end > start);
            previous_end = end;
        }
        assert!((previous_end - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_overall_composition() {
        let stage = ProcessingStage::Preprocessing;
        assert!((stage.overall(0.0) - 0.10).abs() < 1e-9);
        assert!((stage.overall(0.5) - 0.20).abs() < 1e-9);
        assert!((stage.overall(2.0) - 0.30).abs() < 1e-9);
    }

    #[test]
    fn test_terminal_variants() {
        assert!(ProcessingStage::Completed.is_terminal());
        assert!(ProcessingStage::Cancelled.is_terminal());
        assert!(ProcessingStage::Error {
            kind: ErrorKind::Timeout,
            detail: "slow".into()
        }
        .is_terminal());
        assert!(!ProcessingStage::ModelCall { attempt: 2 }.is_terminal());
    }

    #[test]
    fn test_serializes_with_stage_tag() {
        let progress = ProcessingProgress::new(
            Uuid::nil(),
            ProcessingStage::Error {
                kind: ErrorKind::Validation,
                detail: "too big".into(),
            },
            0.05,
            "Image too large",
        );
        let value = serde_json::to_value(&progress).unwrap();
        assert_eq!(value["stage"], "error");
        assert_eq!(value["kind"], "validation");
        assert_eq!(value["detail"], "too big");
        assert_eq!(value["message"], "Image too large");
        assert_eq!(value["can_cancel"], false);
        assert!(value.get("step").is_none());
    }
}
