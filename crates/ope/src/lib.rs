mod baseline;
mod estimators;
mod evaluator;
mod gate;
mod segments;

pub use baseline::{
    baseline_for_policy, BaselineModel, FeeBaseline, PredictedValueBaseline, SizingBaseline,
};
pub use estimators::{
    doubly_robust, effective_sample_size, ips, wis, EstimatorSet, OpeSample, OpeStats,
};
pub use evaluator::{EvaluationReport, OfflineEvaluator};
pub use gate::{gate_failures, GateFailure, GateThresholds};
pub use segments::{quantile, RegimeThresholds, SegmentJoiner};
