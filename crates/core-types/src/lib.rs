use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStrictness {
    Strict,
    Normal,
    Loose,
}

impl GateStrictness {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Normal => "normal",
            Self::Loose => "loose",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "strict" => Some(Self::Strict),
            "normal" => Some(Self::Normal),
            "loose" => Some(Self::Loose),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TipPercentile {
    P25,
    P50,
    P75,
    P90,
}

impl TipPercentile {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::P25 => "p25",
            Self::P50 => "p50",
            Self::P75 => "p75",
            Self::P90 => "p90",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "p25" => Some(Self::P25),
            "p50" => Some(Self::P50),
            "p75" => Some(Self::P75),
            "p90" => Some(Self::P90),
            _ => None,
        }
    }
}

/// Execution parameters applied by the order-placement service when an arm is chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmBundle {
    pub gate: GateStrictness,
    pub slippage_bps: u32,
    pub tip_percentile: TipPercentile,
    pub size_multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arm {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(flatten)]
    pub bundle: ArmBundle,
}

/// Which reward function and baseline model a deployment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyFamily {
    Fee,
    Sizing,
}

impl PolicyFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fee => "fee",
            Self::Sizing => "sizing",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fee" => Some(Self::Fee),
            "sizing" => Some(Self::Sizing),
            _ => None,
        }
    }
}

/// Persisted ridge-regression statistics for one arm. `ainv` is row-major d x d.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanditStateRow {
    pub arm_id: String,
    pub ainv: Vec<f64>,
    pub b: Vec<f64>,
    pub updates: u64,
}

impl BanditStateRow {
    pub fn dim(&self) -> usize {
        self.b.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSelection {
    pub correlation_id: String,
    pub instrument_id: String,
    pub arm_id: String,
    pub context: Vec<f64>,
    pub predicted_value: f64,
    pub logged_propensity: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyActionRecord {
    pub correlation_id: String,
    pub arm_id: String,
    pub instrument_id: String,
    pub context: Value,
    pub parameters: Value,
    pub logged_propensity: f64,
    pub reward: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PolicyActionRecord {
    /// Feature vector stored under `context.features` at selection time.
    pub fn features(&self) -> Option<Vec<f64>> {
        self.context
            .get("features")?
            .as_array()?
            .iter()
            .map(Value::as_f64)
            .collect()
    }
}

/// Trade outcome reported by the execution service once a selection settles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementPayload {
    pub filled: bool,
    pub realized_slippage_bps: f64,
    pub fee_bps: f64,
    pub realized_pnl_sol: f64,
    pub max_adverse_excursion_sol: f64,
    pub slippage_cost_sol: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementEvent {
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub instrument_id: String,
    pub settled_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: SettlementPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecOutcomeRow {
    pub ts: DateTime<Utc>,
    pub filled: bool,
    pub time_to_land_ms: Option<u64>,
    pub priority_fee_lamports: Option<u64>,
    pub route: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillRow {
    pub ts: DateTime<Utc>,
    pub instrument_id: String,
    pub route: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationEventRow {
    pub ts: DateTime<Utc>,
    pub instrument_id: String,
}
