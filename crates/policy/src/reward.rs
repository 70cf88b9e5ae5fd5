use execbandit_config::RewardConfig;
use execbandit_core_types::{Arm, PolicyFamily, SettlementPayload};

/// Maps one settled selection to the scalar the bandit learns from.
pub trait RewardFunction: Send + Sync {
    fn family(&self) -> PolicyFamily;

    fn reward(&self, context: &[f64], arm: &Arm, settlement: &SettlementPayload) -> f64;
}

/// Remaining fee/slippage budget in bps, negated and scaled down when the order never filled.
#[derive(Debug, Clone)]
pub struct FeeReward {
    pub budget_bps: f64,
    pub unfilled_penalty: f64,
}

impl RewardFunction for FeeReward {
    fn family(&self) -> PolicyFamily {
        PolicyFamily::Fee
    }

    fn reward(&self, _context: &[f64], _arm: &Arm, settlement: &SettlementPayload) -> f64 {
        let headroom = (self.budget_bps
            - settlement.realized_slippage_bps
            - settlement.fee_bps)
            .max(0.0);
        if settlement.filled {
            headroom
        } else {
            -self.unfilled_penalty * headroom
        }
    }
}

/// Realized PnL net of adverse excursion and slippage cost, all in SOL.
#[derive(Debug, Clone)]
pub struct SizingReward {
    pub mae_weight: f64,
    pub slippage_weight: f64,
}

impl RewardFunction for SizingReward {
    fn family(&self) -> PolicyFamily {
        PolicyFamily::Sizing
    }

    fn reward(&self, _context: &[f64], _arm: &Arm, settlement: &SettlementPayload) -> f64 {
        settlement.realized_pnl_sol
            - self.mae_weight * settlement.max_adverse_excursion_sol.abs()
            - self.slippage_weight * settlement.slippage_cost_sol.abs()
    }
}

pub fn reward_function_for(config: &RewardConfig) -> Box<dyn RewardFunction> {
    match config.family {
        PolicyFamily::Fee => Box::new(FeeReward {
            budget_bps: config.fee_budget_bps,
            unfilled_penalty: config.unfilled_penalty,
        }),
        PolicyFamily::Sizing => Box::new(SizingReward {
            mae_weight: config.sizing_mae_weight,
            slippage_weight: config.sizing_slippage_weight,
        }),
    }
}
