use crate::core::agent_id::AgentId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// How an exposure is reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposureMethod {
    /// Counterparty repays in cash, closing part of the position.
    Unwind,
    /// Position stays open; an offsetting hedge covers it.
    Hedge,
}

/// The closed vocabulary of actions a bank can take in one round.
///
/// Serialized adjacently tagged:
/// `{"action_type": "post_margin", "payload": {"amount": "12.5"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", content = "payload", rename_all = "snake_case")]
pub enum Action {
    ReduceExposure {
        counterparty: AgentId,
        amount: Decimal,
        method: ExposureMethod,
    },
    Deleverage {
        amount: Decimal,
    },
    RequestLiquidity {
        lender: AgentId,
        amount: Decimal,
    },
    /// Recall `fraction` of the credit this bank has extended.
    WithdrawCreditLine {
        fraction: Decimal,
    },
    PostMargin {
        amount: Decimal,
    },
    ExtendCredit {
        borrower: AgentId,
        amount: Decimal,
        rate: Decimal,
    },
    RequestMarginRelief {
        extension_rounds: u32,
    },
    ReportStressSignal {
        liquidity_stress: f64,
        market_volatility: f64,
    },
    ExecuteBilateralTrade {
        counterparty: AgentId,
        notional: Decimal,
        spread: Decimal,
    },
    DeclareDefault {
        reason: String,
    },
    NoOp,
}

/// Payload-free discriminant of [`Action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ReduceExposure,
    Deleverage,
    RequestLiquidity,
    WithdrawCreditLine,
    PostMargin,
    ExtendCredit,
    RequestMarginRelief,
    ReportStressSignal,
    ExecuteBilateralTrade,
    DeclareDefault,
    NoOp,
}

impl ActionKind {
    pub const ALL: [ActionKind; 11] = [
        ActionKind::ReduceExposure,
        ActionKind::Deleverage,
        ActionKind::RequestLiquidity,
        ActionKind::WithdrawCreditLine,
        ActionKind::PostMargin,
        ActionKind::ExtendCredit,
        ActionKind::RequestMarginRelief,
        ActionKind::ReportStressSignal,
        ActionKind::ExecuteBilateralTrade,
        ActionKind::DeclareDefault,
        ActionKind::NoOp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::ReduceExposure => "reduce_exposure",
            ActionKind::Deleverage => "deleverage",
            ActionKind::RequestLiquidity => "request_liquidity",
            ActionKind::WithdrawCreditLine => "withdraw_credit_line",
            ActionKind::PostMargin => "post_margin",
            ActionKind::ExtendCredit => "extend_credit",
            ActionKind::RequestMarginRelief => "request_margin_relief",
            ActionKind::ReportStressSignal => "report_stress_signal",
            ActionKind::ExecuteBilateralTrade => "execute_bilateral_trade",
            ActionKind::DeclareDefault => "declare_default",
            ActionKind::NoOp => "no_op",
        }
    }

    pub fn category(&self) -> ActionCategory {
        match self {
            ActionKind::DeclareDefault => ActionCategory::Terminal,
            ActionKind::ReduceExposure | ActionKind::Deleverage => ActionCategory::RiskReducing,
            ActionKind::RequestLiquidity
            | ActionKind::WithdrawCreditLine
            | ActionKind::PostMargin => ActionCategory::Liquidity,
            ActionKind::ExtendCredit | ActionKind::RequestMarginRelief => ActionCategory::Credit,
            ActionKind::ExecuteBilateralTrade => ActionCategory::Market,
            ActionKind::ReportStressSignal => ActionCategory::Reporting,
            ActionKind::NoOp => ActionCategory::Inaction,
        }
    }

    /// Position in [`ActionKind::ALL`]; last-resort tie-break.
    pub fn ordinal(&self) -> usize {
        ActionKind::ALL
            .iter()
            .position(|k| k == self)
            .unwrap_or(ActionKind::ALL.len())
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string names no action in the vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown action type '{0}'")]
pub struct UnknownActionType(pub String);

impl FromStr for ActionKind {
    type Err = UnknownActionType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownActionType(s.to_string()))
    }
}

/// Coarse grouping of actions. The declaration order is the application
/// priority: terminal actions are resolved first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    Terminal,
    RiskReducing,
    Liquidity,
    Credit,
    Market,
    Reporting,
    Inaction,
}

impl ActionCategory {
    pub fn rank(&self) -> u8 {
        *self as u8
    }
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::ReduceExposure { .. } => ActionKind::ReduceExposure,
            Action::Deleverage { .. } => ActionKind::Deleverage,
            Action::RequestLiquidity { .. } => ActionKind::RequestLiquidity,
            Action::WithdrawCreditLine { .. } => ActionKind::WithdrawCreditLine,
            Action::PostMargin { .. } => ActionKind::PostMargin,
            Action::ExtendCredit { .. } => ActionKind::ExtendCredit,
            Action::RequestMarginRelief { .. } => ActionKind::RequestMarginRelief,
            Action::ReportStressSignal { .. } => ActionKind::ReportStressSignal,
            Action::ExecuteBilateralTrade { .. } => ActionKind::ExecuteBilateralTrade,
            Action::DeclareDefault { .. } => ActionKind::DeclareDefault,
            Action::NoOp => ActionKind::NoOp,
        }
    }

    pub fn category(&self) -> ActionCategory {
        self.kind().category()
    }

    /// Counterparty named in the payload, if any.
    pub fn counterparty(&self) -> Option<&AgentId> {
        match self {
            Action::ReduceExposure { counterparty, .. }
            | Action::ExecuteBilateralTrade { counterparty, .. } => Some(counterparty),
            Action::RequestLiquidity { lender, .. } => Some(lender),
            Action::ExtendCredit { borrower, .. } => Some(borrower),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::DeclareDefault { .. })
    }
}

/// An immutable, validated request by one agent for one round.
///
/// The priority is derived from the action category and is never taken
/// from the submitter.
///
/// # Examples
///
/// ```
/// use ccp_risk_engine::core::agent_id::AgentId;
/// use ccp_risk_engine::core::intent::{Action, ActionCategory, Intent};
/// use rust_decimal_macros::dec;
///
/// let intent = Intent::new(AgentId::new("A"), 3, Action::PostMargin { amount: dec!(10) });
/// assert_eq!(intent.step(), 3);
/// assert_eq!(intent.priority(), ActionCategory::Liquidity.rank());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    id: Uuid,
    agent_id: AgentId,
    step: u64,
    action: Action,
    priority: u8,
}

impl Intent {
    pub fn new(agent_id: AgentId, step: u64, action: Action) -> Self {
        Self::with_id(Uuid::new_v4(), agent_id, step, action)
    }

    /// Create an intent with a specific ID (ingress and replay keep the
    /// submitter's id).
    pub fn with_id(id: Uuid, agent_id: AgentId, step: u64, action: Action) -> Self {
        let priority = action.category().rank();
        Self {
            id,
            agent_id,
            step,
            action,
            priority,
        }
    }

    pub fn no_op(agent_id: AgentId, step: u64) -> Self {
        Self::new(agent_id, step, Action::NoOp)
    }

    /// Total order used by the application phase: category priority,
    /// then agent id.
    pub fn ordering_key(&self) -> (u8, &AgentId) {
        (self.priority, &self.agent_id)
    }

    // --- Accessors ---

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }
}

/// Sort intents into application order.
pub fn sort_for_application(intents: &mut [Intent]) {
    intents.sort_by(|a, b| a.ordering_key().cmp(&b.ordering_key()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_vocabulary_is_closed() {
        assert_eq!(ActionKind::ALL.len(), 11);
        for kind in ActionKind::ALL {
            assert_eq!(kind.as_str().parse::<ActionKind>().unwrap(), kind);
        }
        assert!("hedge_everything".parse::<ActionKind>().is_err());
    }

    #[test]
    fn test_category_priority_order() {
        assert!(ActionCategory::Terminal < ActionCategory::RiskReducing);
        assert!(ActionCategory::RiskReducing < ActionCategory::Liquidity);
        assert!(ActionCategory::Liquidity < ActionCategory::Credit);
        assert!(ActionCategory::Credit < ActionCategory::Market);
        assert!(ActionCategory::Market < ActionCategory::Reporting);
        assert!(ActionCategory::Reporting < ActionCategory::Inaction);
    }

    #[test]
    fn test_sort_terminal_first_then_agent() {
        let mut intents = vec![
            Intent::no_op(AgentId::new("D"), 1),
            Intent::new(AgentId::new("B"), 1, Action::PostMargin { amount: dec!(1) }),
            Intent::new(AgentId::new("C"), 1, Action::DeclareDefault { reason: "x".into() }),
            Intent::new(AgentId::new("A"), 1, Action::PostMargin { amount: dec!(1) }),
        ];
        sort_for_application(&mut intents);
        let order: Vec<&str> = intents.iter().map(|i| i.agent_id().as_str()).collect();
        assert_eq!(order, vec!["C", "A", "B", "D"]);
    }

    #[test]
    fn test_action_serde_shape() {
        let action = Action::PostMargin { amount: dec!(12.5) };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action_type"], "post_margin");
        assert_eq!(json["payload"]["amount"], "12.5");

        let no_op: Action = serde_json::from_str(r#"{"action_type":"no_op"}"#).unwrap();
        assert_eq!(no_op, Action::NoOp);
    }

    #[test]
    fn test_priority_is_derived() {
        let intent = Intent::new(
            AgentId::new("A"),
            1,
            Action::DeclareDefault { reason: "insolvent".into() },
        );
        assert_eq!(intent.priority(), 0);
        assert!(intent.action().is_terminal());
    }
}
