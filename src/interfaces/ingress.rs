//! Validation of externally submitted intents.
//!
//! A submission is a JSON object:
//!
//! ```json
//! {
//!   "agent_id": "BANK-003",
//!   "step": 7,
//!   "action_type": "post_margin",
//!   "payload": { "amount": "25" },
//!   "intent_id": "5f0c1c53-0a43-4c3f-8b7e-0a5bb4e3a2d1"
//! }
//! ```
//!
//! `payload` may be omitted for `no_op`; `intent_id` is optional. Rejected
//! submissions never touch state.

use crate::core::agent_id::AgentId;
use crate::core::error::{RejectionCode, ValidationError};
use crate::core::intent::{Action, ActionKind, Intent};
use crate::core::snapshot::Snapshot;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Reply returned to the submitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<RejectionCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl IngressResponse {
    pub fn accepted(intent_id: Uuid) -> Self {
        Self {
            accepted: true,
            intent_id: Some(intent_id),
            code: None,
            detail: None,
        }
    }

    pub fn rejected(error: &ValidationError) -> Self {
        Self {
            accepted: false,
            intent_id: None,
            code: Some(error.code),
            detail: Some(error.detail.clone()),
        }
    }
}

impl From<Result<Uuid, ValidationError>> for IngressResponse {
    fn from(result: Result<Uuid, ValidationError>) -> Self {
        match result {
            Ok(id) => Self::accepted(id),
            Err(e) => Self::rejected(&e),
        }
    }
}

fn reject(code: RejectionCode, detail: impl Into<String>) -> ValidationError {
    ValidationError::new(code, detail)
}

fn required<'a>(obj: &'a Map<String, Value>, field: &str) -> Result<&'a Value, ValidationError> {
    match obj.get(field) {
        Some(Value::Null) | None => Err(reject(
            RejectionCode::MissingField,
            format!("missing field '{}'", field),
        )),
        Some(v) => Ok(v),
    }
}

/// Validate one raw submission against the snapshot the round was opened
/// from. `step` is the round being decided.
pub fn validate(raw: &str, snapshot: &Snapshot, step: u64) -> Result<Intent, ValidationError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| reject(RejectionCode::Malformed, format!("invalid JSON: {}", e)))?;
    let Value::Object(obj) = value else {
        return Err(reject(RejectionCode::Malformed, "submission must be a JSON object"));
    };
    validate_object(&obj, snapshot, step)
}

/// Validate an already-parsed submission.
pub fn validate_object(
    obj: &Map<String, Value>,
    snapshot: &Snapshot,
    step: u64,
) -> Result<Intent, ValidationError> {
    let agent_id = required(obj, "agent_id")?
        .as_str()
        .map(AgentId::new)
        .ok_or_else(|| reject(RejectionCode::Malformed, "'agent_id' must be a string"))?;
    let submitted_step = required(obj, "step")?
        .as_u64()
        .ok_or_else(|| reject(RejectionCode::Malformed, "'step' must be a non-negative integer"))?;
    let action_type = required(obj, "action_type")?
        .as_str()
        .ok_or_else(|| reject(RejectionCode::Malformed, "'action_type' must be a string"))?;

    let kind: ActionKind = action_type
        .parse()
        .map_err(|e: crate::core::intent::UnknownActionType| {
            reject(RejectionCode::UnknownActionType, e.to_string())
        })?;

    if submitted_step != step {
        return Err(reject(
            RejectionCode::StepMismatch,
            format!("intent for step {} but round {} is open", submitted_step, step),
        ));
    }

    let view = snapshot.banks.get(&agent_id).ok_or_else(|| {
        reject(
            RejectionCode::UnknownAgent,
            format!("no member '{}'", agent_id),
        )
    })?;
    if !view.is_live() {
        return Err(reject(
            RejectionCode::AgentDefaulted,
            format!("member '{}' has defaulted", agent_id),
        ));
    }

    let mut tagged = Map::new();
    tagged.insert("action_type".into(), Value::String(kind.as_str().into()));
    if let Some(payload) = obj.get("payload").filter(|p| !p.is_null()) {
        tagged.insert("payload".into(), payload.clone());
    }
    let action: Action = serde_json::from_value(Value::Object(tagged)).map_err(|e| {
        reject(
            RejectionCode::InvalidPayload,
            format!("{} payload: {}", kind, e),
        )
    })?;
    check_payload(&agent_id, &action, snapshot)?;

    let intent = match obj.get("intent_id").filter(|v| !v.is_null()) {
        Some(v) => {
            let id = v
                .as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| reject(RejectionCode::InvalidPayload, "'intent_id' is not a UUID"))?;
            Intent::with_id(id, agent_id, step, action)
        }
        None => Intent::new(agent_id, step, action),
    };
    Ok(intent)
}

fn positive(field: &str, amount: Decimal) -> Result<(), ValidationError> {
    if amount > Decimal::ZERO {
        Ok(())
    } else {
        Err(reject(
            RejectionCode::InvalidPayload,
            format!("'{}' must be positive, got {}", field, amount),
        ))
    }
}

fn non_negative(field: &str, amount: Decimal) -> Result<(), ValidationError> {
    if amount >= Decimal::ZERO {
        Ok(())
    } else {
        Err(reject(
            RejectionCode::InvalidPayload,
            format!("'{}' must be >= 0, got {}", field, amount),
        ))
    }
}

fn live_counterparty(
    agent: &AgentId,
    counterparty: &AgentId,
    snapshot: &Snapshot,
) -> Result<(), ValidationError> {
    if counterparty == agent {
        return Err(reject(
            RejectionCode::InvalidPayload,
            "counterparty must differ from the submitting agent",
        ));
    }
    match snapshot.banks.get(counterparty) {
        Some(view) if view.is_live() => Ok(()),
        Some(_) => Err(reject(
            RejectionCode::InvalidPayload,
            format!("counterparty '{}' has defaulted", counterparty),
        )),
        None => Err(reject(
            RejectionCode::InvalidPayload,
            format!("unknown counterparty '{}'", counterparty),
        )),
    }
}

fn check_payload(
    agent: &AgentId,
    action: &Action,
    snapshot: &Snapshot,
) -> Result<(), ValidationError> {
    if let Some(cp) = action.counterparty() {
        live_counterparty(agent, cp, snapshot)?;
    }
    match action {
        Action::ReduceExposure { amount, .. }
        | Action::Deleverage { amount }
        | Action::RequestLiquidity { amount, .. }
        | Action::PostMargin { amount } => positive("amount", *amount),
        Action::WithdrawCreditLine { fraction } => {
            if *fraction > Decimal::ZERO && *fraction <= Decimal::ONE {
                Ok(())
            } else {
                Err(reject(
                    RejectionCode::InvalidPayload,
                    format!("'fraction' must be in (0, 1], got {}", fraction),
                ))
            }
        }
        Action::ExtendCredit { amount, rate, .. } => {
            positive("amount", *amount)?;
            non_negative("rate", *rate)
        }
        Action::RequestMarginRelief { extension_rounds } => {
            if *extension_rounds > 0 {
                Ok(())
            } else {
                Err(reject(
                    RejectionCode::InvalidPayload,
                    "'extension_rounds' must be positive",
                ))
            }
        }
        Action::ReportStressSignal {
            liquidity_stress,
            market_volatility,
        } => {
            if !(liquidity_stress.is_finite() && (0.0..=1.0).contains(liquidity_stress)) {
                return Err(reject(
                    RejectionCode::InvalidPayload,
                    "'liquidity_stress' must be in [0, 1]",
                ));
            }
            if !(market_volatility.is_finite() && *market_volatility >= 0.0) {
                return Err(reject(
                    RejectionCode::InvalidPayload,
                    "'market_volatility' must be finite and >= 0",
                ));
            }
            Ok(())
        }
        Action::ExecuteBilateralTrade {
            notional, spread, ..
        } => {
            positive("notional", *notional)?;
            non_negative("spread", *spread)
        }
        Action::DeclareDefault { .. } | Action::NoOp => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::margin::MemberStatus;
    use crate::core::balance_sheet::BalanceSheet;
    use crate::core::snapshot::{BankView, FundSummary, MarginSummary};
    use crate::simulation::market::MarketState;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn view(defaulted: bool) -> BankView {
        let mut balance = BalanceSheet::new(dec!(100), dec!(50), dec!(20), dec!(10));
        if defaulted {
            balance.seize_on_default();
        }
        BankView {
            balance,
            stressed: false,
            status: if defaulted {
                MemberStatus::Defaulted
            } else {
                MemberStatus::Current
            },
            required_margin: Decimal::ZERO,
            outstanding_call: Decimal::ZERO,
            unmet_rounds: 0,
            relief_granted: 0,
            report: None,
        }
    }

    fn snapshot() -> Snapshot {
        let mut banks = BTreeMap::new();
        banks.insert(AgentId::new("A"), view(false));
        banks.insert(AgentId::new("B"), view(false));
        banks.insert(AgentId::new("D"), view(true));
        Snapshot {
            step: 4,
            banks,
            margin: MarginSummary {
                rate: dec!(0.4),
                stress_index: 0.0,
                calls_outstanding: 0,
            },
            fund: FundSummary {
                balance: Decimal::ZERO,
                contributions: BTreeMap::new(),
                forfeited: Decimal::ZERO,
                losses_absorbed: Decimal::ZERO,
                unfunded_deficit: Decimal::ZERO,
            },
            market: MarketState::calm(0.2),
            new_defaults: Vec::new(),
        }
    }

    fn code(raw: &str) -> RejectionCode {
        validate(raw, &snapshot(), 5).unwrap_err().code
    }

    #[test]
    fn test_accepts_well_formed_intent() {
        let intent = validate(
            r#"{"agent_id":"A","step":5,"action_type":"post_margin","payload":{"amount":"12"}}"#,
            &snapshot(),
            5,
        )
        .unwrap();
        assert_eq!(intent.agent_id(), &AgentId::new("A"));
        assert_eq!(intent.action(), &Action::PostMargin { amount: dec!(12) });
    }

    #[test]
    fn test_no_op_needs_no_payload() {
        let intent = validate(
            r#"{"agent_id":"B","step":5,"action_type":"no_op"}"#,
            &snapshot(),
            5,
        )
        .unwrap();
        assert_eq!(intent.action(), &Action::NoOp);
    }

    #[test]
    fn test_keeps_submitted_id() {
        let id = Uuid::new_v4();
        let raw = format!(
            r#"{{"agent_id":"A","step":5,"action_type":"no_op","intent_id":"{}"}}"#,
            id
        );
        assert_eq!(validate(&raw, &snapshot(), 5).unwrap().id(), id);
    }

    #[test]
    fn test_rejection_codes() {
        assert_eq!(code("[1, 2]"), RejectionCode::Malformed);
        assert_eq!(code("{oops"), RejectionCode::Malformed);
        assert_eq!(
            code(r#"{"step":5,"action_type":"no_op"}"#),
            RejectionCode::MissingField
        );
        assert_eq!(
            code(r#"{"agent_id":"A","step":5,"action_type":"buy_the_dip"}"#),
            RejectionCode::UnknownActionType
        );
        assert_eq!(
            code(r#"{"agent_id":"A","step":4,"action_type":"no_op"}"#),
            RejectionCode::StepMismatch
        );
        assert_eq!(
            code(r#"{"agent_id":"Z","step":5,"action_type":"no_op"}"#),
            RejectionCode::UnknownAgent
        );
        assert_eq!(
            code(r#"{"agent_id":"D","step":5,"action_type":"no_op"}"#),
            RejectionCode::AgentDefaulted
        );
        assert_eq!(
            code(r#"{"agent_id":"A","step":5,"action_type":"post_margin","payload":{}}"#),
            RejectionCode::InvalidPayload
        );
    }

    #[test]
    fn test_semantic_payload_checks() {
        assert_eq!(
            code(r#"{"agent_id":"A","step":5,"action_type":"post_margin","payload":{"amount":"-3"}}"#),
            RejectionCode::InvalidPayload
        );
        assert_eq!(
            code(r#"{"agent_id":"A","step":5,"action_type":"request_liquidity","payload":{"lender":"A","amount":"3"}}"#),
            RejectionCode::InvalidPayload
        );
        assert_eq!(
            code(r#"{"agent_id":"A","step":5,"action_type":"request_liquidity","payload":{"lender":"D","amount":"3"}}"#),
            RejectionCode::InvalidPayload
        );
        assert_eq!(
            code(r#"{"agent_id":"A","step":5,"action_type":"withdraw_credit_line","payload":{"fraction":"1.5"}}"#),
            RejectionCode::InvalidPayload
        );
        assert_eq!(
            code(r#"{"agent_id":"A","step":5,"action_type":"report_stress_signal","payload":{"liquidity_stress":2.0,"market_volatility":0.2}}"#),
            RejectionCode::InvalidPayload
        );
    }

    #[test]
    fn test_response_shape() {
        let err = ValidationError::new(RejectionCode::StepMismatch, "late");
        let json = serde_json::to_value(IngressResponse::rejected(&err)).unwrap();
        assert_eq!(json["accepted"], false);
        assert_eq!(json["code"], "step_mismatch");
        assert!(json.get("intent_id").is_none());
    }
}
