//! Intent digest and transaction summaries.
//!
//! The digest covers receiver and ordered actions of every transaction and
//! nothing else: nonces and block hashes are fetched after the user decides,
//! so they cannot be part of what the user approved.

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::protocol::transaction::{ActionArgs, TransactionInput};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalTransaction<'a> {
    receiver_id: &'a str,
    actions: &'a [ActionArgs],
}

/// blake3 hex over the canonical JSON form of `transactions`.
pub fn compute_intent_digest(transactions: &[TransactionInput]) -> Result<String, serde_json::Error> {
    let canonical: Vec<CanonicalTransaction<'_>> = transactions
        .iter()
        .map(|tx| CanonicalTransaction {
            receiver_id: &tx.receiver_id,
            actions: &tx.actions,
        })
        .collect();
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Constant-time digest comparison.
pub fn digests_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionSummary {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposit: Option<String>,
}

/// What the confirmation surface shows for one transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSummary {
    pub receiver_id: String,
    pub actions: Vec<ActionSummary>,
}

pub fn summarize(transactions: &[TransactionInput]) -> Vec<TransactionSummary> {
    transactions
        .iter()
        .map(|tx| TransactionSummary {
            receiver_id: tx.receiver_id.clone(),
            actions: tx
                .actions
                .iter()
                .map(|action| {
                    let (method_name, deposit) = match action {
                        ActionArgs::Transfer { deposit } => (None, Some(deposit.clone())),
                        ActionArgs::FunctionCall {
                            method_name,
                            deposit,
                            ..
                        } => (Some(method_name.clone()), Some(deposit.clone())),
                        _ => (None, None),
                    };
                    ActionSummary {
                        kind: action.name().to_string(),
                        method_name,
                        deposit,
                    }
                })
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(method: &str) -> TransactionInput {
        TransactionInput {
            receiver_id: "app.testnet".to_string(),
            actions: vec![ActionArgs::FunctionCall {
                method_name: method.to_string(),
                args: json!({ "b": 2, "a": 1 }),
                gas: "30000000000000".to_string(),
                deposit: "0".to_string(),
            }],
        }
    }

    #[test]
    fn digest_is_stable() {
        let txs = vec![call("set_greeting")];
        assert_eq!(
            compute_intent_digest(&txs).unwrap(),
            compute_intent_digest(&txs.clone()).unwrap()
        );
    }

    #[test]
    fn digest_changes_with_any_content_change() {
        let base = compute_intent_digest(&[call("set_greeting")]).unwrap();
        assert_ne!(base, compute_intent_digest(&[call("drain")]).unwrap());

        let mut other_receiver = call("set_greeting");
        other_receiver.receiver_id = "evil.testnet".to_string();
        assert_ne!(base, compute_intent_digest(&[other_receiver]).unwrap());
    }

    #[test]
    fn digest_depends_on_order() {
        let a = compute_intent_digest(&[call("one"), call("two")]).unwrap();
        let b = compute_intent_digest(&[call("two"), call("one")]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn comparison_handles_length_mismatch() {
        assert!(digests_match("abc", "abc"));
        assert!(!digests_match("abc", "abcd"));
    }

    #[test]
    fn summary_lists_actions() {
        let summary = summarize(&[call("set_greeting")]);
        assert_eq!(summary[0].actions[0].kind, "FunctionCall");
        assert_eq!(
            summary[0].actions[0].method_name.as_deref(),
            Some("set_greeting")
        );
    }
}
