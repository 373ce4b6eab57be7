//! Transaction validation functions

use crate::constants::*;
use crate::encoding::encode_transaction;
use crate::types::*;

/// CheckTransaction: 𝒯𝒳 → {valid, invalid}
///
/// A transaction tx = (v, ins, outs, lt) is valid if and only if:
/// 1. |ins| > 0 ∧ |outs| > 0
/// 2. ∀o ∈ outs: 0 ≤ o.value ≤ M_max and Σ o.value ≤ M_max
/// 3. |ins| ≤ M_max_inputs
/// 4. |outs| ≤ M_max_outputs
/// 5. |tx| ≤ M_max_tx_size
/// 6. no two inputs spend the same outpoint; only a coinbase spends the null outpoint
pub fn check_transaction(tx: &Transaction) -> ValidationResult {
    // 1. Check inputs and outputs are not empty
    if tx.inputs.is_empty() || tx.outputs.is_empty() {
        return ValidationResult::Invalid("Empty inputs or outputs".to_string());
    }

    // 2. Check output values are valid
    let mut total_output_value = 0i64;
    for (i, output) in tx.outputs.iter().enumerate() {
        if output.value < 0 || output.value > MAX_MONEY {
            return ValidationResult::Invalid(format!("Invalid output value {} at index {}", output.value, i));
        }
        total_output_value += output.value;
        if total_output_value > MAX_MONEY {
            return ValidationResult::Invalid("Total output value out of range".to_string());
        }
    }

    // 3. Check input count limit
    if tx.inputs.len() > MAX_INPUTS {
        return ValidationResult::Invalid(format!("Too many inputs: {}", tx.inputs.len()));
    }

    // 4. Check output count limit
    if tx.outputs.len() > MAX_OUTPUTS {
        return ValidationResult::Invalid(format!("Too many outputs: {}", tx.outputs.len()));
    }

    // 5. Check transaction size limit
    let tx_size = encode_transaction(tx).len();
    if tx_size > MAX_TX_SIZE {
        return ValidationResult::Invalid(format!("Transaction too large: {} bytes", tx_size));
    }

    // 6. Check outpoints
    if !tx.is_coinbase() {
        let mut seen = std::collections::HashSet::with_capacity(tx.inputs.len());
        for (i, input) in tx.inputs.iter().enumerate() {
            if input.prevout.is_null() {
                return ValidationResult::Invalid(format!("Null prevout at input {}", i));
            }
            if !seen.insert(input.prevout) {
                return ValidationResult::Invalid(format!("Duplicate input at index {}", i));
            }
        }
    }

    ValidationResult::Valid
}

/// Check if transaction is coinbase
pub fn is_coinbase(tx: &Transaction) -> bool {
    tx.is_coinbase()
}
