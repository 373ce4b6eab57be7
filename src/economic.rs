//! Economic model functions: block subsidy and fees

use crate::constants::*;
use crate::error::{display_hash, ChainStateError, Result};
use crate::types::*;

/// GetBlockSubsidy: ℕ → ℤ
///
/// Calculate the block subsidy for a given height.
/// Subsidy halves every 210,000 blocks (HALVING_INTERVAL).
///
/// Formula: subsidy = 50 * C * 2^(-⌊h/H⌋)
/// Where:
/// - h = block height
/// - H = HALVING_INTERVAL (210,000)
/// - C = SATOSHIS_PER_BTC (10^8)
pub fn get_block_subsidy(height: Height) -> i64 {
    let halving_period = height.max(0) as u64 / HALVING_INTERVAL;

    // After 64 halvings, subsidy becomes 0
    if halving_period >= 64 {
        return 0;
    }

    INITIAL_SUBSIDY >> halving_period
}

/// Σ values, where each value and every partial sum lies in [0, MAX_MONEY]
pub fn checked_money_sum(values: impl IntoIterator<Item = i64>) -> Option<i64> {
    values.into_iter().try_fold(0i64, |total, value| {
        if value < 0 {
            return None;
        }
        total.checked_add(value).filter(|total| *total <= MAX_MONEY)
    })
}

/// Fee: 𝒯𝒳 → ℤ
///
/// fee = Σ prev_output(i).value − Σ o.value; zero for a coinbase.
/// Every input must have its previous output resolved and the fee must not be negative.
pub fn calculate_fee(loaded_tx: &LoadedTx) -> Result<i64> {
    if loaded_tx.is_coinbase {
        return Ok(0);
    }

    let mut total_input = 0i64;
    for input_index in 0..loaded_tx.transaction.inputs.len() {
        let prev_output = loaded_tx.prev_output(input_index).ok_or_else(|| {
            ChainStateError::TransactionValidation(format!(
                "tx {} input {} has no resolved previous output",
                display_hash(&loaded_tx.tx_hash),
                input_index
            ))
        })?;
        total_input = total_input
            .checked_add(prev_output.value)
            .filter(|total| *total <= MAX_MONEY)
            .ok_or_else(|| {
                ChainStateError::TransactionValidation(format!(
                    "tx {} input value out of range",
                    display_hash(&loaded_tx.tx_hash)
                ))
            })?;
    }

    let total_output = checked_money_sum(loaded_tx.transaction.outputs.iter().map(|output| output.value))
        .ok_or_else(|| {
            ChainStateError::TransactionValidation(format!(
                "tx {} output value out of range",
                display_hash(&loaded_tx.tx_hash)
            ))
        })?;

    let fee = total_input - total_output;
    if fee < 0 {
        return Err(ChainStateError::TransactionValidation(format!(
            "tx {} spends {} but creates {}",
            display_hash(&loaded_tx.tx_hash),
            total_input,
            total_output
        )));
    }

    Ok(fee)
}
