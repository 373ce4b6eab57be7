//! Error types for chain-state processing

use thiserror::Error;

use crate::types::Hash;

#[derive(Error, Debug)]
pub enum ChainStateError {
    #[error("Invalid transaction state: {0}")]
    InvalidTransactionState(String),

    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("Script validation failed for {} input(s)", .0.len())]
    ScriptValidation(Vec<ScriptFailure>),

    #[error("Block validation failed: {0}")]
    BlockValidation(String),

    #[error("Transaction validation failed: {0}")]
    TransactionValidation(String),

    #[error("Storage error during {operation} ({key}): {message}")]
    Storage {
        operation: &'static str,
        key: String,
        message: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("No common ancestor: {0}")]
    MissingCommonAncestor(String),

    #[error("Invalid chain: {0}")]
    InvalidChain(String),

    #[error("Block not found: {0}")]
    BlockNotFound(String),
}

impl ChainStateError {
    pub fn consistency(message: impl Into<String>) -> Self {
        ChainStateError::ConsistencyViolation(message.into())
    }

    pub fn storage(operation: &'static str, key: impl Into<String>, message: impl ToString) -> Self {
        ChainStateError::Storage {
            operation,
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Failures that mean the store no longer matches the chain
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChainStateError::ConsistencyViolation(_)
                | ChainStateError::MissingCommonAncestor(_)
                | ChainStateError::Storage { .. }
                | ChainStateError::Serialization(_)
        )
    }
}

/// Failure raised by a rule-set's script verifier
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ScriptError(pub String);

/// One failed input, collected by the script validator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("tx {} (index {tx_index}) input {input_index}: {error}", hex::encode(.tx_hash))]
pub struct ScriptFailure {
    pub tx_hash: Hash,
    pub tx_index: usize,
    pub input_index: usize,
    pub error: ScriptError,
}

pub type Result<T> = std::result::Result<T, ChainStateError>;

/// Hex form of a hash for error messages and log fields
pub fn display_hash(hash: &Hash) -> String {
    hex::encode(hash)
}
