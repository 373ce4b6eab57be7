//! Concurrent script validation
//!
//! Work items flow through a bounded queue to a pool of worker threads; each
//! failure is sent to an unbounded channel and collected once every worker
//! has drained the queue. Validation is exhaustive: one failing input never
//! stops the others.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::Span;

use crate::config::ChainStateConfig;
use crate::error::{display_hash, ChainStateError, Result, ScriptError, ScriptFailure};
use crate::rules::BlockchainRules;
use crate::types::*;

/// Script work for every input of a non-coinbase transaction
pub fn script_inputs(chained_header: &ChainedHeader, loaded_tx: &LoadedTx) -> Result<Vec<TxInputWithPrevOutput>> {
    if loaded_tx.is_coinbase {
        return Ok(Vec::new());
    }

    (0..loaded_tx.transaction.inputs.len())
        .map(|input_index| {
            let prev_output = loaded_tx.prev_output(input_index).ok_or_else(|| {
                ChainStateError::consistency(format!(
                    "tx {} input {} has no resolved previous output",
                    display_hash(&loaded_tx.tx_hash),
                    input_index
                ))
            })?;
            Ok(TxInputWithPrevOutput {
                chained_header: chained_header.clone(),
                transaction: Arc::clone(&loaded_tx.transaction),
                tx_hash: loaded_tx.tx_hash,
                tx_index: loaded_tx.tx_index,
                input_index,
                prev_output: prev_output.clone(),
            })
        })
        .collect()
}

/// Outcome of one validation run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptValidationReport {
    pub checked: usize,
    /// Sorted by (tx index, input index)
    pub failures: Vec<ScriptFailure>,
}

impl ScriptValidationReport {
    pub fn is_valid(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn into_result(self) -> Result<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(ChainStateError::ScriptValidation(self.failures))
        }
    }
}

/// Worker pool factory bound to one rule-set
pub struct ScriptValidator {
    rules: Arc<dyn BlockchainRules>,
    workers: usize,
    concurrent: bool,
    queue_capacity: usize,
    span: Span,
}

impl ScriptValidator {
    pub fn new(rules: Arc<dyn BlockchainRules>, config: &ChainStateConfig, span: Span) -> Self {
        Self {
            rules,
            workers: config.script_workers.max(1),
            concurrent: config.concurrent_script_validation,
            queue_capacity: config.script_queue_capacity.max(1),
            span,
        }
    }

    /// Open a validation run; feed it with `submit`, close it with `finish`
    pub fn start(&self) -> ScriptValidation {
        if !self.concurrent {
            return ScriptValidation::inline(Arc::clone(&self.rules));
        }

        let (work_tx, work_rx) = bounded::<TxInputWithPrevOutput>(self.queue_capacity);
        let (failure_tx, failure_rx) = unbounded::<ScriptFailure>();

        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let work_rx = work_rx.clone();
            let failure_tx = failure_tx.clone();
            let rules = Arc::clone(&self.rules);
            let span = tracing::debug_span!(parent: &self.span, "script_worker", worker);
            let spawned = thread::Builder::new()
                .name(format!("script-worker-{}", worker))
                .spawn(move || {
                    let _enter = span.enter();
                    run_worker(rules.as_ref(), &work_rx, &failure_tx)
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.span.in_scope(|| tracing::warn!(worker, error = %e, "failed to spawn script worker"));
                }
            }
        }

        if handles.is_empty() {
            return ScriptValidation::inline(Arc::clone(&self.rules));
        }

        ScriptValidation {
            rules: Arc::clone(&self.rules),
            work_tx: Some(work_tx),
            handles,
            failure_rx: Some(failure_rx),
            inline_checked: 0,
            inline_failures: Vec::new(),
            span: self.span.clone(),
        }
    }

    /// Validate a complete set of inputs
    pub fn validate_all(&self, items: impl IntoIterator<Item = TxInputWithPrevOutput>) -> ScriptValidationReport {
        let mut validation = self.start();
        for item in items {
            validation.submit(item);
        }
        validation.finish()
    }
}

fn check_item(rules: &dyn BlockchainRules, item: &TxInputWithPrevOutput) -> Option<ScriptFailure> {
    let outcome = catch_unwind(AssertUnwindSafe(|| rules.validate_transaction_script(item)))
        .unwrap_or_else(|_| Err(ScriptError("script verifier panicked".to_string())));
    outcome.err().map(|error| ScriptFailure {
        tx_hash: item.tx_hash,
        tx_index: item.tx_index,
        input_index: item.input_index,
        error,
    })
}

fn run_worker(
    rules: &dyn BlockchainRules,
    work_rx: &Receiver<TxInputWithPrevOutput>,
    failure_tx: &Sender<ScriptFailure>,
) -> usize {
    let mut checked = 0;
    while let Ok(item) = work_rx.recv() {
        checked += 1;
        if let Some(failure) = check_item(rules, &item) {
            let _ = failure_tx.send(failure);
        }
    }
    checked
}

/// One in-flight validation run
pub struct ScriptValidation {
    rules: Arc<dyn BlockchainRules>,
    work_tx: Option<Sender<TxInputWithPrevOutput>>,
    handles: Vec<JoinHandle<usize>>,
    failure_rx: Option<Receiver<ScriptFailure>>,
    inline_checked: usize,
    inline_failures: Vec<ScriptFailure>,
    span: Span,
}

impl ScriptValidation {
    fn inline(rules: Arc<dyn BlockchainRules>) -> Self {
        Self {
            rules,
            work_tx: None,
            handles: Vec::new(),
            failure_rx: None,
            inline_checked: 0,
            inline_failures: Vec::new(),
            span: Span::current(),
        }
    }

    fn check_inline(&mut self, item: &TxInputWithPrevOutput) {
        self.inline_checked += 1;
        if let Some(failure) = check_item(self.rules.as_ref(), item) {
            self.inline_failures.push(failure);
        }
    }

    /// Queue one input; blocks while the queue is full
    pub fn submit(&mut self, item: TxInputWithPrevOutput) {
        let returned = match &self.work_tx {
            Some(work_tx) => work_tx.send(item).err().map(|e| e.into_inner()),
            None => Some(item),
        };
        // every worker gone: validate here
        if let Some(item) = returned {
            self.check_inline(&item);
        }
    }

    /// Close the queue, wait for the workers, and collect failures
    pub fn finish(mut self) -> ScriptValidationReport {
        drop(self.work_tx.take());

        let mut checked = self.inline_checked;
        for handle in self.handles.drain(..) {
            match handle.join() {
                Ok(count) => checked += count,
                Err(_) => self.span.in_scope(|| tracing::error!("script worker terminated abnormally")),
            }
        }

        let mut failures = std::mem::take(&mut self.inline_failures);
        if let Some(failure_rx) = self.failure_rx.take() {
            failures.extend(failure_rx.try_iter());
        }
        failures.sort_by_key(|failure| (failure.tx_index, failure.input_index));

        ScriptValidationReport { checked, failures }
    }
}

impl Drop for ScriptValidation {
    fn drop(&mut self) {
        drop(self.work_tx.take());
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
