//! The fetch-until-exhausted loop

use futures::Stream;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::accumulate::AccumulatedResult;
use super::{ContinuationState, pending_modules};
use crate::error::{Error, Result};
use crate::module::{ModuleInput, PageSetSelector, ResultSlot};
use crate::outcome::{ApiResult, ItemError, Outcome, TransientReason, Warning};
use crate::request::RequestBuilder;
use crate::session::Session;

/// How a query ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStatus {
    /// The server reported no further data.
    Complete,
    /// Every module still reporting data had reached its item cap.
    Capped,
    /// Cancelled by the caller; the result holds every completed round.
    Cancelled,
    /// A round failed after some modules had finished. Their results are
    /// kept; the unfinished modules' data was discarded.
    Failed {
        code: String,
        info: String,
        discarded: Vec<String>,
    },
}

impl QueryStatus {
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed { .. })
    }
}

/// One round of a query as it arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundBatch {
    /// 1-based round number.
    pub round: usize,
    pub result: ApiResult,
    pub warnings: Vec<Warning>,
}

/// Merged outcome of a whole query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub data: AccumulatedResult,
    pub warnings: Vec<Warning>,
    pub item_errors: Vec<ItemError>,
    pub status: QueryStatus,
    pub rounds: usize,
}

/// A running query. Drive it with [`QueryStream::next_round`], run it to the
/// end with [`QueryStream::collect`], or turn it into a [`Stream`] of rounds.
pub struct QueryStream {
    session: Arc<Session>,
    inputs: Vec<ModuleInput>,
    selector: PageSetSelector,
    cancel: CancellationToken,
    continuation: Option<ContinuationState>,
    accumulated: AccumulatedResult,
    warnings: Vec<Warning>,
    item_errors: Vec<ItemError>,
    capped: BTreeSet<String>,
    done: BTreeSet<String>,
    rounds: usize,
    /// Retries spent so far, across all rounds.
    retries: u32,
    status: Option<QueryStatus>,
}

impl QueryStream {
    pub(crate) fn new(
        session: Arc<Session>,
        inputs: Vec<ModuleInput>,
        selector: PageSetSelector,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            inputs,
            selector,
            cancel,
            continuation: None,
            accumulated: AccumulatedResult::new(),
            warnings: Vec::new(),
            item_errors: Vec::new(),
            capped: BTreeSet::new(),
            done: BTreeSet::new(),
            rounds: 0,
            retries: 0,
            status: None,
        }
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_some()
    }

    /// Results merged so far.
    pub fn accumulated(&self) -> &AccumulatedResult {
        &self.accumulated
    }

    /// Run one round. Returns `None` once the query has finished.
    pub async fn next_round(&mut self) -> Result<Option<RoundBatch>> {
        if self.status.is_some() {
            return Ok(None);
        }
        let max_rounds = self.session.config().max_rounds;
        if self.rounds >= max_rounds {
            self.status = Some(QueryStatus::Failed {
                code: "protocol-exhausted".to_string(),
                info: format!("continuation did not finish within {max_rounds} rounds"),
                discarded: Vec::new(),
            });
            return Err(Error::ProtocolExhausted { rounds: self.rounds });
        }

        let ctx = self.session.build_context();
        let mut builder = RequestBuilder::new(&ctx, &self.inputs)
            .selector(&self.selector)
            .continuation(self.continuation.as_ref());
        for (name, limit) in self.remaining_limits(ctx.high_limit) {
            builder = builder.limit_override(&name, limit);
        }
        let request = match builder.build() {
            Ok(request) => request,
            Err(e) => {
                self.fail("configuration", &e.to_string());
                return Err(e);
            }
        };
        debug!(
            "Query round {} ({})",
            self.rounds + 1,
            request.module_label()
        );

        let outcome = match self
            .session
            .call(&request, &mut self.retries, &self.cancel)
            .await {
            Ok(outcome) => outcome,
            Err(Error::Cancelled) => {
                self.status = Some(QueryStatus::Cancelled);
                return Err(Error::Cancelled);
            }
            Err(e) => {
                self.fail("transport", &e.to_string());
                return Err(e);
            }
        };

        let (result, warnings) = match outcome {
            Outcome::Success(result) => (result, Vec::new()),
            Outcome::SuccessWithWarnings(result, warnings) => (result, warnings),
            Outcome::Fatal { code, info }
            | Outcome::RetryableTransient(TransientReason::TokenRejected { code, info }) => {
                self.fail(&code, &info);
                return Err(self.session.api_error(code, info, &request));
            }
            Outcome::NeedsChallenge(challenge) => {
                self.fail("captcha", &challenge.kind);
                return Err(Error::ChallengeRequired(challenge));
            }
            Outcome::RetryableLag(_) | Outcome::RetryableTransient(_) => {
                self.fail("retry", "retryable outcome escaped the retry loop");
                return Err(Error::Transient {
                    reason: "retryable outcome escaped the retry loop".to_string(),
                    attempts: 1,
                });
            }
        };

        self.rounds += 1;
        self.merge_round(&result);
        self.warnings.extend(warnings.iter().cloned());
        self.item_errors.extend(result.item_errors.iter().cloned());

        Ok(Some(RoundBatch {
            round: self.rounds,
            result,
            warnings,
        }))
    }

    /// Run every remaining round and return the merged result.
    ///
    /// Cancellation returns what was merged so far with
    /// [`QueryStatus::Cancelled`]. A failing round returns the modules that
    /// had already finished with [`QueryStatus::Failed`], or the error when
    /// none had.
    pub async fn collect(mut self) -> Result<QueryResult> {
        loop {
            match self.next_round().await {
                Ok(Some(_)) => {}
                Ok(None) | Err(Error::Cancelled) => break,
                Err(Error::Api { .. }) if !self.done.is_empty() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(self.finish())
    }

    /// Stop and return what has been merged so far.
    pub fn finish(self) -> QueryResult {
        let status = self.status.unwrap_or(QueryStatus::Cancelled);
        QueryResult {
            data: self.accumulated,
            warnings: self.warnings,
            item_errors: self.item_errors,
            status,
            rounds: self.rounds,
        }
    }

    /// The rounds of this query as a stream. The stream ends after the last
    /// round or after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<RoundBatch>> + Send {
        futures::stream::unfold(Some(self), |query| async move {
            let mut query = query?;
            match query.next_round().await {
                Ok(Some(batch)) => Some((Ok(batch), Some(query))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Per-module limit for the next round, shrunk to what each capped
    /// module still needs.
    fn remaining_limits(&self, high_limit: u32) -> Vec<(String, u32)> {
        self.inputs
            .iter()
            .filter_map(|module| {
                let max = module.limit().max_items?;
                let have = self.accumulated.item_count(&module.result_slot());
                let remaining = u32::try_from(max.saturating_sub(have)).unwrap_or(u32::MAX);
                let batch = module.limit().batch_size.unwrap_or(high_limit);
                Some((module.name().to_string(), batch.min(remaining).max(1)))
            })
            .collect()
    }

    fn merge_round(&mut self, result: &ApiResult) {
        let pages_capped = self
            .inputs
            .iter()
            .any(|m| m.result_slot() == ResultSlot::Pages && self.capped.contains(m.name()));
        self.accumulated.merge(&result.data, !pages_capped);

        for module in &self.inputs {
            if let Some(max) = module.limit().max_items {
                let slot = module.result_slot();
                if self.accumulated.item_count(&slot) >= max {
                    self.accumulated.truncate(&slot, max);
                    self.capped.insert(module.name().to_string());
                }
            }
        }

        let mut pending = result
            .continuation
            .as_ref()
            .map(|raw| pending_modules(raw, &self.inputs))
            .unwrap_or_default();
        if result.continuation.is_some() && pending.is_empty() {
            // Keys we cannot attribute: assume every module may have more.
            pending = self.inputs.iter().map(|m| m.name().to_string()).collect();
        }
        self.done = self
            .inputs
            .iter()
            .map(|m| m.name().to_string())
            .filter(|name| !pending.contains(name))
            .collect();

        if pending.iter().all(|name| self.capped.contains(name)) {
            self.status = Some(if pending.is_empty() {
                QueryStatus::Complete
            } else {
                QueryStatus::Capped
            });
            self.continuation = None;
            debug!("Query finished after {} round(s)", self.rounds);
            return;
        }

        let generator = self
            .inputs
            .iter()
            .find(|m| m.is_generator())
            .map(ModuleInput::name);
        self.continuation = ContinuationState::advance(
            self.continuation.as_ref(),
            result.continuation.as_ref(),
            generator,
        );
        if self.continuation.is_none() {
            self.status = Some(QueryStatus::Complete);
        }
    }

    /// Drop unfinished modules' data and record the failure.
    fn fail(&mut self, code: &str, info: &str) {
        let mut discarded = Vec::new();
        for module in &self.inputs {
            if !self.done.contains(module.name()) {
                self.accumulated.discard(&module.result_slot());
                discarded.push(module.name().to_string());
            }
        }
        if !discarded.is_empty() && self.rounds > 0 {
            warn!(
                "Query failed ({code}); discarding partial results of {}",
                discarded.join(", ")
            );
        }
        self.status = Some(QueryStatus::Failed {
            code: code.to_string(),
            info: info.to_string(),
            discarded,
        });
    }
}
