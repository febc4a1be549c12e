//! Bounded concurrent batching of external calls
//!
//! Batches may finish in any order; results are always put back by batch
//! index so callers can merge them positionally.

use std::future::Future;
use std::ops::Range;

use futures::stream::{self, StreamExt};

use crate::core::context::RunContext;
use crate::core::model::Stage;
use crate::core::retry::RetryPolicy;
use crate::Result;

/// Split `0..len` into consecutive ranges of at most `batch_size`
pub fn batch_ranges(len: usize, batch_size: usize) -> Vec<Range<usize>> {
    let batch_size = batch_size.max(1);
    (0..len)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(len))
        .collect()
}

/// Like [`batch_ranges`], but never leaves a trailing batch shorter than
/// `min_len`: it borrows from the previous batch, or merges into it when the
/// previous batch has nothing to spare
pub fn balanced_ranges(len: usize, batch_size: usize, min_len: usize) -> Vec<Range<usize>> {
    let mut ranges = batch_ranges(len, batch_size);
    if ranges.len() >= 2 {
        let last = ranges.len() - 1;
        let short = min_len.saturating_sub(ranges[last].len());
        if short > 0 {
            if ranges[last - 1].len() >= min_len + short {
                ranges[last - 1].end -= short;
                ranges[last].start -= short;
            } else {
                let tail = ranges.remove(last);
                ranges[last - 1].end = tail.end;
            }
        }
    }
    ranges
}

/// Limits applied to the calls of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicy {
    /// Concurrent batches in flight
    pub parallelism: usize,
    pub retry: RetryPolicy,
}

/// Outcome of one batch, in batch order
#[derive(Debug)]
pub struct BatchResult<T> {
    pub range: Range<usize>,
    pub result: Result<T>,
}

/// Run `call` for every range, at most `parallelism` at a time
pub async fn run_batches<T, F, Fut>(
    ranges: Vec<Range<usize>>,
    parallelism: usize,
    stage: Stage,
    ctx: &RunContext,
    call: F,
) -> Vec<BatchResult<T>>
where
    F: Fn(Range<usize>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let total = ranges.len();
    let mut slots: Vec<Option<Result<T>>> = (0..total).map(|_| None).collect();

    let results = stream::iter(ranges.clone().into_iter().enumerate())
        .map(|(idx, range)| {
            let fut = call(range);
            async move { (idx, fut.await) }
        })
        .buffer_unordered(parallelism.max(1));
    tokio::pin!(results);

    let mut completed = 0;
    while let Some((idx, result)) = results.next().await {
        if let Err(e) = &result {
            ctx.debug(stage, format_args!("batch {idx} failed: {e}"));
        }
        slots[idx] = Some(result);
        completed += 1;
        ctx.report_progress(stage, completed, total);
    }

    ranges
        .into_iter()
        .zip(slots)
        .filter_map(|(range, slot)| slot.map(|result| BatchResult { range, result }))
        .collect()
}
