//! Dependency-aware execution scheduler for tool invocations.
//!
//! Invocations resolve into dependency batches; each batch dispatches
//! concurrently (bounded by a semaphore) and is fully drained before the
//! next batch starts, so batches act as the dependency barrier. A shared
//! in-flight registry guarantees at most one concurrent execution per
//! fingerprint: duplicates in a batch await the one real execution rather
//! than racing through a cache miss.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::core::cache::{ToolCache, fingerprint};
use crate::core::resolver::{self, ResolveError, ToolInvocation};
use crate::tools::{ToolError, ToolRegistry, ToolResult};

// === Policy ===

/// What to do when an invocation in a batch fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// First failure stops dispatching further work; in-flight executions
    /// still complete.
    FailFast,
    /// Collect failures and keep going.
    Continue,
    /// Retry retryable failures with exponential backoff, then continue.
    Retry,
}

#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    pub max_concurrency: usize,
    pub tool_timeout: Duration,
    pub failure: FailurePolicy,
    pub retry: RetryPolicy,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            max_concurrency: crate::config::DEFAULT_MAX_CONCURRENCY,
            tool_timeout: Duration::from_secs(crate::config::DEFAULT_TOOL_TIMEOUT_SECS),
            failure: FailurePolicy::Continue,
            retry: RetryPolicy::default(),
        }
    }
}

// === Results ===

/// Outcome of running (or short-circuiting) one invocation.
#[derive(Debug, Clone)]
pub struct ToolExecutionResult {
    pub fingerprint: String,
    pub invocation_id: String,
    pub tool_name: String,
    pub success: bool,
    /// Tool output when execution produced one.
    pub output: Option<ToolResult>,
    /// Human-readable failure reason.
    pub error: Option<String>,
    pub duration_ms: u64,
    pub from_cache: bool,
}

impl ToolExecutionResult {
    /// Content suitable for feeding back to the model.
    #[must_use]
    pub fn content(&self) -> &str {
        match (&self.output, &self.error) {
            (Some(output), _) => &output.content,
            (None, Some(error)) => error,
            (None, None) => "",
        }
    }
}

// === Scheduler ===

/// Shared state guarded by one mutex so cache and in-flight check-then-act
/// sequences are atomic. The mutex is synchronous; no holder ever awaits
/// while locked, and guard-based cleanup must be able to lock from `Drop`.
struct Shared {
    cache: ToolCache,
    inflight: HashMap<String, watch::Receiver<Option<ToolExecutionResult>>>,
}

fn lock_shared(shared: &StdMutex<Shared>) -> MutexGuard<'_, Shared> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Owns one fingerprint's in-flight registry entry. Dropping the slot
/// releases the entry, so a dropped `execute` future cannot leave the
/// fingerprint permanently resolving to a missing result.
struct InflightSlot {
    shared: Arc<StdMutex<Shared>>,
    fingerprint: String,
}

impl Drop for InflightSlot {
    fn drop(&mut self) {
        lock_shared(&self.shared)
            .inflight
            .remove(&self.fingerprint);
    }
}

/// Executes batches of tool invocations against a registry, with caching
/// and per-fingerprint dedup. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Scheduler {
    registry: ToolRegistry,
    shared: Arc<StdMutex<Shared>>,
}

enum DispatchPlan {
    Cached(Box<ToolExecutionResult>),
    Await(watch::Receiver<Option<ToolExecutionResult>>),
    Run(watch::Sender<Option<ToolExecutionResult>>, InflightSlot),
}

impl Scheduler {
    #[must_use]
    pub fn new(registry: ToolRegistry, cache_max_entries: usize, cache_ttl: Duration) -> Self {
        Self {
            registry,
            shared: Arc::new(StdMutex::new(Shared {
                cache: ToolCache::new(cache_max_entries, cache_ttl),
                inflight: HashMap::new(),
            })),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn clear_cache(&self) {
        lock_shared(&self.shared).cache.clear();
    }

    #[cfg(test)]
    pub(crate) fn inflight_len(&self) -> usize {
        lock_shared(&self.shared).inflight.len()
    }

    /// Execute a set of invocations, respecting declared dependencies.
    ///
    /// Per-invocation failures come back as results with `success: false`;
    /// only structural errors (cycles, unknown dependencies) fail the call
    /// itself. The returned map is keyed by fingerprint.
    pub async fn execute(
        &self,
        invocations: &[ToolInvocation],
        policy: &ExecutionPolicy,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, ToolExecutionResult>, ResolveError> {
        let batches = resolver::resolve(invocations)?;
        let semaphore = Arc::new(Semaphore::new(policy.max_concurrency.max(1)));
        let mut results: HashMap<String, ToolExecutionResult> = HashMap::new();

        for (batch_index, batch) in batches.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(batch = batch_index, "scheduling cancelled before batch");
                break;
            }

            let mut tasks: FuturesUnordered<BoxFuture<'_, ToolExecutionResult>> =
                FuturesUnordered::new();
            for inv in batch {
                let fp = fingerprint(&inv.name, &inv.params);
                match self.plan_dispatch(&fp) {
                    DispatchPlan::Cached(result) => {
                        tracing::debug!(tool = %inv.name, "cache hit, skipping execution");
                        results.insert(fp, *result);
                    }
                    DispatchPlan::Await(rx) => {
                        tasks.push(self.await_inflight(fp, rx).boxed());
                    }
                    DispatchPlan::Run(tx, slot) => {
                        tasks.push(
                            self.run_invocation(
                                fp,
                                inv.clone(),
                                tx,
                                slot,
                                policy.clone(),
                                Arc::clone(&semaphore),
                                cancel.clone(),
                            )
                            .boxed(),
                        );
                    }
                }
            }

            // Hard barrier: drain the whole batch before the next starts.
            let mut batch_failed = false;
            while let Some(result) = tasks.next().await {
                if !result.success {
                    batch_failed = true;
                }
                results.insert(result.fingerprint.clone(), result);
            }

            if batch_failed && policy.failure == FailurePolicy::FailFast {
                tracing::warn!(
                    batch = batch_index,
                    "failure with fail-fast policy, skipping remaining batches"
                );
                break;
            }
        }

        Ok(results)
    }

    /// Atomically decide how one invocation is satisfied: cached result,
    /// piggyback on an in-flight execution, or a fresh run.
    fn plan_dispatch(&self, fp: &str) -> DispatchPlan {
        let mut shared = lock_shared(&self.shared);
        if let Some(result) = shared.cache.get(fp) {
            return DispatchPlan::Cached(Box::new(ToolExecutionResult {
                fingerprint: fp.to_string(),
                invocation_id: String::new(),
                tool_name: String::new(),
                success: result.success,
                output: Some(result),
                error: None,
                duration_ms: 0,
                from_cache: true,
            }));
        }
        if let Some(rx) = shared.inflight.get(fp) {
            return DispatchPlan::Await(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        shared.inflight.insert(fp.to_string(), rx);
        DispatchPlan::Run(
            tx,
            InflightSlot {
                shared: Arc::clone(&self.shared),
                fingerprint: fp.to_string(),
            },
        )
    }

    async fn await_inflight(
        &self,
        fp: String,
        mut rx: watch::Receiver<Option<ToolExecutionResult>>,
    ) -> ToolExecutionResult {
        match rx.wait_for(Option::is_some).await {
            Ok(value) => value
                .clone()
                .unwrap_or_else(|| missing_inflight_result(&fp)),
            Err(_) => missing_inflight_result(&fp),
        }
    }

    async fn run_invocation(
        &self,
        fp: String,
        inv: ToolInvocation,
        tx: watch::Sender<Option<ToolExecutionResult>>,
        slot: InflightSlot,
        policy: ExecutionPolicy,
        semaphore: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> ToolExecutionResult {
        let started = Instant::now();
        let outcome = match semaphore.acquire_owned().await {
            Ok(_permit) => self.attempt_with_retry(&inv, &policy, &cancel).await,
            Err(_) => Err(ToolError::execution_failed("scheduler shut down")),
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let result = match outcome {
            Ok(output) => ToolExecutionResult {
                fingerprint: fp.clone(),
                invocation_id: inv.id.clone(),
                tool_name: inv.name.clone(),
                success: output.success,
                error: if output.success {
                    None
                } else {
                    Some(output.content.clone())
                },
                output: Some(output),
                duration_ms,
                from_cache: false,
            },
            Err(err) => ToolExecutionResult {
                fingerprint: fp.clone(),
                invocation_id: inv.id.clone(),
                tool_name: inv.name.clone(),
                success: false,
                output: None,
                error: Some(err.to_string()),
                duration_ms,
                from_cache: false,
            },
        };

        if result.success {
            if let Some(output) = &result.output {
                let cacheable = self
                    .registry
                    .get(&inv.name)
                    .is_some_and(|tool| tool.cacheable());
                if cacheable {
                    lock_shared(&self.shared).cache.put(fp.clone(), output.clone());
                }
            }
        }
        // Publish before releasing the slot; waiters holding the receiver
        // observe the value, late arrivals re-plan against the cache. The
        // slot's Drop releases the registry entry even if this future is
        // dropped mid-execution.
        let _ = tx.send(Some(result.clone()));
        drop(slot);
        result
    }

    /// One logical execution: validate, run with a timeout, and retry
    /// retryable failures when the policy allows.
    async fn attempt_with_retry(
        &self,
        inv: &ToolInvocation,
        policy: &ExecutionPolicy,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let mut attempt: u32 = 0;
        loop {
            let attempt_result = self
                .attempt_once(&inv.name, inv.params.clone(), policy.tool_timeout, cancel)
                .await;

            let err = match attempt_result {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };

            let retry_allowed = policy.failure == FailurePolicy::Retry
                && policy.retry.enabled
                && attempt < policy.retry.max_retries
                && err.is_retryable()
                && !cancel.is_cancelled();
            if !retry_allowed {
                return Err(err);
            }

            let delay = policy.retry.delay_for_attempt(attempt);
            attempt += 1;
            tracing::warn!(
                tool = %inv.name,
                attempt,
                max = policy.retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying tool execution"
            );
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(ToolError::cancelled("request cancelled during retry backoff"));
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt_once(
        &self,
        name: &str,
        params: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        tokio::select! {
            () = cancel.cancelled() => Err(ToolError::cancelled("request cancelled")),
            result = tokio::time::timeout(timeout, self.registry.execute(name, params)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(ToolError::Timeout {
                        seconds: timeout.as_secs(),
                    }),
                }
            }
        }
    }
}

fn missing_inflight_result(fp: &str) -> ToolExecutionResult {
    ToolExecutionResult {
        fingerprint: fp.to_string(),
        invocation_id: String::new(),
        tool_name: String::new(),
        success: false,
        output: None,
        error: Some("in-flight execution ended without a result".to_string()),
        duration_ms: 0,
        from_cache: false,
    }
}
