//! Phase-sequenced coordination across nodes.
//!
//! Each phase fans out one call per participant as tokio tasks bounded by a
//! semaphore, and resolves only after every call has finished, timed out or
//! been cancelled. Nothing from one phase leaks into the next until then.

pub mod backup;
pub mod cleanup;
pub mod restore;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::{BrError, Result};
use crate::registry::{NodeError, NodeId, NodeRegistry, NodeTarget, ResolvedNode};

pub use backup::SnapshotCoordinator;
pub use cleanup::{cleanup_backup, CleanupReport};
pub use restore::{MappingPolicy, RestoreCoordinator};

/// Snapshot state of one participant.
///
/// ```text
/// Idle -> Begun -> Committed
///   \       \         \
///    +-------+---------+--> Aborted
///  (any non-final) ------> Failed -> Aborted
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantState {
    Idle,
    Begun,
    Committed,
    Aborted,
    Failed(String),
}

impl ParticipantState {
    pub fn can_advance_to(&self, next: &ParticipantState) -> bool {
        use ParticipantState::*;
        matches!(
            (self, next),
            (Idle, Begun)
                | (Begun, Committed)
                | (Idle | Begun | Committed, Failed(_))
                | (Begun | Committed | Failed(_), Aborted)
        )
    }

    /// The node may hold snapshot state that must be dropped on abort.
    pub fn needs_abort(&self) -> bool {
        matches!(
            self,
            ParticipantState::Begun | ParticipantState::Committed | ParticipantState::Failed(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub node: ResolvedNode,
    state: ParticipantState,
}

impl Participant {
    pub fn new(node: ResolvedNode) -> Self {
        Self {
            node,
            state: ParticipantState::Idle,
        }
    }

    pub fn id(&self) -> &NodeId {
        self.node.id()
    }

    pub fn state(&self) -> &ParticipantState {
        &self.state
    }

    pub fn advance(&mut self, next: ParticipantState) {
        if self.state.can_advance_to(&next) {
            tracing::debug!(node = %self.id(), from = ?self.state, to = ?next, "Participant state change");
            self.state = next;
        } else {
            tracing::warn!(node = %self.id(), from = ?self.state, to = ?next, "Ignoring invalid state change");
        }
    }
}

/// Why one call of a phase did not produce a value.
#[derive(Debug)]
pub enum StepError<E> {
    Failed(E),
    Timeout(Duration),
    Cancelled,
    Task(String),
}

impl<E: fmt::Display> fmt::Display for StepError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepError::Failed(e) => write!(f, "{}", e),
            StepError::Timeout(d) => write!(f, "timed out after {:?}", d),
            StepError::Cancelled => f.write_str("cancelled"),
            StepError::Task(m) => write!(f, "task failed: {}", m),
        }
    }
}

/// Resolve every target, giving up early if the run is cancelled.
pub(crate) async fn resolve_all(
    registry: &NodeRegistry,
    targets: &[NodeTarget],
    cancel: &CancellationToken,
) -> Result<Vec<(NodeTarget, std::result::Result<ResolvedNode, NodeError>)>> {
    tokio::select! {
        results = registry.resolve_role(targets) => Ok(results),
        _ = cancel.cancelled() => Err(BrError::Cancelled),
    }
}

/// Resolve every target; any failure fails the run.
pub(crate) async fn resolve_mandatory(
    registry: &NodeRegistry,
    targets: &[NodeTarget],
    cancel: &CancellationToken,
) -> Result<Vec<ResolvedNode>> {
    let mut nodes = Vec::with_capacity(targets.len());
    let mut failed = Vec::new();
    for (target, result) in resolve_all(registry, targets, cancel).await? {
        match result {
            Ok(node) => nodes.push(node),
            Err(e) => failed.push((target, e)),
        }
    }
    if !failed.is_empty() {
        return Err(resolve_error(failed));
    }
    Ok(nodes)
}

/// A credential refusal is reported on its own; anything else is a
/// topology problem naming every node that could not be resolved.
pub(crate) fn resolve_error(failed: Vec<(NodeTarget, NodeError)>) -> BrError {
    if let Some((target, e)) = failed
        .iter()
        .find(|(_, e)| matches!(e, NodeError::AuthRejected(_)))
    {
        return BrError::AuthRejected {
            node: target.id.to_string(),
            message: e.to_string(),
        };
    }
    let nodes: Vec<String> = failed
        .iter()
        .map(|(target, e)| format!("{}: {}", target.id, e))
        .collect();
    BrError::Topology(format!("cannot resolve {}", nodes.join("; ")))
}

/// Limits applied to every call of one phase.
#[derive(Debug, Clone)]
pub struct PhaseLimits {
    pub fan_out: usize,
    pub timeout: Duration,
}

/// Run `op` for every item concurrently, at most `limits.fan_out` at a
/// time. Results come back in input order once every call has resolved.
pub async fn run_phase<T, R, E, F, Fut>(
    items: Vec<T>,
    limits: &PhaseLimits,
    cancel: &CancellationToken,
    op: F,
) -> Vec<std::result::Result<R, StepError<E>>>
where
    T: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limits.fan_out.max(1)));
    let mut handles = Vec::with_capacity(items.len());

    for item in items {
        let sem = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        let timeout = limits.timeout;
        let call = op(item);

        handles.push(tokio::spawn(async move {
            let _permit = tokio::select! {
                permit = sem.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => return Err(StepError::Task(format!("semaphore closed: {}", e))),
                },
                _ = cancel.cancelled() => return Err(StepError::Cancelled),
            };

            tokio::select! {
                result = tokio::time::timeout(timeout, call) => match result {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(StepError::Failed(e)),
                    Err(_) => Err(StepError::Timeout(timeout)),
                },
                _ = cancel.cancelled() => Err(StepError::Cancelled),
            }
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(match handle.await {
            Ok(result) => result,
            Err(e) => Err(StepError::Task(e.to_string())),
        });
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limits(fan_out: usize, timeout_ms: u64) -> PhaseLimits {
        PhaseLimits {
            fan_out,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[test]
    fn test_state_transitions() {
        use ParticipantState::*;
        assert!(Idle.can_advance_to(&Begun));
        assert!(Begun.can_advance_to(&Committed));
        assert!(Committed.can_advance_to(&Aborted));
        assert!(Failed("x".into()).can_advance_to(&Aborted));
        assert!(!Idle.can_advance_to(&Committed));
        assert!(!Aborted.can_advance_to(&Begun));
        assert!(!Committed.can_advance_to(&Begun));
        assert!(!Idle.needs_abort());
        assert!(Begun.needs_abort());
    }

    #[tokio::test]
    async fn test_results_keep_input_order() {
        let results = run_phase(vec![30u64, 1, 10], &limits(8, 1000), &CancellationToken::new(), |ms| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, String>(ms)
        })
        .await;
        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![30, 1, 10]);
    }

    #[tokio::test]
    async fn test_fan_out_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = run_phase((0..10).collect(), &limits(3, 1000), &CancellationToken::new(), |_: u32| {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, String>(())
            }
        })
        .await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_timeout_and_failure_are_reported_per_item() {
        let results = run_phase(vec![0u64, 1, 2], &limits(8, 50), &CancellationToken::new(), |i| async move {
            match i {
                0 => Ok(i),
                1 => Err("boom".to_string()),
                _ => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(i)
                }
            }
        })
        .await;

        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(StepError::Failed(ref e)) if e == "boom"));
        assert!(matches!(results[2], Err(StepError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_cancellation_resolves_every_item() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let results = run_phase(vec![1, 2], &limits(1, 10_000), &cancel, |_: u8| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, String>(())
        })
        .await;
        assert!(results.iter().all(|r| matches!(r, Err(StepError::Cancelled))));
    }
}
