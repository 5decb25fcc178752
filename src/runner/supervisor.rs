//! Job supervisor - drives one claimed lease to its end
//!
//! ```text
//!   claimed lease
//!        │ policy from context, fresh sandbox token
//!        ▼
//!   pool.acquire ──capacity──► requeue (not a failure)
//!        │ registered VM
//!        ▼
//!   MMDS metadata ──► watch run (events, terminal status)
//!        │      ├─ deadline  ──► timeout
//!        │      ├─ VM died   ──► failed
//!        │      └─ shutdown  ──► failed
//!        ▼
//!   pool.release (repool only after success) ──► lease complete
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use super::job::{policy_from_context, sandbox_token};
use super::Runner;
use crate::metrics::JOBS_FINISHED;
use crate::queue::JobLease;
use crate::telemetry::watcher::{RunWatcher, WatchEvent};
use crate::telemetry::{EventSource, RunState, RunStatus};
use crate::vm::{RunningVm, VmAssignment};

/// How often a running job's VM is checked for liveness
const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Why the watch on a job ended
#[derive(Debug)]
enum JobEnd {
    Reported(RunStatus),
    HandoverFailed(String),
    TimedOut,
    VmDied,
    Cancelled,
}

/// Run a claimed lease to completion inside its own span
pub async fn supervise(runner: Arc<Runner>, lease: JobLease, cancel: CancellationToken) {
    let span = info_span!("job", run_id = %lease.run_id, address = tracing::field::Empty);
    run_job(runner, lease, cancel).instrument(span).await
}

async fn run_job(runner: Arc<Runner>, lease: JobLease, cancel: CancellationToken) {
    let run_id = lease.run_id.clone();

    let policy = match policy_from_context(&lease.execution_context) {
        Ok(policy) => policy,
        Err(e) => {
            warn!(error = %e, "execution context has an invalid network section");
            runner.finish(&run_id, RunState::Failed, Some(&format!("invalid network policy: {}", e))).await;
            return;
        }
    };

    let assignment = VmAssignment {
        run_id: run_id.clone(),
        sandbox_token: sandbox_token(),
        policy,
    };

    let acquired = tokio::select! {
        _ = cancel.cancelled() => {
            runner.requeue(&run_id).await;
            return;
        }
        acquired = runner.pool.acquire_owned(assignment.clone()) => acquired,
    };
    let mut vm = match acquired {
        Ok(vm) => vm,
        Err(e) if e.is_capacity() => {
            info!(error = %e, "no capacity for job, returning it to the queue");
            runner.requeue(&run_id).await;
            return;
        }
        Err(e) => {
            warn!(error = %e, "vm acquire failed");
            runner.finish(&run_id, RunState::Failed, Some(&format!("vm acquire failed: {}", e))).await;
            return;
        }
    };
    Span::current().record("address", tracing::field::display(vm.address()));
    runner.mark_running(&run_id).await;

    // the lease TTL is a hard ceiling; stop before the sweeper could fire
    let deadline = runner
        .settings
        .job_timeout
        .min(lease.remaining_ttl(chrono::Utc::now()));
    let end = match hand_over(&runner, &vm, &lease, &assignment).await {
        Ok(()) => watch(&runner, &mut vm, &run_id, deadline, &cancel).await,
        Err(detail) => {
            vm.mark_failed(detail.clone());
            JobEnd::HandoverFailed(detail)
        }
    };

    let state = match &end {
        // stored by the completion endpoint already
        JobEnd::Reported(status) => status.state,
        JobEnd::HandoverFailed(detail) => {
            warn!(error = %detail, "handing job to vm failed");
            runner.finish_status(&run_id, RunState::Failed, Some(detail)).await
        }
        JobEnd::TimedOut => {
            let detail = format!("job exceeded {}s", deadline.as_secs());
            warn!(%detail, "job deadline reached");
            runner.finish_status(&run_id, RunState::Timeout, Some(&detail)).await
        }
        JobEnd::VmDied => {
            runner
                .finish_status(&run_id, RunState::Failed, Some("vm stopped unexpectedly"))
                .await
        }
        JobEnd::Cancelled => {
            runner
                .finish_status(&run_id, RunState::Failed, Some("runner shutting down"))
                .await
        }
    };

    let repool = runner.settings.repool_on_success && state == RunState::Completed && !cancel.is_cancelled();
    runner.pool.release(vm, repool).await;
    runner.complete_lease(&run_id).await;
    JOBS_FINISHED.with_label_values(&[state.as_str()]).inc();
    info!(state = %state, repool, "job finished");
}

/// Give the VM its identity and job through the metadata service
async fn hand_over(runner: &Runner, vm: &RunningVm, lease: &JobLease, assignment: &VmAssignment) -> Result<(), String> {
    let metadata = json!({
        "runvisor": {
            "runId": lease.run_id,
            "sandboxToken": assignment.sandbox_token,
            "apiUrl": runner.api_url_for(vm),
            "executionContext": lease.execution_context,
        }
    });
    vm.control()
        .put_metadata(&metadata)
        .await
        .map_err(|e| format!("metadata handoff failed: {}", e))
}

async fn watch(
    runner: &Runner,
    vm: &mut RunningVm,
    run_id: &str,
    deadline: Duration,
    cancel: &CancellationToken,
) -> JobEnd {
    let watch_cancel = cancel.child_token();
    let source: Arc<dyn EventSource> = Arc::new(runner.store.clone());
    let (mut events, handle) = RunWatcher::new(run_id, source, runner.settings.watch.clone())
        .with_realtime(runner.hub.clone())
        .spawn(watch_cancel.clone());

    let deadline = tokio::time::sleep(deadline);
    tokio::pin!(deadline);
    let mut health = tokio::time::interval(HEALTH_INTERVAL);
    health.tick().await;

    let end = loop {
        tokio::select! {
            _ = cancel.cancelled() => break JobEnd::Cancelled,
            _ = &mut deadline => break JobEnd::TimedOut,
            _ = health.tick() => {
                if !vm.is_healthy().await {
                    warn!(vm_id = %vm.vm_id, "vm is no longer healthy");
                    vm.mark_failed("health check failed");
                    break JobEnd::VmDied;
                }
            }
            item = events.recv() => match item {
                Some(WatchEvent::Event(event)) => {
                    debug!(seq = event.sequence_number, event_type = %event.event_type, "agent event");
                }
                Some(WatchEvent::Terminal(status)) => break JobEnd::Reported(status),
                None => break JobEnd::Cancelled,
            },
        }
    };

    watch_cancel.cancel();
    if let Ok(outcome) = handle.await {
        debug!(delivered = outcome.delivered, gaps = outcome.gaps, "run watch closed");
    }
    end
}
