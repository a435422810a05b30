//! Task Dispatcher: runs pipelines outside the request cycle and records
//! each job's outcome in the ledger exactly once.
//!
//! A job row is written PENDING before its task is pushed. Workers never
//! touch the row until the pipeline has finished; then it moves to SUCCESS
//! or FAILED through the ledger's guarded transitions. A task is acknowledged
//! on the queue only after that write, so a worker that dies mid-pipeline
//! leaves it to be requeued.

pub mod queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ledger::LedgerError;
use crate::models::workflow::{JobResult, Transition};
use crate::pipeline::{Orchestrator, PipelineError, Task};
use queue::{Delivery, QueueError, TaskConsumer, TaskEnvelope, TaskQueue};

/// How long one consume call may block before the shutdown flag is re-checked.
const POLL_WAIT: Duration = Duration::from_secs(1);
/// Pause after a broken queue connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Clone)]
pub struct Dispatcher {
    orchestrator: Orchestrator,
    queue: Arc<dyn TaskQueue>,
}

impl Dispatcher {
    pub fn new(orchestrator: Orchestrator, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            orchestrator,
            queue,
        }
    }

    /// Creates the PENDING job and pushes its task. Returns the job id.
    pub async fn submit(&self, workflow_id: Uuid, task: Task) -> Result<Uuid, DispatchError> {
        let task_id = Uuid::new_v4();
        let ledger = self.orchestrator.ledger();
        ledger.create_job(task_id, workflow_id, task.kind()).await?;

        let envelope = TaskEnvelope {
            task_id,
            workflow_id,
            task,
        };
        if let Err(e) = self.queue.enqueue(&envelope).await {
            self.record_failure(task_id, &format!("Could not enqueue task: {e}"))
                .await;
            return Err(e.into());
        }

        info!(
            "Job {task_id}: queued {} for workflow {workflow_id}",
            envelope.task.kind().as_str()
        );
        Ok(task_id)
    }

    /// Runs one delivered task to a terminal job state. Never returns an error.
    pub async fn execute(&self, envelope: TaskEnvelope) {
        let orchestrator = self.orchestrator.clone();
        let TaskEnvelope {
            task_id,
            workflow_id,
            task,
        } = envelope;
        let handle =
            tokio::spawn(async move { orchestrator.run(task_id, workflow_id, &task).await });
        self.settle(task_id, workflow_id, handle).await;
    }

    async fn settle(
        &self,
        job_id: Uuid,
        workflow_id: Uuid,
        handle: JoinHandle<Result<JobResult, PipelineError>>,
    ) {
        match handle.await {
            Ok(Ok(result)) => {
                match self.orchestrator.finish(job_id, workflow_id, result).await {
                    Ok(Transition::Applied) => info!("Job {job_id}: SUCCESS"),
                    Ok(Transition::AlreadyTerminal(status)) => {
                        warn!("Job {job_id}: result dropped, job already {}", status.as_str())
                    }
                    Err(e) => {
                        // The version is numbered, published and recorded in
                        // one transaction, so nothing partial is left behind.
                        error!("Job {job_id}: could not record success: {e}");
                        self.record_failure(job_id, &format!("Could not record result: {e}"))
                            .await;
                    }
                }
            }
            Ok(Err(e)) => self.record_failure(job_id, &e.to_string()).await,
            Err(e) => {
                error!("Job {job_id}: pipeline task aborted: {e}");
                self.record_failure(job_id, "pipeline panicked").await;
            }
        }
    }

    /// Moves the job to FAILED. Errors here are logged only.
    async fn record_failure(&self, job_id: Uuid, message: &str) {
        match self.orchestrator.ledger().fail_job(job_id, message).await {
            Ok(Transition::Applied) => info!("Job {job_id}: FAILED"),
            Ok(Transition::AlreadyTerminal(status)) => {
                warn!("Job {job_id}: failure dropped, job already {}", status.as_str())
            }
            Err(e) => error!("Job {job_id}: could not record FAILED state: {e}"),
        }
    }

    /// Starts `count` worker loops, each with its own queue consumer. Worker
    /// `n` always uses consumer slot `n`, so a restart picks up what the
    /// previous process left in flight.
    pub async fn spawn_workers(
        &self,
        count: usize,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Vec<JoinHandle<()>>, QueueError> {
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let consumer = self.queue.consumer(index).await?;
            let dispatcher = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.run_worker(index, consumer, shutdown).await
            }));
        }
        info!("Started {count} pipeline worker(s)");
        Ok(handles)
    }

    async fn run_worker(
        &self,
        index: usize,
        mut consumer: Box<dyn TaskConsumer>,
        shutdown: Arc<AtomicBool>,
    ) {
        debug!("Worker {index} waiting for tasks");
        loop {
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            match consumer.next(POLL_WAIT).await {
                Ok(Some(Delivery::Task(envelope))) => {
                    debug!("Worker {index} picked up job {}", envelope.task_id);
                    self.execute(envelope).await;
                    ack(index, consumer.as_mut()).await;
                }
                Ok(Some(Delivery::Malformed { task_id, reason })) => {
                    match task_id {
                        Some(job_id) => {
                            warn!("Worker {index}: job {job_id} has a malformed task: {reason}");
                            self.record_failure(job_id, &format!("Malformed task payload: {reason}"))
                                .await;
                        }
                        None => warn!("Worker {index} dropped an unreadable task: {reason}"),
                    }
                    ack(index, consumer.as_mut()).await;
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Worker {index} queue error: {e}");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
        info!("Worker {index} stopped");
    }
}

async fn ack(index: usize, consumer: &mut dyn TaskConsumer) {
    if let Err(e) = consumer.ack().await {
        // The task is requeued on the next start; its job is already terminal.
        warn!("Worker {index} could not acknowledge its task: {e}");
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryQueue;
    use super::*;
    use crate::ledger::memory::MemoryLedger;
    use crate::ledger::Ledger;
    use crate::models::workflow::{JobStatus, NewWorkflow, VersionLabel, WorkflowRow};
    use crate::pipeline::testing::{analysis_json, harness, Harness, Typesetter, WORKSPACE};
    use crate::pipeline::{AnalyzeTask, OptimizeTask, RefineTask};
    use serde_json::json;

    const REFINE_REPLY: &str = r#"{"new_latex_code": "\\section{Summary} Sharper", "summary": "Tightened"}"#;
    const OPTIMIZE_REPLY: &str = r#"{"final_score": 86, "new_latex_code": "\\section{Experience} Terraform", "summary": ["Added Terraform"]}"#;

    async fn new_workflow(h: &Harness) -> WorkflowRow {
        h.ledger
            .create_workflow(NewWorkflow {
                user_id: Uuid::new_v4(),
                workspace_id: WORKSPACE.to_string(),
                job_description: "Platform engineer".to_string(),
                template_filename: "resume.tex".to_string(),
                profile_filename: None,
            })
            .await
            .unwrap()
    }

    async fn setup_with(typesetter: Typesetter) -> (Harness, Arc<MemoryQueue>, Dispatcher, WorkflowRow) {
        let h = harness(typesetter).await;
        let queue = Arc::new(MemoryQueue::default());
        let dispatcher = Dispatcher::new(h.orchestrator.clone(), queue.clone());
        let workflow = new_workflow(&h).await;
        // An optimize already produced v1.
        h.orchestrator
            .store()
            .write(
                WORKSPACE,
                workflow.id,
                "v1".parse().unwrap(),
                "Resume.tex",
                b"\\section{Experience}",
            )
            .await
            .unwrap();
        h.ledger.set_version_counter(workflow.id, 1);
        (h, queue, dispatcher, workflow)
    }

    async fn setup() -> (Harness, Arc<MemoryQueue>, Dispatcher, WorkflowRow) {
        setup_with(Typesetter::Working).await
    }

    fn analyze(version: &str) -> Task {
        Task::Analyze(AnalyzeTask {
            version: version.to_string(),
            filename: "Resume".to_string(),
        })
    }

    fn refine() -> Task {
        Task::Refine(RefineTask {
            current_version: "v1".to_string(),
            current_filename: "Resume".to_string(),
            user_request: "Tighten the summary".to_string(),
            output_filename: "Resume".to_string(),
            job_description: None,
            target_version: None,
        })
    }

    fn script_refine(h: &Harness) {
        h.backend.reply("refine_result", Ok(REFINE_REPLY));
        h.backend
            .reply("analysis_result", Ok(analysis_json(77, &[], &[]).as_str()));
    }

    fn labels(raw: &[&str]) -> Vec<VersionLabel> {
        raw.iter().map(|l| l.parse().unwrap()).collect()
    }

    fn status(ledger: &MemoryLedger, id: Uuid) -> JobStatus {
        ledger.job(id).unwrap().status()
    }

    async fn wait_terminal(ledger: &MemoryLedger, id: Uuid) -> JobStatus {
        for _ in 0..200 {
            if status(ledger, id).is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        status(ledger, id)
    }

    #[tokio::test]
    async fn test_submit_creates_pending_job_before_push() {
        let (h, queue, dispatcher, workflow) = setup().await;

        let job_id = dispatcher.submit(workflow.id, analyze("v1")).await.unwrap();

        assert_eq!(status(&h.ledger, job_id), JobStatus::Pending);
        let queued = queue.pop();
        assert_eq!(queued.task_id, job_id);
        assert_eq!(queued.workflow_id, workflow.id);
    }

    #[tokio::test]
    async fn test_failed_push_fails_the_job() {
        let (h, queue, dispatcher, workflow) = setup().await;
        queue.reject_pushes.store(true, Ordering::Release);

        let err = dispatcher
            .submit(workflow.id, analyze("v1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Queue(_)));

        let jobs = h.ledger.list_jobs(workflow.id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status(), JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_successful_pipeline_records_payload() {
        let (h, queue, dispatcher, workflow) = setup().await;
        h.backend
            .reply("analysis_result", Ok(analysis_json(64, &["Terraform"], &[]).as_str()));
        dispatcher.submit(workflow.id, analyze("v1")).await.unwrap();
        let envelope = queue.pop();

        dispatcher.execute(envelope.clone()).await;

        let job = h.ledger.job(envelope.task_id).unwrap();
        assert_eq!(job.status(), JobStatus::Success);
        assert_eq!(job.result_data.unwrap()["analysis"]["ats_score"], 64);
        assert!(job.error_message.is_none());
    }

    #[tokio::test]
    async fn test_optimize_task_records_v1() {
        let (h, queue, dispatcher, _) = setup().await;
        let workflow = new_workflow(&h).await;
        let templates = h.dir.path().join("users").join(WORKSPACE).join("templates");
        std::fs::write(templates.join("resume.tex"), "\\section{Experience}").unwrap();
        h.backend.reply("optimization_result", Ok(OPTIMIZE_REPLY));
        let task: OptimizeTask = serde_json::from_value(json!({
            "analysis": {"ats_score": 41, "missing_keywords": ["Terraform"]},
            "output_filename": "Resume"
        }))
        .unwrap();
        dispatcher.submit(workflow.id, Task::Optimize(task)).await.unwrap();
        let envelope = queue.pop();

        dispatcher.execute(envelope.clone()).await;

        let job = h.ledger.job(envelope.task_id).unwrap();
        assert_eq!(job.status(), JobStatus::Success);
        let payload = job.result_data.unwrap();
        assert_eq!(payload["version"], "v1");
        assert_eq!(payload["compilation"]["success"], true);
        let versions = h.ledger.list_versions(workflow.id).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].label, "v1");
        assert_eq!(versions[0].job_id, Some(envelope.task_id));
        let source = h
            .orchestrator
            .store()
            .read(WORKSPACE, workflow.id, "v1".parse().unwrap(), "Resume.tex")
            .await
            .unwrap();
        assert_eq!(source, b"\\section{Experience} Terraform");
    }

    #[tokio::test]
    async fn test_refine_task_with_broken_typesetter_still_succeeds() {
        let (h, queue, dispatcher, workflow) = setup_with(Typesetter::Broken).await;
        script_refine(&h);
        dispatcher.submit(workflow.id, refine()).await.unwrap();
        let envelope = queue.pop();

        dispatcher.execute(envelope.clone()).await;

        let job = h.ledger.job(envelope.task_id).unwrap();
        assert_eq!(job.status(), JobStatus::Success);
        let payload = job.result_data.unwrap();
        assert_eq!(payload["version"], "v2");
        assert_eq!(payload["compilation"]["success"], false);
        assert!(payload["compilation"]["tex_path"]
            .as_str()
            .unwrap()
            .ends_with("v2/Resume.tex"));
        let versions = h.ledger.list_versions(workflow.id).await.unwrap();
        assert_eq!(versions[0].label, "v2");
    }

    #[tokio::test]
    async fn test_versions_are_numbered_in_completion_order() {
        let (h, _queue, dispatcher, workflow) = setup().await;
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        for job_id in [first, second] {
            h.ledger
                .create_job(job_id, workflow.id, refine().kind())
                .await
                .unwrap();
        }
        script_refine(&h);
        let first_result = h.orchestrator.run(first, workflow.id, &refine()).await;
        script_refine(&h);
        let second_result = h.orchestrator.run(second, workflow.id, &refine()).await;

        // The job started second finishes first.
        dispatcher
            .settle(second, workflow.id, tokio::spawn(async move { second_result }))
            .await;
        dispatcher
            .settle(first, workflow.id, tokio::spawn(async move { first_result }))
            .await;

        let versions = h.ledger.list_versions(workflow.id).await.unwrap();
        let recorded: Vec<(String, Option<Uuid>)> = versions
            .iter()
            .map(|v| (v.label.clone(), v.job_id))
            .collect();
        assert_eq!(
            recorded,
            vec![("v2".to_string(), Some(second)), ("v3".to_string(), Some(first))]
        );
        assert!(versions[0].created_at <= versions[1].created_at);
        assert_eq!(h.ledger.job(first).unwrap().result_data.unwrap()["version"], "v3");
        assert_eq!(
            h.orchestrator.store().list_versions(WORKSPACE, workflow.id).await.unwrap(),
            labels(&["v1", "v2", "v3"])
        );
    }

    #[tokio::test]
    async fn test_failed_refine_does_not_consume_a_version() {
        let (h, queue, dispatcher, workflow) = setup().await;
        dispatcher.submit(workflow.id, refine()).await.unwrap();
        dispatcher.submit(workflow.id, refine()).await.unwrap();
        let (doomed, survivor) = (queue.pop(), queue.pop());

        // No scripted reply: generation fails.
        dispatcher.execute(doomed.clone()).await;
        script_refine(&h);
        dispatcher.execute(survivor.clone()).await;

        assert_eq!(status(&h.ledger, doomed.task_id), JobStatus::Failed);
        let payload = h.ledger.job(survivor.task_id).unwrap().result_data.unwrap();
        assert_eq!(payload["version"], "v2");
        assert_eq!(
            h.orchestrator.store().list_versions(WORKSPACE, workflow.id).await.unwrap(),
            labels(&["v1", "v2"])
        );
    }

    #[tokio::test]
    async fn test_pipeline_error_becomes_failed_job() {
        let (h, queue, dispatcher, workflow) = setup().await;
        dispatcher.submit(workflow.id, analyze("v9")).await.unwrap();
        let envelope = queue.pop();

        dispatcher.execute(envelope.clone()).await;

        let job = h.ledger.job(envelope.task_id).unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("Not found"));
        assert!(job.result_data.is_none());
    }

    #[tokio::test]
    async fn test_panicking_pipeline_becomes_failed_job() {
        let (h, _queue, dispatcher, workflow) = setup().await;
        let job_id = Uuid::new_v4();
        h.ledger
            .create_job(job_id, workflow.id, analyze("v1").kind())
            .await
            .unwrap();

        let handle: JoinHandle<Result<JobResult, PipelineError>> =
            tokio::spawn(async { panic!("backend client poisoned") });
        dispatcher.settle(job_id, workflow.id, handle).await;

        let job = h.ledger.job(job_id).unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("pipeline panicked"));
    }

    #[tokio::test]
    async fn test_redelivered_task_cannot_overwrite_outcome() {
        let (h, queue, dispatcher, workflow) = setup().await;
        dispatcher.submit(workflow.id, analyze("v1")).await.unwrap();
        let envelope = queue.pop();

        // No scripted reply: the first run fails.
        dispatcher.execute(envelope.clone()).await;
        h.backend
            .reply("analysis_result", Ok(analysis_json(99, &[], &[]).as_str()));
        dispatcher.execute(envelope.clone()).await;

        let job = h.ledger.job(envelope.task_id).unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.result_data.is_none());
    }

    #[tokio::test]
    async fn test_malformed_task_fails_its_job() {
        let (h, queue, dispatcher, workflow) = setup().await;
        let job_id = Uuid::new_v4();
        h.ledger
            .create_job(job_id, workflow.id, analyze("v1").kind())
            .await
            .unwrap();
        queue.push_raw("{ truncated");
        queue.push_raw(
            &json!({"task_id": job_id, "workflow_id": workflow.id, "task": {"kind": "translate"}})
                .to_string(),
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let handles = dispatcher.spawn_workers(1, shutdown.clone()).await.unwrap();

        assert_eq!(wait_terminal(&h.ledger, job_id).await, JobStatus::Failed);
        let message = h.ledger.job(job_id).unwrap().error_message.unwrap();
        assert!(message.starts_with("Malformed task payload"), "{message}");

        shutdown.store(true, Ordering::Release);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.in_flight(0), 0);
    }

    #[tokio::test]
    async fn test_interrupted_task_is_requeued_for_the_next_worker() {
        let (h, queue, dispatcher, workflow) = setup().await;
        h.backend
            .reply("analysis_result", Ok(analysis_json(58, &[], &[]).as_str()));
        let job_id = dispatcher.submit(workflow.id, analyze("v1")).await.unwrap();

        // A worker takes the task and dies before acknowledging it.
        let mut crashed = queue.consumer(0).await.unwrap();
        assert!(crashed.next(POLL_WAIT).await.unwrap().is_some());
        drop(crashed);
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.in_flight(0), 1);

        let shutdown = Arc::new(AtomicBool::new(false));
        let handles = dispatcher.spawn_workers(1, shutdown.clone()).await.unwrap();

        assert_eq!(wait_terminal(&h.ledger, job_id).await, JobStatus::Success);
        shutdown.store(true, Ordering::Release);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(queue.in_flight(0), 0);
    }

    #[tokio::test]
    async fn test_workers_drain_queue_and_stop_on_shutdown() {
        let (h, _queue, dispatcher, workflow) = setup().await;
        h.backend
            .reply("analysis_result", Ok(analysis_json(50, &[], &[]).as_str()));
        let job_id = dispatcher.submit(workflow.id, analyze("v1")).await.unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        let handles = dispatcher.spawn_workers(2, shutdown.clone()).await.unwrap();

        assert_eq!(wait_terminal(&h.ledger, job_id).await, JobStatus::Success);

        shutdown.store(true, Ordering::Release);
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
