use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use valet_agent::{Agent, CapabilityRegistry};
use valet_config::ConfigSnapshot;
use valet_exec::CodeRunner;
use valet_llm::CompletionClient;
use valet_memory::{AsyncIoLog, IoEntry, IoLog, SnapshotStore, SolutionSnapshot, normalize_question};
use valet_notify::{
    Fabric, Notification, NotificationKind, NotificationLog, NotificationPriority,
    NotificationRequest,
};
use valet_pipeline::{ChainedPipeline, PipelineState};

use crate::auth::{QueueFilter, Requester, authorize_filter};
use crate::chained::AgentBackedStage;
use crate::error::QueueError;
use crate::fifo::FifoQueue;
use crate::job::{Job, JobStatus, JobView};
use crate::router::route_question;
use crate::tracker::UserJobTracker;

/// The four lifecycle stages. The notification queue lives in valet-notify
/// but is cleared alongside these on reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueName {
    Todo,
    Running,
    Done,
    Dead,
}

impl QueueName {
    pub fn parse(raw: &str) -> Result<Self, QueueError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "todo" => Ok(QueueName::Todo),
            "run" | "running" => Ok(QueueName::Running),
            "done" => Ok(QueueName::Done),
            "dead" => Ok(QueueName::Dead),
            other => Err(QueueError::Validation(format!("unknown queue '{other}'"))),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            QueueName::Todo => "todo",
            QueueName::Running => "run",
            QueueName::Done => "done",
            QueueName::Dead => "dead",
        }
    }
}

/// Interaction-log sink; which mode is active is a configuration flag.
pub enum IoSink {
    Sync(Arc<IoLog>),
    Async(AsyncIoLog),
}

impl IoSink {
    async fn append(&self, entry: IoEntry) {
        match self {
            IoSink::Sync(log) => {
                if let Err(err) = log.append(entry).await {
                    warn!(%err, "io-log append failed");
                }
            }
            IoSink::Async(log) => log.append(entry),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnqueueReceipt {
    pub id_hash: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueView {
    pub queue: String,
    pub jobs: Vec<JobView>,
    pub filtered_by: String,
    pub is_admin_view: bool,
    pub total_jobs: usize,
}

pub type ResetCounts = IndexMap<String, usize>;

struct JobQueues {
    todo: Mutex<FifoQueue>,
    running: Mutex<FifoQueue>,
    done: Mutex<FifoQueue>,
    dead: Mutex<FifoQueue>,
}

impl JobQueues {
    fn new() -> Self {
        Self {
            todo: Mutex::new(FifoQueue::new()),
            running: Mutex::new(FifoQueue::new()),
            done: Mutex::new(FifoQueue::new()),
            dead: Mutex::new(FifoQueue::new()),
        }
    }

    fn stage(&self, name: QueueName) -> &Mutex<FifoQueue> {
        match name {
            QueueName::Todo => &self.todo,
            QueueName::Running => &self.running,
            QueueName::Done => &self.done,
            QueueName::Dead => &self.dead,
        }
    }
}

enum Outcome {
    Ok,
    Error(String),
    Fatal(String),
}

/// Owns the full life of every job: enqueue with cache-hit decision,
/// worker-loop execution, user-filtered retrieval, reset, and message
/// delivery to running jobs.
pub struct Scheduler {
    config: ConfigSnapshot,
    registry: CapabilityRegistry,
    queues: JobQueues,
    tracker: Mutex<UserJobTracker>,
    snapshots: Arc<Mutex<SnapshotStore>>,
    io: IoSink,
    fabric: Arc<Fabric>,
    notifications: Arc<NotificationLog>,
    client: Arc<dyn CompletionClient>,
    runner: CodeRunner,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConfigSnapshot,
        client: Arc<dyn CompletionClient>,
        runner: CodeRunner,
        snapshots: Arc<Mutex<SnapshotStore>>,
        io: IoSink,
        fabric: Arc<Fabric>,
        notifications: Arc<NotificationLog>,
    ) -> Self {
        let registry = CapabilityRegistry::from_config(&config);
        Self {
            config,
            registry,
            queues: JobQueues::new(),
            tracker: Mutex::new(UserJobTracker::default()),
            snapshots,
            io,
            fabric,
            notifications,
            client,
            runner,
        }
    }

    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    pub fn notifications(&self) -> &Arc<NotificationLog> {
        &self.notifications
    }

    // ── Enqueue ───────────────────────────────────────────────────────────────

    /// Accept a question: decide cache-hit vs fresh agentic, append to todo,
    /// index by user, and push a `todo_update` to the owner.
    ///
    /// Snapshot/embedding trouble degrades to a fresh agentic job — an
    /// enqueue is never dropped for a cold cache.
    pub async fn enqueue(
        &self,
        question: &str,
        websocket_id: Option<String>,
        user_id: &str,
        user_email: &str,
    ) -> Result<EnqueueReceipt, QueueError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(QueueError::Validation("question must not be empty".to_string()));
        }
        if user_id.trim().is_empty() {
            return Err(QueueError::Validation("user_id must not be empty".to_string()));
        }

        let canonical = normalize_question(question);
        let threshold = self.config.similarity_threshold();

        // Cache decision. An empty embedding (backend down) scores 0 against
        // everything, so the fresh-agentic path is the natural degradation.
        let (gist, cache_hit) = {
            let store = self.snapshots.lock().await;
            let gist = store.embeddings().cache_key(question, true);
            let cache_hit = store.best_match(&canonical, threshold).await.map(|(snapshot, score)| {
                (
                    snapshot.id_hash.clone(),
                    snapshot.routing_command.clone(),
                    snapshot.answer.clone(),
                    snapshot.answer_conversational.clone(),
                    score,
                )
            });
            (gist, cache_hit)
        };

        let mut job = match cache_hit {
            Some((snapshot_id, routing_command, answer, conversational, score))
                if self.registry.is_cacheable(&routing_command) =>
            {
                let mut job = Job::new(
                    question,
                    &canonical,
                    user_id,
                    user_email,
                    websocket_id,
                    &routing_command,
                    self.topic_for(&routing_command),
                );
                job.is_cache_hit = true;
                job.snapshot_id = Some(snapshot_id);
                job.cache_hit_score = Some(score);
                job.answer = Some(answer);
                job.answer_conversational = Some(conversational);
                info!(id_hash = %job.id_hash, score, "enqueue: cache hit");
                job
            }
            _ => {
                let routing_command = route_question(&canonical);
                info!(routing_command, "enqueue: fresh agentic job");
                Job::new(
                    question,
                    &canonical,
                    user_id,
                    user_email,
                    websocket_id,
                    routing_command,
                    self.topic_for(routing_command),
                )
            }
        };
        if !gist.is_empty() {
            job.question_gist = Some(gist);
        }

        let receipt = EnqueueReceipt {
            id_hash: job.id_hash.clone(),
            status: "queued".to_string(),
        };
        let view = job_view_json(&job);
        {
            let mut todo = self.queues.todo.lock().await;
            todo.push(job);
        }
        self.tracker.lock().await.track(user_id, &receipt.id_hash);
        self.fabric.emit_to_user(user_id, "todo_update", view);
        Ok(receipt)
    }

    fn topic_for(&self, routing_command: &str) -> &str {
        self.registry
            .resolve(routing_command)
            .map(|capability| capability.topic.as_str())
            .unwrap_or("unknown")
    }

    // ── Retrieval ─────────────────────────────────────────────────────────────

    /// User-filtered queue view. Regular users are forced to their own jobs;
    /// admins may widen the filter. todo/done/dead sort newest-first,
    /// running oldest-first.
    pub async fn get_queue(
        &self,
        name: &str,
        requester: &Requester,
        filter: Option<&str>,
    ) -> Result<QueueView, QueueError> {
        let queue_name = QueueName::parse(name)?;
        let authorized = authorize_filter(requester, QueueFilter::parse(filter))?;
        let is_admin_view = requester.is_admin && filter.is_some();

        let mut jobs: Vec<JobView> = {
            let guard = self.queues.stage(queue_name).lock().await;
            guard
                .iter()
                .filter(|job| match &authorized {
                    QueueFilter::All => true,
                    QueueFilter::OwnJobs => job.user_id == requester.user_id,
                    QueueFilter::User(user_id) => &job.user_id == user_id,
                })
                .map(JobView::from)
                .collect()
        };

        match queue_name {
            QueueName::Running => jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
            _ => jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        }

        Ok(QueueView {
            queue: queue_name.label().to_string(),
            filtered_by: authorized.label(requester),
            is_admin_view,
            total_jobs: jobs.len(),
            jobs,
        })
    }

    // ── Reset ─────────────────────────────────────────────────────────────────

    /// Clear all queues (and the notification record) and report per-queue
    /// counts. Empty queues report zero; no events are emitted.
    pub async fn reset(&self) -> ResetCounts {
        let mut counts = ResetCounts::new();
        counts.insert("todo".to_string(), self.queues.todo.lock().await.clear());
        counts.insert("run".to_string(), self.queues.running.lock().await.clear());
        counts.insert("done".to_string(), self.queues.done.lock().await.clear());
        counts.insert("dead".to_string(), self.queues.dead.lock().await.clear());
        counts.insert(
            "notification".to_string(),
            self.notifications.clear().unwrap_or_else(|err| {
                warn!(%err, "notification clear failed during reset");
                0
            }),
        );
        self.tracker.lock().await.clear();
        info!(?counts, "queues reset");
        counts
    }

    // ── Focus mode ────────────────────────────────────────────────────────────

    /// Park a blocking object on todo; the worker stops draining until it is
    /// popped.
    pub async fn push_blocking_object(&self, blocking_object: Value) {
        self.queues.todo.lock().await.push_blocking_object(blocking_object);
    }

    pub async fn pop_blocking_object(&self) -> Option<Value> {
        self.queues.todo.lock().await.pop_blocking_object()
    }

    pub async fn accepting_jobs(&self) -> bool {
        self.queues.todo.lock().await.is_accepting_jobs()
    }

    // ── User-initiated messages ───────────────────────────────────────────────

    /// Deliver a message to a running job. The running agent polls its
    /// notification stream at checkpoints; delivery here means persisting the
    /// row and waking the owner's sessions.
    pub async fn deliver_user_message(
        &self,
        job_id: &str,
        requester: &Requester,
        message: &str,
        priority: NotificationPriority,
    ) -> Result<Uuid, QueueError> {
        if message.trim().is_empty() {
            return Err(QueueError::Validation("message must not be empty".to_string()));
        }

        let (owner, tag) = {
            let running = self.queues.running.lock().await;
            let job = running
                .get(job_id)
                .ok_or_else(|| QueueError::NotFound(format!("job {job_id} is not running")))?;
            (job.user_id.clone(), job.two_word_tag.clone())
        };
        if owner != requester.user_id && !requester.is_admin {
            return Err(QueueError::Forbidden("job belongs to another user".to_string()));
        }

        let id = self
            .notifications
            .notify(
                &self.fabric,
                NotificationRequest::new(&requester.user_id, &owner, message)
                    .kind(NotificationKind::UserInitiatedMessage)
                    .priority(priority)
                    .job_id(job_id),
            )
            .map_err(QueueError::Internal)?;

        // Echo receipt so the sender's UI shows the message as queued.
        self.notifications
            .notify(
                &self.fabric,
                NotificationRequest::new("queue.run@valet", &requester.user_id, format!(
                    "message queued for job '{tag}'"
                ))
                .kind(NotificationKind::Custom)
                .priority(NotificationPriority::Low)
                .job_id(job_id),
            )
            .map_err(QueueError::Internal)?;

        Ok(id)
    }

    /// Job metadata plus its notification history, owner-or-admin only.
    /// Jobs are looked up in the done queue; dead jobs surface their fatal
    /// error instead of a view, which the transport maps to a 500.
    pub async fn job_interactions(
        &self,
        job_id: &str,
        requester: &Requester,
    ) -> Result<(JobView, Vec<Notification>), QueueError> {
        let view = {
            let done = self.queues.done.lock().await;
            done.get(job_id).map(JobView::from)
        };
        let Some(view) = view else {
            let dead = self.queues.dead.lock().await;
            if let Some(job) = dead.get(job_id) {
                if job.user_id != requester.user_id && !requester.is_admin {
                    return Err(QueueError::Forbidden("job belongs to another user".to_string()));
                }
                let detail = job
                    .error
                    .clone()
                    .unwrap_or_else(|| "job died without a recorded error".to_string());
                return Err(QueueError::Internal(anyhow::anyhow!(detail)));
            }
            return Err(QueueError::NotFound(format!("job {job_id} not in done queue")));
        };

        if view.user_id != requester.user_id && !requester.is_admin {
            return Err(QueueError::Forbidden("job belongs to another user".to_string()));
        }

        let notifications = self
            .notifications
            .for_job(job_id)
            .map_err(QueueError::Internal)?;
        Ok((view, notifications))
    }

    // ── Worker loop ───────────────────────────────────────────────────────────

    /// Drain todo → running → terminal until shutdown flips. One job at a
    /// time; focus mode pauses the drain without stopping the loop.
    pub fn spawn_worker(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            info!("queue worker started");
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(25)) => {
                        let next = {
                            let mut todo = scheduler.queues.todo.lock().await;
                            if todo.is_accepting_jobs() { todo.pop() } else { None }
                        };
                        if let Some(job) = next {
                            scheduler.process_job(job).await;
                        }
                    }
                }
            }
            info!("queue worker stopped");
        })
    }

    async fn process_job(&self, mut job: Job) {
        let started = Instant::now();
        let owner = job.user_id.clone();
        let id_hash = job.id_hash.clone();

        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        let mut working = job.clone();
        {
            let mut running = self.queues.running.lock().await;
            running.push(job);
        }
        self.fabric.emit_to_user(&owner, "run_update", job_view_json(&working));

        let outcome = if working.is_cache_hit {
            self.run_cache_hit(&mut working, started).await
        } else {
            self.run_agentic(&mut working, started).await
        };

        working.completed_at = Some(Utc::now());
        let (event, message) = match outcome {
            Outcome::Ok => {
                working.status = JobStatus::DoneOk;
                let message = working
                    .answer_conversational
                    .clone()
                    .unwrap_or_else(|| "job complete".to_string());
                ("done_update", message)
            }
            Outcome::Error(detail) => {
                working.status = JobStatus::DoneError;
                working.error = Some(detail.clone());
                ("done_update", detail)
            }
            Outcome::Fatal(detail) => {
                working.status = JobStatus::Dead;
                working.error = Some(detail.clone());
                ("dead_update", detail)
            }
        };

        {
            let mut running = self.queues.running.lock().await;
            running.delete(&id_hash);
        }
        let view = job_view_json(&working);
        self.write_last_response(&view);
        let terminal = working.status;
        {
            let stage = if terminal == JobStatus::Dead {
                &self.queues.dead
            } else {
                &self.queues.done
            };
            stage.lock().await.push(working);
        }
        self.fabric.emit_to_user(&owner, event, view);

        // Final spoken notification, correlated with the job.
        let priority = if terminal == JobStatus::DoneOk {
            NotificationPriority::High
        } else {
            NotificationPriority::Urgent
        };
        if let Err(err) = self.notifications.notify(
            &self.fabric,
            NotificationRequest::new("queue.run@valet", &owner, message)
                .kind(NotificationKind::Task)
                .priority(priority)
                .job_id(&id_hash),
        ) {
            warn!(%err, "final job notification failed");
        }
        debug!(id_hash = %id_hash, status = ?terminal, elapsed_ms = started.elapsed().as_millis() as u64, "job finished");
    }

    /// Replay a snapshot: no code runs, only the formatter path synthesizes
    /// a fresh conversational answer. Runtime stats and the synonym map are
    /// updated on the backing snapshot.
    async fn run_cache_hit(&self, job: &mut Job, started: Instant) -> Outcome {
        let Some(snapshot_id) = job.snapshot_id.clone() else {
            return Outcome::Error("cache-hit job without a backing snapshot".to_string());
        };

        let (answer, fallback_conversational) = {
            let store = self.snapshots.lock().await;
            let Some(snapshot) = store.get_by_id(&snapshot_id) else {
                return Outcome::Error(format!("backing snapshot {snapshot_id} is gone"));
            };
            (snapshot.answer.clone(), snapshot.answer_conversational.clone())
        };
        job.answer = Some(answer.clone());

        // Formatter-only pass through the agent core.
        let conversational = match self.registry.resolve(&job.routing_command).cloned() {
            Some(capability) => {
                let mut agent = Agent::new(
                    capability,
                    self.config.clone(),
                    self.client.clone(),
                    self.runner.clone(),
                    &job.question,
                    job.question_gist.as_deref().unwrap_or(""),
                    &job.user_id,
                );
                agent.answer = Some(answer.clone());
                match agent.run_formatter().await {
                    Ok(conversational) => {
                        job.cost.merge(agent.cost);
                        conversational
                    }
                    Err(err) => {
                        warn!(%err, "cache-hit formatter failed — using stored phrasing");
                        fallback_conversational
                    }
                }
            }
            None => fallback_conversational,
        };
        job.answer_conversational = Some(conversational);

        {
            let mut store = self.snapshots.lock().await;
            if let Some(snapshot) = store.get_mut(&snapshot_id) {
                snapshot.update_runtime_stats(started.elapsed().as_millis() as u64);
                if let Some(score) = job.cache_hit_score {
                    snapshot.add_synonymous_question(&job.question, score);
                }
            }
            if let Err(err) = store.persist(&snapshot_id) {
                warn!(%err, "snapshot stat persist failed");
            }
        }
        Outcome::Ok
    }

    /// Fresh agentic run: `do_all` through the agent core, then snapshot +
    /// io-log bookkeeping on success. Podcast requests fan into the chained
    /// research→podcast pipeline instead.
    async fn run_agentic(&self, job: &mut Job, started: Instant) -> Outcome {
        if job.routing_command == "agent router go to podcast" {
            return self.run_pipeline(job).await;
        }

        let Some(capability) = self.registry.resolve(&job.routing_command).cloned() else {
            return Outcome::Error(format!("unknown routing command '{}'", job.routing_command));
        };

        let mut agent = Agent::new(
            capability.clone(),
            self.config.clone(),
            self.client.clone(),
            self.runner.clone(),
            &job.question,
            job.question_gist.as_deref().unwrap_or(""),
            &job.user_id,
        );

        match agent.do_all().await {
            Ok(conversational) => {
                job.answer = agent.answer.clone();
                job.answer_conversational = Some(conversational.clone());
                if let Some(parsed) = &agent.parsed {
                    job.code = parsed.code.clone();
                    job.code_example = parsed.get_or_default("example");
                    job.code_returns = parsed.get_or_default("returns");
                }
                job.cost.merge(agent.cost);

                if let Err(err) = agent.serialize_to_file(&self.config.paths.agent_log_dir) {
                    warn!(%err, "agent state serialization failed");
                }

                let solution_path = if capability.cacheable {
                    self.persist_snapshot(job, &agent, started).await
                } else {
                    None
                };

                self.io
                    .append(IoEntry {
                        input_type: job.routing_command.clone(),
                        input: job.question.clone(),
                        output_raw: job.answer.clone().unwrap_or_default(),
                        output_final: conversational,
                        solution_path,
                    })
                    .await;
                Outcome::Ok
            }
            Err(err) if err.is_fatal() => {
                error!(%err, id_hash = %job.id_hash, "agent run fatal");
                Outcome::Fatal(err.to_string())
            }
            Err(err) => {
                warn!(%err, id_hash = %job.id_hash, "agent run failed");
                Outcome::Error(err.to_string())
            }
        }
    }

    /// Run research → podcast as one chained workflow. Cancellation is
    /// bridged from the job's notification stream: a user-initiated message
    /// containing "cancel" flips the watch channel the stages poll.
    async fn run_pipeline(&self, job: &mut Job) -> Outcome {
        let (Some(research_capability), Some(podcast_capability)) = (
            self.registry.resolve("agent router go to research").cloned(),
            self.registry.resolve("agent router go to podcast").cloned(),
        ) else {
            return Outcome::Error("pipeline families are not configured".to_string());
        };

        let tag: String = job.id_hash.chars().take(12).collect();
        let research = Box::new(AgentBackedStage::new(
            "deep-research",
            research_capability,
            self.config.clone(),
            self.client.clone(),
            self.runner.clone(),
            PathBuf::from(self.config.get_or("research output dir", "io/research")),
            tag.clone(),
        ));
        let podcast = Box::new(AgentBackedStage::new(
            "podcast-generator",
            podcast_capability,
            self.config.clone(),
            self.client.clone(),
            self.runner.clone(),
            PathBuf::from(self.config.get_or("podcast output dir", "io/podcasts")),
            tag,
        ));
        let pipeline = ChainedPipeline::new(
            research,
            podcast,
            self.fabric.clone(),
            self.notifications.clone(),
            &job.question,
            &job.user_id,
            Some(job.id_hash.clone()),
        );

        let (cancel_tx, cancel_rx) = watch::channel(self.cancel_requested(&job.id_hash));
        let watcher = {
            let notifications = self.notifications.clone();
            let job_id = job.id_hash.clone();
            tokio::spawn(async move {
                loop {
                    let cancelled = notifications
                        .for_job(&job_id)
                        .map(|rows| rows.iter().any(is_cancel_message))
                        .unwrap_or(false);
                    if cancelled {
                        let _ = cancel_tx.send(true);
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            })
        };

        let result = pipeline.run(cancel_rx).await;
        watcher.abort();

        job.cost.cost_usd += result.total_cost;
        if let Some(path) = &result.research_path {
            job.artifacts.insert("report_path".to_string(), path.clone());
        }
        if let Some(path) = &result.podcast_path {
            job.artifacts.insert("audio_script_path".to_string(), path.clone());
        }
        for (key, value) in &result.research_artifacts {
            job.artifacts.insert(format!("research_{key}"), value.clone());
        }
        for (key, value) in &result.podcast_artifacts {
            job.artifacts.insert(format!("podcast_{key}"), value.clone());
        }

        match result.state {
            PipelineState::Completed => {
                job.answer = result.podcast_path.clone();
                job.answer_conversational = Some(result.summary());
                Outcome::Ok
            }
            PipelineState::Cancelled => Outcome::Error(result.summary()),
            _ => Outcome::Error(result.error.clone().unwrap_or_else(|| result.summary())),
        }
    }

    /// Most recent terminal job view, for quick "what just happened" reads.
    fn write_last_response(&self, view: &Value) {
        let path = &self.config.paths.last_response_path;
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(err) = std::fs::write(path, view.to_string()) {
            warn!(%err, path = %path.display(), "last response write failed");
        }
    }

    fn cancel_requested(&self, job_id: &str) -> bool {
        self.notifications
            .for_job(job_id)
            .map(|rows| rows.iter().any(is_cancel_message))
            .unwrap_or(false)
    }

    async fn persist_snapshot(&self, job: &mut Job, agent: &Agent, started: Instant) -> Option<String> {
        let mut snapshot = SolutionSnapshot::for_question(&job.question)
            .with_gist(job.question_gist.as_deref().unwrap_or(""));
        snapshot.routing_command = job.routing_command.clone();
        snapshot.user_id = job.user_id.clone();
        snapshot.answer = job.answer.clone().unwrap_or_default();
        snapshot.answer_conversational = job.answer_conversational.clone().unwrap_or_default();
        snapshot.code = job.code.clone();
        snapshot.code_example = job.code_example.clone();
        snapshot.code_returns = job.code_returns.clone();
        if let Some(parsed) = &agent.parsed {
            snapshot.thoughts = parsed.get_or_default("thoughts");
            snapshot.solution_summary = parsed.get_or_default("explanation");
        }

        let mut store = self.snapshots.lock().await;
        match store.insert(snapshot).await {
            Ok(snapshot_id) => {
                if let Some(stored) = store.get_mut(&snapshot_id) {
                    stored.update_runtime_stats(started.elapsed().as_millis() as u64);
                }
                if let Err(err) = store.persist(&snapshot_id) {
                    warn!(%err, "snapshot stat persist failed");
                }
                let path = store
                    .get_by_id(&snapshot_id)
                    .and_then(|stored| stored.solution_file.clone());
                job.snapshot_id = Some(snapshot_id);
                path
            }
            Err(err) => {
                warn!(%err, "snapshot insert failed — answer not cached");
                None
            }
        }
    }
}

fn job_view_json(job: &Job) -> Value {
    serde_json::to_value(JobView::from(job)).unwrap_or(Value::Null)
}

fn is_cancel_message(notification: &Notification) -> bool {
    notification.kind == NotificationKind::UserInitiatedMessage
        && notification.message.to_lowercase().contains("cancel")
}
