//! Activity delivery pipeline
//!
//! Outbound activities are fanned out into one persisted delivery per
//! recipient; inbound activities are recorded under a single local
//! delivery. A pool of workers claims due deliveries, performs them and
//! records the outcome, retrying transient failures with backoff.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use http::HeaderValue;
use rand::Rng;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use super::actor_cache::ActorCache;
use super::http::HttpClient;
use super::identity::{CanonicalUrl, IdentityResolver, LocalEntityRef, UrlClass};
use super::signature::{LocalKey, SignatureCodec};
use super::store::{ActivityStore, ClaimedJob, Direction, LOCAL_INBOX_TARGET, NewInbound};
use super::verifier::{InboundRequest, RequestVerifier, activity_actor};
use super::local_key_id;
use crate::config::DeliveryConfig;
use crate::error::AppError;
use crate::host::{HandlerRegistry, InboundActivity};
use crate::metrics::{
    ACTIVITIES_RECEIVED, ACTIVITIES_SENT, DELIVERY_ATTEMPTS_TOTAL, DELIVERY_QUEUE_DEPTH,
};

pub const ACTIVITY_CONTENT_TYPE: &str = "application/activity+json";

const CACHE_PRUNE_INTERVAL: Duration = Duration::from_secs(300);

/// Retry schedule for failed deliveries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base: config.base_backoff(),
            max: config.max_backoff(),
        }
    }

    /// Delay after failed attempt `attempt` (1-based), before jitter:
    /// `min(base * 2^(attempt-1), max)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max)
    }

    /// [`Self::base_delay`] plus uniform jitter in `[0, delay/4]`.
    pub fn delay_with_jitter(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let delay = self.base_delay(attempt);
        let jitter_ms = (delay.as_millis() / 4) as u64;
        delay + Duration::from_millis(rng.gen_range(0..=jitter_ms))
    }
}

/// Result of handing an inbound request to the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Accepted,
    Duplicate,
}

/// What happened to one claimed job
#[derive(Debug)]
enum JobOutcome {
    Done,
    Retry(AppError),
    Abandon(String),
}

impl JobOutcome {
    fn label(&self) -> &'static str {
        match self {
            JobOutcome::Done => "processed",
            JobOutcome::Retry(_) => "failed_retryable",
            JobOutcome::Abandon(_) => "abandoned",
        }
    }
}

/// Deduplicate identical targets while keeping their order.
fn unique_targets(targets: &[CanonicalUrl]) -> Vec<String> {
    let mut seen = HashSet::new();
    targets
        .iter()
        .filter(|target| seen.insert(target.as_str()))
        .map(|target| target.as_str().to_string())
        .collect()
}

fn activity_type(activity: &serde_json::Value) -> Option<&str> {
    activity.get("type").and_then(|value| value.as_str())
}

/// Persistent, retrying delivery and ingestion pipeline.
pub struct DeliveryPipeline {
    store: ActivityStore,
    http: Arc<dyn HttpClient>,
    actors: Arc<ActorCache>,
    verifier: RequestVerifier,
    codec: SignatureCodec,
    instance_key: Arc<LocalKey>,
    instance_actor_url: String,
    identity: IdentityResolver,
    handlers: HandlerRegistry,
    policy: RetryPolicy,
    request_timeout: Duration,
    poll_interval: Duration,
    workers: usize,
    defer_verification: bool,
    wake: Notify,
}

/// Collaborators the pipeline is built from
pub struct PipelineParts {
    pub store: ActivityStore,
    pub http: Arc<dyn HttpClient>,
    pub actors: Arc<ActorCache>,
    pub codec: SignatureCodec,
    pub instance_key: Arc<LocalKey>,
    pub instance_actor_url: String,
    pub identity: IdentityResolver,
    pub handlers: HandlerRegistry,
    pub defer_verification: bool,
}

impl DeliveryPipeline {
    pub fn new(parts: PipelineParts, config: &DeliveryConfig) -> Self {
        let verifier = RequestVerifier::new(parts.codec.clone(), parts.actors.clone());
        Self {
            store: parts.store,
            http: parts.http,
            actors: parts.actors,
            verifier,
            codec: parts.codec,
            instance_key: parts.instance_key,
            instance_actor_url: parts.instance_actor_url,
            identity: parts.identity,
            handlers: parts.handlers,
            policy: RetryPolicy::from_config(config),
            request_timeout: config.request_timeout(),
            poll_interval: config.poll_interval(),
            workers: config.workers.max(1),
            defer_verification: parts.defer_verification,
            wake: Notify::new(),
        }
    }

    pub fn store(&self) -> &ActivityStore {
        &self.store
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Queue an outbound activity for every recipient actor.
    ///
    /// An activity without `id` gets one under the local activity path.
    /// Returns the activity id.
    pub async fn publish(
        &self,
        mut activity: serde_json::Value,
        recipients: &[CanonicalUrl],
    ) -> Result<String, AppError> {
        if !activity.is_object() {
            return Err(AppError::Validation(
                "Activity must be a JSON object".to_string(),
            ));
        }

        let id = match activity.get("id").and_then(|id| id.as_str()) {
            Some(id) => id.to_string(),
            None => {
                let entity = LocalEntityRef::object(
                    super::identity::ACTIVITY_SUBTYPE,
                    ulid::Ulid::new().to_string().to_lowercase(),
                );
                let id = self.identity.to_canonical_url(&entity).to_string();
                activity["id"] = serde_json::Value::String(id.clone());
                id
            }
        };

        let payload = serde_json::to_vec(&activity)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;
        self.enqueue_outbound(&id, &payload, recipients).await?;
        Ok(id)
    }

    /// Queue pre-serialized payload for delivery to `targets` (actor URLs).
    ///
    /// Pairs already known are left as they are, so re-publishing never
    /// repeats a delivery. Returns the number of new deliveries.
    pub async fn enqueue_outbound(
        &self,
        id: &str,
        payload: &[u8],
        targets: &[CanonicalUrl],
    ) -> Result<u64, AppError> {
        let activity: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| AppError::Validation(format!("Activity is not JSON: {}", e)))?;
        let activity_type = activity_type(&activity);

        let targets: Vec<String> = unique_targets(targets)
            .into_iter()
            .filter(|target| {
                let local = self.identity.is_local(target);
                if local {
                    tracing::debug!(target = %target, "Skipping local recipient");
                }
                !local
            })
            .collect();

        let inserted = self
            .store
            .enqueue_outbound(id, activity_type, payload, &targets, Utc::now())
            .await?;

        if inserted > 0 {
            ACTIVITIES_SENT
                .with_label_values(&[activity_type.unwrap_or("unknown")])
                .inc();
            tracing::info!(
                activity = %id,
                new_deliveries = inserted,
                targets = targets.len(),
                "Queued outbound activity"
            );
            self.wake.notify_waiters();
        }
        Ok(inserted)
    }

    /// Verify a signed inbound request now and queue it for handling.
    ///
    /// # Errors
    /// `SignatureInvalid` when the request cannot be authenticated,
    /// including when the signer's actor cannot be fetched. Nothing is
    /// recorded in that case.
    pub async fn receive(&self, request: InboundRequest) -> Result<ReceiveOutcome, AppError> {
        if self.defer_verification {
            return self.ingest(request).await;
        }

        let activity = parse_inbound(&request.body)?;
        let id = inbound_id(&activity)?;

        let actor = self
            .verifier
            .authenticate(&request, &activity, Utc::now())
            .await
            .map_err(|e| match e {
                AppError::SignatureInvalid(_) => e,
                other => AppError::SignatureInvalid(format!("Could not verify signer: {}", other)),
            })?;

        self.record_inbound(
            NewInbound {
                id: &id,
                activity_type: activity_type(&activity),
                payload: &request.body,
                source_actor_url: Some(actor.canonical_url.as_str()),
                request_meta: None,
                verified: true,
            },
            activity_type(&activity),
        )
        .await
    }

    /// Persist the raw signed request and verify it inside a worker.
    ///
    /// A request failing verification there ends `Abandoned`, and a later
    /// request under the same id takes its place.
    pub async fn ingest(&self, request: InboundRequest) -> Result<ReceiveOutcome, AppError> {
        let activity = parse_inbound(&request.body)?;
        let id = inbound_id(&activity)?;
        let meta = serde_json::to_string(&request.meta())
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to store request: {}", e)))?;

        self.record_inbound(
            NewInbound {
                id: &id,
                activity_type: activity_type(&activity),
                payload: &request.body,
                source_actor_url: activity_actor(&activity),
                request_meta: Some(meta),
                verified: false,
            },
            activity_type(&activity),
        )
        .await
    }

    async fn record_inbound(
        &self,
        inbound: NewInbound<'_>,
        activity_type: Option<&str>,
    ) -> Result<ReceiveOutcome, AppError> {
        let id = inbound.id.to_string();
        if !self.store.enqueue_inbound(inbound, Utc::now()).await? {
            tracing::debug!(activity = %id, "Duplicate inbound activity");
            return Ok(ReceiveOutcome::Duplicate);
        }

        ACTIVITIES_RECEIVED
            .with_label_values(&[activity_type.unwrap_or("unknown")])
            .inc();
        self.wake.notify_waiters();
        Ok(ReceiveOutcome::Accepted)
    }

    /// Claim and run one due job. Returns `false` when nothing was due.
    pub async fn process_next(&self) -> Result<bool, AppError> {
        let Some(job) = self.store.claim_next(Utc::now()).await? else {
            return Ok(false);
        };

        let outcome = match job.direction {
            Direction::Outbound => self.deliver(&job).await,
            Direction::Inbound => self.handle_inbound(&job).await,
        };

        DELIVERY_ATTEMPTS_TOTAL
            .with_label_values(&[job.direction.as_str(), outcome.label()])
            .inc();
        self.record_outcome(&job, outcome).await?;
        self.update_queue_depth().await;
        Ok(true)
    }

    /// Run jobs until none is due. Retries scheduled in the future are
    /// left for later.
    pub async fn run_until_idle(&self) -> Result<usize, AppError> {
        let mut processed = 0;
        while self.process_next().await? {
            processed += 1;
        }
        Ok(processed)
    }

    /// Start the worker pool and cache maintenance.
    ///
    /// Workers exit once `shutdown` flips to `true`; a job in progress is
    /// finished first.
    pub fn spawn_workers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<JoinHandle<()>> = (0..self.workers)
            .map(|worker| {
                let pipeline = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pipeline.worker_loop(worker, shutdown).await })
            })
            .collect();

        let actors = self.actors.clone();
        let mut shutdown = shutdown;
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(CACHE_PRUNE_INTERVAL) => {
                        actors.prune_expired().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));

        tracing::info!(workers = self.workers, "Delivery workers started");
        handles
    }

    async fn worker_loop(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_next().await {
                Ok(true) => continue,
                Ok(false) => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    tracing::error!(worker, error = %e, "Delivery worker failed to process job");
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        tracing::debug!(worker, "Delivery worker stopped");
    }

    async fn deliver(&self, job: &ClaimedJob) -> JobOutcome {
        let target = match CanonicalUrl::parse(&job.target_url) {
            Ok(target) => target,
            Err(e) => return JobOutcome::Abandon(e.to_string()),
        };

        let actor = match self.actors.get(&target).await {
            Ok(actor) => actor,
            Err(e) => return JobOutcome::Retry(e),
        };
        let inbox = actor.inbox_url.as_str();

        let key = self.signing_key_for(&job.payload);
        let mut headers = match self
            .codec
            .sign_outgoing("POST", inbox, Some(&job.payload), &key)
        {
            Ok(headers) => headers,
            Err(e) => return JobOutcome::Abandon(format!("Cannot sign delivery: {}", e)),
        };
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static(ACTIVITY_CONTENT_TYPE),
        );

        let post = self.http.post(inbox, headers, job.payload.clone());
        let response = match tokio::time::timeout(self.request_timeout, post).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return JobOutcome::Retry(e),
            Err(_) => {
                return JobOutcome::Retry(AppError::Transport(format!(
                    "Delivery to {} timed out",
                    inbox
                )));
            }
        };

        if response.status.is_success() {
            tracing::info!(activity = %job.activity_id, inbox = %inbox, "Delivered activity");
            JobOutcome::Done
        } else {
            JobOutcome::Retry(AppError::DeliveryFailure(format!(
                "Inbox {} rejected activity: HTTP {}",
                inbox, response.status
            )))
        }
    }

    async fn handle_inbound(&self, job: &ClaimedJob) -> JobOutcome {
        let activity: serde_json::Value = match serde_json::from_slice(&job.payload) {
            Ok(activity) => activity,
            Err(e) => return JobOutcome::Abandon(format!("Stored payload is not JSON: {}", e)),
        };

        let mut actor = job.source_actor_url.clone();
        if !job.verified {
            let Some(meta) = job.request_meta.as_deref() else {
                return JobOutcome::Abandon("Unverified activity without request data".to_string());
            };
            let request = match serde_json::from_str(meta)
                .map_err(|e| AppError::Validation(e.to_string()))
                .and_then(|meta| InboundRequest::from_meta(meta, job.payload.clone()))
            {
                Ok(request) => request,
                Err(e) => return JobOutcome::Abandon(format!("Stored request unusable: {}", e)),
            };

            match self
                .verifier
                .authenticate(&request, &activity, job.received_at)
                .await
            {
                Ok(signer) => {
                    if let Err(e) = self
                        .store
                        .mark_verified(&job.activity_id, signer.canonical_url.as_str())
                        .await
                    {
                        return JobOutcome::Retry(e);
                    }
                    actor = Some(signer.canonical_url.to_string());
                }
                Err(e) if e.is_retryable() => return JobOutcome::Retry(e),
                Err(e) => return JobOutcome::Abandon(e.to_string()),
            }
        }

        let Some(kind) = activity_type(&activity) else {
            return JobOutcome::Abandon("Activity has no type".to_string());
        };
        let Some(handler) = self.handlers.get(kind) else {
            return JobOutcome::Abandon(format!("No handler for activity type {}", kind));
        };

        let inbound = InboundActivity {
            id: job.activity_id.clone(),
            activity_type: kind.to_string(),
            actor,
            payload: activity.clone(),
        };
        match handler.handle(&inbound).await {
            Ok(()) => JobOutcome::Done,
            Err(e) => JobOutcome::Retry(e),
        }
    }

    async fn record_outcome(&self, job: &ClaimedJob, outcome: JobOutcome) -> Result<(), AppError> {
        match outcome {
            JobOutcome::Done => {
                self.store
                    .mark_processed(&job.activity_id, &job.target_url)
                    .await
            }
            JobOutcome::Retry(e) if job.attempt >= self.policy.max_attempts => {
                tracing::warn!(
                    activity = %job.activity_id,
                    target = %job.target_url,
                    attempts = job.attempt,
                    error = %e,
                    "Giving up on delivery"
                );
                self.store
                    .mark_abandoned(
                        &job.activity_id,
                        &job.target_url,
                        &format!("Gave up after {} attempts: {}", job.attempt, e),
                    )
                    .await
            }
            JobOutcome::Retry(e) => {
                let delay = self
                    .policy
                    .delay_with_jitter(job.attempt, &mut rand::thread_rng());
                tracing::debug!(
                    activity = %job.activity_id,
                    target = %job.target_url,
                    attempt = job.attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Delivery failed, will retry"
                );
                let next = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                self.store
                    .mark_retry(&job.activity_id, &job.target_url, &e.to_string(), next)
                    .await
            }
            JobOutcome::Abandon(reason) => {
                tracing::warn!(
                    activity = %job.activity_id,
                    target = %job.target_url,
                    reason = %reason,
                    "Abandoned job"
                );
                self.store
                    .mark_abandoned(&job.activity_id, &job.target_url, &reason)
                    .await
            }
        }
    }

    /// Local actors share the instance keypair under their own key id.
    fn signing_key_for(&self, payload: &[u8]) -> LocalKey {
        let actor = serde_json::from_slice::<serde_json::Value>(payload)
            .ok()
            .and_then(|activity| activity_actor(&activity).map(str::to_string));

        match actor {
            Some(actor) if actor == self.instance_actor_url => (*self.instance_key).clone(),
            Some(actor) if matches!(self.identity.classify(&actor), UrlClass::LocalActor(_)) => {
                self.instance_key.with_key_id(local_key_id(&actor))
            }
            _ => (*self.instance_key).clone(),
        }
    }

    async fn update_queue_depth(&self) {
        match self.store.status_counts().await {
            Ok(counts) => {
                for (status, count) in counts {
                    DELIVERY_QUEUE_DEPTH
                        .with_label_values(&[status.as_str()])
                        .set(count);
                }
            }
            Err(e) => tracing::debug!(error = %e, "Could not read queue depth"),
        }
    }
}

fn parse_inbound(body: &[u8]) -> Result<serde_json::Value, AppError> {
    let activity: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("Activity is not JSON: {}", e)))?;
    if !activity.is_object() {
        return Err(AppError::Validation(
            "Activity must be a JSON object".to_string(),
        ));
    }
    Ok(activity)
}

fn inbound_id(activity: &serde_json::Value) -> Result<String, AppError> {
    activity
        .get("id")
        .and_then(|id| id.as_str())
        .filter(|id| !id.is_empty() && *id != LOCAL_INBOX_TARGET)
        .map(str::to_string)
        .ok_or_else(|| AppError::Validation("Activity has no id".to_string()))
}
