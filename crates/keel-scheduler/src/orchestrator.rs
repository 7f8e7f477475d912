//! Build lifecycle orchestration.
//!
//! A trigger becomes a build in four steps: allocate a number (which
//! persists the build as `pending`), resolve the pipeline's secrets, pick a
//! route and publish the dispatch message. A failure after allocation leaves
//! the build in `error`; the number is never given back.
//!
//! Worker reports and cancellation move the build forward through the store's
//! compare-and-set, so a report racing a cancel can never resurrect a build.

use chrono::Utc;
use keel_config::VariableContextBuilder;
use keel_core::pipeline::CompiledPipeline;
use keel_core::queue::DispatchMessage;
use keel_core::{Build, BuildId, BuildStatus, Error, NewBuild, Result};
use keel_db::{BuildStore, StatusChange};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::allocator::NumberAllocator;
use crate::router::QueueRouter;
use crate::secrets::SecretGateway;

/// Re-reads allowed when a status update loses a compare-and-set race.
const TRANSITION_ATTEMPTS: u32 = 5;

/// Drives builds from trigger to dispatch and through their status changes.
pub struct BuildOrchestrator {
    store: Arc<dyn BuildStore>,
    allocator: NumberAllocator,
    secrets: SecretGateway,
    router: Arc<QueueRouter>,
    /// Values for `${env.*}` in pipeline environments.
    env: HashMap<String, String>,
}

impl BuildOrchestrator {
    pub fn new(
        store: Arc<dyn BuildStore>,
        allocator: NumberAllocator,
        secrets: SecretGateway,
        router: Arc<QueueRouter>,
    ) -> Self {
        Self {
            store,
            allocator,
            secrets,
            router,
            env: HashMap::new(),
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn store(&self) -> &Arc<dyn BuildStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<QueueRouter> {
        &self.router
    }

    /// Create a build for a trigger and dispatch it.
    ///
    /// On success the returned build is `pending` with its route and
    /// `enqueued_at` set. Allocation failures leave nothing behind; later
    /// failures up to the publish are recorded on the persisted build, which
    /// ends in `error`, before the error is returned. Once the message is
    /// published the build is returned even if `enqueued_at` could not be
    /// recorded.
    pub async fn allocate_and_create(
        &self,
        new_build: NewBuild,
        pipeline: &CompiledPipeline,
    ) -> Result<Build> {
        let build = self.allocator.allocate(&new_build).await?;
        info!(
            build_id = %build.id,
            repo_id = %build.repo_id,
            number = build.number,
            event = %build.event,
            "Build created"
        );
        crate::metrics::build_status_changed(BuildStatus::Pending.as_str());

        match self.dispatch(&build, pipeline).await {
            Ok(dispatched) => Ok(dispatched),
            Err(e) => {
                error!(build_id = %build.id, error = %e, "Build dispatch failed");
                crate::metrics::dispatch_failure(failure_reason(&e));
                self.record_dispatch_error(&build, &e).await;
                Err(e)
            }
        }
    }

    async fn dispatch(&self, build: &Build, pipeline: &CompiledPipeline) -> Result<Build> {
        let secrets = self.secrets.resolve(&pipeline.secrets).await?;
        let route = self.router.resolve(pipeline.route.as_deref())?;

        let build = self.store.set_route(build.id, &route).await?;

        let mut vars = VariableContextBuilder::new()
            .with_build(&build)
            .with_secrets(secrets)
            .build();
        vars.env = self.env.clone();
        let env = vars.runtime_env(&pipeline.env);

        let payload = DispatchMessage::new(&build, pipeline.clone(), env).to_bytes()?;
        self.router.publish(&route, payload).await?;

        // the message is on the queue; the build must stay dispatchable
        let build = match self.store.mark_enqueued(build.id, Utc::now()).await {
            Ok(enqueued) => enqueued,
            Err(e) => {
                warn!(
                    build_id = %build.id,
                    error = %e,
                    "Build enqueued but its enqueue time was not recorded"
                );
                build
            }
        };
        info!(build_id = %build.id, route = %route, "Build enqueued");
        Ok(build)
    }

    async fn record_dispatch_error(&self, build: &Build, cause: &Error) {
        let now = Utc::now();
        let change = StatusChange {
            status: BuildStatus::Error,
            error: Some(cause.to_string()),
            started_at: None,
            finished_at: Some(now),
        };

        match self
            .store
            .update_status(build.id, BuildStatus::Pending, &change)
            .await
        {
            Ok(Some(_)) => crate::metrics::build_status_changed(BuildStatus::Error.as_str()),
            Ok(None) => warn!(
                build_id = %build.id,
                "Build left pending before its dispatch error could be recorded"
            ),
            Err(e) => error!(
                build_id = %build.id,
                error = %e,
                "Failed to record dispatch error"
            ),
        }
    }

    /// A worker picked the build up.
    pub async fn mark_running(&self, id: BuildId) -> Result<Build> {
        self.transition(id, BuildStatus::Running, None).await
    }

    /// A worker finished the build with `success`, `failure` or `error`.
    pub async fn complete(
        &self,
        id: BuildId,
        status: BuildStatus,
        message: Option<String>,
    ) -> Result<Build> {
        if !matches!(
            status,
            BuildStatus::Success | BuildStatus::Failure | BuildStatus::Error
        ) {
            return Err(Error::InvalidArgument(format!(
                "{} is not a completion status",
                status
            )));
        }
        self.transition(id, status, message).await
    }

    /// Apply a worker status report: `running` or a completion status.
    pub async fn report(
        &self,
        id: BuildId,
        status: BuildStatus,
        message: Option<String>,
    ) -> Result<Build> {
        match status {
            BuildStatus::Running => self.mark_running(id).await,
            _ => self.complete(id, status, message).await,
        }
    }

    /// Administratively stop a build. Later worker reports are rejected.
    pub async fn cancel(&self, id: BuildId) -> Result<Build> {
        self.transition(id, BuildStatus::Canceled, None).await
    }

    async fn transition(
        &self,
        id: BuildId,
        to: BuildStatus,
        message: Option<String>,
    ) -> Result<Build> {
        for _ in 0..TRANSITION_ATTEMPTS {
            let current = self.store.get_by_id(id).await?;
            if !current.status.can_transition_to(to) {
                warn!(
                    build_id = %id,
                    from = %current.status,
                    to = %to,
                    "Rejected status transition"
                );
                return Err(Error::InvalidTransition {
                    from: current.status,
                    to,
                });
            }

            let now = Utc::now();
            let change = StatusChange {
                status: to,
                error: message.clone(),
                // cancel never marks a start
                started_at: (to != BuildStatus::Canceled).then_some(now),
                finished_at: to.is_terminal().then_some(now),
            };

            if let Some(updated) = self
                .store
                .update_status(id, current.status, &change)
                .await?
            {
                info!(build_id = %id, from = %current.status, to = %to, "Build status changed");
                crate::metrics::build_status_changed(to.as_str());
                return Ok(updated);
            }
        }

        Err(Error::Unavailable(format!(
            "build {} changed status concurrently {} times",
            id, TRANSITION_ATTEMPTS
        )))
    }
}

fn failure_reason(err: &Error) -> &'static str {
    match err {
        Error::SecretUnavailable { .. } => "secret",
        Error::DispatchFailure(_) => "publish",
        _ => "internal",
    }
}
