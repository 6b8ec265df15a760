use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::{Configuration, Credentials};
use crate::error::Result;
use crate::events::{CycleOutcome, ExitReason, RotationState};
use crate::pool::ImageCandidate;
use crate::remote::{IdentityConnector, IdentitySession};
use crate::retention::RetentionPolicy;
use crate::selection::{SelectionMode, Selector};

/// Source of the inter-cycle delay. Swappable so tests need not wait on the wall clock.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone)]
pub struct RotatorSettings {
    pub interval: Duration,
    pub retention: Option<RetentionPolicy>,
    pub selection: SelectionMode,
    pub selection_seed: Option<u64>,
    /// Stop after this many cycles instead of looping forever.
    pub max_cycles: Option<u64>,
}

impl From<&Configuration> for RotatorSettings {
    fn from(cfg: &Configuration) -> Self {
        Self {
            interval: cfg.interval,
            retention: cfg.retention(),
            selection: cfg.selection,
            selection_seed: cfg.selection_seed,
            max_cycles: None,
        }
    }
}

/// Drives select -> upload -> evict -> sleep against one open session.
///
/// At most one cycle is in flight. Failures inside a cycle, panics included,
/// are turned into a [`CycleOutcome`] and logged; the only ways out of
/// [`Rotator::run`] are an empty pool, cancellation, or reaching `max_cycles`.
pub struct Rotator<'s, S: ?Sized, P> {
    session: &'s S,
    pool: Vec<ImageCandidate>,
    selector: Selector,
    interval: Duration,
    retention: Option<RetentionPolicy>,
    max_cycles: Option<u64>,
    sleeper: P,
    cycles: u64,
    state: watch::Sender<RotationState>,
}

impl<'s, S, P> Rotator<'s, S, P>
where
    S: IdentitySession + ?Sized,
    P: Sleeper,
{
    pub fn new(
        session: &'s S,
        pool: Vec<ImageCandidate>,
        settings: RotatorSettings,
        sleeper: P,
    ) -> Self {
        let (state, _) = watch::channel(RotationState::Selecting);
        Self {
            session,
            pool,
            selector: Selector::new(settings.selection, settings.selection_seed),
            interval: settings.interval,
            retention: settings.retention,
            max_cycles: settings.max_cycles,
            sleeper,
            cycles: 0,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RotationState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> RotationState {
        *self.state.borrow()
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Cycles run so far, whatever their outcome.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub async fn run(&mut self, cancel: CancellationToken) -> ExitReason {
        loop {
            self.set_state(RotationState::Selecting);
            if self.pool.is_empty() {
                error!("image pool is empty; add images and restart");
                return self.finish(ExitReason::EmptyPool);
            }
            if cancel.is_cancelled() {
                return self.finish(ExitReason::Cancelled);
            }

            let cycle = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                outcome = AssertUnwindSafe(self.run_cycle()).catch_unwind() => Some(outcome),
            };
            let outcome = match cycle {
                Some(Ok(outcome)) => outcome,
                Some(Err(panic)) => CycleOutcome::Panicked {
                    message: panic_message(panic.as_ref()),
                },
                None => {
                    info!("cancel received mid-cycle; abandoning outstanding remote calls");
                    return self.finish(ExitReason::Cancelled);
                }
            };
            self.cycles += 1;
            log_outcome(self.cycles, &outcome);

            if self.max_cycles.is_some_and(|max| self.cycles >= max) {
                return self.finish(ExitReason::Completed);
            }

            self.set_state(RotationState::Sleeping);
            info!(
                interval = %humantime::format_duration(self.interval),
                "waiting before next rotation"
            );
            let slept = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = self.sleeper.sleep(self.interval) => true,
            };
            if !slept {
                info!("cancel received while sleeping");
                return self.finish(ExitReason::Cancelled);
            }
        }
    }

    /// One select/upload/evict pass. Never fails; errors come back as the outcome.
    ///
    /// # Panics
    /// Panics if the pool is empty.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.set_state(RotationState::Selecting);
        let cycle = self.selector.cycle();
        let image = self.selector.select_next(&self.pool).path().to_path_buf();
        info!(
            cycle,
            strategy = %self.selector.mode(),
            image = %image.display(),
            "selected next profile image"
        );

        self.set_state(RotationState::Uploading);
        if let Err(error) = self.session.upload_and_assign(&image).await {
            return CycleOutcome::UploadFailed { image, error };
        }
        info!(image = %image.display(), "profile image updated");

        let Some(policy) = self.retention else {
            return CycleOutcome::Rotated {
                image,
                evicted: None,
            };
        };

        // History is listed after the upload, so the new photo counts toward `keep`.
        self.set_state(RotationState::Evicting);
        match policy.prune(self.session).await {
            Ok(evicted) => CycleOutcome::Rotated {
                image,
                evicted: Some(evicted),
            },
            Err(error) => CycleOutcome::EvictionFailed { image, error },
        }
    }

    fn set_state(&self, state: RotationState) {
        self.state.send_replace(state);
    }

    fn finish(&self, reason: ExitReason) -> ExitReason {
        self.set_state(RotationState::Terminated);
        info!(?reason, cycles = self.cycles, "rotation loop stopped");
        reason
    }
}

fn log_outcome(cycle: u64, outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Rotated { image, evicted } => {
            info!(cycle, image = %image.display(), evicted = ?evicted, "rotation cycle complete");
        }
        CycleOutcome::UploadFailed { image, error } => {
            warn!(cycle, image = %image.display(), "upload failed; continuing with next cycle: {error}");
        }
        CycleOutcome::EvictionFailed { image, error } => {
            warn!(cycle, image = %image.display(), "pruning old photos failed: {error}");
        }
        CycleOutcome::Panicked { message } => {
            error!(cycle, "rotation cycle panicked: {message}");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Open a session, rotate until the loop stops, then release the session.
///
/// The session is torn down on every exit path, including an empty pool and
/// a panic escaping the loop.
#[instrument(skip_all, fields(images = pool.len()))]
pub async fn run<C, P>(
    connector: &C,
    credentials: &Credentials,
    pool: Vec<ImageCandidate>,
    settings: RotatorSettings,
    sleeper: P,
    cancel: CancellationToken,
) -> Result<ExitReason>
where
    C: IdentityConnector,
    P: Sleeper,
{
    let session = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            info!("cancel received before the session was established");
            return Ok(ExitReason::Cancelled);
        }
        session = connector.authenticate(credentials) => session?,
    };
    info!("identity session established");

    let result = {
        let mut rotator = Rotator::new(&session, pool, settings, sleeper);
        AssertUnwindSafe(rotator.run(cancel)).catch_unwind().await
    };

    match session.teardown().await {
        Ok(()) => info!("identity session released"),
        Err(err) => warn!("failed to release identity session: {err}"),
    }

    match result {
        Ok(reason) => Ok(reason),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
