//! The scheduled cycle.
//!
//! One cycle reads the queue, ranks the batch, and walks the ranking until a
//! candidate composes; that artifact is posted and the batch is settled.
//! With `fan_out > 1` several candidates compose at once and the first to
//! succeed wins; the rest are cancelled.
//!
//! The global gate is consulted before each candidate without counting;
//! the one counted hit is taken just before the post.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::{DispatchConfig, DrainPolicy, RateLimitStopPolicy};
use crate::compose::{ComposeFailure, ComposeRetryController, Composed};
use crate::domain::{Candidate, ScoredCandidate};
use crate::error::Result;
use crate::post::{PostError, PostPayload, PostRetryPolicy, Poster, post_with_retry};
use crate::queue::CandidateQueue;
use crate::ratelimit::{RateLimitResult, RateLimiter};
use crate::scoring::Scorer;
use crate::shutdown::{self, Shutdown, ShutdownTrigger};
use crate::text::{MAX_STATUS_WITH_MEDIA_LENGTH, PhrasePicker, ellipsis};

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleReport {
    /// Queue was empty
    Idle,
    /// Nothing in the batch was eligible
    NothingEligible { pending: usize },
    Posted {
        candidate_id: String,
        url: String,
        /// Candidates composed before (and including) the winner
        tried: usize,
    },
    /// The global gate closed the cycle
    RateLimited { tried: usize, reset_secs: u64 },
    /// Every ranked candidate was abandoned
    Missed { tried: usize },
    PostFailed { candidate_id: String, error: PostError },
    Cancelled,
}

impl CycleReport {
    pub fn is_posted(&self) -> bool {
        matches!(self, CycleReport::Posted { .. })
    }
}

impl std::fmt::Display for CycleReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleReport::Idle => write!(f, "queue empty"),
            CycleReport::NothingEligible { pending } => write!(f, "none of {} candidates eligible", pending),
            CycleReport::Posted {
                candidate_id,
                url,
                tried,
            } => write!(f, "posted {} as {} after {} candidate(s)", candidate_id, url, tried),
            CycleReport::RateLimited { tried, reset_secs } => {
                write!(f, "rate limited after {} candidate(s), resets in {}s", tried, reset_secs)
            }
            CycleReport::Missed { tried } => write!(f, "no candidate composed ({} tried)", tried),
            CycleReport::PostFailed { candidate_id, error } => write!(f, "post of {} failed: {}", candidate_id, error),
            CycleReport::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Where the walk over the ranking stopped.
enum Finish {
    Won {
        candidate: Candidate,
        composed: Composed,
        tried: usize,
    },
    RateLimited {
        tried: usize,
        reset_secs: u64,
    },
    Missed {
        tried: usize,
    },
    Cancelled,
}

/// What one fan-out task came back with.
enum Attempt {
    Won(Composed),
    /// Composed, but another task won first
    Discarded,
    Failed(ComposeFailure),
    RateLimited(u64),
    Skipped,
}

/// The global gate: one unit per post.
#[derive(Clone)]
struct Gate {
    limiter: RateLimiter,
    config: DispatchConfig,
}

impl Gate {
    /// Would a post be let through right now.
    async fn available(&self) -> RateLimitResult {
        self.limiter
            .available(
                &self.config.rate_limit_scope,
                &self.config.rate_limit_identity,
                self.config.rate_limit_max,
                self.config.rate_limit_ttl(),
            )
            .await
    }

    /// Count the post.
    async fn take(&self) -> RateLimitResult {
        self.limiter
            .check(
                &self.config.rate_limit_scope,
                &self.config.rate_limit_identity,
                self.config.rate_limit_max,
                self.config.rate_limit_ttl(),
            )
            .await
    }
}

pub struct Dispatcher {
    queue: Arc<CandidateQueue>,
    scorer: Scorer,
    controller: Arc<ComposeRetryController>,
    gate: Gate,
    poster: Arc<dyn Poster>,
    post_retry: PostRetryPolicy,
    picker: PhrasePicker,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<CandidateQueue>,
        scorer: Scorer,
        controller: Arc<ComposeRetryController>,
        limiter: RateLimiter,
        poster: Arc<dyn Poster>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            queue,
            scorer,
            controller,
            gate: Gate { limiter, config },
            poster,
            post_retry: PostRetryPolicy::default(),
            picker: PhrasePicker::default(),
        }
    }

    pub fn with_post_retry(mut self, policy: PostRetryPolicy) -> Self {
        self.post_retry = policy;
        self
    }

    pub fn with_phrase_picker(mut self, picker: PhrasePicker) -> Self {
        self.picker = picker;
        self
    }

    fn config(&self) -> &DispatchConfig {
        &self.gate.config
    }

    /// Rank what is queued right now without touching the queue.
    pub fn preview(&self) -> Result<Vec<ScoredCandidate>> {
        let pending = self.queue.read_all()?;
        Ok(self.scorer.score(&pending, Utc::now()))
    }

    /// Run one cycle. Only queue I/O errors are returned; every other
    /// outcome is a [`CycleReport`].
    pub async fn run_cycle(&self, shutdown: &Shutdown) -> Result<CycleReport> {
        let pending = match self.config().drain_policy {
            DrainPolicy::OnSuccess => self.queue.read_all()?,
            DrainPolicy::AtCycleStart => self.queue.drain_all()?,
        };
        if pending.is_empty() {
            tracing::debug!("Queue empty, nothing to do");
            return Ok(CycleReport::Idle);
        }

        let ranked = self.scorer.score(&pending, Utc::now());
        if ranked.is_empty() {
            tracing::info!(pending = pending.len(), "No eligible candidates");
            self.settle(&pending)?;
            return Ok(CycleReport::NothingEligible { pending: pending.len() });
        }

        tracing::info!(
            pending = pending.len(),
            eligible = ranked.len(),
            fan_out = self.config().fan_out,
            "Starting cycle"
        );

        let finish = if self.config().fan_out > 1 {
            self.walk_concurrent(ranked, shutdown).await
        } else {
            self.walk_sequential(&ranked, shutdown).await
        };

        let report = match finish {
            Finish::Won {
                candidate,
                composed,
                tried,
            } => self.post_winner(candidate, &composed, tried, &pending).await?,
            Finish::RateLimited { tried, reset_secs } => CycleReport::RateLimited { tried, reset_secs },
            Finish::Missed { tried } => {
                tracing::info!(tried, "No candidate composed this cycle");
                CycleReport::Missed { tried }
            }
            Finish::Cancelled => CycleReport::Cancelled,
        };

        Ok(report)
    }

    /// Cycle every `cycle_interval` until shutdown.
    pub async fn run(&self, mut shutdown: Shutdown) {
        let interval = self.config().cycle_interval();
        loop {
            if shutdown.is_triggered() {
                break;
            }

            match self.run_cycle(&shutdown).await {
                Ok(report) => log::info!("Cycle finished: {}", report),
                Err(e) => log::error!("Cycle failed: {}", e),
            }

            let limiter = self.gate.limiter.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || limiter.purge_expired()).await {
                log::warn!("Rate limit purge task failed: {}", e);
            }

            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        log::info!("Dispatcher stopped");
    }

    async fn walk_sequential(&self, ranked: &[ScoredCandidate], shutdown: &Shutdown) -> Finish {
        let mut tried = 0;
        let mut limited = None;

        for scored in ranked {
            if shutdown.is_triggered() {
                return Finish::Cancelled;
            }

            let gate = self.gate.available().await;
            if !gate.allowed {
                match self.config().rate_limit_stop {
                    RateLimitStopPolicy::StopCycle => {
                        return Finish::RateLimited {
                            tried,
                            reset_secs: gate.reset_secs,
                        };
                    }
                    RateLimitStopPolicy::SkipCandidate => {
                        limited.get_or_insert(gate.reset_secs);
                        continue;
                    }
                }
            }

            tried += 1;
            let candidate = &scored.candidate;
            let text = self.picker.pick(&candidate.cleaned_text);
            match self
                .controller
                .try_compose(&text, None, shutdown)
                .await
            {
                Ok(composed) => {
                    return Finish::Won {
                        candidate: candidate.clone(),
                        composed,
                        tried,
                    };
                }
                Err(ComposeFailure::Cancelled) => return Finish::Cancelled,
                Err(e) => {
                    tracing::warn!(candidate = %candidate.id, score = scored.score, error = %e, "Candidate abandoned");
                }
            }
        }

        match limited {
            Some(reset_secs) if tried == 0 => Finish::RateLimited { tried, reset_secs },
            _ => Finish::Missed { tried },
        }
    }

    async fn walk_concurrent(&self, ranked: Vec<ScoredCandidate>, shutdown: &Shutdown) -> Finish {
        let (trigger, cancel) = shutdown::channel();
        let trigger = Arc::new(trigger);
        let won = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));
        let slots = Arc::new(Semaphore::new(self.config().fan_out));
        let stop_on_limit = self.config().rate_limit_stop == RateLimitStopPolicy::StopCycle;

        let forward = {
            let mut outer = shutdown.clone();
            let trigger = trigger.clone();
            tokio::spawn(async move {
                outer.wait().await;
                trigger.trigger();
            })
        };

        let mut tasks = JoinSet::new();
        for scored in ranked {
            let text = self.picker.pick(&scored.candidate.cleaned_text);
            let task = FanOutTask {
                controller: self.controller.clone(),
                gate: self.gate.clone(),
                slots: slots.clone(),
                trigger: trigger.clone(),
                cancel: cancel.clone(),
                won: won.clone(),
                closed: closed.clone(),
                stop_on_limit,
            };
            tasks.spawn(async move {
                let attempt = task.run(&text).await;
                (scored, attempt)
            });
        }

        let mut winner = None;
        let mut tried = 0;
        let mut limited = None;

        while let Some(joined) = tasks.join_next().await {
            let (scored, attempt) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::warn!(error = %e, "Compose task failed");
                    continue;
                }
            };

            match attempt {
                Attempt::Won(composed) => {
                    tried += 1;
                    winner = Some((scored.candidate, composed));
                }
                Attempt::Discarded => {
                    tried += 1;
                    tracing::debug!(candidate = %scored.candidate.id, "Discarding late compose");
                }
                Attempt::Failed(ComposeFailure::Cancelled) | Attempt::Skipped => {}
                Attempt::Failed(e) => {
                    tried += 1;
                    tracing::warn!(candidate = %scored.candidate.id, score = scored.score, error = %e, "Candidate abandoned");
                }
                Attempt::RateLimited(reset_secs) => {
                    limited.get_or_insert(reset_secs);
                }
            }
        }
        forward.abort();

        if let Some((candidate, composed)) = winner {
            return Finish::Won {
                candidate,
                composed,
                tried,
            };
        }
        if shutdown.is_triggered() {
            return Finish::Cancelled;
        }
        match limited {
            Some(reset_secs) if stop_on_limit || tried == 0 => Finish::RateLimited { tried, reset_secs },
            _ => Finish::Missed { tried },
        }
    }

    /// Take the counted gate hit, then post and settle.
    async fn post_winner(
        &self,
        candidate: Candidate,
        composed: &Composed,
        tried: usize,
        pending: &[Candidate],
    ) -> Result<CycleReport> {
        let gate = self.gate.take().await;
        if !gate.allowed {
            // another process used the last unit since we looked
            tracing::info!(candidate = %candidate.id, reset_secs = gate.reset_secs, "Gate closed before posting");
            return Ok(CycleReport::RateLimited {
                tried,
                reset_secs: gate.reset_secs,
            });
        }

        match self.publish(composed).await {
            Ok(url) => {
                self.settle(pending)?;
                Ok(CycleReport::Posted {
                    candidate_id: candidate.id,
                    url,
                    tried,
                })
            }
            Err(error) => {
                tracing::error!(candidate = %candidate.id, error = %error, "Post failed, cycle ends without success");
                Ok(CycleReport::PostFailed {
                    candidate_id: candidate.id,
                    error,
                })
            }
        }
    }

    async fn publish(&self, composed: &Composed) -> std::result::Result<String, PostError> {
        let text = ellipsis(&composed.artifact.caption, MAX_STATUS_WITH_MEDIA_LENGTH);
        let payload = PostPayload::text(text).with_media(&composed.artifact.path);
        post_with_retry(self.poster.as_ref(), &payload, &self.post_retry).await
    }

    /// Forget the batch once it has been acted on.
    fn settle(&self, pending: &[Candidate]) -> Result<()> {
        if self.config().drain_policy == DrainPolicy::OnSuccess {
            let ids: Vec<String> = pending.iter().map(|c| c.id.clone()).collect();
            let removed = self.queue.clear_drained(&ids)?;
            tracing::debug!(removed, "Cleared settled candidates");
        }
        Ok(())
    }
}

/// One candidate's share of a concurrent walk.
///
/// `cancel` fires on a win or an outer shutdown and aborts compose attempts
/// in flight. `closed` only stops new candidates from being admitted.
struct FanOutTask {
    controller: Arc<ComposeRetryController>,
    gate: Gate,
    slots: Arc<Semaphore>,
    trigger: Arc<ShutdownTrigger>,
    cancel: Shutdown,
    won: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    stop_on_limit: bool,
}

impl FanOutTask {
    async fn run(mut self, text: &str) -> Attempt {
        let _slot = tokio::select! {
            _ = self.cancel.wait() => return Attempt::Skipped,
            slot = self.slots.clone().acquire_owned() => match slot {
                Ok(slot) => slot,
                Err(_) => return Attempt::Skipped,
            },
        };
        if self.cancel.is_triggered() || self.closed.load(Ordering::SeqCst) {
            return Attempt::Skipped;
        }

        let gate = self.gate.available().await;
        if !gate.allowed {
            if self.stop_on_limit {
                self.closed.store(true, Ordering::SeqCst);
            }
            return Attempt::RateLimited(gate.reset_secs);
        }

        match self.controller.try_compose(text, None, &self.cancel).await {
            Ok(composed) => {
                if self
                    .won
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    self.trigger.trigger();
                    Attempt::Won(composed)
                } else {
                    Attempt::Discarded
                }
            }
            Err(e) => Attempt::Failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::Composer;
    use crate::domain::{Artifact, ComposeAttemptResult, ComposeRequest, Engagement};
    use crate::post::DryRunPoster;
    use crate::ratelimit::MemoryCounterStore;
    use crate::scoring::ScoringConfig;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::collections::{HashMap, VecDeque};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Answers per text from a script; unknown texts have no source.
    #[derive(Default)]
    struct KeyedComposer {
        script: Mutex<HashMap<String, VecDeque<ComposeAttemptResult>>>,
        calls: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl KeyedComposer {
        fn on(self, text: &str, results: Vec<ComposeAttemptResult>) -> Self {
            self.script.lock().unwrap().insert(text.to_string(), results.into());
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Composer for KeyedComposer {
        async fn compose(&self, request: &ComposeRequest) -> ComposeAttemptResult {
            self.calls.lock().unwrap().push(request.text.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.script
                .lock()
                .unwrap()
                .get_mut(&request.text)
                .and_then(|results| results.pop_front())
                .unwrap_or(ComposeAttemptResult::NoSourceAvailable)
        }
    }

    fn success(text: &str) -> ComposeAttemptResult {
        ComposeAttemptResult::Success(Artifact {
            path: PathBuf::from(format!("/tmp/{}.png", text)),
            caption: format!("caption {}", text),
            source: Some(format!("https://img.example/{}.jpg", text)),
            bytes: 2048,
        })
    }

    fn candidate(id: &str, text: &str, followers: u64, favorites: u64) -> Candidate {
        let old = Utc::now() - ChronoDuration::hours(2);
        Candidate::new(id, text, Engagement::new(followers, old).with_counts(favorites, 0))
    }

    struct Harness {
        _temp: TempDir,
        queue: Arc<CandidateQueue>,
        composer: Arc<KeyedComposer>,
        poster: Arc<DryRunPoster>,
        limiter: RateLimiter,
    }

    impl Harness {
        fn new(composer: KeyedComposer) -> Self {
            let temp = TempDir::new().unwrap();
            let queue = Arc::new(CandidateQueue::open(temp.path().join("queue.jsonl")).unwrap());
            Self {
                _temp: temp,
                queue,
                composer: Arc::new(composer),
                poster: Arc::new(DryRunPoster::new()),
                limiter: RateLimiter::new(Arc::new(MemoryCounterStore::new())),
            }
        }

        fn enqueue(&self, candidates: &[Candidate]) {
            for c in candidates {
                self.queue.append(c).unwrap();
            }
        }

        fn dispatcher(&self, config: DispatchConfig) -> Dispatcher {
            let scoring = ScoringConfig {
                eligibility_multiplier: 1.0,
                ..Default::default()
            };
            let controller = ComposeRetryController::new(self.composer.clone()).with_max_attempts(3);
            Dispatcher::new(
                self.queue.clone(),
                Scorer::new(scoring),
                Arc::new(controller),
                self.limiter.clone(),
                self.poster.clone(),
                config,
            )
            .with_phrase_picker(PhrasePicker {
                tries: 0,
                ..Default::default()
            })
            .with_post_retry(PostRetryPolicy {
                attempts: 1,
                delay: Duration::ZERO,
                timeout: Duration::from_secs(5),
            })
        }
    }

    /// a: no followers (ineligible), b: score 5.0, c: score 2.0
    fn scenario() -> Vec<Candidate> {
        vec![
            candidate("a", "alpha", 0, 900),
            candidate("b", "bravo", 100, 500),
            candidate("c", "charlie", 100, 200),
        ]
    }

    #[tokio::test]
    async fn test_empty_queue_is_idle() {
        let harness = Harness::new(KeyedComposer::default());
        let report = harness.dispatcher(DispatchConfig::default()).run_cycle(&Shutdown::never()).await.unwrap();
        assert_eq!(report, CycleReport::Idle);
        assert!(harness.composer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_posts_first_candidate_that_composes() {
        let harness = Harness::new(KeyedComposer::default().on("charlie", vec![success("charlie")]));
        harness.enqueue(&scenario());

        let report = harness.dispatcher(DispatchConfig::default()).run_cycle(&Shutdown::never()).await.unwrap();

        assert_eq!(
            report,
            CycleReport::Posted {
                candidate_id: "c".into(),
                url: "dry-run://post/1".into(),
                tried: 2,
            }
        );
        // bravo abandoned after one NoSourceAvailable, alpha never attempted
        assert_eq!(harness.composer.calls(), vec!["bravo", "charlie"]);
        let posted = harness.poster.posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].text, "caption charlie");
        assert_eq!(posted[0].media, Some(PathBuf::from("/tmp/charlie.png")));
        assert!(harness.queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_missed_cycle_keeps_queue() {
        let harness = Harness::new(KeyedComposer::default());
        harness.enqueue(&scenario());

        let report = harness.dispatcher(DispatchConfig::default()).run_cycle(&Shutdown::never()).await.unwrap();

        assert_eq!(report, CycleReport::Missed { tried: 2 });
        assert!(harness.poster.posted().is_empty());
        assert_eq!(harness.queue.len().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_missed_cycle_with_drain_at_start_loses_batch() {
        let harness = Harness::new(KeyedComposer::default());
        harness.enqueue(&scenario());
        let config = DispatchConfig {
            drain_policy: DrainPolicy::AtCycleStart,
            ..Default::default()
        };

        let report = harness.dispatcher(config).run_cycle(&Shutdown::never()).await.unwrap();
        assert_eq!(report, CycleReport::Missed { tried: 2 });
        assert!(harness.queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_nothing_eligible_clears_batch() {
        let harness = Harness::new(KeyedComposer::default());
        harness.enqueue(&[candidate("a", "alpha", 0, 10), candidate("z", "zulu", 0, 10)]);

        let report = harness.dispatcher(DispatchConfig::default()).run_cycle(&Shutdown::never()).await.unwrap();
        assert_eq!(report, CycleReport::NothingEligible { pending: 2 });
        assert!(harness.queue.is_empty().unwrap());
        assert!(harness.composer.calls().is_empty());
    }

    const HOUR: Duration = Duration::from_secs(3600);

    /// Stands in for another process posting while we compose.
    struct GateFillingComposer {
        limiter: RateLimiter,
    }

    #[async_trait]
    impl Composer for GateFillingComposer {
        async fn compose(&self, request: &ComposeRequest) -> ComposeAttemptResult {
            self.limiter.hit("timeline", "global", 1, HOUR);
            success(&request.text)
        }
    }

    fn gate_count(harness: &Harness) -> u32 {
        harness
            .limiter
            .peek("timeline", "global")
            .unwrap()
            .map(|row| row.count)
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_rate_limit_stops_cycle() {
        let harness = Harness::new(KeyedComposer::default().on("bravo", vec![success("bravo")]));
        harness.enqueue(&scenario());
        assert!(harness.limiter.hit("timeline", "global", 1, HOUR).allowed);
        let config = DispatchConfig {
            rate_limit_max: 1,
            ..Default::default()
        };

        let report = harness.dispatcher(config).run_cycle(&Shutdown::never()).await.unwrap();

        assert!(matches!(report, CycleReport::RateLimited { tried: 0, .. }));
        assert!(harness.composer.calls().is_empty());
        assert!(harness.poster.posted().is_empty());
        assert_eq!(harness.queue.len().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_skip_candidate_policy() {
        let harness = Harness::new(KeyedComposer::default().on("bravo", vec![success("bravo")]));
        harness.enqueue(&scenario());
        assert!(harness.limiter.hit("timeline", "global", 1, HOUR).allowed);
        let config = DispatchConfig {
            rate_limit_max: 1,
            rate_limit_stop: RateLimitStopPolicy::SkipCandidate,
            ..Default::default()
        };

        // every candidate consults the same closed gate
        let report = harness.dispatcher(config).run_cycle(&Shutdown::never()).await.unwrap();
        assert!(matches!(report, CycleReport::RateLimited { tried: 0, .. }));
        assert!(harness.composer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_gate_counts_posts_not_candidates() {
        let harness = Harness::new(KeyedComposer::default().on("charlie", vec![success("charlie")]));
        harness.enqueue(&scenario());
        let config = DispatchConfig {
            rate_limit_max: 1,
            ..Default::default()
        };

        // bravo fails first; the single unit is still there for charlie
        let report = harness.dispatcher(config).run_cycle(&Shutdown::never()).await.unwrap();
        assert!(matches!(report, CycleReport::Posted { tried: 2, .. }));
        assert_eq!(gate_count(&harness), 1);
    }

    #[tokio::test]
    async fn test_missed_cycle_leaves_gate_untouched() {
        let harness = Harness::new(KeyedComposer::default());
        harness.enqueue(&scenario());

        let report = harness.dispatcher(DispatchConfig::default()).run_cycle(&Shutdown::never()).await.unwrap();
        assert_eq!(report, CycleReport::Missed { tried: 2 });
        assert_eq!(gate_count(&harness), 0);
    }

    #[tokio::test]
    async fn test_gate_closed_while_composing_skips_post() {
        let harness = Harness::new(KeyedComposer::default());
        harness.enqueue(&scenario());
        let filler = GateFillingComposer {
            limiter: harness.limiter.clone(),
        };
        let config = DispatchConfig {
            rate_limit_max: 1,
            ..Default::default()
        };
        let dispatcher = Dispatcher {
            controller: Arc::new(ComposeRetryController::new(Arc::new(filler))),
            ..harness.dispatcher(config)
        };

        let report = dispatcher.run_cycle(&Shutdown::never()).await.unwrap();
        assert!(matches!(report, CycleReport::RateLimited { tried: 1, .. }));
        assert!(harness.poster.posted().is_empty());
        assert_eq!(harness.queue.len().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_before_cycle_cancels() {
        let harness = Harness::new(KeyedComposer::default().on("bravo", vec![success("bravo")]));
        harness.enqueue(&scenario());
        let (trigger, shutdown) = shutdown::channel();
        trigger.trigger();

        let report = harness.dispatcher(DispatchConfig::default()).run_cycle(&shutdown).await.unwrap();
        assert_eq!(report, CycleReport::Cancelled);
        assert!(harness.poster.posted().is_empty());
        assert_eq!(harness.queue.len().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_appends_during_cycle_survive_settle() {
        let harness = Harness::new(KeyedComposer::default().on("bravo", vec![success("bravo")]));
        harness.enqueue(&scenario());
        let dispatcher = harness.dispatcher(DispatchConfig::default());

        // settle only forgets what the cycle read
        harness.queue.append(&candidate("late", "late arrival", 10, 1)).unwrap();
        let report = dispatcher.run_cycle(&Shutdown::never()).await.unwrap();
        assert!(report.is_posted());
        assert!(harness.queue.is_empty().unwrap());

        harness.queue.append(&candidate("later", "later arrival", 10, 1)).unwrap();
        dispatcher.settle(&scenario()).unwrap();
        assert_eq!(harness.queue.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fan_out_posts_exactly_once() {
        let composer = KeyedComposer {
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        }
        .on("bravo", vec![success("bravo")])
        .on("charlie", vec![success("charlie")]);
        let harness = Harness::new(composer);
        harness.enqueue(&scenario());
        let config = DispatchConfig {
            fan_out: 2,
            ..Default::default()
        };

        let report = harness.dispatcher(config).run_cycle(&Shutdown::never()).await.unwrap();

        assert!(report.is_posted());
        assert_eq!(harness.poster.posted().len(), 1);
        assert!(harness.queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_fan_out_under_single_unit_gate_posts() {
        let composer = KeyedComposer {
            delay: Some(Duration::from_millis(100)),
            ..Default::default()
        }
        .on("bravo", vec![success("bravo")])
        .on("charlie", vec![success("charlie")]);
        let harness = Harness::new(composer);
        harness.enqueue(&scenario());
        let config = DispatchConfig {
            fan_out: 2,
            rate_limit_max: 1,
            ..Default::default()
        };

        let report = harness.dispatcher(config).run_cycle(&Shutdown::never()).await.unwrap();

        assert!(report.is_posted(), "got {:?}", report);
        assert_eq!(harness.poster.posted().len(), 1);
        assert_eq!(gate_count(&harness), 1);
    }

    #[tokio::test]
    async fn test_fan_out_closed_gate_composes_nothing() {
        let harness = Harness::new(KeyedComposer::default().on("bravo", vec![success("bravo")]));
        harness.enqueue(&scenario());
        assert!(harness.limiter.hit("timeline", "global", 1, HOUR).allowed);
        let config = DispatchConfig {
            fan_out: 2,
            rate_limit_max: 1,
            ..Default::default()
        };

        let report = harness.dispatcher(config).run_cycle(&Shutdown::never()).await.unwrap();
        assert!(matches!(report, CycleReport::RateLimited { tried: 0, .. }));
        assert!(harness.composer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_all_fail_is_missed() {
        let harness = Harness::new(KeyedComposer::default());
        harness.enqueue(&scenario());
        let config = DispatchConfig {
            fan_out: 4,
            ..Default::default()
        };

        let report = harness.dispatcher(config).run_cycle(&Shutdown::never()).await.unwrap();
        assert_eq!(report, CycleReport::Missed { tried: 2 });
        assert_eq!(harness.queue.len().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_preview_ranks_without_draining() {
        let harness = Harness::new(KeyedComposer::default());
        harness.enqueue(&scenario());

        let ranked = harness.dispatcher(DispatchConfig::default()).preview().unwrap();
        let ids: Vec<&str> = ranked.iter().map(|s| s.candidate.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!((ranked[0].score - 5.0).abs() < 1e-9);
        assert!((ranked[1].score - 2.0).abs() < 1e-9);
        assert_eq!(harness.queue.len().unwrap(), 3);
    }

    #[test]
    fn test_report_display() {
        let report = CycleReport::RateLimited {
            tried: 1,
            reset_secs: 30,
        };
        assert_eq!(report.to_string(), "rate limited after 1 candidate(s), resets in 30s");
    }
}
