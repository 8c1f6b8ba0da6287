//! Submission of gated events to the scrobbling service
//!
//! Each logical unit gets its own FIFO worker per event kind, so submissions
//! for one unit go out in arrival order while different units proceed in
//! parallel. A slow scrobble retry on one unit never holds up another.
//! Workers of units that no longer exist are retired and dropped once idle.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::logical_unit::LogicalUnitId;
use super::session_tracker::{SessionEvents, TrackWithContext};
use crate::bluos::PlayingTrack;
use crate::lastfm::{
    LastFmError, MaybeUnknown, NowPlayingResponse, ScrobbleService, ScrobblesResponse,
    TrackSubmission,
};

/// Retry policy for scrobble submissions. Now-playing updates are never
/// retried.
#[derive(Debug, Clone)]
pub struct SubmitRetry {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for SubmitRetry {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SubmitResult<T> {
    Success {
        context: TrackWithContext,
        response: T,
    },
    Error {
        context: TrackWithContext,
        message: String,
        error: Arc<LastFmError>,
    },
}

impl<T> SubmitResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, SubmitResult::Success { .. })
    }

    pub fn context(&self) -> &TrackWithContext {
        match self {
            SubmitResult::Success { context, .. } | SubmitResult::Error { context, .. } => context,
        }
    }
}

pub type UpdateNowPlayingResult = SubmitResult<MaybeUnknown<NowPlayingResponse>>;
pub type SubmitScrobbleResult = SubmitResult<MaybeUnknown<ScrobblesResponse>>;

/// The two continuous result feeds
pub struct ResultFeeds {
    pub now_playing: mpsc::UnboundedReceiver<UpdateNowPlayingResult>,
    pub scrobbles: mpsc::UnboundedReceiver<SubmitScrobbleResult>,
}

struct Job {
    context: TrackWithContext,
    gated_at: DateTime<Utc>,
}

type SubmitFn<R> = Arc<dyn Fn(Job) -> BoxFuture<'static, SubmitResult<R>> + Send + Sync>;

/// A unit's worker. `jobs` is `None` once the unit is retired; the task
/// then drains what was queued and exits.
struct UnitWorker {
    jobs: Option<mpsc::UnboundedSender<Job>>,
    task: JoinHandle<()>,
}

struct UnitQueues<R> {
    submit: SubmitFn<R>,
    results: mpsc::UnboundedSender<SubmitResult<R>>,
    shutdown: CancellationToken,
    workers: HashMap<LogicalUnitId, UnitWorker>,
}

impl<R: Send + 'static> UnitQueues<R> {
    fn new(
        submit: SubmitFn<R>,
        results: mpsc::UnboundedSender<SubmitResult<R>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            submit,
            results,
            shutdown,
            workers: HashMap::new(),
        }
    }

    fn push(&mut self, context: TrackWithContext) {
        self.prune();
        let unit = context.logical_unit_id.clone();
        let job = Job {
            context,
            gated_at: Utc::now(),
        };

        if let Some(jobs) = self.workers.get(&unit).and_then(|w| w.jobs.as_ref()) {
            if jobs.send(job).is_err() {
                warn!("Submission worker for {} is gone, dropping event", unit);
            }
            return;
        }

        // A retired worker may still be draining; the new one starts after it
        let previous = self.workers.remove(&unit).map(|w| w.task);
        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(job).is_err() {
            warn!("Submission worker for {} is gone, dropping event", unit);
        }
        let task = tokio::spawn(unit_worker(
            previous,
            rx,
            self.submit.clone(),
            self.results.clone(),
            self.shutdown.clone(),
        ));
        self.workers.insert(
            unit,
            UnitWorker {
                jobs: Some(tx),
                task,
            },
        );
    }

    fn retire(&mut self, unit: &LogicalUnitId) {
        if let Some(worker) = self.workers.get_mut(unit) {
            worker.jobs = None;
        }
        self.prune();
    }

    /// Drop retired workers that have finished
    fn prune(&mut self) {
        self.workers
            .retain(|_, worker| worker.jobs.is_some() || !worker.task.is_finished());
    }

    fn worker_count(&self) -> usize {
        self.workers.len()
    }

    async fn join(self) {
        let tasks: Vec<JoinHandle<()>> = self.workers.into_values().map(|w| w.task).collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!("Submission worker ended abnormally: {}", e);
            }
        }
    }
}

async fn unit_worker<R>(
    previous: Option<JoinHandle<()>>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    submit: SubmitFn<R>,
    results: mpsc::UnboundedSender<SubmitResult<R>>,
    shutdown: CancellationToken,
) {
    if let Some(previous) = previous {
        if let Err(e) = previous.await {
            warn!("Submission worker ended abnormally: {}", e);
        }
    }
    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = submit(job) => result,
        };
        if results.send(result).is_err() {
            break;
        }
    }
}

pub struct SubmissionPipeline {
    now_playing: UnitQueues<MaybeUnknown<NowPlayingResponse>>,
    scrobbles: UnitQueues<MaybeUnknown<ScrobblesResponse>>,
}

impl SubmissionPipeline {
    pub fn new(
        service: Arc<dyn ScrobbleService>,
        session_key: String,
        retry: SubmitRetry,
        shutdown: CancellationToken,
    ) -> (Self, ResultFeeds) {
        let session_key: Arc<str> = Arc::from(session_key);
        let (now_playing_tx, now_playing_rx) = mpsc::unbounded_channel();
        let (scrobbles_tx, scrobbles_rx) = mpsc::unbounded_channel();

        let pipeline = Self {
            now_playing: UnitQueues::new(
                now_playing_submitter(service.clone(), session_key.clone()),
                now_playing_tx,
                shutdown.clone(),
            ),
            scrobbles: UnitQueues::new(
                scrobble_submitter(service, session_key, retry),
                scrobbles_tx,
                shutdown,
            ),
        };
        let feeds = ResultFeeds {
            now_playing: now_playing_rx,
            scrobbles: scrobbles_rx,
        };
        (pipeline, feeds)
    }

    pub fn submit(&mut self, events: SessionEvents) {
        if let Some(context) = events.now_playing {
            self.submit_now_playing(context);
        }
        if let Some(context) = events.scrobble {
            self.submit_scrobble(context);
        }
    }

    pub fn submit_now_playing(&mut self, context: TrackWithContext) {
        self.now_playing.push(context);
    }

    pub fn submit_scrobble(&mut self, context: TrackWithContext) {
        self.scrobbles.push(context);
    }

    /// Let `unit`'s workers finish what is queued and exit. A later event
    /// for the unit starts fresh workers that run after the old ones.
    pub fn retire(&mut self, unit: &LogicalUnitId) {
        self.now_playing.retire(unit);
        self.scrobbles.retire(unit);
    }

    /// Units with a live or draining worker
    pub fn active_units(&self) -> usize {
        self.now_playing.worker_count().max(self.scrobbles.worker_count())
    }

    /// Wait for every unit worker to finish. Workers exit once the shutdown
    /// token fires or their queues drain after this pipeline is dropped.
    pub async fn join(self) {
        tokio::join!(self.now_playing.join(), self.scrobbles.join());
    }
}

fn submission(track: &PlayingTrack, timestamp: Option<i64>) -> TrackSubmission {
    TrackSubmission {
        artist: track.artist.clone(),
        track: track.title.clone(),
        album: Some(track.album.clone()),
        duration: track.total_length.map(|l| l.round() as u64),
        timestamp,
    }
}

fn now_playing_submitter(
    service: Arc<dyn ScrobbleService>,
    session_key: Arc<str>,
) -> SubmitFn<MaybeUnknown<NowPlayingResponse>> {
    Arc::new(move |job: Job| {
        let service = service.clone();
        let session_key = session_key.clone();
        Box::pin(async move {
            let context = job.context;
            let mut track = submission(&context.track, None);
            track.duration = None;
            match service.update_now_playing(&session_key, &track).await {
                Ok(response) => {
                    info!(
                        "Updated now playing for {}: {} - {}",
                        context.unit_label(),
                        context.track.artist,
                        context.track.title
                    );
                    SubmitResult::Success { context, response }
                }
                Err(e) => SubmitResult::Error {
                    message: format!("Unable to update now playing track for {}", context.unit_label()),
                    error: Arc::new(e),
                    context,
                },
            }
        })
    })
}

fn scrobble_submitter(
    service: Arc<dyn ScrobbleService>,
    session_key: Arc<str>,
    retry: SubmitRetry,
) -> SubmitFn<MaybeUnknown<ScrobblesResponse>> {
    Arc::new(move |job: Job| {
        let service = service.clone();
        let session_key = session_key.clone();
        let retry = retry.clone();
        Box::pin(async move {
            let context = job.context;
            let started_at = job.gated_at.timestamp() - context.track.secs.max(0.0) as i64;
            let track = submission(&context.track, Some(started_at));

            let mut retries = 0;
            loop {
                match service.scrobble(&session_key, &track).await {
                    Ok(response) => {
                        info!(
                            "Scrobbled track for {}: {} - {} ({}s)",
                            context.unit_label(),
                            context.track.artist,
                            context.track.title,
                            context.track.secs
                        );
                        return SubmitResult::Success { context, response };
                    }
                    Err(e) if retries < retry.max_retries => {
                        retries += 1;
                        warn!(
                            "Scrobble for {} failed ({}), retry {}/{} in {:?}",
                            context.unit_label(),
                            e,
                            retries,
                            retry.max_retries,
                            retry.delay
                        );
                        tokio::time::sleep(retry.delay).await;
                    }
                    Err(e) => {
                        return SubmitResult::Error {
                            message: format!("Unable to scrobble track for {}", context.unit_label()),
                            error: Arc::new(e),
                            context,
                        };
                    }
                }
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluos::Player;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeService {
        calls: Mutex<Vec<(&'static str, TrackSubmission)>>,
        now_playing_failures: AtomicU32,
        scrobble_failures: AtomicU32,
        delay: Duration,
    }

    impl FakeService {
        fn record(&self, method: &'static str, track: &TrackSubmission) {
            self.calls.lock().unwrap().push((method, track.clone()));
        }

        fn calls(&self, method: &str) -> Vec<TrackSubmission> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, _)| *m == method)
                .map(|(_, t)| t.clone())
                .collect()
        }

        fn fail(counter: &AtomicU32) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl ScrobbleService for FakeService {
        async fn update_now_playing(
            &self,
            _session_key: &str,
            track: &TrackSubmission,
        ) -> Result<MaybeUnknown<NowPlayingResponse>, LastFmError> {
            self.record("nowplaying", track);
            tokio::time::sleep(self.delay).await;
            if Self::fail(&self.now_playing_failures) {
                return Err(LastFmError::HttpStatus(503));
            }
            Ok(MaybeUnknown::Unknown(json!({ "ok": track.track })))
        }

        async fn scrobble(
            &self,
            _session_key: &str,
            track: &TrackSubmission,
        ) -> Result<MaybeUnknown<ScrobblesResponse>, LastFmError> {
            self.record("scrobble", track);
            tokio::time::sleep(self.delay).await;
            if Self::fail(&self.scrobble_failures) {
                return Err(LastFmError::Api {
                    code: 16,
                    message: "Service temporarily unavailable".to_string(),
                });
            }
            Ok(MaybeUnknown::Unknown(json!({ "ok": track.track })))
        }
    }

    fn context(host: &str, title: &str, secs: f64, group: Option<&str>) -> TrackWithContext {
        let track = PlayingTrack {
            artist: "A".to_string(),
            album: "B".to_string(),
            title: title.to_string(),
            secs,
            total_length: Some(200.0),
            state: "play".to_string(),
            group_name: group.map(str::to_string),
        };
        TrackWithContext {
            logical_unit_id: LogicalUnitId::for_snapshot(&Player::new(host, 11000), &track),
            group_name: track.group_name.clone(),
            track,
        }
    }

    fn pipeline(service: Arc<FakeService>) -> (SubmissionPipeline, ResultFeeds, CancellationToken) {
        let shutdown = CancellationToken::new();
        let (pipeline, feeds) =
            SubmissionPipeline::new(service, "SESSION".to_string(), SubmitRetry::default(), shutdown.clone());
        (pipeline, feeds, shutdown)
    }

    #[tokio::test]
    async fn now_playing_success() {
        let service = Arc::new(FakeService::default());
        let (mut pipeline, mut feeds, _shutdown) = pipeline(service.clone());

        pipeline.submit_now_playing(context("10.0.0.1", "C", 10.0, None));
        let result = feeds.now_playing.recv().await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.context().track.title, "C");

        let calls = service.calls("nowplaying");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].album.as_deref(), Some("B"));
        assert_eq!(calls[0].duration, None);
        assert_eq!(calls[0].timestamp, None);
    }

    #[tokio::test(start_paused = true)]
    async fn now_playing_is_not_retried() {
        let service = Arc::new(FakeService {
            now_playing_failures: AtomicU32::new(1),
            ..Default::default()
        });
        let (mut pipeline, mut feeds, _shutdown) = pipeline(service.clone());

        pipeline.submit_now_playing(context("10.0.0.1", "C", 10.0, Some("Living Room")));
        match feeds.now_playing.recv().await.unwrap() {
            SubmitResult::Error { message, error, .. } => {
                assert_eq!(message, "Unable to update now playing track for group \"Living Room\"");
                assert!(matches!(*error, LastFmError::HttpStatus(503)));
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(service.calls("nowplaying").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scrobble_retries_until_success() {
        let service = Arc::new(FakeService {
            scrobble_failures: AtomicU32::new(3),
            ..Default::default()
        });
        let (mut pipeline, mut feeds, _shutdown) = pipeline(service.clone());

        let started = tokio::time::Instant::now();
        pipeline.submit_scrobble(context("10.0.0.1", "C", 120.0, None));
        let result = feeds.scrobbles.recv().await.unwrap();
        assert!(result.is_success());
        assert_eq!(started.elapsed(), Duration::from_secs(60));

        let calls = service.calls("scrobble");
        assert_eq!(calls.len(), 4);
        assert!(calls.iter().all(|c| c.timestamp == calls[0].timestamp));
        assert_eq!(calls[0].duration, Some(200));
    }

    #[tokio::test(start_paused = true)]
    async fn scrobble_gives_up_after_max_retries() {
        let service = Arc::new(FakeService {
            scrobble_failures: AtomicU32::new(100),
            ..Default::default()
        });
        let (mut pipeline, mut feeds, _shutdown) = pipeline(service.clone());

        pipeline.submit_scrobble(context("10.0.0.1", "C", 120.0, None));
        match feeds.scrobbles.recv().await.unwrap() {
            SubmitResult::Error { message, .. } => {
                assert_eq!(message, "Unable to scrobble track for logical unit player:10.0.0.1:11000");
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(service.calls("scrobble").len(), 6);
    }

    #[tokio::test]
    async fn scrobble_timestamp_is_track_start() {
        let service = Arc::new(FakeService::default());
        let (mut pipeline, mut feeds, _shutdown) = pipeline(service.clone());

        let before = Utc::now().timestamp();
        pipeline.submit_scrobble(context("10.0.0.1", "C", 120.0, None));
        feeds.scrobbles.recv().await.unwrap();
        let after = Utc::now().timestamp();

        let timestamp = service.calls("scrobble")[0].timestamp.unwrap();
        assert!(timestamp >= before - 120 && timestamp <= after - 120);
    }

    #[tokio::test(start_paused = true)]
    async fn unit_order_is_preserved_and_units_run_in_parallel() {
        let service = Arc::new(FakeService {
            delay: Duration::from_secs(1),
            ..Default::default()
        });
        let (mut pipeline, mut feeds, _shutdown) = pipeline(service.clone());

        let started = tokio::time::Instant::now();
        pipeline.submit_now_playing(context("10.0.0.1", "First", 1.0, None));
        pipeline.submit_now_playing(context("10.0.0.1", "Second", 1.0, None));
        pipeline.submit_now_playing(context("10.0.0.2", "Other", 1.0, None));

        let mut unit_one = Vec::new();
        for _ in 0..3 {
            let result = feeds.now_playing.recv().await.unwrap();
            if result.context().logical_unit_id.as_str() == "player:10.0.0.1:11000" {
                unit_one.push(result.context().track.title.clone());
            }
        }
        assert_eq!(unit_one, vec!["First", "Second"]);
        // Two sequential calls on unit one, the other unit alongside
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_abandons_pending_retries() {
        let service = Arc::new(FakeService {
            scrobble_failures: AtomicU32::new(100),
            ..Default::default()
        });
        let (mut pipeline, mut feeds, shutdown) = pipeline(service.clone());

        pipeline.submit_scrobble(context("10.0.0.1", "C", 120.0, None));
        tokio::time::sleep(Duration::from_secs(30)).await;
        shutdown.cancel();
        pipeline.join().await;

        assert_eq!(service.calls("scrobble").len(), 2);
        assert!(feeds.scrobbles.recv().await.is_none());
    }

    #[tokio::test]
    async fn session_events_fan_out() {
        let service = Arc::new(FakeService::default());
        let (mut pipeline, mut feeds, _shutdown) = pipeline(service.clone());

        let c = context("10.0.0.1", "C", 150.0, None);
        pipeline.submit(SessionEvents {
            now_playing: Some(c.clone()),
            scrobble: Some(c),
        });
        assert!(feeds.now_playing.recv().await.unwrap().is_success());
        assert!(feeds.scrobbles.recv().await.unwrap().is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn retired_unit_keeps_order_across_workers() {
        let service = Arc::new(FakeService {
            delay: Duration::from_secs(1),
            ..Default::default()
        });
        let (mut pipeline, mut feeds, _shutdown) = pipeline(service.clone());
        let first = context("10.0.0.1", "First", 1.0, None);
        let unit = first.logical_unit_id.clone();

        let started = tokio::time::Instant::now();
        pipeline.submit_now_playing(first);
        pipeline.retire(&unit);
        pipeline.submit_now_playing(context("10.0.0.1", "Second", 1.0, None));

        let a = feeds.now_playing.recv().await.unwrap();
        let b = feeds.now_playing.recv().await.unwrap();
        assert_eq!(a.context().track.title, "First");
        assert_eq!(b.context().track.title, "Second");
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn retired_idle_workers_are_dropped() {
        let service = Arc::new(FakeService::default());
        let (mut pipeline, mut feeds, _shutdown) = pipeline(service.clone());
        let c = context("10.0.0.1", "C", 150.0, None);
        let unit = c.logical_unit_id.clone();

        pipeline.submit(SessionEvents {
            now_playing: Some(c.clone()),
            scrobble: Some(c),
        });
        feeds.now_playing.recv().await.unwrap();
        feeds.scrobbles.recv().await.unwrap();
        assert_eq!(pipeline.active_units(), 1);

        for _ in 0..100 {
            pipeline.retire(&unit);
            if pipeline.active_units() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(pipeline.active_units(), 0);

        // The unit comes back with fresh workers
        pipeline.submit_now_playing(context("10.0.0.1", "D", 1.0, None));
        assert_eq!(
            feeds.now_playing.recv().await.unwrap().context().track.title,
            "D"
        );
        assert_eq!(pipeline.active_units(), 1);
    }
}
