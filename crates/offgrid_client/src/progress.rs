//! Server-side jobs tracked through [`Tracker`]: model loading, model
//! downloads, and the trigger-then-wait warm-up.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::engine::RequestEngine;
use crate::error::{Error, Result};
use crate::messages::{
    CacheStats, ChatRequest, DownloadProgress, DownloadRequest, DownloadTable, LoadingProgress,
};
use crate::operation::Operation;
use crate::tracker::{deadline_after, PhaseStatus, Phased, Tracker, WaitOutcome};

const LOADING_PROGRESS: &str = "/v1/loading/progress";
const LOADING_STREAM: &str = "/v1/loading/progress/stream";
const DOWNLOAD: &str = "/v1/models/download";
const DOWNLOAD_PROGRESS: &str = "/v1/models/download/progress";
const CACHE_STATS: &str = "/v1/cache/stats";
const CHAT_COMPLETIONS: &str = "/v1/chat/completions";

pub fn loading_progress(engine: &RequestEngine) -> Result<LoadingProgress> {
    engine.execute(&Operation::get(LOADING_PROGRESS))?.decode()
}

/// Poll loading progress until the model is ready, loading failed, or `budget` runs out.
pub fn wait_for_ready(
    engine: &RequestEngine,
    tracker: &Tracker,
    budget: Duration,
    on_progress: impl FnMut(&LoadingProgress),
) -> Result<WaitOutcome<LoadingProgress>> {
    ready_before(engine, tracker, deadline_after(budget), on_progress)
}

/// Each poll is itself cut off at `deadline`, so a hung request cannot
/// outlast the wait.
fn ready_before(
    engine: &RequestEngine,
    tracker: &Tracker,
    deadline: Instant,
    on_progress: impl FnMut(&LoadingProgress),
) -> Result<WaitOutcome<LoadingProgress>> {
    let poll = Operation::get(LOADING_PROGRESS).deadline(deadline);
    let mut source = || -> Result<LoadingProgress> { engine.execute(&poll)?.decode() };
    tracker.wait_until(&mut source, deadline, on_progress)
}

/// Follow the server's progress event stream. If the stream is unavailable
/// or closes before a terminal phase, the rest of the budget is spent polling.
///
/// The stream request carries the wait's deadline, so a server that stops
/// sending events mid-stream is cut off when the budget runs out.
pub fn watch_loading(
    engine: &RequestEngine,
    tracker: &Tracker,
    budget: Duration,
    mut on_progress: impl FnMut(&LoadingProgress),
) -> Result<WaitOutcome<LoadingProgress>> {
    let deadline = deadline_after(budget);
    let open = Operation::get(LOADING_STREAM).deadline(deadline);
    let events = match engine.execute_stream(&open) {
        Ok(events) => events,
        Err(Error::Client { status: 404, .. }) => {
            debug!("no progress stream on this server, polling instead");
            return ready_before(engine, tracker, deadline, on_progress);
        }
        Err(err) if Instant::now() >= deadline => {
            debug!(error = %err, "progress stream did not open within the wait budget");
            return Ok(WaitOutcome::TimedOut(None));
        }
        Err(err) => return Err(err),
    };
    let feed = events.filter_map(|event| match event {
        Ok(value) => match serde_json::from_value::<LoadingProgress>(value) {
            Ok(progress) => Some(Ok(progress)),
            Err(err) => {
                debug!(error = %err, "ignoring unrecognized progress event");
                None
            }
        },
        Err(err) => Some(Err(err)),
    });
    match tracker.follow_until(feed, deadline, &mut on_progress)? {
        WaitOutcome::Ended(last) if Instant::now() >= deadline => Ok(WaitOutcome::TimedOut(last)),
        WaitOutcome::Ended(_) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            debug!(
                remaining_ms = remaining.as_millis() as u64,
                "progress stream closed early, polling"
            );
            ready_before(engine, tracker, deadline, on_progress)
        }
        outcome => Ok(outcome),
    }
}

pub fn download_progress(engine: &RequestEngine) -> Result<DownloadTable> {
    engine.execute(&Operation::get(DOWNLOAD_PROGRESS))?.decode()
}

/// Start a download and wait for its row in the progress table to finish.
///
/// `on_progress` runs on every poll that finds the row. A row that is not
/// there yet counts as still downloading.
pub fn download_model(
    engine: &RequestEngine,
    tracker: &Tracker,
    repository: &str,
    file_name: &str,
    budget: Duration,
    mut on_progress: impl FnMut(&DownloadProgress),
) -> Result<WaitOutcome<DownloadProgress>> {
    let deadline = deadline_after(budget);
    let start = Operation::post(DOWNLOAD)
        .json(&DownloadRequest {
            repository,
            file_name,
        })?
        .deadline(deadline);
    engine.execute(&start)?;
    info!(repository, file_name, "model download started");

    let poll = Operation::get(DOWNLOAD_PROGRESS).deadline(deadline);
    let mut source = || -> Result<Option<DownloadProgress>> {
        let mut table: DownloadTable = engine.execute(&poll)?.decode()?;
        Ok(table.remove(file_name).or_else(|| {
            table
                .into_values()
                .find(|row| row.filename == file_name)
        }))
    };
    let outcome = tracker.wait_until(&mut source, deadline, |row: &Option<DownloadProgress>| {
        if let Some(row) = row {
            on_progress(row);
        }
    })?;
    if let WaitOutcome::Failed(Some(row)) = &outcome {
        warn!(
            file_name,
            error = row.error.as_deref().unwrap_or("unknown"),
            "model download failed"
        );
    }
    Ok(match outcome {
        WaitOutcome::Ready(Some(row)) => WaitOutcome::Ready(row),
        WaitOutcome::Failed(Some(row)) => WaitOutcome::Failed(row),
        // An absent row is never terminal.
        WaitOutcome::Ready(None) | WaitOutcome::Failed(None) => WaitOutcome::Ended(None),
        WaitOutcome::TimedOut(row) => WaitOutcome::TimedOut(row.flatten()),
        WaitOutcome::Ended(row) => WaitOutcome::Ended(row.flatten()),
    })
}

/// Knobs for [`warm_model`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmOptions {
    /// Poll cache stats after the trigger until the model shows up.
    pub wait: bool,
    pub trigger_backoff: Duration,
    pub max_trigger_attempts: u32,
}

impl Default for WarmOptions {
    fn default() -> Self {
        Self {
            wait: true,
            trigger_backoff: Duration::from_secs(2),
            max_trigger_attempts: 5,
        }
    }
}

#[derive(Debug)]
pub enum WarmOutcome {
    Warmed,
    Failed(Error),
    TimedOut,
}

impl WarmOutcome {
    pub fn is_warm(&self) -> bool {
        matches!(self, WarmOutcome::Warmed)
    }
}

struct Cached(bool);

impl Phased for Cached {
    fn status(&self) -> PhaseStatus {
        if self.0 {
            PhaseStatus::Succeeded
        } else {
            PhaseStatus::Pending
        }
    }
}

/// Force `model` to load with a one-token completion, then wait until the
/// server lists it as cached.
///
/// Every request, pause and poll comes out of one `budget` measured from the
/// first trigger; a 4xx on the trigger ends the flow at once.
pub fn warm_model(
    engine: &RequestEngine,
    tracker: &Tracker,
    model: &str,
    budget: Duration,
    options: &WarmOptions,
) -> WarmOutcome {
    let start = Instant::now();
    let deadline = deadline_after(budget);
    let request = ChatRequest::new("hi").model(model).max_tokens(1).temperature(0.0);
    let trigger = match Operation::post(CHAT_COMPLETIONS).json(&request) {
        Ok(op) => op.without_retry().deadline(deadline),
        Err(err) => return WarmOutcome::Failed(err),
    };

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match engine.execute(&trigger) {
            Ok(_) => {
                debug!(model, attempt, "warm-up trigger accepted");
                break;
            }
            Err(err) if !err.is_retryable() => return WarmOutcome::Failed(err),
            Err(err) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    debug!(model, attempt, error = %err, "warm-up budget spent on the trigger");
                    return WarmOutcome::TimedOut;
                }
                if attempt >= options.max_trigger_attempts.max(1) {
                    warn!(model, attempt, error = %err, "giving up on warm-up trigger");
                    return WarmOutcome::Failed(err);
                }
                let pause = options.trigger_backoff.min(remaining);
                warn!(
                    model,
                    attempt,
                    remaining_ms = remaining.as_millis() as u64,
                    delay_ms = pause.as_millis() as u64,
                    error = %err,
                    "warm-up trigger failed, model may still be loading"
                );
                engine.pause(pause);
                if Instant::now() >= deadline {
                    return WarmOutcome::TimedOut;
                }
            }
        }
    }

    if !options.wait {
        return WarmOutcome::Warmed;
    }
    let poll = Operation::get(CACHE_STATS).deadline(deadline);
    let mut source = || -> Result<Cached> {
        let stats: CacheStats = engine.execute(&poll)?.decode()?;
        Ok(Cached(stats.has_model(model)))
    };
    match tracker.wait_until(&mut source, deadline, |_| {}) {
        Ok(WaitOutcome::Ready(_)) => {
            info!(model, elapsed_ms = start.elapsed().as_millis() as u64, "model warm");
            WarmOutcome::Warmed
        }
        Ok(_) => WarmOutcome::TimedOut,
        Err(err) => WarmOutcome::Failed(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::messages::{DownloadStatus, LoadingPhase};
    use crate::operation::Method;
    use crate::transport::testing::{Reply, ScriptedTransport};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    fn engine_with(transport: &Arc<ScriptedTransport>) -> (RequestEngine, Arc<Mutex<Vec<Duration>>>) {
        let pauses = Arc::new(Mutex::new(Vec::new()));
        let recorded = pauses.clone();
        let config = ClientConfig::new("127.0.0.1:11611").retries(1, Duration::ZERO);
        let engine = RequestEngine::with_transport(&config, transport.clone()).with_sleep(move |d| {
            recorded.lock().unwrap().push(d);
            std::thread::sleep(d);
        });
        (engine, pauses)
    }

    fn tracker() -> Tracker {
        Tracker::new(Duration::from_millis(5))
    }

    fn body(request: &crate::transport::HttpRequest) -> Value {
        serde_json::from_slice(request.body.as_deref().unwrap()).unwrap()
    }

    #[test]
    fn wait_for_ready_reports_each_snapshot() {
        let transport = ScriptedTransport::new(vec![
            Reply::ok(r#"{"model_id":"m1","phase":"loading","progress":30}"#),
            Reply::ok(r#"{"model_id":"m1","phase":"warmup","progress":90}"#),
            Reply::ok(r#"{"model_id":"m1","phase":"ready","progress":100}"#),
        ]);
        let (engine, _) = engine_with(&transport);
        let mut seen = Vec::new();
        let outcome = wait_for_ready(&engine, &tracker(), Duration::from_secs(5), |p| {
            seen.push(p.progress)
        })
        .unwrap();
        assert!(outcome.is_success());
        assert_eq!(seen, vec![30, 90, 100]);
        assert!(transport
            .requests()
            .iter()
            .all(|r| r.url.ends_with("/v1/loading/progress")));
    }

    #[test]
    fn watch_loading_follows_stream_then_falls_back_to_polling() {
        let transport = ScriptedTransport::new(vec![
            Reply::ok(
                "data: {\"model_id\":\"m1\",\"phase\":\"starting\",\"progress\":5}\n\n\
                 data: {\"model_id\":\"m1\",\"phase\":\"loading\",\"progress\":60}\n\n",
            ),
            Reply::ok(r#"{"model_id":"m1","phase":"ready","progress":100}"#),
        ]);
        let (engine, _) = engine_with(&transport);
        let mut seen = Vec::new();
        let outcome = watch_loading(&engine, &tracker(), Duration::from_secs(5), |p| {
            seen.push(p.phase)
        })
        .unwrap();
        assert!(outcome.is_success());
        assert_eq!(
            seen,
            vec![LoadingPhase::Starting, LoadingPhase::Loading, LoadingPhase::Ready]
        );
        let requests = transport.requests();
        assert_eq!(requests[0].header("accept"), Some("text/event-stream"));
        assert!(requests[1].url.ends_with("/v1/loading/progress"));
        assert!(requests.iter().all(|r| r.timeout <= Duration::from_secs(5)));
    }

    #[test]
    fn watch_loading_cut_off_mid_stream_is_a_timeout() {
        struct Stalled {
            sent: bool,
            stall: Duration,
        }

        impl std::io::Read for Stalled {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if !std::mem::replace(&mut self.sent, true) {
                    let frame = b"data: {\"model_id\":\"m1\",\"phase\":\"loading\",\"progress\":40}\n\n";
                    buf[..frame.len()].copy_from_slice(frame);
                    return Ok(frame.len());
                }
                // Stand-in for the transport's timeout firing on a silent body.
                std::thread::sleep(self.stall);
                Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"))
            }
        }

        let budget = Duration::from_millis(50);
        let transport = ScriptedTransport::new(vec![Reply::stream(Stalled {
            sent: false,
            stall: budget,
        })]);
        let (engine, _) = engine_with(&transport);
        let started = Instant::now();
        let outcome = watch_loading(&engine, &tracker(), budget, |_| {}).unwrap();
        assert!(
            matches!(outcome, WaitOutcome::TimedOut(Some(ref p)) if p.progress == 40),
            "{outcome:?}"
        );
        assert!(started.elapsed() < budget + Duration::from_millis(500));
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].timeout <= budget);
    }

    #[test]
    fn download_reports_progress_while_row_exists() {
        let transport = ScriptedTransport::new(vec![
            Reply::ok(r#"{"status":"started"}"#),
            Reply::ok("{}"),
            Reply::ok(
                r#"{"m.gguf":{"file_name":"m.gguf","percent":50.0,"bytes_done":50,"bytes_total":100,"status":"downloading"}}"#,
            ),
            Reply::ok(
                r#"{"m.gguf":{"file_name":"m.gguf","percent":100.0,"bytes_done":100,"bytes_total":100,"status":"complete"}}"#,
            ),
        ]);
        let (engine, _) = engine_with(&transport);
        let mut calls = Vec::new();
        let outcome = download_model(
            &engine,
            &tracker(),
            "org/repo",
            "m.gguf",
            Duration::from_secs(5),
            |row| calls.push((row.percent, row.bytes_done, row.bytes_total)),
        )
        .unwrap();
        assert!(outcome.is_success());
        assert_eq!(calls, vec![(50.0, 50, 100), (100.0, 100, 100)]);

        let requests = transport.requests();
        let start = &requests[0];
        assert_eq!(start.method, Method::Post);
        assert_eq!(
            body(start),
            json!({"repository": "org/repo", "file_name": "m.gguf"})
        );
    }

    #[test]
    fn download_failure_carries_server_error() {
        let transport = ScriptedTransport::new(vec![
            Reply::ok("{}"),
            Reply::ok(r#"{"m.gguf":{"status":"failed","error":"disk full"}}"#),
        ]);
        let (engine, _) = engine_with(&transport);
        let outcome = download_model(
            &engine,
            &tracker(),
            "org/repo",
            "m.gguf",
            Duration::from_secs(5),
            |_| {},
        )
        .unwrap();
        match outcome {
            WaitOutcome::Failed(row) => {
                assert_eq!(row.status, DownloadStatus::Failed);
                assert_eq!(row.error.as_deref(), Some("disk full"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn warm_retries_trigger_then_waits_for_cache() {
        let transport = ScriptedTransport::new(vec![
            Reply::network("connection reset"),
            Reply::status(503, r#"{"error":{"message":"model loading"}}"#),
            Reply::ok(r#"{"choices":[{"message":{"role":"assistant","content":"h"}}]}"#),
            Reply::ok(r#"{"loaded_models":[]}"#),
            Reply::ok(r#"{"model_cache":{"cached_models":[{"model_id":"llama-3b-q4"}]}}"#),
        ]);
        let (engine, pauses) = engine_with(&transport);
        let budget = Duration::from_secs(2);
        let options = WarmOptions {
            trigger_backoff: Duration::from_millis(20),
            ..WarmOptions::default()
        };
        let started = Instant::now();
        let outcome = warm_model(&engine, &tracker(), "llama-3b", budget, &options);
        assert!(outcome.is_warm(), "{outcome:?}");
        assert!(started.elapsed() <= budget);

        let pauses = pauses.lock().unwrap().clone();
        assert_eq!(pauses, vec![Duration::from_millis(20); 2]);

        let requests = transport.requests();
        assert_eq!(requests.len(), 5);
        let trigger = body(&requests[0]);
        assert_eq!(trigger["model"], "llama-3b");
        assert_eq!(trigger["max_tokens"], 1);
        assert_eq!(trigger["temperature"], 0.0);
        assert_eq!(trigger["stream"], false);
        assert!(requests[3].url.ends_with("/v1/cache/stats"));
        // Trigger and cache polls never wait longer than the warm-up budget.
        assert!(requests.iter().all(|r| r.timeout <= budget));
    }

    #[test]
    fn warm_stops_on_client_error() {
        let transport = ScriptedTransport::new(vec![Reply::status(
            404,
            r#"{"error":{"message":"model not found"}}"#,
        )]);
        let (engine, pauses) = engine_with(&transport);
        let outcome = warm_model(
            &engine,
            &tracker(),
            "missing",
            Duration::from_secs(5),
            &WarmOptions::default(),
        );
        assert!(matches!(outcome, WarmOutcome::Failed(Error::Client { status: 404, .. })));
        assert_eq!(transport.requests().len(), 1);
        assert!(pauses.lock().unwrap().is_empty());
    }

    #[test]
    fn warm_budget_shrinks_and_is_never_reset() {
        // An empty script answers every request with a network error.
        let transport = ScriptedTransport::new(vec![]);
        let (engine, pauses) = engine_with(&transport);
        let budget = Duration::from_millis(100);
        let options = WarmOptions {
            trigger_backoff: Duration::from_millis(40),
            max_trigger_attempts: 50,
            ..WarmOptions::default()
        };
        let started = Instant::now();
        let outcome = warm_model(&engine, &tracker(), "m1", budget, &options);
        assert!(matches!(outcome, WarmOutcome::TimedOut));

        let pauses = pauses.lock().unwrap().clone();
        assert!(pauses.len() >= 2);
        assert!(pauses.iter().sum::<Duration>() <= budget);
        assert!(pauses.last().unwrap() <= &Duration::from_millis(40));
        assert!(started.elapsed() < budget + Duration::from_millis(500));
    }

    #[test]
    fn warm_trigger_attempts_are_capped() {
        let transport = ScriptedTransport::new(vec![]);
        let (engine, _) = engine_with(&transport);
        let options = WarmOptions {
            trigger_backoff: Duration::from_millis(1),
            max_trigger_attempts: 3,
            ..WarmOptions::default()
        };
        let outcome = warm_model(&engine, &tracker(), "m1", Duration::from_secs(10), &options);
        assert!(matches!(outcome, WarmOutcome::Failed(Error::Network { .. })));
        assert_eq!(transport.requests().len(), 3);
    }
}
