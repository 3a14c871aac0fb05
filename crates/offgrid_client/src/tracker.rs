//! Bounded waits on server-side jobs that report progress snapshots.
//!
//! The tracker only cares whether a snapshot is terminal; it does not check
//! that the server moved between phases in any particular order.

use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::Result;
use crate::messages::{DownloadProgress, DownloadStatus, LoadingPhase, LoadingProgress};

/// Coarse view of a snapshot's phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    /// No job known; nothing to wait for.
    Idle,
    Pending,
    Succeeded,
    Failed,
}

pub trait Phased {
    fn status(&self) -> PhaseStatus;
}

impl Phased for LoadingProgress {
    fn status(&self) -> PhaseStatus {
        match self.phase {
            LoadingPhase::Idle => PhaseStatus::Idle,
            LoadingPhase::Ready => PhaseStatus::Succeeded,
            LoadingPhase::Failed => PhaseStatus::Failed,
            _ => PhaseStatus::Pending,
        }
    }
}

impl Phased for DownloadProgress {
    fn status(&self) -> PhaseStatus {
        match self.status {
            DownloadStatus::Complete => PhaseStatus::Succeeded,
            DownloadStatus::Failed => PhaseStatus::Failed,
            _ => PhaseStatus::Pending,
        }
    }
}

/// A job the server has not registered yet is still pending.
impl<S: Phased> Phased for Option<S> {
    fn status(&self) -> PhaseStatus {
        self.as_ref().map_or(PhaseStatus::Pending, Phased::status)
    }
}

/// Something that can be asked for the current snapshot.
pub trait ProgressSource {
    type Snapshot: Phased;

    fn poll(&mut self) -> Result<Self::Snapshot>;
}

impl<F, S> ProgressSource for F
where
    F: FnMut() -> Result<S>,
    S: Phased,
{
    type Snapshot = S;

    fn poll(&mut self) -> Result<S> {
        self()
    }
}

/// How a bounded wait ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome<S> {
    /// Success terminal, or idle with nothing to wait for.
    Ready(S),
    Failed(S),
    /// Budget spent while the job was still transient.
    TimedOut(Option<S>),
    /// A progress feed closed before reporting a terminal phase.
    Ended(Option<S>),
}

impl<S> WaitOutcome<S> {
    pub fn is_success(&self) -> bool {
        matches!(self, WaitOutcome::Ready(_))
    }

    pub fn snapshot(&self) -> Option<&S> {
        match self {
            WaitOutcome::Ready(s) | WaitOutcome::Failed(s) => Some(s),
            WaitOutcome::TimedOut(s) | WaitOutcome::Ended(s) => s.as_ref(),
        }
    }
}

/// Polls at a fixed cadence until a terminal phase or the budget runs out.
#[derive(Debug, Clone, Copy)]
pub struct Tracker {
    poll_interval: Duration,
}

impl Tracker {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Poll `source` until it reports a terminal or idle phase, or `budget` elapses.
    pub fn wait<P: ProgressSource>(
        &self,
        source: &mut P,
        budget: Duration,
        on_snapshot: impl FnMut(&P::Snapshot),
    ) -> Result<WaitOutcome<P::Snapshot>> {
        self.wait_until(source, deadline_after(budget), on_snapshot)
    }

    /// [`wait`](Self::wait) against a fixed point in time.
    ///
    /// `on_snapshot` sees every snapshot, terminal or not. Transport errors
    /// (already retried by the engine) end the wait as `Err`, unless the
    /// deadline has already passed, in which case the wait timed out.
    pub fn wait_until<P: ProgressSource>(
        &self,
        source: &mut P,
        deadline: Instant,
        mut on_snapshot: impl FnMut(&P::Snapshot),
    ) -> Result<WaitOutcome<P::Snapshot>> {
        let mut polls = 0u32;
        let mut last = None;
        loop {
            let snapshot = match source.poll() {
                Ok(snapshot) => snapshot,
                Err(err) if Instant::now() >= deadline => {
                    debug!(polls, error = %err, "poll failed after the wait budget ran out");
                    return Ok(WaitOutcome::TimedOut(last));
                }
                Err(err) => return Err(err),
            };
            polls += 1;
            on_snapshot(&snapshot);
            match snapshot.status() {
                PhaseStatus::Succeeded | PhaseStatus::Idle => return Ok(WaitOutcome::Ready(snapshot)),
                PhaseStatus::Failed => return Ok(WaitOutcome::Failed(snapshot)),
                PhaseStatus::Pending => {}
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(polls, "wait budget exhausted");
                return Ok(WaitOutcome::TimedOut(Some(snapshot)));
            }
            last = Some(snapshot);
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    /// Consume a live feed of snapshots until a terminal phase, the feed
    /// closing, or `budget` elapsing.
    pub fn follow<S: Phased>(
        &self,
        feed: impl IntoIterator<Item = Result<S>>,
        budget: Duration,
        on_snapshot: impl FnMut(&S),
    ) -> Result<WaitOutcome<S>> {
        self.follow_until(feed, deadline_after(budget), on_snapshot)
    }

    /// [`follow`](Self::follow) against a fixed point in time.
    ///
    /// The deadline is checked as snapshots arrive. A feed that stalls must be
    /// cut off by its source; the read error it then yields after the deadline
    /// counts as a timeout.
    pub fn follow_until<S: Phased>(
        &self,
        feed: impl IntoIterator<Item = Result<S>>,
        deadline: Instant,
        mut on_snapshot: impl FnMut(&S),
    ) -> Result<WaitOutcome<S>> {
        let mut last = None;
        for snapshot in feed {
            let snapshot = match snapshot {
                Ok(snapshot) => snapshot,
                Err(err) if Instant::now() >= deadline => {
                    debug!(error = %err, "progress feed failed after the wait budget ran out");
                    return Ok(WaitOutcome::TimedOut(last));
                }
                Err(err) => return Err(err),
            };
            on_snapshot(&snapshot);
            match snapshot.status() {
                PhaseStatus::Succeeded | PhaseStatus::Idle => return Ok(WaitOutcome::Ready(snapshot)),
                PhaseStatus::Failed => return Ok(WaitOutcome::Failed(snapshot)),
                PhaseStatus::Pending => {}
            }
            last = Some(snapshot);
            if Instant::now() >= deadline {
                return Ok(WaitOutcome::TimedOut(last));
            }
        }
        Ok(WaitOutcome::Ended(last))
    }
}

/// `budget` from now, saturating for budgets too large to represent.
pub(crate) fn deadline_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn loading(phase: LoadingPhase, progress: u8) -> LoadingProgress {
        LoadingProgress {
            model_id: "m1".into(),
            phase,
            progress,
            ..LoadingProgress::default()
        }
    }

    fn scripted(phases: Vec<LoadingPhase>) -> impl FnMut() -> Result<LoadingProgress> {
        let mut phases = phases.into_iter();
        let mut last = LoadingPhase::Loading;
        move || {
            if let Some(p) = phases.next() {
                last = p;
            }
            Ok(loading(last, 50))
        }
    }

    fn tracker() -> Tracker {
        Tracker::new(Duration::from_millis(5))
    }

    #[test]
    fn idle_on_first_poll_is_immediate_success() {
        let mut polls = 0;
        let mut source = scripted(vec![LoadingPhase::Idle]);
        let outcome = tracker()
            .wait(&mut source, Duration::from_secs(5), |_| polls += 1)
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(polls, 1);
    }

    #[test]
    fn ready_after_transient_phases_is_success() {
        let mut seen = Vec::new();
        let mut source = scripted(vec![
            LoadingPhase::Unloading,
            LoadingPhase::Starting,
            LoadingPhase::Loading,
            LoadingPhase::Warmup,
            LoadingPhase::Ready,
        ]);
        let outcome = tracker()
            .wait(&mut source, Duration::from_secs(5), |p| seen.push(p.phase))
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(seen.len(), 5);
        assert_eq!(seen.last(), Some(&LoadingPhase::Ready));
    }

    #[test]
    fn failed_phase_is_failure() {
        let mut source = scripted(vec![LoadingPhase::Loading, LoadingPhase::Failed]);
        let outcome = tracker()
            .wait(&mut source, Duration::from_secs(5), |_| {})
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::Failed(ref p) if p.phase == LoadingPhase::Failed));
        assert!(!outcome.is_success());
    }

    #[test]
    fn endless_loading_times_out_within_budget() {
        let mut source = scripted(vec![]);
        let budget = Duration::from_millis(60);
        let start = Instant::now();
        let outcome = tracker().wait(&mut source, budget, |_| {}).unwrap();
        assert!(matches!(outcome, WaitOutcome::TimedOut(Some(_))));
        assert!(!outcome.is_success());
        assert!(start.elapsed() < budget + Duration::from_millis(200));
    }

    #[test]
    fn transport_error_ends_the_wait() {
        let mut source = || -> Result<LoadingProgress> { Err(Error::network("refused")) };
        let err = tracker()
            .wait(&mut source, Duration::from_secs(1), |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::Network { .. }));
    }

    #[test]
    fn missing_download_entry_keeps_waiting() {
        let mut rows = vec![
            None,
            Some(DownloadProgress {
                filename: "m.gguf".into(),
                percent: 40.0,
                ..DownloadProgress::default()
            }),
            Some(DownloadProgress {
                filename: "m.gguf".into(),
                percent: 100.0,
                status: DownloadStatus::Complete,
                ..DownloadProgress::default()
            }),
        ]
        .into_iter();
        let mut source = move || Ok(rows.next().flatten());
        let mut calls = 0;
        let outcome = tracker()
            .wait(&mut source, Duration::from_secs(5), |_| calls += 1)
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(calls, 3);
    }

    #[test]
    fn follow_stops_at_terminal_or_reports_early_end() {
        let feed = vec![
            Ok(loading(LoadingPhase::Starting, 5)),
            Ok(loading(LoadingPhase::Loading, 60)),
            Ok(loading(LoadingPhase::Ready, 100)),
            Ok(loading(LoadingPhase::Loading, 0)),
        ];
        let mut seen = 0;
        let outcome = tracker()
            .follow(feed, Duration::from_secs(5), |_| seen += 1)
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(seen, 3);

        let feed = vec![Ok(loading(LoadingPhase::Loading, 60))];
        let outcome = tracker().follow(feed, Duration::from_secs(5), |_| {}).unwrap();
        assert!(matches!(outcome, WaitOutcome::Ended(Some(ref p)) if p.progress == 60));
    }

    #[test]
    fn poll_failing_past_the_deadline_is_a_timeout() {
        let mut first = true;
        let mut source = move || -> Result<LoadingProgress> {
            if std::mem::take(&mut first) {
                return Ok(loading(LoadingPhase::Loading, 10));
            }
            thread::sleep(Duration::from_millis(40));
            Err(Error::network("request timed out"))
        };
        let outcome = tracker()
            .wait(&mut source, Duration::from_millis(20), |_| {})
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::TimedOut(Some(ref p)) if p.progress == 10));
    }

    #[test]
    fn stalled_feed_cut_off_at_the_deadline_is_a_timeout() {
        let budget = Duration::from_millis(30);
        let deadline = deadline_after(budget);
        let feed = vec![Ok(loading(LoadingPhase::Loading, 25)), Err(Error::network("stalled"))]
            .into_iter()
            .inspect(|item| {
                if item.is_err() {
                    thread::sleep(budget);
                }
            });
        let outcome = tracker().follow_until(feed, deadline, |_| {}).unwrap();
        assert!(matches!(outcome, WaitOutcome::TimedOut(Some(ref p)) if p.progress == 25));

        let feed = vec![Err::<LoadingProgress, _>(Error::network("reset"))];
        let err = tracker()
            .follow(feed, Duration::from_secs(5), |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::Network { .. }));
    }
}
