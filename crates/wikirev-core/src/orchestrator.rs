//! Batch orchestrator: one pipeline per article (or per latest-revision
//! batch), driven by a rayon worker pool and the shared rate limiter.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::cancel::CancelFlag;
use crate::config::{ConfigError, FetchConfig};
use crate::error::FetchError;
use crate::limiter::RateLimiter;
use crate::model::{ArticleTarget, FetchOutcome, Mode};
use crate::pipeline::PipelineContext;
use crate::progress::SharedProgress;
use crate::transport::Transport;
use crate::work_queue::WorkQueue;

/// Terminal result for one input target
#[derive(Debug)]
pub struct ArticleResult {
    /// Position in the input list
    pub index: usize,
    pub target: ArticleTarget,
    pub outcome: FetchOutcome,
    /// Pages fetched by the pipeline that handled this article
    pub pages: usize,
    pub elapsed: Duration,
}

/// Every outcome of a batch, in input order
#[derive(Debug, Default)]
pub struct BatchReport {
    pub results: Vec<ArticleResult>,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn completed(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_complete()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.completed()
    }

    pub fn cancelled(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, FetchOutcome::Failed(FetchError::Cancelled)))
            .count()
    }

    pub fn revisions(&self) -> usize {
        self.results
            .iter()
            .filter_map(|r| r.outcome.history())
            .map(|h| h.revisions.len())
            .sum()
    }

    pub fn all_complete(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_complete())
    }
}

/// One unit of work: targets sharing a pipeline, with their input positions
struct Job {
    indices: Vec<usize>,
    targets: Vec<ArticleTarget>,
}

/// Split the input into pipelines.
///
/// Full history runs one pipeline per article. Latest-revision mode groups
/// titles and page ids separately (the API refuses a mix) into batches of
/// `batch_size`.
fn plan_jobs(targets: &[ArticleTarget], mode: Mode, batch_size: usize) -> Vec<Job> {
    match mode {
        Mode::FullHistory => targets
            .iter()
            .enumerate()
            .map(|(i, t)| Job {
                indices: vec![i],
                targets: vec![t.clone()],
            })
            .collect(),
        Mode::LatestRevision => {
            let (titles, ids): (Vec<_>, Vec<_>) =
                targets.iter().enumerate().partition(|(_, t)| t.is_title());
            [titles, ids]
                .iter()
                .flat_map(|group| group.chunks(batch_size.max(1)))
                .map(|chunk| Job {
                    indices: chunk.iter().map(|(i, _)| *i).collect(),
                    targets: chunk.iter().map(|(_, t)| (*t).clone()).collect(),
                })
                .collect()
        }
    }
}

pub struct Orchestrator<T> {
    config: FetchConfig,
    transport: T,
    limiter: RateLimiter,
    cancel: CancelFlag,
    progress: Option<SharedProgress>,
}

impl<T: Transport> Orchestrator<T> {
    pub fn new(config: FetchConfig, transport: T) -> Self {
        Self {
            limiter: RateLimiter::from_config(&config),
            config,
            transport,
            cancel: CancelFlag::new(),
            progress: None,
        }
    }

    /// [`Orchestrator::new`] for a config that passes [`FetchConfig::validate`]
    pub fn try_new(config: FetchConfig, transport: T) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(config, transport))
    }

    /// Share an externally owned flag (signal handlers, tests)
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: SharedProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Fetch every target and return the outcomes in input order
    pub fn run(
        &self,
        targets: &[ArticleTarget],
    ) -> Result<BatchReport, rayon::ThreadPoolBuildError> {
        self.run_with(targets, |_| {})
    }

    /// Fetch every target, calling `on_outcome` as each article finishes.
    ///
    /// Articles finish independently; one failure never stops the batch.
    /// After cancellation every unfinished article reports `Cancelled`.
    pub fn run_with<F>(
        &self,
        targets: &[ArticleTarget],
        on_outcome: F,
    ) -> Result<BatchReport, rayon::ThreadPoolBuildError>
    where
        F: Fn(&ArticleResult) + Sync,
    {
        let start = Instant::now();
        let mode = self.config.mode;
        let jobs = plan_jobs(targets, mode, self.config.latest_batch());
        let workers = self.config.concurrency.min(jobs.len()).max(1);
        log::info!(
            "Fetching {} articles ({mode}) as {} pipelines on {workers} workers",
            targets.len(),
            jobs.len()
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("wikirev-{i}"))
            .build()?;

        let queue = WorkQueue::new(jobs);
        let slots: Mutex<Vec<Option<ArticleResult>>> =
            Mutex::new((0..targets.len()).map(|_| None).collect());
        let ctx = PipelineContext {
            config: &self.config,
            transport: &self.transport,
            limiter: &self.limiter,
            cancel: &self.cancel,
        };

        pool.install(|| {
            rayon::scope(|s| {
                for _ in 0..workers {
                    s.spawn(|_| {
                        while let Some(job) = queue.next() {
                            for result in self.run_job(&ctx, mode, job) {
                                on_outcome(&result);
                                let index = result.index;
                                slots.lock().unwrap_or_else(PoisonError::into_inner)[index] =
                                    Some(result);
                            }
                        }
                    });
                }
            });
        });

        let results: Vec<ArticleResult> = slots
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_iter()
            .flatten()
            .collect();
        let report = BatchReport {
            results,
            elapsed: start.elapsed(),
        };
        log::info!(
            "Batch finished in {:.1}s: {} complete, {} failed ({} cancelled), {} revisions",
            report.elapsed.as_secs_f64(),
            report.completed(),
            report.failed(),
            report.cancelled(),
            report.revisions()
        );
        Ok(report)
    }

    fn run_job(&self, ctx: &PipelineContext<'_, T>, mode: Mode, job: &Job) -> Vec<ArticleResult> {
        let start = Instant::now();
        let (outcomes, pages) = if self.cancel.is_cancelled() {
            let outcomes: Vec<FetchOutcome> = job
                .targets
                .iter()
                .map(|_| FetchOutcome::Failed(FetchError::Cancelled))
                .collect();
            (outcomes, 0)
        } else {
            let name = match job.targets.as_slice() {
                [one] => one.to_string(),
                many => format!("{} articles", many.len()),
            };
            let pb = match &self.progress {
                Some(p) => p.article_bar(&name),
                None => indicatif::ProgressBar::hidden(),
            };
            pb.set_message("connecting...");
            let result = ctx.run(mode, &job.targets, &pb);
            pb.finish_and_clear();
            (result.outcomes, result.pages)
        };

        let elapsed = start.elapsed();
        job.indices
            .iter()
            .zip(&job.targets)
            .zip(outcomes)
            .map(|((&index, target), outcome)| {
                match &outcome {
                    FetchOutcome::Complete(h) => log::info!(
                        "{target}: {} revisions in {:.1}s",
                        h.revisions.len(),
                        elapsed.as_secs_f64()
                    ),
                    FetchOutcome::Failed(FetchError::Cancelled) => {
                        log::debug!("{target}: cancelled")
                    }
                    FetchOutcome::Failed(e) => log::error!("{target}: {e}"),
                }
                ArticleResult {
                    index,
                    target: target.clone(),
                    outcome,
                    pages,
                    elapsed,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IssueError;
    use crate::transport::ResponseBody;

    fn t(s: &str) -> ArticleTarget {
        ArticleTarget::parse(s)
    }

    #[test]
    fn history_jobs_one_per_article() {
        let targets = vec![t("A"), t("B"), t("pageid:3")];
        let jobs = plan_jobs(&targets, Mode::FullHistory, 20);
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[2].indices, vec![2]);
    }

    #[test]
    fn latest_jobs_batch_and_split_kinds() {
        let targets = vec![t("A"), t("pageid:1"), t("B"), t("C"), t("pageid:2")];
        let jobs = plan_jobs(&targets, Mode::LatestRevision, 2);
        let shapes: Vec<Vec<usize>> = jobs.iter().map(|j| j.indices.clone()).collect();
        assert_eq!(shapes, vec![vec![0, 2], vec![3], vec![1, 4]]);
        assert!(jobs[2].targets.iter().all(|t| !t.is_title()));
    }

    struct Offline;

    impl Transport for Offline {
        fn execute(&self, _: &crate::model::FetchRequest) -> Result<ResponseBody, IssueError> {
            Err(IssueError::Transient {
                status: None,
                message: "offline".to_string(),
            })
        }
    }

    #[test]
    fn try_new_rejects_zero_rate() {
        let config = FetchConfig {
            requests_per_second: 0.0,
            ..Default::default()
        };
        assert!(Orchestrator::try_new(config.clone(), Offline).is_err());
        // The unchecked constructor still builds a usable limiter
        let orch = Orchestrator::new(config, Offline);
        assert_eq!(orch.limiter().spacing(), orch.config().backoff_ceiling());
        assert!(Orchestrator::try_new(FetchConfig::default(), Offline).is_ok());
    }

    #[test]
    fn empty_report() {
        let report = BatchReport::default();
        assert!(report.all_complete());
        assert_eq!(report.failed(), 0);
        assert_eq!(report.revisions(), 0);
    }
}
