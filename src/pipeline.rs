//! Stage pipeline runner.
//!
//! Sequences Extract → Chunk → Enrich → Embed → Cluster → Position → Load.
//! Each stage reads the upstream artifact stream, consults its manifest,
//! writes new artifacts and then marks the processed digests.
//!
//! Per stage: `Pending → Running → {Committed | Skipped | Failed}`. A
//! failed stage stops the run; downstream stages stay `Pending` and are
//! never invoked.

use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info};

use crate::config::Config;
use crate::context::PipelineContext;
use crate::error::{Error, ErrorKind, Result};
use crate::progress::{StageProgressEvent, StageProgressReporter};
use crate::stages;

/// Progress is reported every this many units.
const PROGRESS_EVERY: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Extract,
    Chunk,
    Enrich,
    Embed,
    Cluster,
    Position,
    Load,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Extract,
        Stage::Chunk,
        Stage::Enrich,
        Stage::Embed,
        Stage::Cluster,
        Stage::Position,
        Stage::Load,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Chunk => "chunk",
            Stage::Enrich => "enrich",
            Stage::Embed => "embed",
            Stage::Cluster => "cluster",
            Stage::Position => "position",
            Stage::Load => "load",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.to_ascii_lowercase();
        Stage::ALL.into_iter().find(|stage| stage.as_str() == s)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageState {
    Pending,
    Running,
    Committed,
    Skipped,
    Failed,
}

impl StageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageState::Pending => "pending",
            StageState::Running => "running",
            StageState::Committed => "committed",
            StageState::Skipped => "skipped",
            StageState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Written,
    Skipped,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub state: StageState,
    pub total: u64,
    pub written: u64,
    pub skipped: u64,
    pub fallback: u64,
    /// Units that could not be written and were left unmarked.
    pub failed: u64,
    pub error: Option<String>,
    pub elapsed_ms: u128,
}

impl StageReport {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            state: StageState::Pending,
            total: 0,
            written: 0,
            skipped: 0,
            fallback: 0,
            failed: 0,
            error: None,
            elapsed_ms: 0,
        }
    }

    pub fn handled(&self) -> u64 {
        self.written + self.skipped + self.fallback + self.failed
    }
}

/// Where a single stage reads, writes and keeps its manifest.
///
/// `input` is the corpus file for Extract and the artifacts directory for
/// every other stage. `output` is always a directory.
#[derive(Debug, Clone)]
pub struct StageIo {
    pub input: PathBuf,
    pub output: PathBuf,
    pub manifest: PathBuf,
}

impl StageIo {
    pub fn for_stage(config: &Config, stage: Stage) -> Self {
        let artifacts = config.paths.artifacts_dir();
        Self {
            input: match stage {
                Stage::Extract => config.paths.input.clone(),
                _ => artifacts.clone(),
            },
            output: artifacts,
            manifest: config.paths.manifest_for(stage.as_str()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Ignore manifests and reprocess every unit.
    pub force: bool,
    /// First stage to run; earlier stages are left untouched.
    pub from: Option<Stage>,
    /// Overrides `enrichment.workers`.
    pub workers: Option<usize>,
    /// Overrides `enrichment.min_delay_ms`.
    pub delay_ms: Option<u64>,
}

/// Live state of one running stage: counts plus progress emission.
pub struct StageRun<'a> {
    pub report: StageReport,
    progress: &'a dyn StageProgressReporter,
}

impl<'a> StageRun<'a> {
    pub fn new(stage: Stage, progress: &'a dyn StageProgressReporter) -> Self {
        let mut report = StageReport::new(stage);
        report.state = StageState::Running;
        Self { report, progress }
    }

    pub fn stage(&self) -> Stage {
        self.report.stage
    }

    pub fn begin(&mut self, total: usize) {
        self.report.total = total as u64;
        self.progress.report(StageProgressEvent::Started {
            stage: self.report.stage.to_string(),
            total: self.report.total,
        });
    }

    pub fn record(&mut self, outcome: UnitOutcome) {
        match outcome {
            UnitOutcome::Written => self.report.written += 1,
            UnitOutcome::Skipped => self.report.skipped += 1,
            UnitOutcome::Fallback => self.report.fallback += 1,
        }
        self.tick();
    }

    pub fn record_failure(&mut self) {
        self.report.failed += 1;
        self.tick();
    }

    fn tick(&self) {
        let n = self.report.handled();
        if n % PROGRESS_EVERY == 0 || n == self.report.total {
            self.progress.report(StageProgressEvent::Units {
                stage: self.report.stage.to_string(),
                n,
                total: self.report.total,
            });
        }
    }

    fn finish(mut self, result: Result<()>, started: Instant) -> StageReport {
        self.report.elapsed_ms = started.elapsed().as_millis();
        self.report.state = match result {
            Ok(()) if self.report.written + self.report.fallback > 0 => StageState::Committed,
            Ok(()) => StageState::Skipped,
            Err(e) => {
                let e = match e.kind() {
                    ErrorKind::StageFatal => e,
                    _ => Error::stage_fatal(self.report.stage.as_str(), e),
                };
                error!(stage = %self.report.stage, error = %e, "stage failed");
                self.report.error = Some(e.to_string());
                StageState::Failed
            }
        };
        self.progress.report(StageProgressEvent::Finished {
            stage: self.report.stage.to_string(),
            state: self.report.state.as_str().to_string(),
            written: self.report.written + self.report.fallback,
            skipped: self.report.skipped,
        });
        self.report
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub stages: Vec<StageReport>,
}

impl PipelineReport {
    pub fn failed(&self) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.state == StageState::Failed)
    }

    pub fn succeeded(&self) -> bool {
        self.failed().is_none()
    }

    pub fn get(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

pub struct Pipeline {
    ctx: PipelineContext,
}

impl Pipeline {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Run every stage from `opts.from` onwards with the configured paths.
    pub async fn run(&self, opts: &RunOptions) -> PipelineReport {
        let mut stages = Vec::with_capacity(Stage::ALL.len());
        let mut halted = false;
        for stage in Stage::ALL {
            if halted {
                stages.push(StageReport::new(stage));
                continue;
            }
            if opts.from.is_some_and(|from| stage < from) {
                let mut report = StageReport::new(stage);
                report.state = StageState::Skipped;
                stages.push(report);
                continue;
            }
            let io = StageIo::for_stage(&self.ctx.config, stage);
            let report = self.run_stage(stage, &io, opts).await;
            halted = report.state == StageState::Failed;
            stages.push(report);
        }
        let report = PipelineReport { stages };
        info!(succeeded = report.succeeded(), "pipeline finished");
        report
    }

    /// Run one stage against explicit paths.
    pub async fn run_stage(&self, stage: Stage, io: &StageIo, opts: &RunOptions) -> StageReport {
        info!(stage = %stage, input = %io.input.display(), "stage started");
        let started = Instant::now();
        let mut run = StageRun::new(stage, self.ctx.progress.as_ref());
        let result = match stage {
            Stage::Extract => stages::extract::run(&self.ctx, io, opts, &mut run).await,
            Stage::Chunk => stages::chunk::run(&self.ctx, io, opts, &mut run).await,
            Stage::Enrich => stages::enrich::run(&self.ctx, io, opts, &mut run).await,
            Stage::Embed => stages::embed::run(&self.ctx, io, opts, &mut run).await,
            Stage::Cluster => stages::cluster::run(&self.ctx, io, opts, &mut run).await,
            Stage::Position => stages::position::run(&self.ctx, io, opts, &mut run).await,
            Stage::Load => stages::load::run(&self.ctx, io, opts, &mut run).await,
        };
        let report = run.finish(result, started);
        info!(
            stage = %stage,
            state = report.state.as_str(),
            written = report.written,
            skipped = report.skipped,
            fallback = report.fallback,
            failed = report.failed,
            "stage finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;

    #[test]
    fn test_stage_parse_and_order() {
        assert_eq!(Stage::parse("Enrich"), Some(Stage::Enrich));
        assert_eq!(Stage::parse("index"), None);
        assert!(Stage::Extract < Stage::Load);
        assert_eq!(Stage::ALL.len(), 7);
    }

    #[test]
    fn test_stage_io_paths() {
        let config = Config::for_work_dir(
            std::path::Path::new("corpus.json"),
            std::path::Path::new("work"),
        );
        let extract = StageIo::for_stage(&config, Stage::Extract);
        assert_eq!(extract.input, PathBuf::from("corpus.json"));
        let load = StageIo::for_stage(&config, Stage::Load);
        assert_eq!(load.input, config.paths.artifacts_dir());
        assert!(load.manifest.ends_with("manifests/load.log"));
    }

    #[test]
    fn test_finish_states() {
        let progress = NoProgress;
        let mut run = StageRun::new(Stage::Chunk, &progress);
        run.begin(2);
        run.record(UnitOutcome::Skipped);
        run.record(UnitOutcome::Skipped);
        assert_eq!(run.finish(Ok(()), Instant::now()).state, StageState::Skipped);

        let mut run = StageRun::new(Stage::Chunk, &progress);
        run.record(UnitOutcome::Fallback);
        assert_eq!(run.finish(Ok(()), Instant::now()).state, StageState::Committed);

        let run = StageRun::new(Stage::Load, &progress);
        let report = run.finish(Err(Error::Store("down".into())), Instant::now());
        assert_eq!(report.state, StageState::Failed);
        assert!(report.error.unwrap_or_default().contains("load"));
    }
}
