//! The seven pipeline stages.
//!
//! Every stage has the same shape: `run(ctx, io, opts, run)`. Per-unit
//! stages follow check → transform → write artifact → mark; batch stages
//! (cluster, position) treat the whole input as one unit and close each
//! run with a header in `runs.jsonl`.

pub mod chunk;
pub mod cluster;
pub mod embed;
pub mod enrich;
pub mod extract;
pub mod load;
pub mod position;

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use crate::artifact;
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::models::{BatchRun, Keyed};
use crate::pipeline::{RunOptions, Stage, StageIo};

pub(crate) fn open_manifest(
    stage: Stage,
    io: &StageIo,
    opts: &RunOptions,
) -> Result<Manifest> {
    Manifest::open(&io.manifest, opts.force).map_err(|e| match e {
        Error::ManifestCorrupt { .. } => e,
        other => Error::stage_fatal(stage.as_str(), format!("cannot open manifest: {}", other)),
    })
}

pub(crate) fn input_path(io: &StageIo, name: &str) -> PathBuf {
    io.input.join(name)
}

pub(crate) fn output_path(io: &StageIo, name: &str) -> PathBuf {
    io.output.join(name)
}

/// Read a required upstream stream, resolving duplicates by key.
pub(crate) fn read_upstream<T: DeserializeOwned + Keyed>(
    stage: Stage,
    path: &Path,
) -> Result<Vec<T>> {
    if !path.exists() {
        return Err(Error::stage_fatal(
            stage.as_str(),
            format!("missing input artifact {}", path.display()),
        ));
    }
    artifact::read_latest(path)
}

pub(crate) fn open_output(stage: Stage, path: &Path) -> Result<artifact::ArtifactWriter> {
    artifact::ArtifactWriter::open(path).map_err(|e| {
        Error::stage_fatal(stage.as_str(), format!("cannot open {}: {}", path.display(), e))
    })
}

/// Record `run` as the stage's current run. Called after every record of
/// the run is written and before the manifest is marked.
pub(crate) fn close_run(stage: Stage, io: &StageIo, run: &str, records: usize) -> Result<()> {
    let mut runs = open_output(stage, &output_path(io, artifact::RUNS))?;
    runs.append(&BatchRun {
        stage: stage.as_str().to_string(),
        run: run.to_string(),
        records,
        created_at: chrono::Utc::now().timestamp(),
    })
}
