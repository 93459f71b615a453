use std::{fs, io, path::PathBuf};
use tempdir::TempDir;
use thiserror::Error;

pub mod config;
pub mod executor;
pub mod extract;
pub mod graph;
pub mod language;
pub mod materialize;
pub mod scratch;
pub mod service;
pub mod submission;

pub use crate::{
    config::Config,
    executor::ProcessOutput,
    extract::RenderedImage,
    language::Language,
    materialize::{PlotHeuristic, RenderDetector},
};

use crate::{executor::Executor, materialize::Materializer};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Missing required field `{field}`")]
    MissingField { field: &'static str },
    #[error("Unsupported language: {language}")]
    UnsupportedLanguage { language: String },
    #[error("Invalid graph request: {reason}")]
    InvalidGraphRequest { reason: String },
    #[error("Invalid value {value:?} for {key}")]
    InvalidConfig { key: &'static str, value: String },
    #[error("Unable to create temporary directory: {source}")]
    UnableToCreateTempDir { source: io::Error },
    #[error("Unable to create scratch directory: {source}")]
    UnableToCreateScratchDir { source: io::Error },
    #[error("Unable to create source file: {source}")]
    UnableToCreateSourceFile { source: io::Error },
    #[error("Unable to start the interpreter {}: {source}", program.display())]
    UnableToStartInterpreter { program: PathBuf, source: io::Error },
    #[error("Unable to capture output from the interpreter")]
    UnableToCaptureOutput,
    #[error("Unable to wait for the interpreter: {source}")]
    UnableToWaitForInterpreter { source: io::Error },
    #[error("Graph rendering failed: {stderr}")]
    GraphRenderFailed { stderr: String },
}

impl Error {
    /// Errors caused by the request itself rather than by the sandbox.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::MissingField { .. }
                | Error::UnsupportedLanguage { .. }
                | Error::InvalidGraphRequest { .. }
        )
    }
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub language: Language,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
    pub rendered_image: Option<RenderedImage>,
    pub timed_out: bool,
    pub output_limit_exceeded: bool,
}

impl ExecutionResult {
    pub fn has_image(&self) -> bool {
        self.rendered_image.is_some()
    }
}

pub struct Sandbox {
    #[allow(dead_code)]
    scratch: Option<TempDir>,
    config: Config,
    materializer: Materializer,
    executor: Executor,
}

impl Sandbox {
    pub fn new() -> Result<Self> {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Self> {
        Self::with_detector(config, Box::new(PlotHeuristic))
    }

    pub fn with_detector(config: Config, detector: Box<dyn RenderDetector>) -> Result<Self> {
        let (scratch, dir) = match &config.scratch_dir {
            Some(dir) => {
                // The child runs inside this directory and sentinel paths
                // must be absolute, so relative paths are resolved up front.
                let dir = fs::create_dir_all(dir)
                    .and_then(|_| fs::canonicalize(dir))
                    .map_err(|e| Error::UnableToCreateScratchDir { source: e })?;
                (None, dir)
            }
            None => {
                let tmp = TempDir::new("code-runner")
                    .map_err(|e| Error::UnableToCreateTempDir { source: e })?;
                let dir = fs::canonicalize(tmp.path())
                    .map_err(|e| Error::UnableToCreateTempDir { source: e })?;
                (Some(tmp), dir)
            }
        };

        log::debug!("Using scratch directory {}", dir.display());

        Ok(Sandbox {
            scratch,
            materializer: Materializer::new(dir, detector),
            executor: Executor::new(config.clone()),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scratch_dir(&self) -> &std::path::Path {
        self.materializer.dir()
    }

    /// Runs one request to completion.
    ///
    /// Only validation and sandbox failures come back as `Err`. A program
    /// that crashes, times out or floods its output still produces an
    /// `ExecutionResult`, with the problem described in `stderr`. Every
    /// scratch file is gone by the time this returns.
    pub async fn execute(&self, req: &ExecutionRequest) -> Result<ExecutionResult> {
        if req.code.is_empty() {
            return Err(Error::MissingField { field: "code" });
        }
        if req.language.trim().is_empty() {
            return Err(Error::MissingField { field: "language" });
        }
        let language: Language = req.language.parse()?;

        let materialized = self.materializer.materialize(language, &req.code)?;
        let output = self
            .executor
            .run(language, materialized.source.path(), self.scratch_dir())
            .await?;

        let extracted = extract::extract(output.stdout, materialized.image.as_ref());

        for file in materialized.image.into_iter().chain(Some(materialized.source)) {
            if let Err(e) = file.remove() {
                log::warn!("Unable to clean up after execution: {}", e);
            }
        }

        log::info!(
            "Executed {} in {} ms (timed out: {}, image: {})",
            language,
            output.execution_time_ms,
            output.timed_out,
            extracted.image.is_some()
        );

        Ok(ExecutionResult {
            language,
            stdout: extracted.stdout,
            stderr: output.stderr,
            execution_time_ms: output.execution_time_ms,
            rendered_image: extracted.image,
            timed_out: output.timed_out,
            output_limit_exceeded: output.output_limit_exceeded,
        })
    }
}
