use std::fmt;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use compat_idtech3::lines::Interrupt;
use rayon::prelude::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobsMode {
    Threaded,
    Inline,
}

#[derive(Clone, Copy, Debug)]
pub struct JobsConfig {
    pub mode: JobsMode,
    pub workers: usize,
}

impl JobsConfig {
    /// `workers == 0` sizes the pool from the available parallelism.
    pub fn threaded(workers: usize) -> Self {
        Self {
            mode: JobsMode::Threaded,
            workers,
        }
    }

    pub fn inline() -> Self {
        Self {
            mode: JobsMode::Inline,
            workers: 0,
        }
    }
}

#[derive(Debug)]
pub enum JobError {
    Pool(String),
    Panicked { stage: &'static str, message: String },
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::Pool(message) => write!(f, "worker pool: {}", message),
            JobError::Panicked { stage, message } => {
                write!(f, "{} job panic ({})", stage, message)
            }
        }
    }
}

impl std::error::Error for JobError {}

/// Shared cancellation flag, checked per line, per file and per archive entry.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

impl Interrupt for CancelToken {
    fn interrupted(&self) -> bool {
        self.is_cancelled()
    }
}

/// Bounded worker pool for the fan-out stages of a run.
pub struct Jobs {
    pool: Option<rayon::ThreadPool>,
}

impl Jobs {
    pub fn new(config: JobsConfig) -> Result<Self, JobError> {
        let pool = match config.mode {
            JobsMode::Inline => None,
            JobsMode::Threaded => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(config.workers)
                    .thread_name(|index| format!("mappack-{}", index))
                    .build()
                    .map_err(|err| JobError::Pool(err.to_string()))?;
                Some(pool)
            }
        };
        Ok(Self { pool })
    }

    pub fn workers(&self) -> usize {
        self.pool
            .as_ref()
            .map(|pool| pool.current_num_threads())
            .unwrap_or(1)
    }

    /// Runs `job` over every item and returns the results in input order.
    /// A panicking job fails the whole stage once every job has finished.
    pub fn map<T, R, F>(&self, stage: &'static str, items: Vec<T>, job: F) -> Result<Vec<R>, JobError>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Send + Sync,
    {
        let guarded = |item: T| {
            panic::catch_unwind(panic::AssertUnwindSafe(|| job(item)))
                .map_err(|payload| panic_payload_to_string(&payload))
        };
        let results: Vec<Result<R, String>> = match &self.pool {
            None => items.into_iter().map(guarded).collect(),
            Some(pool) => pool.install(|| items.into_par_iter().map(guarded).collect()),
        };
        results
            .into_iter()
            .map(|result| result.map_err(|message| JobError::Panicked { stage, message }))
            .collect()
    }
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
