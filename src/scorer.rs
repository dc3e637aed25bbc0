use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::{debug, error, warn};

use crate::{corpus::TestPosition, engine::{EngineCommand, EngineError, EngineSession, Timeouts}, error_metric::mean_square_error, params::TuningParameter};

/// Produces the aggregate fit error of one full evaluation pass.
pub trait Scorer {
    fn pass(&mut self, params: &[TuningParameter]) -> Result<f64>;
}

/// Positions per worker; the last batch holds the remainder.
pub fn batch_size(positions: usize, workers: usize) -> usize {
    positions.div_ceil(workers.max(1)).max(1)
}

/// A fixed set of engine sessions; batch `i` of every pass goes to session `i`.
pub struct EnginePool {
    sessions: Vec<EngineSession>,
    positions: Vec<TestPosition>,
    pool: rayon::ThreadPool,
    k: f64,
}

impl EnginePool {
    pub fn start(command: &EngineCommand, workers: usize, timeouts: Timeouts, positions: Vec<TestPosition>, k: f64) -> Result<Self> {
        let mut sessions = Vec::with_capacity(workers);
        for worker in 1..=workers {
            sessions.push(EngineSession::spawn(worker, command, timeouts)?);
        }
        Self::with_sessions(sessions, positions, k)
    }

    pub fn with_sessions(sessions: Vec<EngineSession>, positions: Vec<TestPosition>, k: f64) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(sessions.len().max(1))
            .thread_name(|i| format!("engine-worker-{}", i + 1))
            .build()
            .context("failed to build engine worker pool")?;
        Ok(EnginePool { sessions, positions, pool, k })
    }

    pub fn positions(&self) -> &[TestPosition] {
        &self.positions
    }

    /// Scores the whole corpus with `params` and returns the mean error.
    ///
    /// A pass with a failed batch is never used. Fatal failures are returned
    /// immediately, otherwise the pass is repeated once.
    pub fn run_pass(&mut self, params: &[TuningParameter]) -> Result<f64, EngineError> {
        if let Err(err) = self.dispatch(params) {
            if err.is_fatal() {
                return Err(err);
            }
            warn!("Pass failed ({err}), retrying once");
            self.reset_scores();
            self.dispatch(params)?;
        }
        Ok(mean_square_error(self.k, &self.positions))
    }

    fn dispatch(&mut self, params: &[TuningParameter]) -> Result<(), EngineError> {
        debug!("Starting pass");
        let size = batch_size(self.positions.len(), self.sessions.len());
        let EnginePool { sessions, positions, pool, .. } = self;

        let results: Vec<Result<(), EngineError>> = pool.install(|| {
            sessions
                .par_iter_mut()
                .zip(positions.par_chunks_mut(size))
                .map(|(session, batch)| session.score(params, batch))
                .collect()
        });

        // Every batch has finished or failed at this point.
        let mut failure: Option<EngineError> = None;
        for err in results.into_iter().filter_map(Result::err) {
            error!("Batch failed: {err}");
            if failure.as_ref().map_or(true, |first| !first.is_fatal() && err.is_fatal()) {
                failure = Some(err);
            }
        }
        debug!("Pass completed");
        failure.map_or(Ok(()), Err)
    }

    fn reset_scores(&mut self) {
        for pos in &mut self.positions {
            pos.score = 0;
        }
    }

    /// Stops every session, even after a failure, and reports the first error.
    pub fn shutdown(&mut self) -> Result<(), EngineError> {
        let mut first = None;
        for session in &mut self.sessions {
            if let Err(err) = session.stop() {
                error!(worker = session.worker(), "{err}");
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl Scorer for EnginePool {
    fn pass(&mut self, params: &[TuningParameter]) -> Result<f64> {
        Ok(self.run_pass(params)?)
    }
}
