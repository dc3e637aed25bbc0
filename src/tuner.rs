use std::{path::PathBuf, time::{Duration, Instant}};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::{params::{TuningParameter, Value}, persist::write_results, scorer::Scorer};

#[derive(Debug, Clone, PartialEq)]
pub struct TuningSummary {
    pub initial_error: f64,
    pub final_error: f64,
    pub rounds: u32,
    pub trials: u64,
    pub duration: Duration,
}

/// Adaptive coordinate search over a parameter list ("Texel's Tuning Method").
///
/// `current` is the trial state handed to the scorer. `best` is the last
/// committed snapshot; it is only replaced by a fresh copy of `current`.
pub struct Tuner<'a, S: Scorer> {
    scorer: &'a mut S,
    current: Vec<TuningParameter>,
    best: Vec<TuningParameter>,
    best_err: f64,
    initial_err: f64,
    trials: u64,
    result_file: Option<PathBuf>,
}

impl<'a, S: Scorer> Tuner<'a, S> {
    /// Runs the unperturbed pass that sets the error to beat.
    pub fn new(scorer: &'a mut S, params: Vec<TuningParameter>) -> Result<Self> {
        let best_err = scorer.pass(&params).context("initial pass failed")?;
        info!("Starting err: {best_err:.8}");
        Ok(Tuner {
            scorer,
            best: params.clone(),
            current: params,
            best_err,
            initial_err: best_err,
            trials: 0,
            result_file: None,
        })
    }

    pub fn with_result_file(mut self, path: PathBuf) -> Self {
        self.result_file = Some(path);
        self
    }

    pub fn best(&self) -> &[TuningParameter] {
        &self.best
    }

    pub fn parameters(&self) -> &[TuningParameter] {
        &self.current
    }

    pub fn best_error(&self) -> f64 {
        self.best_err
    }

    /// Repeats rounds until neither a round nor the postponed retry improves anything.
    pub fn run(&mut self) -> Result<TuningSummary> {
        let tick = Instant::now();
        let mut rounds = 0;
        let mut retry_postponed = false;
        let mut improved = true;

        while improved {
            self.persist()?;
            rounds += 1;
            improved = self.round()?;

            if !improved && !retry_postponed {
                info!("No improvement => check postponed parameters");
                retry_postponed = true;
                improved = self.release_postponed();
            } else {
                retry_postponed = false;
            }
        }

        self.persist()?;
        Ok(TuningSummary {
            initial_error: self.initial_err,
            final_error: self.best_err,
            rounds,
            trials: self.trials,
            duration: tick.elapsed(),
        })
    }

    /// One trial (or skip) per parameter, in list order. Returns whether any trial was committed.
    pub fn round(&mut self) -> Result<bool> {
        let mut improved = false;

        for i in 0..self.current.len() {
            if self.current[i].remaining_skips > 0 {
                self.current[i].remaining_skips -= 1;
                self.best[i].remaining_skips = self.current[i].remaining_skips;
                continue;
            }

            self.current[i].iterations += 1;
            let prev_value = self.current[i].value;
            let delta = self.current[i].delta();

            if let Some(err) = self.trial(i, prev_value, delta)? {
                if err < self.best_err {
                    self.commit(i, err, false);
                    improved = true;
                    continue;
                }
            }

            if let Some(err) = self.trial(i, prev_value, -delta)? {
                if err < self.best_err {
                    self.commit(i, err, true);
                    improved = true;
                    continue;
                }
            }

            let param = &mut self.current[i];
            param.value = prev_value;
            param.record_failure();
            // Values agree with the snapshot again; only the schedule moved.
            self.best[i] = param.clone();
        }

        Ok(improved)
    }

    /// Drops every step to 1 and clears pending skips. True if any parameter was postponed.
    pub fn release_postponed(&mut self) -> bool {
        let mut any_postponed = false;
        for (current, best) in self.current.iter_mut().zip(self.best.iter_mut()) {
            current.step = 1;
            if current.remaining_skips > 0 {
                current.remaining_skips = 0;
                any_postponed = true;
            }
            best.step = current.step;
            best.remaining_skips = current.remaining_skips;
        }
        any_postponed
    }

    /// Scores `prev_value + offset`. `None` when the value leaves the `i32` range; no pass is run then.
    fn trial(&mut self, i: usize, prev_value: Value, offset: Value) -> Result<Option<f64>> {
        let Some(value) = prev_value.checked_add(offset) else {
            debug!("Skip {} {:+}: out of range", self.current[i].option_name(), offset);
            return Ok(None);
        };
        self.current[i].value = value;
        self.trials += 1;

        let err = self.scorer.pass(&self.current)?;
        info!("Try {} = {} [step {}] => {:+.8}", self.current[i].option_name(), value, offset, err - self.best_err);
        Ok(Some(err))
    }

    fn commit(&mut self, i: usize, err: f64, flip: bool) {
        self.best_err = err;
        let param = &mut self.current[i];
        if flip {
            param.direction = param.direction.flipped();
        }
        param.record_improvement();
        self.best = self.current.clone();
        info!("Improvement: {err:.8}");
    }

    fn persist(&self) -> Result<()> {
        if let Some(path) = &self.result_file {
            write_results(path, &self.best).with_context(|| format!("failed writing {}", path.display()))?;
        }
        Ok(())
    }
}
