//! Plain data records shared by chains and the sampler, and the execution
//! context the sampler dispatches its chains on.

use std::sync::Arc;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::Result;

/// One recorded position of a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub point: Vec<f64>,
    pub log_density: f64,
    /// Mixture component the point belongs to. Only the global-local proposal
    /// uses it; it is 0 otherwise.
    pub component: usize,
}

impl State {
    pub fn new(point: Vec<f64>, log_density: f64) -> Self {
        Self {
            point,
            log_density,
            component: 0,
        }
    }

    pub fn dimension(&self) -> usize {
        self.point.len()
    }
}

/// Append-only record of the states a chain visited since its history was
/// last cleared. Nothing is recorded unless `keep` is set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    states: Vec<State>,
    keep: bool,
}

impl History {
    pub fn new(keep: bool) -> Self {
        Self {
            states: Vec::new(),
            keep,
        }
    }

    pub fn push(&mut self, state: &State) {
        if self.keep {
            self.states.push(state.clone());
        }
    }

    pub fn keep(&self) -> bool {
        self.keep
    }

    /// Turning recording off also drops what was recorded so far.
    pub fn set_keep(&mut self, keep: bool) {
        self.keep = keep;
        if !keep {
            self.states.clear();
        }
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// The last `n` states (all of them if fewer were recorded).
    pub fn tail(&self, n: usize) -> &[State] {
        &self.states[self.states.len().saturating_sub(n)..]
    }

    /// Everything after the first `fraction` of the history, used to drop
    /// burn-in before computing statistics.
    pub fn after_skip(&self, fraction: f64) -> &[State] {
        let skip = (fraction * self.states.len() as f64) as usize;
        &self.states[skip.min(self.states.len())..]
    }
}

/// Handle on the worker pool chains are dispatched to.
///
/// Every call to [`Executor::for_each`] is a barrier: it only returns once the
/// closure has finished for every item.
#[derive(Debug, Clone)]
pub enum Executor {
    /// Run every chain on the calling thread, in order.
    Sequential,
    Pool(Arc<ThreadPool>),
}

impl Executor {
    /// A pool with rayon's default thread count, or the sequential executor.
    pub fn new(parallelize: bool) -> Result<Self> {
        if parallelize {
            let pool = ThreadPoolBuilder::new()
                .thread_name(|i| format!("mcmc-worker-{i}"))
                .build()?;
            Ok(Executor::Pool(Arc::new(pool)))
        } else {
            Ok(Executor::Sequential)
        }
    }

    pub fn with_threads(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("mcmc-worker-{i}"))
            .build()?;
        Ok(Executor::Pool(Arc::new(pool)))
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self, Executor::Pool(_))
    }

    /// Applies `f` to every item, passing its index along.
    pub fn for_each<T, F>(&self, items: &mut [T], f: F)
    where
        T: Send,
        F: Fn(usize, &mut T) + Send + Sync,
    {
        match self {
            Executor::Sequential => items.iter_mut().enumerate().for_each(|(i, t)| f(i, t)),
            Executor::Pool(pool) => {
                pool.install(|| items.par_iter_mut().enumerate().for_each(|(i, t)| f(i, t)))
            }
        }
    }

    /// Like [`Executor::for_each`] but collects one result per item, in order.
    pub fn map<T, R, F>(&self, items: &mut [T], f: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(usize, &mut T) -> R + Send + Sync,
    {
        match self {
            Executor::Sequential => items
                .iter_mut()
                .enumerate()
                .map(|(i, t)| f(i, t))
                .collect(),
            Executor::Pool(pool) => pool.install(|| {
                items
                    .par_iter_mut()
                    .enumerate()
                    .map(|(i, t)| f(i, t))
                    .collect()
            }),
        }
    }
}

/// One progress bar per chain, advanced once per batch.
pub struct ChainProgress {
    _multi: MultiProgress,
    bars: Vec<ProgressBar>,
}

impl ChainProgress {
    pub fn new(n_chains: usize, length: u64, phase: &str, visible: bool) -> Self {
        let multi = if visible {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        let style =
            ProgressStyle::with_template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-");

        let bars = (0..n_chains)
            .map(|i| {
                let pb = multi.add(ProgressBar::new(length));
                pb.set_prefix(format!("{phase} chain {i}"));
                pb.set_style(style.clone());
                pb
            })
            .collect();

        Self {
            _multi: multi,
            bars,
        }
    }

    pub fn inc_all(&self, n: u64) {
        for pb in &self.bars {
            pb.inc(n);
        }
    }

    pub fn set_message(&self, chain: usize, msg: String) {
        if let Some(pb) = self.bars.get(chain) {
            pb.set_message(msg);
        }
    }

    pub fn finish(&self, msg: &'static str) {
        for pb in &self.bars {
            pb.finish_with_message(msg);
        }
    }
}
