//! Windowing DAG: which ciphertext powers to multiply, and a concurrent
//! executor that computes them.
//!
//! The Receiver encrypts the *source powers* `d·B^k` (`1 ≤ d < B`) of each
//! query batch. Every other power `i` is the product of two lower powers
//! `i1 + i2 = i`, chosen so the multiplicative depth of `i` is as small as
//! possible. The graph only depends on `(max_power, window_base,
//! ps_low_degree)` and is built once.
//!
//! ## Execution
//!
//! Workers share one [`DagExecutionState`]. Each repeatedly takes the next
//! work index from an atomic counter: indices below the node count are DAG
//! nodes (in depth order, so inputs are always claimed before the nodes that
//! need them), the rest are powers to convert to NTT form. A worker that
//! needs an input not yet `Done` spins for up to `spin_limit` iterations,
//! then yields to the OS scheduler between checks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;
use rayon::ThreadPool;
use tracing::debug;

use crate::error::{malformed, Error, Result};

/// One multiplication `power = inputs.0 + inputs.1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DagNode {
    pub power: u32,
    pub inputs: (u32, u32),
    pub depth: u32,
}

/// Plan for computing every power `1..=max_power` of the query from the
/// source powers the Receiver sends.
///
/// Each non-source power is the product of two smaller powers, chosen so
/// that its multiplicative depth is minimal.
#[derive(Clone, Debug)]
pub struct WindowingDag {
    max_power: u32,
    window_base: u32,
    ps_low_degree: u32,
    /// Multiplicative depth per power (index 0 unused). Sources have depth 1.
    depths: Vec<u32>,
    source_powers: Vec<u32>,
    nodes: Vec<DagNode>,
    targets: Vec<u32>,
    ntt_powers: Vec<u32>,
}

fn is_source_power(power: u32, base: u32) -> bool {
    let mut p = power;
    while p % base == 0 {
        p /= base;
    }
    p < base
}

impl WindowingDag {
    /// Builds the DAG for evaluating polynomials of degree `max_power`.
    ///
    /// With `ps_low_degree = L > 0` only the powers a Paterson–Stockmeyer
    /// evaluation needs are kept: `1..=L` and the multiples of `L + 1`.
    /// Nodes no target depends on are pruned.
    pub fn new(max_power: u32, window_base: u32, ps_low_degree: u32) -> Result<Self> {
        if window_base < 2 {
            return Err(Error::InvalidParams("window_base must be at least 2".into()));
        }
        let max = max_power as usize;
        let mut depths = vec![0u32; max + 1];
        let mut splits = vec![(0u32, 0u32); max + 1];

        for i in 1..=max_power {
            if is_source_power(i, window_base) {
                depths[i as usize] = 1;
                continue;
            }
            // scanning from the middle outward keeps the most balanced split
            // among those of equal depth
            let mut best: Option<(u32, u32)> = None;
            for i1 in (1..=i / 2).rev() {
                let i2 = i - i1;
                let d = depths[i1 as usize].max(depths[i2 as usize]) + 1;
                if best.map_or(true, |(bd, _)| d < bd) {
                    best = Some((d, i1));
                }
            }
            let (d, i1) = best.unwrap_or((1, 0));
            depths[i as usize] = d;
            splits[i as usize] = (i1, i - i1);
        }

        let targets: Vec<u32> = if ps_low_degree == 0 {
            (1..=max_power).collect()
        } else {
            let step = ps_low_degree + 1;
            (1..=ps_low_degree.min(max_power))
                .chain((step..=max_power).step_by(step as usize))
                .collect()
        };
        let ntt_powers: Vec<u32> = if ps_low_degree == 0 {
            targets.clone()
        } else {
            (1..=ps_low_degree.min(max_power)).collect()
        };

        let mut needed = vec![false; max + 1];
        for &t in &targets {
            needed[t as usize] = true;
        }
        for i in (1..=max).rev() {
            if needed[i] && depths[i] > 1 {
                let (a, b) = splits[i];
                needed[a as usize] = true;
                needed[b as usize] = true;
            }
        }

        let source_powers: Vec<u32> = (1..=max_power)
            .filter(|&i| needed[i as usize] && depths[i as usize] == 1)
            .collect();
        let mut nodes: Vec<DagNode> = (1..=max_power)
            .filter(|&i| needed[i as usize] && depths[i as usize] > 1)
            .map(|i| DagNode {
                power: i,
                inputs: splits[i as usize],
                depth: depths[i as usize],
            })
            .collect();
        nodes.sort_by_key(|n| (n.depth, n.power));

        let dag = Self {
            max_power,
            window_base,
            ps_low_degree,
            depths,
            source_powers,
            nodes,
            targets,
            ntt_powers,
        };
        debug!(
            max_power,
            window_base,
            ps_low_degree,
            sources = dag.source_powers.len(),
            nodes = dag.nodes.len(),
            depth = dag.depth(),
            "built windowing dag"
        );
        Ok(dag)
    }

    /// Highest power the Sender needs (the bin capacity).
    pub fn max_power(&self) -> u32 {
        self.max_power
    }

    /// Base `B` used to pick the source powers.
    pub fn window_base(&self) -> u32 {
        self.window_base
    }

    /// Paterson–Stockmeyer low degree, or 0 for plain evaluation.
    pub fn ps_low_degree(&self) -> u32 {
        self.ps_low_degree
    }

    /// Powers the Receiver must encrypt and send.
    pub fn source_powers(&self) -> &[u32] {
        &self.source_powers
    }

    /// Multiplications, sorted by depth.
    pub fn nodes(&self) -> &[DagNode] {
        &self.nodes
    }

    /// Powers the evaluation reads.
    pub fn targets(&self) -> &[u32] {
        &self.targets
    }

    /// Powers the evaluation reads in NTT form.
    pub fn ntt_powers(&self) -> &[u32] {
        &self.ntt_powers
    }

    /// Depth of `power`, or `None` if it is neither a source nor computed.
    pub fn power_depth(&self, power: u32) -> Option<u32> {
        let computed = self.nodes.iter().any(|n| n.power == power);
        if computed || self.source_powers.binary_search(&power).is_ok() {
            Some(self.depths[power as usize])
        } else {
            None
        }
    }

    /// Largest depth of any retained power.
    pub fn depth(&self) -> u32 {
        self.nodes
            .iter()
            .map(|n| n.depth)
            .chain(self.source_powers.iter().map(|_| 1))
            .max()
            .unwrap_or(0)
    }

    /// Total number of claimable work items per batch.
    pub fn work_count(&self) -> usize {
        self.nodes.len() + self.ntt_powers.len()
    }
}

const UNCOMPUTED: u8 = 0;
const COMPUTING: u8 = 1;
const DONE: u8 = 2;

/// Per-batch mutable state of one DAG execution.
///
/// Owned by a single query and dropped when the batch's powers are
/// extracted.
pub struct DagExecutionState<T> {
    flags: Vec<AtomicU8>,
    coeff: Vec<OnceLock<T>>,
    ntt: Vec<OnceLock<T>>,
    next: AtomicUsize,
    abort: AtomicBool,
    error: Mutex<Option<Error>>,
}

impl<T> DagExecutionState<T> {
    /// Fresh state with `sources` already `Done`.
    pub fn new(dag: &WindowingDag, sources: BTreeMap<u32, T>) -> Result<Self> {
        let len = dag.max_power as usize + 1;
        let state = Self {
            flags: (0..len).map(|_| AtomicU8::new(UNCOMPUTED)).collect(),
            coeff: (0..len).map(|_| OnceLock::new()).collect(),
            ntt: (0..len).map(|_| OnceLock::new()).collect(),
            next: AtomicUsize::new(0),
            abort: AtomicBool::new(false),
            error: Mutex::new(None),
        };

        let mut sources = sources;
        for &power in &dag.source_powers {
            let value = sources
                .remove(&power)
                .ok_or_else(|| malformed!("missing source power {power}"))?;
            let _ = state.coeff[power as usize].set(value);
            state.flags[power as usize].store(DONE, Ordering::Release);
        }
        if let Some(&extra) = sources.keys().next() {
            return Err(malformed!("unexpected source power {extra}"));
        }
        Ok(state)
    }

    /// `Uncomputed → Computing`. Failure means two workers claimed the same
    /// power.
    pub(crate) fn claim(&self, power: u32) -> Result<()> {
        self.flags[power as usize]
            .compare_exchange(UNCOMPUTED, COMPUTING, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::DagDoubleClaim { power })
    }

    fn complete(&self, power: u32, value: T) {
        let _ = self.coeff[power as usize].set(value);
        self.flags[power as usize].store(DONE, Ordering::Release);
    }

    /// Records the first error, then raises the abort flag.
    fn fail(&self, err: Error) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        self.abort.store(true, Ordering::Release);
    }

    fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Spins, then yields, until `power` is `Done`.
    fn wait_done(&self, power: u32, spin_limit: u32) -> Result<&T> {
        let flag = &self.flags[power as usize];
        let mut spins = 0u32;
        while flag.load(Ordering::Acquire) != DONE {
            if self.is_aborted() {
                return Err(Error::QueryAborted);
            }
            if spins < spin_limit {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        self.coeff[power as usize]
            .get()
            .ok_or_else(|| Error::InvalidState(format!("power {power} done without a value")))
    }

    fn run_worker<M, F>(&self, dag: &WindowingDag, spin_limit: u32, multiply: &M, to_ntt: &F)
    where
        M: Fn(&T, &T) -> Result<T>,
        F: Fn(&T) -> Result<T>,
    {
        let node_count = dag.nodes.len();
        let total = dag.work_count();
        while !self.is_aborted() {
            let idx = self.next.fetch_add(1, Ordering::AcqRel);
            if idx >= total {
                break;
            }
            let result = if idx < node_count {
                self.compute_node(&dag.nodes[idx], spin_limit, multiply)
            } else {
                let power = dag.ntt_powers[idx - node_count];
                self.wait_done(power, spin_limit)
                    .and_then(to_ntt)
                    .map(|v| {
                        let _ = self.ntt[power as usize].set(v);
                    })
            };
            if let Err(err) = result {
                self.fail(err);
                break;
            }
        }
    }

    fn compute_node<M>(&self, node: &DagNode, spin_limit: u32, multiply: &M) -> Result<()>
    where
        M: Fn(&T, &T) -> Result<T>,
    {
        self.claim(node.power)?;
        let a = self.wait_done(node.inputs.0, spin_limit)?;
        let b = self.wait_done(node.inputs.1, spin_limit)?;
        let product = multiply(a, b)?;
        self.complete(node.power, product);
        Ok(())
    }

    fn into_powers(self, dag: &WindowingDag) -> Result<BatchPowers<T>> {
        if let Some(err) = self.error.into_inner() {
            return Err(err);
        }
        let mut coeff = BTreeMap::new();
        for (power, slot) in self.coeff.into_iter().enumerate() {
            if let Some(v) = slot.into_inner() {
                coeff.insert(power as u32, v);
            }
        }
        let mut ntt = BTreeMap::new();
        for (power, slot) in self.ntt.into_iter().enumerate() {
            if let Some(v) = slot.into_inner() {
                ntt.insert(power as u32, v);
            }
        }
        let missing = dag
            .targets
            .iter()
            .chain(&dag.ntt_powers)
            .find(|&&p| !coeff.contains_key(&p))
            .or_else(|| dag.ntt_powers.iter().find(|&&p| !ntt.contains_key(&p)));
        if let Some(&p) = missing {
            return Err(Error::InvalidState(format!("power {p} was never computed")));
        }
        Ok(BatchPowers { coeff, ntt })
    }
}

/// All powers of one query batch after DAG execution.
#[derive(Debug)]
pub struct BatchPowers<T> {
    /// Every retained power, as produced by the multiplications.
    pub coeff: BTreeMap<u32, T>,
    /// The [`WindowingDag::ntt_powers`], converted by the finalize phase.
    pub ntt: BTreeMap<u32, T>,
}

/// Runs the DAG for one batch on `pool`, one worker per pool thread.
///
/// # Arguments
///
/// * `dag` - Graph to execute
/// * `sources` - Values for every [`WindowingDag::source_powers`] entry
/// * `pool` - Worker pool; every thread spins on this batch until done
/// * `spin_limit` - Busy-wait iterations before a waiting worker yields
/// * `multiply` - Product of two powers (multiply + relinearize)
/// * `to_ntt` - Conversion applied to the [`WindowingDag::ntt_powers`]
///
/// # Errors
///
/// `MalformedMessage` if the sources do not match the DAG. Any error from a
/// worker, including `DagDoubleClaim`, aborts every other worker and is
/// returned.
pub fn compute_batch_powers<T, M, F>(
    dag: &WindowingDag,
    sources: BTreeMap<u32, T>,
    pool: &ThreadPool,
    spin_limit: u32,
    multiply: M,
    to_ntt: F,
) -> Result<BatchPowers<T>>
where
    T: Send + Sync,
    M: Fn(&T, &T) -> Result<T> + Sync,
    F: Fn(&T) -> Result<T> + Sync,
{
    let state = DagExecutionState::new(dag, sources)?;
    let workers = pool.current_num_threads().clamp(1, dag.work_count().max(1));
    pool.scope(|s| {
        for _ in 0..workers {
            let (state, multiply, to_ntt) = (&state, &multiply, &to_ntt);
            s.spawn(move |_| state.run_worker(dag, spin_limit, multiply, to_ntt));
        }
    });
    state.into_powers(dag)
}
