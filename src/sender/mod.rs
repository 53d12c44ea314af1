//! Sender: the database holder's side of a query round.
//!
//! ```text
//! AwaitingQuery → ExpandingPowers → Evaluating → Responding → AwaitingQuery
//! ```
//!
//! For every bundle index the Sender expands the Receiver's source powers
//! through the windowing DAG, evaluates every bundle at that index against
//! the expanded powers, and mod-switches each result to the last level.
//!
//! Queries and database maintenance share one worker pool. Both take the
//! database lock on the calling thread before handing work to the pool, so
//! no pool thread ever waits on the lock while another holds it across a
//! `scope` or `install`.

pub mod bin_bundle;
pub mod db;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use rand::{CryptoRng, Rng};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dag::{compute_batch_powers, WindowingDag};
use crate::error::{malformed, Error, Result};
use crate::he::Ciphertext;
use crate::item::{Item, Label};
use crate::messages::{OprfRequest, OprfResponse, PackageKind, QueryRequest, QueryResponse, ResultPackage};

pub use bin_bundle::{BinBundle, BundleShape};
pub use db::SenderDb;

/// Worker pool configuration.
///
/// # Fields
///
/// * `thread_count` - Threads in the Sender's pool
/// * `spin_limit` - Busy-wait iterations a DAG worker spends on a missing
///   input before it starts yielding to the OS between checks
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderConfig {
    pub thread_count: usize,
    pub spin_limit: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            thread_count: std::thread::available_parallelism().map_or(1, |n| n.get()),
            spin_limit: 1 << 10,
        }
    }
}

/// Where the Sender is in answering a query. Only reported through logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SenderStage {
    AwaitingQuery,
    ExpandingPowers,
    Evaluating,
    Responding,
}

/// Answers queries against a [`SenderDb`] on a fixed worker pool.
pub struct Sender {
    db: Arc<SenderDb>,
    config: SenderConfig,
    pool: ThreadPool,
    dag: WindowingDag,
}

impl Sender {
    /// Builds the worker pool and the windowing DAG for `db`'s parameters.
    ///
    /// # Arguments
    ///
    /// * `db` - Database to serve; may be shared with other readers
    /// * `config` - Pool size and DAG spin limit
    pub fn new(db: Arc<SenderDb>, config: SenderConfig) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.thread_count.max(1))
            .thread_name(|i| format!("psi-sender-{i}"))
            .build()
            .map_err(|e| Error::InvalidParams(format!("thread pool: {e}")))?;
        let params = db.params();
        let dag = WindowingDag::new(
            params.table.max_items_per_bin,
            params.query.window_base,
            params.query.ps_low_degree,
        )?;
        info!(
            threads = pool.current_num_threads(),
            spin_limit = config.spin_limit,
            source_powers = ?dag.source_powers(),
            "sender ready"
        );
        Ok(Self {
            db,
            config,
            pool,
            dag,
        })
    }

    /// Database being served.
    pub fn db(&self) -> &Arc<SenderDb> {
        &self.db
    }

    /// Pool configuration.
    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    /// Windowing DAG for the database's parameters.
    pub fn dag(&self) -> &WindowingDag {
        &self.dag
    }

    /// Inserts new items on the Sender's pool. See [`SenderDb::insert`].
    ///
    /// Waits for running queries to finish, and blocks new ones until done.
    pub fn insert(&self, data: &[(Item, Label)]) -> Result<()> {
        let mut guard = self.db.write_state();
        let state = &mut *guard;
        self.pool.install(|| self.db.insert_locked(state, data))
    }

    /// Unlabeled form of [`Sender::insert`].
    pub fn insert_items(&self, items: &[Item]) -> Result<()> {
        let data: Vec<(Item, Label)> = items.iter().map(|i| (*i, Vec::new())).collect();
        self.insert(&data)
    }

    /// See [`SenderDb::insert_or_assign`].
    pub fn insert_or_assign(&self, data: &[(Item, Label)]) -> Result<()> {
        let mut guard = self.db.write_state();
        let state = &mut *guard;
        self.pool.install(|| self.db.insert_or_assign_locked(state, data))
    }

    /// See [`SenderDb::remove`].
    pub fn remove(&self, items: &[Item]) -> Result<usize> {
        let mut guard = self.db.write_state();
        let state = &mut *guard;
        self.pool.install(|| self.db.remove_locked(state, items))
    }

    /// See [`SenderDb::strip`].
    pub fn strip(&self) -> Result<()> {
        let mut guard = self.db.write_state();
        let state = &mut *guard;
        self.pool.install(|| self.db.strip_locked(state))
    }

    /// Answers the OPRF round.
    pub fn process_oprf(&self, request: &OprfRequest) -> Result<OprfResponse> {
        let key = self
            .db
            .oprf_key()
            .ok_or_else(|| Error::Oprf("database was built without an OPRF key".into()))?;
        let evaluated = self.pool.install(|| key.process_queries(&request.blinded))?;
        debug!(count = evaluated.len(), "answered OPRF request");
        Ok(OprfResponse { evaluated })
    }

    fn validate_query(&self, request: &QueryRequest) -> Result<()> {
        let he = self.db.he();
        if !request.relin_keys.is_well_formed(he) {
            return Err(malformed!("relinearization keys do not match parameters"));
        }
        let expected: Vec<u32> = self.dag.source_powers().to_vec();
        let got: Vec<u32> = request.powers.keys().copied().collect();
        if got != expected {
            return Err(malformed!("query powers {got:?}, expected {expected:?}"));
        }
        let batch_count = self.db.params().bundle_idx_count();
        for (power, cts) in &request.powers {
            if cts.len() != batch_count {
                return Err(malformed!(
                    "power {power} has {} batches, expected {batch_count}",
                    cts.len()
                ));
            }
            if !cts.iter().all(|ct| ct.is_well_formed(he)) {
                return Err(malformed!("power {power} holds a malformed ciphertext"));
            }
        }
        Ok(())
    }

    /// Evaluates a query against the database.
    ///
    /// Holds the database read lock, taken on the calling thread, for the
    /// whole query. Bundle indices without bundles produce no packages.
    ///
    /// # Errors
    ///
    /// `MalformedMessage` for a query that does not fit the parameters,
    /// `CacheInvalid` if a bundle cache is stale, and any error that aborted
    /// power expansion (e.g. `DagDoubleClaim`).
    pub fn process_query<R: Rng + CryptoRng>(
        &self,
        request: &QueryRequest,
        rng: &mut R,
    ) -> Result<QueryResponse> {
        let start = Instant::now();
        debug!(stage = ?SenderStage::AwaitingQuery, "query received");
        self.validate_query(request)?;

        let state = self.db.read_state();
        if let Some(bundle_idx) = state
            .bundles
            .iter()
            .position(|at| at.iter().any(|b| !b.cache_is_valid()))
        {
            return Err(Error::CacheInvalid { bundle_idx });
        }

        let he = self.db.he();
        let rk = &request.relin_keys;
        let mut packages = Vec::new();
        for (bundle_idx, bundles) in state.bundles.iter().enumerate() {
            if bundles.is_empty() {
                continue;
            }

            debug!(bundle_idx, stage = ?SenderStage::ExpandingPowers);
            let sources: BTreeMap<u32, Ciphertext> = request
                .powers
                .iter()
                .map(|(&power, cts)| (power, cts[bundle_idx].expand(he)))
                .collect();
            let powers = compute_batch_powers(
                &self.dag,
                sources,
                &self.pool,
                self.config.spin_limit,
                |a, b| he.multiply_relin(a, b, rk),
                |a| {
                    let mut ct = a.clone();
                    he.transform_to_ntt(&mut ct);
                    Ok(ct)
                },
            )?;

            debug!(bundle_idx, bundles = bundles.len(), stage = ?SenderStage::Evaluating);
            let seeds: Vec<[u8; 32]> = bundles.iter().map(|_| rng.gen()).collect();
            let results = self.pool.install(|| {
                bundles
                    .par_iter()
                    .zip(seeds.par_iter())
                    .map(|(bundle, seed)| bundle.evaluate(he, &powers, rk, *seed))
                    .collect::<Result<Vec<_>>>()
            })?;

            debug!(bundle_idx, stage = ?SenderStage::Responding);
            for (instance, result) in results.into_iter().enumerate() {
                let kinds = std::iter::once(PackageKind::Matching)
                    .chain((0..result.labels.len() as u32).map(PackageKind::Label));
                let cts = std::iter::once(result.matching).chain(result.labels);
                for (kind, mut ciphertext) in kinds.zip(cts) {
                    he.mod_switch_to_last(&mut ciphertext)?;
                    packages.push(ResultPackage {
                        bundle_idx: bundle_idx as u32,
                        bundle_instance: instance as u32,
                        kind,
                        ciphertext,
                    });
                }
            }
        }

        info!(
            packages = packages.len(),
            elapsed = ?start.elapsed(),
            "query answered"
        );
        debug!(stage = ?SenderStage::AwaitingQuery);
        Ok(QueryResponse {
            label_byte_count: self.db.label_byte_count() as u32,
            packages,
        })
    }
}
