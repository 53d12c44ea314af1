//! Receiver: builds encrypted queries and decrypts the Sender's answers.
//!
//! A query walks through
//!
//! ```text
//! Idle → Preprocessing → Hashing → Encoding → PowerEncrypting
//!      → AwaitingResponse → Decrypting → Done
//! ```
//!
//! where `Preprocessing` (the OPRF round) is skipped when the Sender's
//! database stores raw items. All per-query state lives in a
//! [`PendingQuery`] owned by the caller, so one `Receiver` can drive many
//! queries.

use std::collections::{BTreeMap, HashMap};

use rand::{CryptoRng, Rng};
use tracing::{debug, info, warn};

use crate::codec::FieldCodec;
use crate::cuckoo::CuckooTable;
use crate::dag::WindowingDag;
use crate::error::{malformed, Error, Result};
use crate::he::{HeContext, RelinKeys, SecretKey, SeededCiphertext};
use crate::item::{Felt, Item, Label};
use crate::math::ModArith;
use crate::messages::{OprfRequest, OprfResponse, PackageKind, QueryRequest, QueryResponse};
use crate::oprf::OprfReceiver;
use crate::params::PsiParams;

/// Progress of one [`PendingQuery`]. Operations called out of order fail
/// with `InvalidState`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStage {
    Idle,
    Preprocessing,
    Hashing,
    Encoding,
    PowerEncrypting,
    AwaitingResponse,
    Decrypting,
    Done,
}

/// Outcome for one query item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchRecord {
    pub found: bool,
    /// Zero-padded to the database's label length. `None` for misses and for
    /// unlabeled databases.
    pub label: Option<Label>,
}

impl MatchRecord {
    fn miss() -> Self {
        Self {
            found: false,
            label: None,
        }
    }
}

/// State of one query in flight.
pub struct PendingQuery {
    stage: QueryStage,
    /// Distinct query items, in first-seen order.
    unique: Vec<Item>,
    /// Position in `unique` of every original query item.
    index_of: Vec<usize>,
    /// Items as placed in the table: OPRF outputs or the raw items.
    hashed: Vec<Item>,
    oprf: Option<OprfReceiver>,
    table: Option<CuckooTable>,
}

impl PendingQuery {
    /// Current stage.
    pub fn stage(&self) -> QueryStage {
        self.stage
    }

    /// Number of distinct items in the query.
    pub fn unique_count(&self) -> usize {
        self.unique.len()
    }

    fn expect_stage(&self, expected: &[QueryStage], op: &str) -> Result<()> {
        if expected.contains(&self.stage) {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "{op} called in stage {:?}",
                self.stage
            )))
        }
    }

    fn advance(&mut self, stage: QueryStage) {
        debug!(from = ?self.stage, to = ?stage, "query stage");
        self.stage = stage;
    }
}

/// Decrypted slots of one bundle instance.
#[derive(Default)]
struct InstanceSlots {
    matching: Option<Vec<Felt>>,
    labels: BTreeMap<u32, Vec<Felt>>,
}

/// Query side of the protocol. Holds the secret key for every query it
/// creates.
pub struct Receiver {
    params: PsiParams,
    he: HeContext,
    codec: FieldCodec,
    dag: WindowingDag,
    secret_key: SecretKey,
    relin_keys: RelinKeys,
}

impl Receiver {
    /// Generates fresh keys for `params`.
    pub fn new<R: Rng + CryptoRng>(params: PsiParams, rng: &mut R) -> Result<Self> {
        params.validate()?;
        let he = HeContext::new(&params.he)?;
        let codec = FieldCodec::new(&params);
        let dag = WindowingDag::new(
            params.table.max_items_per_bin,
            params.query.window_base,
            params.query.ps_low_degree,
        )?;
        let secret_key = he.generate_secret_key(rng);
        let relin_keys = he.generate_relin_keys(&secret_key, rng);
        Ok(Self {
            params,
            he,
            codec,
            dag,
            secret_key,
            relin_keys,
        })
    }

    /// Parameters the Receiver was created with.
    pub fn params(&self) -> &PsiParams {
        &self.params
    }

    /// Encryption context.
    pub fn he(&self) -> &HeContext {
        &self.he
    }

    /// Relinearization keys sent along with each query.
    pub fn relin_keys(&self) -> &RelinKeys {
        &self.relin_keys
    }

    /// Starts a query. Repeated items are queried once and reported at every
    /// position they occur.
    pub fn begin_query(&self, items: &[Item]) -> PendingQuery {
        let mut position: HashMap<Item, usize> = HashMap::with_capacity(items.len());
        let mut unique = Vec::new();
        let index_of = items
            .iter()
            .map(|item| {
                *position.entry(*item).or_insert_with(|| {
                    unique.push(*item);
                    unique.len() - 1
                })
            })
            .collect();
        PendingQuery {
            stage: QueryStage::Idle,
            hashed: unique.clone(),
            unique,
            index_of,
            oprf: None,
            table: None,
        }
    }

    /// Blinds the query items for the OPRF round.
    pub fn create_oprf_request<R: Rng + CryptoRng>(
        &self,
        pending: &mut PendingQuery,
        rng: &mut R,
    ) -> Result<OprfRequest> {
        pending.expect_stage(&[QueryStage::Idle], "create_oprf_request")?;
        let (oprf, blinded) = OprfReceiver::new(&pending.unique, rng);
        pending.oprf = Some(oprf);
        pending.advance(QueryStage::Preprocessing);
        Ok(OprfRequest { blinded })
    }

    /// Unblinds the OPRF answers; the outputs replace the items in the
    /// cuckoo table.
    pub fn process_oprf_response(
        &self,
        pending: &mut PendingQuery,
        response: &OprfResponse,
    ) -> Result<()> {
        pending.expect_stage(&[QueryStage::Preprocessing], "process_oprf_response")?;
        let oprf = pending
            .oprf
            .take()
            .ok_or_else(|| Error::InvalidState("no OPRF round in progress".into()))?;
        pending.hashed = oprf.process_responses(&response.evaluated)?;
        pending.advance(QueryStage::Hashing);
        Ok(())
    }

    /// Places the items, packs them into slots and encrypts every source
    /// power of every batch.
    ///
    /// # Errors
    ///
    /// `CuckooTableFull` if the items cannot be placed, `InvalidState` if an
    /// OPRF round was started but not finished.
    pub fn create_query<R: Rng + CryptoRng>(
        &self,
        pending: &mut PendingQuery,
        rng: &mut R,
    ) -> Result<QueryRequest> {
        pending.expect_stage(&[QueryStage::Idle, QueryStage::Hashing], "create_query")?;
        if pending.stage == QueryStage::Idle {
            pending.advance(QueryStage::Hashing);
        }

        let table_params = &self.params.table;
        let mut table = CuckooTable::new(
            table_params.table_size as usize,
            table_params.hash_func_count as usize,
            table_params.max_probes as usize,
        );
        for (index, item) in pending.hashed.iter().enumerate() {
            table.insert(*item, index)?;
        }

        pending.advance(QueryStage::Encoding);
        let n = self.he.n();
        let mut batches = vec![vec![0 as Felt; n]; self.params.bundle_idx_count()];
        for (loc, entry) in table.entries() {
            let (bundle_idx, start_bin) = self.params.bundle_location(loc);
            let felts = self.codec.encode_item(&entry.item)?;
            batches[bundle_idx][start_bin..start_bin + felts.len()].copy_from_slice(&felts);
        }

        pending.advance(QueryStage::PowerEncrypting);
        let t = self.he.plain_modulus();
        let mut powers: BTreeMap<u32, Vec<SeededCiphertext>> = BTreeMap::new();
        for &power in self.dag.source_powers() {
            let cts = batches
                .iter()
                .map(|slots| {
                    let raised: Vec<Felt> = slots
                        .iter()
                        .map(|&y| ModArith::pow(y, power as u64, t))
                        .collect();
                    let pt = self.codec.batch(&self.he, &raised)?;
                    Ok(self.he.encrypt_symmetric(&pt, &self.secret_key, rng))
                })
                .collect::<Result<Vec<_>>>()?;
            powers.insert(power, cts);
        }

        info!(
            items = pending.unique.len(),
            batches = batches.len(),
            source_powers = powers.len(),
            "query created"
        );
        pending.table = Some(table);
        pending.advance(QueryStage::AwaitingResponse);
        Ok(QueryRequest {
            powers,
            relin_keys: self.relin_keys.clone(),
        })
    }

    fn decrypt_packages(
        &self,
        response: &QueryResponse,
    ) -> Result<HashMap<(u32, u32), InstanceSlots>> {
        let label_size = self.params.label_size(response.label_byte_count as usize) as u32;
        let bundle_idx_count = self.params.bundle_idx_count() as u32;
        let mut slots: HashMap<(u32, u32), InstanceSlots> = HashMap::new();
        for package in &response.packages {
            if package.bundle_idx >= bundle_idx_count {
                return Err(malformed!("bundle index {} out of range", package.bundle_idx));
            }
            if !package.ciphertext.is_well_formed(&self.he) {
                return Err(malformed!(
                    "ciphertext for bundle {} does not match parameters",
                    package.bundle_idx
                ));
            }
            let pt = self.he.decrypt(&package.ciphertext, &self.secret_key)?;
            let values = self.codec.unbatch(&self.he, &pt);
            let entry = slots
                .entry((package.bundle_idx, package.bundle_instance))
                .or_default();
            let duplicate = match package.kind {
                PackageKind::Matching => entry.matching.replace(values).is_some(),
                PackageKind::Label(part) if part < label_size => {
                    entry.labels.insert(part, values).is_some()
                }
                PackageKind::Label(part) => {
                    return Err(malformed!("label part {part} out of range {label_size}"));
                }
            };
            if duplicate {
                return Err(malformed!(
                    "repeated {:?} package for bundle {} instance {}",
                    package.kind,
                    package.bundle_idx,
                    package.bundle_instance
                ));
            }
        }
        Ok(slots)
    }

    /// Decrypts the Sender's answer into one record per original query item,
    /// in query order.
    ///
    /// A rejected response leaves the query awaiting its response, so it can
    /// be retried with another one.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the query is awaiting its response,
    /// `MalformedMessage` for packages that do not fit the parameters.
    pub fn process_response(
        &self,
        pending: &mut PendingQuery,
        response: &QueryResponse,
    ) -> Result<Vec<MatchRecord>> {
        pending.expect_stage(&[QueryStage::AwaitingResponse], "process_response")?;
        pending.advance(QueryStage::Decrypting);
        match self.match_records(pending, response) {
            Ok(records) => {
                pending.advance(QueryStage::Done);
                Ok(records)
            }
            Err(e) => {
                pending.advance(QueryStage::AwaitingResponse);
                Err(e)
            }
        }
    }

    fn match_records(
        &self,
        pending: &PendingQuery,
        response: &QueryResponse,
    ) -> Result<Vec<MatchRecord>> {
        let label_byte_count = response.label_byte_count as usize;
        let label_size = self.params.label_size(label_byte_count) as u32;
        let slots = self.decrypt_packages(response)?;
        let table = pending
            .table
            .as_ref()
            .ok_or_else(|| Error::InvalidState("query table missing".into()))?;
        let fpi = self.params.felts_per_item();

        let mut instances: BTreeMap<u32, Vec<&InstanceSlots>> = BTreeMap::new();
        for ((bundle_idx, _), instance) in &slots {
            instances.entry(*bundle_idx).or_default().push(instance);
        }

        let mut unique_records = Vec::with_capacity(pending.hashed.len());
        for item in &pending.hashed {
            let Some(loc) = table.query(item) else {
                warn!("query item missing from its own table");
                unique_records.push(MatchRecord::miss());
                continue;
            };
            let (bundle_idx, start) = self.params.bundle_location(loc);
            let span = start..start + fpi;

            let hit = instances
                .get(&(bundle_idx as u32))
                .into_iter()
                .flatten()
                .find(|inst| {
                    inst.matching
                        .as_ref()
                        .is_some_and(|m| m[span.clone()].iter().all(|&v| v == 0))
                });
            let record = match hit {
                None => MatchRecord::miss(),
                Some(_) if label_byte_count == 0 => MatchRecord {
                    found: true,
                    label: None,
                },
                Some(inst) => {
                    let parts: Vec<&Vec<Felt>> = (0..label_size)
                        .map(|p| {
                            inst.labels
                                .get(&p)
                                .ok_or_else(|| malformed!("label part {p} missing"))
                        })
                        .collect::<Result<_>>()?;
                    let per_bin: Vec<Vec<Felt>> = span
                        .clone()
                        .map(|bin| parts.iter().map(|part| part[bin]).collect())
                        .collect();
                    MatchRecord {
                        found: true,
                        label: Some(self.codec.decode_label(&per_bin, label_byte_count)?),
                    }
                }
            };
            unique_records.push(record);
        }

        let records: Vec<MatchRecord> = pending
            .index_of
            .iter()
            .map(|&i| unique_records[i].clone())
            .collect();
        info!(
            queried = records.len(),
            found = records.iter().filter(|r| r.found).count(),
            "response processed"
        );
        Ok(records)
    }
}
