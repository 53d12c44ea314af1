//! Labeled private set intersection over batched homomorphic encryption.
//!
//! The Sender holds `(item, label)` pairs, the Receiver a set of query items.
//! After one (optionally two, with the OPRF) round trip the Receiver learns
//! which of its items the Sender holds and, for those, their labels.
//!
//! Key components:
//! - Bin bundles: per-bin matching and label-interpolation polynomials,
//!   batched into plaintexts ([`sender::BinBundle`])
//! - Windowing DAG: minimal-depth computation of all query powers from the
//!   few the Receiver encrypts, run by a worker pool ([`dag`])
//! - Protocol orchestration ([`Sender`], [`Receiver`])
//!
//! ```no_run
//! use std::sync::Arc;
//! use labeled_psi::{Item, PsiParams, Receiver, Sender, SenderConfig, SenderDb};
//!
//! let params = PsiParams::small_test();
//! let db = SenderDb::new(params.clone(), 0, false, None)?;
//! db.insert_items(&[Item::from(1u128), Item::from(2u128)])?;
//! let sender = Sender::new(Arc::new(db), SenderConfig::default())?;
//!
//! let mut rng = rand::thread_rng();
//! let receiver = Receiver::new(params, &mut rng)?;
//! let mut pending = receiver.begin_query(&[Item::from(2u128)]);
//! let request = receiver.create_query(&mut pending, &mut rng)?;
//! let response = sender.process_query(&request, &mut rng)?;
//! let records = receiver.process_response(&mut pending, &response)?;
//! assert!(records[0].found);
//! # Ok::<(), labeled_psi::Error>(())
//! ```

pub mod codec;
pub mod cuckoo;
pub mod dag;
pub mod error;
pub mod filter;
pub mod he;
pub mod item;
pub mod math;
pub mod messages;
pub mod oprf;
pub mod params;
pub mod receiver;
pub mod sender;

pub use codec::FieldCodec;
pub use dag::{compute_batch_powers, BatchPowers, WindowingDag};
pub use error::{BinInsertError, Error, Result};
pub use item::{Felt, Item, Label};
pub use messages::{OprfRequest, OprfResponse, QueryRequest, QueryResponse, ResultPackage};
pub use oprf::OprfKey;
pub use params::PsiParams;
pub use receiver::{MatchRecord, PendingQuery, QueryStage, Receiver};
pub use sender::{Sender, SenderConfig, SenderDb};
