//! End-to-end labeled PSI tests
//!
//! Tests the full protocol: Insert → (OPRF) → Query → Evaluate → Decrypt

use std::io::{BufReader, Seek, SeekFrom};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

use labeled_psi::messages;
use labeled_psi::sender::{BinBundle, BundleShape};
use labeled_psi::{
    BinInsertError, Error, Item, MatchRecord, OprfKey, PsiParams, QueryResponse, QueryStage,
    Receiver, Sender, SenderConfig, SenderDb,
};

fn item(v: u128) -> Item {
    Item::from(v)
}

fn sender_for(db: SenderDb) -> Sender {
    let config = SenderConfig {
        thread_count: 4,
        spin_limit: 64,
    };
    Sender::new(Arc::new(db), config).unwrap()
}

fn run_query(sender: &Sender, items: &[Item], rng: &mut ChaCha20Rng) -> Vec<MatchRecord> {
    let receiver = Receiver::new(sender.db().params().clone(), rng).unwrap();
    let mut pending = receiver.begin_query(items);
    if sender.db().oprf_key().is_some() {
        let request = receiver.create_oprf_request(&mut pending, rng).unwrap();
        let response = sender.process_oprf(&request).unwrap();
        receiver.process_oprf_response(&mut pending, &response).unwrap();
    }
    let request = receiver.create_query(&mut pending, rng).unwrap();
    let response = sender.process_query(&request, rng).unwrap();
    let records = receiver.process_response(&mut pending, &response).unwrap();
    assert_eq!(pending.stage(), QueryStage::Done);
    records
}

fn found(records: &[MatchRecord]) -> Vec<bool> {
    records.iter().map(|r| r.found).collect()
}

fn labeled_db(params: PsiParams, label_bytes: usize, oprf: Option<OprfKey>) -> SenderDb {
    let db = SenderDb::new(params, label_bytes, false, oprf).unwrap();
    db.insert(&[
        (item(1), b"a".to_vec()),
        (item(2), b"b".to_vec()),
        (item(3), b"c".to_vec()),
    ])
    .unwrap();
    db
}

#[test]
fn test_e2e_unlabeled_membership() {
    let mut rng = ChaCha20Rng::seed_from_u64(100);
    let db = SenderDb::new(PsiParams::small_test(), 0, false, None).unwrap();
    db.insert_items(&[item(1), item(2), item(3)]).unwrap();
    let sender = sender_for(db);

    let records = run_query(&sender, &[item(2), item(5)], &mut rng);
    assert_eq!(found(&records), vec![true, false]);
    assert!(records.iter().all(|r| r.label.is_none()));
}

#[test]
fn test_e2e_labeled_lookup() {
    let mut rng = ChaCha20Rng::seed_from_u64(101);
    let sender = sender_for(labeled_db(PsiParams::small_test(), 1, None));

    let records = run_query(&sender, &[item(2)], &mut rng);
    assert_eq!(
        records,
        vec![MatchRecord {
            found: true,
            label: Some(b"b".to_vec()),
        }]
    );
}

#[test]
fn test_e2e_multi_part_labels() {
    let mut rng = ChaCha20Rng::seed_from_u64(102);
    let params = PsiParams::small_test();
    // 40 bytes need 3 label parts of 128 bits
    assert_eq!(params.label_size(40), 3);
    let db = SenderDb::new(params, 40, false, None).unwrap();
    let long: Vec<u8> = (0..40).map(|i| (i * 7 + 3) as u8).collect();
    db.insert(&[(item(10), long.clone()), (item(11), b"short".to_vec())])
        .unwrap();
    let sender = sender_for(db);

    let records = run_query(&sender, &[item(11), item(12), item(10)], &mut rng);
    assert_eq!(found(&records), vec![true, false, true]);

    let mut short = b"short".to_vec();
    short.resize(40, 0);
    assert_eq!(records[0].label.as_deref(), Some(&short[..]));
    assert_eq!(records[1].label, None);
    assert_eq!(records[2].label.as_deref(), Some(&long[..]));
}

#[test]
fn test_e2e_duplicate_insert_leaves_db_unchanged() {
    let mut rng = ChaCha20Rng::seed_from_u64(103);
    let db = labeled_db(PsiParams::small_test(), 1, None);
    let bundles = db.bin_bundle_count();

    assert!(matches!(
        db.insert(&[(item(4), b"d".to_vec()), (item(2), b"x".to_vec())]),
        Err(Error::DuplicateItem)
    ));
    assert_eq!(db.item_count(), 3);
    assert_eq!(db.bin_bundle_count(), bundles);
    assert!(!db.has_item(&item(4)).unwrap());
    assert_eq!(db.get_label(&item(2)).unwrap(), Some(b"b".to_vec()));

    let sender = sender_for(db);
    let records = run_query(&sender, &[item(2), item(4)], &mut rng);
    assert_eq!(records[0].label, Some(b"b".to_vec()));
    assert!(!records[1].found);
}

#[test]
fn test_bin_capacity_distinct_from_duplicate() {
    let shape = BundleShape {
        num_bins: 64,
        max_bin_size: 4,
        label_size: 0,
        ps_low_degree: 0,
        compressed: false,
    };
    let mut bundle = BinBundle::new(shape, 0.01);
    let run = |f: u64| -> Vec<(u64, Vec<u64>)> { (0..8).map(|k| (f * 10 + k, vec![])).collect() };
    for f in 1..=4 {
        bundle.multi_insert(&run(f), 8, false).unwrap();
    }
    let before = bundle.clone();

    let full = bundle.multi_insert(&run(5), 8, false);
    assert_eq!(full, Err(BinInsertError::BinFull { bin: 8, max: 4 }));
    assert!(bundle.multi_insert(&run(2), 16, false).is_ok());
    let dup_again = bundle.multi_insert(&run(2), 16, false);
    assert_eq!(dup_again, Err(BinInsertError::DuplicateFelt { bin: 16 }));
    assert_ne!(full, dup_again);
    assert_eq!(bundle.bin(8), before.bin(8));
}

#[test]
fn test_e2e_overflow_spills_into_new_bundles() {
    let mut rng = ChaCha20Rng::seed_from_u64(104);
    let db = SenderDb::new(PsiParams::small_test(), 2, false, None).unwrap();
    let data: Vec<(Item, Vec<u8>)> = (0..40u128)
        .map(|i| (item(1000 + i), vec![i as u8, 0xAA]))
        .collect();
    db.insert(&data).unwrap();
    // 40 items × up to 3 locations over 8 runs of 4-deep bins
    assert!(db.bin_bundle_count() > 1);
    let sender = sender_for(db);

    let query = [item(1000), item(1017), item(1039), item(7)];
    let records = run_query(&sender, &query, &mut rng);
    assert_eq!(found(&records), vec![true, true, true, false]);
    assert_eq!(records[0].label, Some(vec![0, 0xAA]));
    assert_eq!(records[1].label, Some(vec![17, 0xAA]));
    assert_eq!(records[2].label, Some(vec![39, 0xAA]));
}

#[test]
fn test_e2e_empty_database() {
    let mut rng = ChaCha20Rng::seed_from_u64(105);
    let db = SenderDb::new(PsiParams::small_test(), 4, false, None).unwrap();
    let sender = sender_for(db);

    let records = run_query(&sender, &[item(1), item(2), item(3)], &mut rng);
    assert_eq!(found(&records), vec![false, false, false]);
}

#[test]
fn test_e2e_paterson_stockmeyer_matches_plain() {
    for ps_low_degree in [1, 2] {
        let mut rng = ChaCha20Rng::seed_from_u64(106 + ps_low_degree as u64);
        let mut params = PsiParams::small_test();
        params.query.ps_low_degree = ps_low_degree;
        let sender = sender_for(labeled_db(params, 1, None));

        let records = run_query(&sender, &[item(3), item(9), item(1)], &mut rng);
        assert_eq!(found(&records), vec![true, false, true], "ps_low_degree {ps_low_degree}");
        assert_eq!(records[0].label, Some(b"c".to_vec()));
        assert_eq!(records[2].label, Some(b"a".to_vec()));
    }
}

#[test]
fn test_e2e_compressed_database() {
    let mut rng = ChaCha20Rng::seed_from_u64(108);
    let db = SenderDb::new(PsiParams::small_test(), 1, true, None).unwrap();
    db.insert(&[(item(1), b"a".to_vec()), (item(2), b"b".to_vec())])
        .unwrap();
    let sender = sender_for(db);

    let records = run_query(&sender, &[item(2), item(6)], &mut rng);
    assert_eq!(found(&records), vec![true, false]);
    assert_eq!(records[0].label, Some(b"b".to_vec()));
}

#[test]
fn test_e2e_with_oprf() {
    let mut rng = ChaCha20Rng::seed_from_u64(109);
    let key = OprfKey::random(&mut rng);
    let sender = sender_for(labeled_db(PsiParams::small_test(), 1, Some(key)));
    assert!(sender.db().has_item(&item(1)).unwrap());

    let records = run_query(&sender, &[item(1), item(8)], &mut rng);
    assert_eq!(found(&records), vec![true, false]);
    assert_eq!(records[0].label, Some(b"a".to_vec()));
}

#[test]
fn test_e2e_update_and_remove() {
    let mut rng = ChaCha20Rng::seed_from_u64(110);
    let db = labeled_db(PsiParams::small_test(), 1, None);
    db.insert_or_assign(&[(item(2), b"B".to_vec()), (item(4), b"d".to_vec())])
        .unwrap();
    assert_eq!(db.remove(&[item(1), item(99)]).unwrap(), 1);
    assert_eq!(db.item_count(), 3);
    let sender = sender_for(db);

    let records = run_query(&sender, &[item(1), item(2), item(4)], &mut rng);
    assert_eq!(found(&records), vec![false, true, true]);
    assert_eq!(records[1].label, Some(b"B".to_vec()));
    assert_eq!(records[2].label, Some(b"d".to_vec()));
}

#[test]
fn test_e2e_sender_maintenance() {
    let mut rng = ChaCha20Rng::seed_from_u64(115);
    let sender = sender_for(labeled_db(PsiParams::small_test(), 1, None));
    sender.insert(&[(item(4), b"d".to_vec())]).unwrap();
    sender.insert_items(&[]).unwrap();
    sender
        .insert_or_assign(&[(item(2), b"B".to_vec()), (item(5), b"e".to_vec())])
        .unwrap();
    assert_eq!(sender.remove(&[item(1), item(42)]).unwrap(), 1);
    assert!(matches!(
        sender.insert(&[(item(3), b"x".to_vec())]),
        Err(Error::DuplicateItem)
    ));
    assert_eq!(sender.db().item_count(), 4);

    let records = run_query(&sender, &[item(1), item(2), item(4), item(5)], &mut rng);
    assert_eq!(found(&records), vec![false, true, true, true]);
    assert_eq!(records[1].label, Some(b"B".to_vec()));
    assert_eq!(records[3].label, Some(b"e".to_vec()));

    sender.strip().unwrap();
    assert!(matches!(sender.remove(&[item(2)]), Err(Error::Stripped)));
    let records = run_query(&sender, &[item(4)], &mut rng);
    assert_eq!(records[0].label, Some(b"d".to_vec()));
}

#[test]
fn test_e2e_maintenance_alongside_queries() {
    const ROUNDS: u128 = 4;
    for thread_count in [1, 2, 8] {
        let config = SenderConfig {
            thread_count,
            spin_limit: 64,
        };
        let db = labeled_db(PsiParams::small_test(), 1, None);
        let sender = Arc::new(Sender::new(Arc::new(db), config).unwrap());
        let (tx, rx) = mpsc::channel();

        let query_sender = Arc::clone(&sender);
        let query_tx = tx.clone();
        let queries = thread::spawn(move || {
            let mut rng = ChaCha20Rng::seed_from_u64(116);
            for _ in 0..ROUNDS {
                let records = run_query(&query_sender, &[item(1), item(999)], &mut rng);
                let ok = records[0].label == Some(b"a".to_vec()) && !records[1].found;
                query_tx.send(ok).unwrap();
            }
        });
        let maintenance = thread::spawn(move || {
            for i in 0..ROUNDS {
                sender.insert(&[(item(1000 + i), vec![i as u8])]).unwrap();
                sender.insert_or_assign(&[(item(2), b"b".to_vec())]).unwrap();
                if i % 2 == 1 {
                    sender.remove(&[item(1000 + i - 1)]).unwrap();
                }
                tx.send(true).unwrap();
            }
        });

        for _ in 0..2 * ROUNDS {
            let ok = rx
                .recv_timeout(Duration::from_secs(120))
                .unwrap_or_else(|_| panic!("no progress with {thread_count} threads"));
            assert!(ok, "query saw wrong results with {thread_count} threads");
        }
        queries.join().unwrap();
        maintenance.join().unwrap();
    }
}

#[test]
fn test_e2e_repeated_query_items() {
    let mut rng = ChaCha20Rng::seed_from_u64(111);
    let sender = sender_for(labeled_db(PsiParams::small_test(), 1, None));

    let records = run_query(&sender, &[item(3), item(5), item(3)], &mut rng);
    assert_eq!(found(&records), vec![true, false, true]);
    assert_eq!(records[0], records[2]);
}

#[test]
fn test_e2e_save_load_and_strip() {
    let mut rng = ChaCha20Rng::seed_from_u64(112);
    let db = labeled_db(PsiParams::small_test(), 1, None);

    let mut file = tempfile::tempfile().unwrap();
    db.save(&mut file).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    let loaded = SenderDb::load(BufReader::new(file)).unwrap();
    assert_eq!(loaded.item_count(), 3);
    assert_eq!(loaded.get_label(&item(3)).unwrap(), Some(b"c".to_vec()));

    loaded.strip().unwrap();
    assert!(loaded.is_stripped());
    assert_eq!(loaded.item_count(), 3);
    assert!(matches!(loaded.has_item(&item(1)), Err(Error::Stripped)));
    assert!(matches!(
        loaded.insert(&[(item(9), b"z".to_vec())]),
        Err(Error::Stripped)
    ));

    let sender = sender_for(loaded);
    let records = run_query(&sender, &[item(1), item(7)], &mut rng);
    assert_eq!(found(&records), vec![true, false]);
    assert_eq!(records[0].label, Some(b"a".to_vec()));
}

#[test]
fn test_e2e_messages_survive_the_wire() {
    let mut rng = ChaCha20Rng::seed_from_u64(113);
    let sender = sender_for(labeled_db(PsiParams::small_test(), 1, None));
    let receiver = Receiver::new(PsiParams::small_test(), &mut rng).unwrap();

    let mut pending = receiver.begin_query(&[item(1)]);
    let request = receiver.create_query(&mut pending, &mut rng).unwrap();
    let request = messages::from_bytes(&messages::to_bytes(&request).unwrap()).unwrap();
    let response = sender.process_query(&request, &mut rng).unwrap();
    let response: QueryResponse =
        messages::from_bytes(&messages::to_bytes(&response).unwrap()).unwrap();

    let records = receiver.process_response(&mut pending, &response).unwrap();
    assert_eq!(records[0].label, Some(b"a".to_vec()));
}

#[test]
fn test_e2e_mismatched_parameters_rejected() {
    let mut rng = ChaCha20Rng::seed_from_u64(114);
    let sender = sender_for(labeled_db(PsiParams::small_test(), 1, None));

    let mut params = PsiParams::small_test();
    params.query.window_base = 4;
    let receiver = Receiver::new(params, &mut rng).unwrap();
    let mut pending = receiver.begin_query(&[item(1)]);
    let request = receiver.create_query(&mut pending, &mut rng).unwrap();
    assert!(matches!(
        sender.process_query(&request, &mut rng),
        Err(Error::MalformedMessage(_))
    ));
}
