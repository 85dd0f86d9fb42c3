//! End-to-end scenarios through the public API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use radar_core::decoder::{decode_frame, AdFlags, AdRecord, ContactHash};
use radar_core::filter::Predicate;
use radar_core::pipeline::{
    BatchContext, ChannelNotifier, Pipeline, PipelineWorker, RawScan, WorkerEvent,
};
use radar_core::storage::{
    database_info, last_batch, ContactStore, DeviceStore, InMemoryStore, RadarProfile,
};
use radar_core::{PipelineConfig, RadarError};

const FLAGS_AND_APPLE: [u8; 9] = [0x02, 0x01, 0x06, 0x05, 0xFF, 0x4C, 0x00, 0x10, 0x5A];

fn scan(address: &str, raw: &[u8], at: i64) -> RawScan {
    RawScan {
        address: address.to_string(),
        raw: raw.to_vec(),
        rssi: Some(-55),
        timestamp_ms: at,
        ..Default::default()
    }
}

/// Manufacturer element carrying one AirDrop message with the given hashes.
fn airdrop_frame(hashes: &[u16]) -> Vec<u8> {
    let mut body = vec![0u8; 18];
    body[8] = 0x01;
    for (i, h) in hashes.iter().take(4).enumerate() {
        body[9 + i * 2..11 + i * 2].copy_from_slice(&h.to_be_bytes());
    }
    let mut payload = vec![0x4C, 0x00, 0x05, 18];
    payload.extend_from_slice(&body);
    let mut raw = vec![0x02, 0x01, 0x06, (payload.len() + 1) as u8, 0xFF];
    raw.extend_from_slice(&payload);
    raw
}

fn apple_profile(cooldown_ms: u64) -> RadarProfile {
    RadarProfile {
        id: 1,
        name: "apple nearby".to_string(),
        description: Some("any Apple device".to_string()),
        is_active: true,
        detect_filter: Some(Predicate::manufacturer(76)),
        cooldown_ms,
    }
}

fn setup() -> (Arc<InMemoryStore>, Pipeline) {
    let store = Arc::new(InMemoryStore::new());
    let pipeline = Pipeline::new(store.clone(), PipelineConfig::default());
    (store, pipeline)
}

#[test]
fn test_flags_and_manufacturer_frame() {
    let frame = decode_frame(&FLAGS_AND_APPLE);
    assert!(!frame.is_truncated());
    assert_eq!(
        frame.records,
        vec![
            AdRecord::Flags(AdFlags(0x06)),
            AdRecord::ManufacturerData {
                company_id: 76,
                payload: vec![0x10, 0x5A],
            },
        ]
    );
}

#[test]
fn test_merge_scenario() {
    let (store, pipeline) = setup();

    pipeline
        .process_batch(&BatchContext::new(), vec![scan("AA:BB", &FLAGS_AND_APPLE, 1_000)])
        .unwrap();
    let record = store.get_device("AA:BB").unwrap().unwrap();
    assert_eq!(record.first_seen_ms, 1_000);
    assert_eq!(record.last_seen_ms, 1_000);
    assert_eq!(record.detect_count, 1);

    pipeline
        .process_batch(&BatchContext::new(), vec![scan("AA:BB", &FLAGS_AND_APPLE, 2_000)])
        .unwrap();
    let record = store.get_device("AA:BB").unwrap().unwrap();
    assert_eq!(record.first_seen_ms, 1_000);
    assert_eq!(record.last_seen_ms, 2_000);
    assert_eq!(record.detect_count, 2);
    assert_eq!(record.raw_data(), Some(FLAGS_AND_APPLE.to_vec()));
}

#[test]
fn test_match_scenario() {
    let (store, pipeline) = setup();
    store.load_profiles(vec![apple_profile(5_000)]);

    let mut fired = Vec::new();
    for t in [1_000, 3_000, 6_500] {
        let result = pipeline
            .process_batch(&BatchContext::new(), vec![scan("AA:BB", &FLAGS_AND_APPLE, t)])
            .unwrap();
        fired.push(result.detections.len());
    }
    assert_eq!(fired, vec![1, 0, 1]);
    let times: Vec<i64> = store
        .all_detections()
        .iter()
        .map(|d| d.trigger_time_ms)
        .collect();
    assert_eq!(times, vec![1_000, 6_500]);
}

#[test]
fn test_contacts_follow_the_latest_address() {
    let (store, pipeline) = setup();
    pipeline
        .process_batch(
            &BatchContext::new(),
            vec![
                scan("AA", &airdrop_frame(&[0x1111, 0x2222]), 1_000),
                scan("BB", &airdrop_frame(&[0x2222]), 2_000),
            ],
        )
        .unwrap();

    let found = store
        .associations_by_hashes(&[ContactHash(0x1111), ContactHash(0x2222), ContactHash(0x9999)])
        .unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(store.get_contact(ContactHash(0x1111)).unwrap().unwrap().address, "AA");
    assert_eq!(store.get_contact(ContactHash(0x2222)).unwrap().unwrap().address, "BB");

    // Filter by contact on the read path
    let with_shared = pipeline
        .filtered_devices(
            vec![Predicate::AirdropContact {
                hash: ContactHash(0x2222),
            }],
            None,
            2_000,
        )
        .unwrap();
    let addresses: Vec<&str> = with_shared.iter().map(|r| r.address.as_str()).collect();
    assert_eq!(addresses, vec!["AA", "BB"]);
}

#[test]
fn test_delete_then_collect_orphaned_contacts() {
    let (store, pipeline) = setup();
    pipeline
        .process_batch(
            &BatchContext::new(),
            vec![
                scan("AA", &airdrop_frame(&[0x0A0A]), 1_000),
                scan("BB", &airdrop_frame(&[0x0B0B]), 1_500),
            ],
        )
        .unwrap();

    assert_eq!(store.delete_devices(&["AA".to_string()]).unwrap(), 1);
    assert_eq!(pipeline.merge_engine().clear_unassociated_contacts().unwrap(), 1);

    let info = database_info(store.as_ref()).unwrap();
    assert_eq!(info.device_count, 1);
    assert_eq!(info.contact_count, 1);

    let latest = last_batch(store.as_ref()).unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].address, "BB");
}

#[test]
fn test_collection_during_ingest_keeps_live_contacts() {
    let (store, pipeline) = setup();
    for i in 0..2_000 {
        store
            .upsert_device(&radar_core::DeviceRecord::new(&format!("PAD-{}", i), 0))
            .unwrap();
    }

    let stop = AtomicBool::new(false);
    std::thread::scope(|scope| {
        scope.spawn(|| {
            while !stop.load(Ordering::SeqCst) {
                pipeline.merge_engine().clear_unassociated_contacts().unwrap();
            }
        });
        for i in 0..300u16 {
            pipeline
                .process_batch(
                    &BatchContext::new(),
                    vec![scan(&format!("DEV-{}", i), &airdrop_frame(&[0x1000 + i]), 1_000)],
                )
                .unwrap();
        }
        stop.store(true, Ordering::SeqCst);
    });

    for i in 0..300u16 {
        let contact = store.get_contact(ContactHash(u32::from(0x1000 + i))).unwrap();
        assert_eq!(contact.map(|c| c.address), Some(format!("DEV-{}", i)));
    }
}

#[test]
fn test_partial_failure_retry_counts_once() {
    let (store, pipeline) = setup();
    store.limit_device_writes(1);

    let scans = vec![
        scan("AA", &FLAGS_AND_APPLE, 1_000),
        scan("BB", &FLAGS_AND_APPLE, 1_000),
    ];
    let failure = pipeline
        .process_batch(&BatchContext::new(), scans)
        .unwrap_err();
    assert!(failure.is_retryable());
    let retry: Vec<&str> = failure.scans.iter().map(|s| s.address.as_str()).collect();
    assert_eq!(retry, vec!["BB"]);

    store.limit_device_writes(usize::MAX);
    pipeline
        .process_batch(&BatchContext::new(), failure.scans)
        .unwrap();
    assert_eq!(store.get_device("AA").unwrap().unwrap().detect_count, 1);
    assert_eq!(store.get_device("BB").unwrap().unwrap().detect_count, 1);
}

#[test]
fn test_following_detection_is_filterable() {
    let (_, pipeline) = setup();
    pipeline
        .process_batch(
            &BatchContext::new(),
            vec![scan("AA", &FLAGS_AND_APPLE, 1), scan("BB", &FLAGS_AND_APPLE, 1)],
        )
        .unwrap();
    pipeline
        .merge_engine()
        .save_following_detection("BB", 99)
        .unwrap();

    let following = pipeline
        .filtered_devices(vec![Predicate::IsFollowing], None, 100)
        .unwrap();
    assert_eq!(following.len(), 1);
    assert_eq!(following[0].address, "BB");
}

#[test]
fn test_worker_reports_and_allows_retry() {
    let store = Arc::new(InMemoryStore::new());
    store.load_profiles(vec![apple_profile(0)]);
    let config = PipelineConfig::from_json_str(r#"{"shard_count": 3, "queue_capacity": 4}"#).unwrap();
    let pipeline = Arc::new(Pipeline::new(store.clone(), config));
    let (notifier, events) = ChannelNotifier::new();
    let worker = PipelineWorker::start(pipeline, Arc::new(notifier)).unwrap();

    store.set_available(false);
    worker
        .submit(vec![scan("AA", &FLAGS_AND_APPLE, 1), scan("BB", &FLAGS_AND_APPLE, 1)])
        .unwrap();
    let failed = match events.recv_timeout(Duration::from_secs(10)).unwrap() {
        WorkerEvent::Failed(failure) => failure,
        WorkerEvent::Completed(_) => panic!("store was offline"),
    };
    assert!(matches!(failed.error, RadarError::StoreUnavailable { .. }));

    store.set_available(true);
    worker.submit(failed.scans).unwrap();
    match events.recv_timeout(Duration::from_secs(10)).unwrap() {
        WorkerEvent::Completed(result) => {
            assert_eq!(result.received_count, 2);
            assert_eq!(result.detections.len(), 2);
        }
        WorkerEvent::Failed(f) => panic!("retry failed: {}", f.error),
    }
    worker.shutdown();
    assert_eq!(store.device_count().unwrap(), 2);
}
