use std::path::PathBuf;

use chrono::{Datelike, TimeZone, Utc};
use itlog_adapters::{adapter_for_kind, read_json_records, SourceKind};
use itlog_core::Cost;
use itlog_storage::FixtureFetcher;

fn fixtures_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .canonicalize()
        .expect("fixtures root")
}

#[test]
fn every_source_has_a_fixture_collection() {
    for kind in SourceKind::ALL {
        let path = fixtures_root().join(kind.source_id()).join("records.json");
        let records = read_json_records(&path).expect("fixture records");
        assert!(!records.is_empty(), "{} fixture is empty", kind);
    }
}

#[tokio::test]
async fn helpdesk_fixture_normalizes_and_skips_unnumbered_records() {
    let fetcher = FixtureFetcher::new(fixtures_root());
    let adapter = adapter_for_kind(SourceKind::Helpdesk);
    let batch = adapter.fetch_drafts(&fetcher, "unused").await.unwrap();

    assert_eq!(batch.drafts.len(), 3);
    assert_eq!(batch.skipped, 1);

    let first = batch.drafts[0].clone().into_record().unwrap();
    assert_eq!(first.ticket_no, "HD-2025-0001");
    assert_eq!(first.fields.cost, Cost::from_cents(15050));
    assert_eq!(
        first.fields.created_date,
        Some(Utc.with_ymd_and_hms(2025, 3, 10, 8, 15, 0).unwrap())
    );

    let server = batch.drafts[1].clone().into_record().unwrap();
    assert_eq!(server.fields.cost.to_string(), "1200.00");
    assert_eq!(server.fields.solution, None);
    assert_eq!(server.fields.finished_date, None);
}

#[tokio::test]
async fn request_and_cctv_fixtures_carry_source_specific_details() {
    let fetcher = FixtureFetcher::new(fixtures_root());

    let requests = adapter_for_kind(SourceKind::AccessRequest)
        .fetch_drafts(&fetcher, "unused")
        .await
        .unwrap();
    let vpn = requests.drafts[0].clone().into_record().unwrap();
    assert_eq!(vpn.fields.details, "Request: VPN");
    assert_eq!(vpn.fields.cost, Cost::ZERO);

    let cctv = adapter_for_kind(SourceKind::CctvRequest)
        .fetch_drafts(&fetcher, "unused")
        .await
        .unwrap();
    let playback = cctv.drafts[0].clone().into_record().unwrap();
    assert_eq!(
        playback.fields.details,
        "Parking lot incident (Point: P2-04) [Period: 2025-07-19 18:00 - 20:00] [Head office]"
    );
    let install = cctv.drafts[1].clone().into_record().unwrap();
    assert_eq!(install.fields.details, "New camera at warehouse gate [Warehouse]");
    assert_eq!(install.fields.created_date.map(|d| d.month()), Some(12));
}
