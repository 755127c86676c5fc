// Golden test: the captured realm auctions document normalizes to the expected listings.

use std::fs;
use std::path::PathBuf;

use ahf_adapters::{normalize_page, parse_page, NextPage};
use ahf_core::{Region, SkippedRecord, SnapshotBuilder, TimeLeft};
use chrono::Utc;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ExpectedListing {
    auction_id: i64,
    item_id: i64,
    buyout: Option<i64>,
    time_left: TimeLeft,
}

#[derive(Debug, Deserialize)]
struct Expected {
    listings: Vec<ExpectedListing>,
    skipped: Vec<SkippedRecord>,
}

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/auctions/sample")
        .join(name)
}

#[test]
fn sample_realm_page_matches_golden_listings() {
    let body: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(fixture("page.json")).unwrap()).unwrap();
    let expected: Expected =
        serde_json::from_str(&fs::read_to_string(fixture("expected.json")).unwrap()).unwrap();

    let page = parse_page(body).unwrap();
    assert_eq!(page.next, NextPage::Done);

    let mut builder = SnapshotBuilder::new(Region::Eu, 1305, Utc::now());
    normalize_page(&mut builder, &page.records);
    let snapshot = builder.finalize();

    assert_eq!(snapshot.listings.len(), expected.listings.len());
    for (actual, want) in snapshot.listings.iter().zip(&expected.listings) {
        assert_eq!(actual.auction_id, want.auction_id);
        assert_eq!(actual.item_id, want.item_id);
        assert_eq!(actual.buyout, want.buyout);
        assert_eq!(actual.time_left, want.time_left);
    }
    assert_eq!(snapshot.skipped, expected.skipped);
    assert_eq!(snapshot.listings[0].bonus_lists, vec![8836, 8840, 8902]);
}
