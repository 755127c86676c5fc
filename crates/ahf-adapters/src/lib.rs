//! Normalization of raw Battle.net auction documents into typed listings.
//!
//! Record-level problems never fail a pull: a record that cannot be turned
//! into an [`AuctionListing`] becomes a [`SkippedRecord`] carrying a reason.
//! Only the aggregate skip rate of a finished snapshot can fail a cycle.

use std::collections::BTreeMap;
use std::str::FromStr;

use ahf_core::{AuctionListing, ConnectedRealm, ItemModifier, SkipReason, SkippedRecord, SnapshotBuilder, TimeLeft};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "ahf-adapters";

pub const DEFAULT_SKIP_THRESHOLD: f64 = 0.05;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("unexpected document shape: {0}")]
    UnexpectedShape(String),
    #[error(
        "schema drift: {skipped} of {total} records skipped (rate {rate:.4} > threshold {threshold:.4})"
    )]
    SchemaDrift {
        skipped: usize,
        total: usize,
        rate: f64,
        threshold: f64,
        breakdown: BTreeMap<SkipReason, usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    Listing(AuctionListing),
    Skipped(SkippedRecord),
}

/// Where the upstream document says the next page lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NextPage {
    Done,
    Href(String),
    Index(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawPage {
    pub records: Vec<JsonValue>,
    pub next: NextPage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageStats {
    pub accepted: usize,
    pub skipped: usize,
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    json_at(value, path)?.as_i64()
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

fn json_i64_vec(value: &JsonValue, path: &[&str]) -> Vec<i64> {
    json_at(value, path)
        .and_then(JsonValue::as_array)
        .map(|arr| arr.iter().filter_map(JsonValue::as_i64).collect())
        .unwrap_or_default()
}

fn json_modifiers(value: &JsonValue, path: &[&str]) -> Vec<ItemModifier> {
    json_at(value, path)
        .and_then(JsonValue::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|m| {
                    Some(ItemModifier {
                        kind: json_i64(m, &["type"])?,
                        value: json_i64(m, &["value"])?,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn skip(reason: SkipReason, auction_id: Option<i64>) -> Normalized {
    Normalized::Skipped(SkippedRecord { reason, auction_id })
}

/// Converts one raw auction record. Unknown fields are ignored.
pub fn normalize(raw: &JsonValue) -> Normalized {
    if !raw.is_object() {
        return skip(SkipReason::NotAnObject, None);
    }
    let Some(auction_id) = json_i64(raw, &["id"]) else {
        return skip(SkipReason::MissingAuctionId, None);
    };
    let id = Some(auction_id);
    let Some(item_id) = json_i64(raw, &["item", "id"]) else {
        return skip(SkipReason::MissingItemId, id);
    };
    let Some(quantity) = json_i64(raw, &["quantity"]) else {
        return skip(SkipReason::MissingQuantity, id);
    };
    if quantity <= 0 {
        return skip(SkipReason::NonPositiveQuantity, id);
    }
    let Some(time_left) = json_str(raw, &["time_left"]).and_then(|t| TimeLeft::from_str(t).ok()) else {
        return skip(SkipReason::InvalidTimeLeft, id);
    };

    let unit_price = json_i64(raw, &["unit_price"]);
    let buyout = json_i64(raw, &["buyout"]);
    let bid = json_i64(raw, &["bid"]);
    if unit_price.is_none() && buyout.is_none() && bid.is_none() {
        return skip(SkipReason::MissingPrice, id);
    }
    if [unit_price, buyout, bid].iter().flatten().any(|p| *p < 0) {
        return skip(SkipReason::NegativePrice, id);
    }

    Normalized::Listing(AuctionListing {
        auction_id,
        item_id,
        quantity,
        unit_price,
        buyout,
        bid,
        time_left,
        bonus_lists: json_i64_vec(raw, &["item", "bonus_lists"]),
        modifiers: json_modifiers(raw, &["item", "modifiers"]),
    })
}

/// Normalizes a page into the snapshot under construction, preserving arrival order.
pub fn normalize_page(builder: &mut SnapshotBuilder, records: &[JsonValue]) -> PageStats {
    let mut stats = PageStats::default();
    let skipped_before = builder.skipped_count();
    for raw in records {
        match normalize(raw) {
            Normalized::Listing(listing) => builder.push_listing(listing),
            Normalized::Skipped(skipped) => {
                debug!(reason = %skipped.reason, auction_id = ?skipped.auction_id, "skipping auction record");
                builder.push_skipped(skipped);
            }
        }
    }
    builder.record_page();
    stats.skipped = builder.skipped_count() - skipped_before;
    stats.accepted = records.len().saturating_sub(stats.skipped);
    if stats.skipped > 0 {
        warn!(
            region = %builder.region(),
            realm_id = builder.realm_id(),
            skipped = stats.skipped,
            accepted = stats.accepted,
            "page contained unusable auction records"
        );
    }
    stats
}

/// Splits an auctions document into its records and the next-page pointer.
///
/// Takes the body by value so the record array is moved out, not copied.
pub fn parse_page(mut body: JsonValue) -> Result<RawPage, NormalizeError> {
    if !body.is_object() {
        return Err(NormalizeError::UnexpectedShape(
            "auctions response is not a JSON object".to_string(),
        ));
    }

    let next = if let Some(href) = json_str(&body, &["_links", "next", "href"]) {
        NextPage::Href(href.to_string())
    } else {
        match (json_i64(&body, &["page"]), json_i64(&body, &["pageCount"])) {
            (Some(page), Some(count)) if page < count => u32::try_from(page + 1)
                .map(NextPage::Index)
                .unwrap_or(NextPage::Done),
            _ => NextPage::Done,
        }
    };

    let records = match body.get_mut("auctions").map(JsonValue::take) {
        Some(JsonValue::Array(items)) => items,
        // A realm with an empty auction house may omit the array entirely.
        None | Some(JsonValue::Null) => Vec::new(),
        Some(_) => {
            return Err(NormalizeError::UnexpectedShape(
                "`auctions` is not an array".to_string(),
            ))
        }
    };

    Ok(RawPage { records, next })
}

/// Extracts connected realm ids from `/data/wow/connected-realm/index`.
pub fn parse_realm_index(body: &JsonValue) -> Result<Vec<u32>, NormalizeError> {
    let entries = json_at(body, &["connected_realms"])
        .and_then(JsonValue::as_array)
        .ok_or_else(|| NormalizeError::UnexpectedShape("missing `connected_realms` array".to_string()))?;

    let mut ids = entries
        .iter()
        .filter_map(|entry| json_str(entry, &["href"]))
        .filter_map(realm_id_from_href)
        .collect::<Vec<_>>();
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

/// Reads `/data/wow/connected-realm/{id}`. Missing status, population or
/// queue flags fall back to `UP`, `MEDIUM` and `false`.
pub fn parse_connected_realm(body: &JsonValue) -> Result<ConnectedRealm, NormalizeError> {
    let id = json_i64(body, &["id"])
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| NormalizeError::UnexpectedShape("connected realm without a valid `id`".to_string()))?;

    let realms = json_at(body, &["realms"])
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let (realm_names, realm_slugs): (Vec<String>, Vec<String>) = realms
        .iter()
        .map(|realm| {
            (
                json_str(realm, &["name"]).unwrap_or_default().to_string(),
                json_str(realm, &["slug"]).unwrap_or_default().to_string(),
            )
        })
        .unzip();

    Ok(ConnectedRealm {
        id,
        realm_names,
        realm_slugs,
        status: json_str(body, &["status", "type"]).unwrap_or("UP").to_string(),
        population: json_str(body, &["population", "type"])
            .unwrap_or("MEDIUM")
            .to_string(),
        has_queue: json_at(body, &["has_queue"])
            .and_then(JsonValue::as_bool)
            .unwrap_or(false),
    })
}

fn realm_id_from_href(href: &str) -> Option<u32> {
    let (_, tail) = href.split_once("/connected-realm/")?;
    let digits = tail
        .split(|c: char| c == '?' || c == '/')
        .next()
        .unwrap_or_default();
    digits.parse().ok()
}

/// Fails when the fraction of skipped records is strictly above `threshold`.
pub fn check_skip_rate(
    listings: usize,
    skipped: usize,
    threshold: f64,
    breakdown: BTreeMap<SkipReason, usize>,
) -> Result<(), NormalizeError> {
    let total = listings + skipped;
    if total == 0 {
        return Ok(());
    }
    let rate = skipped as f64 / total as f64;
    if rate > threshold {
        return Err(NormalizeError::SchemaDrift {
            skipped,
            total,
            rate,
            threshold,
            breakdown,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahf_core::Region;
    use chrono::Utc;
    use serde_json::json;

    fn record(id: i64) -> JsonValue {
        json!({
            "id": id,
            "item": {"id": 19019, "bonus_lists": [6654, 1705], "modifiers": [{"type": 9, "value": 60}]},
            "quantity": 1,
            "buyout": 1_500_000,
            "bid": 1_200_000,
            "time_left": "VERY_LONG"
        })
    }

    #[test]
    fn normalizes_realm_auction_with_item_details() {
        let Normalized::Listing(listing) = normalize(&record(42)) else {
            panic!("expected listing");
        };
        assert_eq!(listing.auction_id, 42);
        assert_eq!(listing.item_id, 19019);
        assert_eq!(listing.buyout, Some(1_500_000));
        assert_eq!(listing.bid, Some(1_200_000));
        assert_eq!(listing.unit_price, None);
        assert_eq!(listing.time_left, TimeLeft::VeryLong);
        assert_eq!(listing.bonus_lists, vec![6654, 1705]);
        assert_eq!(listing.modifiers, vec![ItemModifier { kind: 9, value: 60 }]);
    }

    #[test]
    fn normalizes_commodity_with_unit_price_only() {
        let raw = json!({"id": 7, "item": {"id": 2589}, "quantity": 200, "unit_price": 1234, "time_left": "SHORT"});
        let Normalized::Listing(listing) = normalize(&raw) else {
            panic!("expected listing");
        };
        assert_eq!(listing.unit_price, Some(1234));
        assert!(listing.bonus_lists.is_empty());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let mut raw = record(1);
        raw["brand_new_field"] = json!({"nested": true});
        raw["item"]["context"] = json!(3);
        assert!(matches!(normalize(&raw), Normalized::Listing(_)));
    }

    #[test]
    fn malformed_records_are_classified_not_failed() {
        let cases = [
            (json!("nope"), SkipReason::NotAnObject),
            (json!({"item": {"id": 1}, "quantity": 1, "buyout": 1, "time_left": "LONG"}), SkipReason::MissingAuctionId),
            (json!({"id": 1, "quantity": 1, "buyout": 1, "time_left": "LONG"}), SkipReason::MissingItemId),
            (json!({"id": 1, "item": {"id": 1}, "buyout": 1, "time_left": "LONG"}), SkipReason::MissingQuantity),
            (json!({"id": 1, "item": {"id": 1}, "quantity": 0, "buyout": 1, "time_left": "LONG"}), SkipReason::NonPositiveQuantity),
            (json!({"id": 1, "item": {"id": 1}, "quantity": 1, "buyout": 1, "time_left": "FOREVER"}), SkipReason::InvalidTimeLeft),
            (json!({"id": 1, "item": {"id": 1}, "quantity": 1, "time_left": "LONG"}), SkipReason::MissingPrice),
            (json!({"id": 1, "item": {"id": 1}, "quantity": 1, "buyout": -5, "time_left": "LONG"}), SkipReason::NegativePrice),
        ];
        for (raw, expected) in cases {
            match normalize(&raw) {
                Normalized::Skipped(skipped) => assert_eq!(skipped.reason, expected, "{raw}"),
                Normalized::Listing(_) => panic!("expected skip for {raw}"),
            }
        }
    }

    #[test]
    fn normalize_page_counts_skips_and_duplicates() {
        let mut builder = SnapshotBuilder::new(Region::Eu, 1305, Utc::now());
        let records = vec![record(1), json!({"id": 2}), record(1), record(3)];
        let stats = normalize_page(&mut builder, &records);
        assert_eq!(stats, PageStats { accepted: 2, skipped: 2 });
        assert_eq!(builder.listing_count(), 2);
        assert_eq!(builder.page_count(), 1);
        let breakdown = builder.skip_breakdown();
        assert_eq!(breakdown.get(&SkipReason::MissingItemId), Some(&1));
        assert_eq!(breakdown.get(&SkipReason::DuplicateAuctionId), Some(&1));
    }

    #[test]
    fn parse_page_reads_link_and_index_cursors() {
        let linked = json!({"auctions": [record(1)], "_links": {"next": {"href": "https://x/next?page=2"}}});
        let page = parse_page(linked).unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.next, NextPage::Href("https://x/next?page=2".to_string()));

        let indexed = json!({"auctions": [], "page": 1, "pageCount": 3});
        assert_eq!(parse_page(indexed).unwrap().next, NextPage::Index(2));

        let last = json!({"auctions": [], "page": 3, "pageCount": 3});
        assert_eq!(parse_page(last).unwrap().next, NextPage::Done);

        let single = json!({"_links": {"self": {"href": "x"}}, "connected_realm": {"href": "y"}, "auctions": []});
        assert_eq!(parse_page(single).unwrap().next, NextPage::Done);
    }

    #[test]
    fn parse_page_moves_records_out_in_arrival_order() {
        let body = json!({"auctions": [record(3), record(1), record(2)], "page": 1, "pageCount": 1});
        let page = parse_page(body).unwrap();
        let ids: Vec<_> = page.records.iter().map(|r| r["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert_eq!(page.records[0], record(3));
        assert_eq!(page.next, NextPage::Done);
    }

    #[test]
    fn parse_page_rejects_non_array_auctions() {
        let err = parse_page(json!({"auctions": {"oops": 1}})).unwrap_err();
        assert!(matches!(err, NormalizeError::UnexpectedShape(_)));
    }

    #[test]
    fn parse_realm_index_extracts_sorted_ids() {
        let body = json!({
            "connected_realms": [
                {"href": "https://eu.api.blizzard.com/data/wow/connected-realm/3674?namespace=dynamic-eu"},
                {"href": "https://eu.api.blizzard.com/data/wow/connected-realm/1305?namespace=dynamic-eu"},
                {"href": "https://eu.api.blizzard.com/data/wow/connected-realm/1305?namespace=dynamic-eu"},
                {"href": "garbage"}
            ]
        });
        assert_eq!(parse_realm_index(&body).unwrap(), vec![1305, 3674]);
    }

    #[test]
    fn connected_realm_detail_is_flattened() {
        let body = json!({
            "id": 1305,
            "has_queue": true,
            "status": {"type": "UP", "name": "Up"},
            "population": {"type": "FULL", "name": "Full"},
            "realms": [
                {"id": 1305, "name": "Kazzak", "slug": "kazzak"},
                {"id": 1306, "name": "Ravencrest", "slug": "ravencrest"}
            ]
        });
        let realm = parse_connected_realm(&body).unwrap();
        assert_eq!(realm.id, 1305);
        assert_eq!(realm.realm_names, vec!["Kazzak", "Ravencrest"]);
        assert_eq!(realm.realm_slugs, vec!["kazzak", "ravencrest"]);
        assert_eq!(realm.population, "FULL");
        assert!(realm.has_queue);
    }

    #[test]
    fn connected_realm_defaults_missing_state() {
        let realm = parse_connected_realm(&json!({"id": 7, "realms": []})).unwrap();
        assert_eq!(realm.status, "UP");
        assert_eq!(realm.population, "MEDIUM");
        assert!(!realm.has_queue);
        assert!(realm.realm_names.is_empty());

        let err = parse_connected_realm(&json!({"realms": []})).unwrap_err();
        assert!(matches!(err, NormalizeError::UnexpectedShape(_)));
    }

    #[test]
    fn skip_threshold_is_strictly_greater_than() {
        assert!(check_skip_rate(95, 5, 0.05, BTreeMap::new()).is_ok());
        let err = check_skip_rate(94, 6, 0.05, BTreeMap::new()).unwrap_err();
        match err {
            NormalizeError::SchemaDrift { skipped, total, .. } => {
                assert_eq!((skipped, total), (6, 100));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(check_skip_rate(0, 0, 0.0, BTreeMap::new()).is_ok());
    }
}
