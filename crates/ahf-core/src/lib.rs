//! Core domain model for the auction house feeder.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "ahf-core";

/// Region-wide commodity auctions are stored under this pseudo realm id.
pub const COMMODITIES_REALM_ID: u32 = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown region `{0}` (expected one of us, eu, kr, tw, cn)")]
    Region(String),
    #[error("unknown time_left bucket `{0}`")]
    TimeLeft(String),
    #[error("invalid bucket granularity `{0}` (expected hour, day or minutes:N)")]
    Granularity(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Us,
    Eu,
    Kr,
    Tw,
    Cn,
}

impl Region {
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Us => "us",
            Region::Eu => "eu",
            Region::Kr => "kr",
            Region::Tw => "tw",
            Region::Cn => "cn",
        }
    }

    pub fn api_base_url(&self) -> String {
        match self {
            Region::Cn => "https://gateway.battlenet.com.cn".to_string(),
            other => format!("https://{}.api.blizzard.com", other.as_str()),
        }
    }

    pub fn token_url(&self) -> &'static str {
        match self {
            Region::Cn => "https://oauth.battlenet.com.cn/token",
            _ => "https://oauth.battle.net/token",
        }
    }

    pub fn dynamic_namespace(&self) -> String {
        format!("dynamic-{}", self.as_str())
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "us" => Ok(Region::Us),
            "eu" => Ok(Region::Eu),
            "kr" => Ok(Region::Kr),
            "tw" => Ok(Region::Tw),
            "cn" => Ok(Region::Cn),
            _ => Err(ParseError::Region(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeLeft {
    Short,
    Medium,
    Long,
    VeryLong,
}

impl TimeLeft {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeLeft::Short => "SHORT",
            TimeLeft::Medium => "MEDIUM",
            TimeLeft::Long => "LONG",
            TimeLeft::VeryLong => "VERY_LONG",
        }
    }
}

impl FromStr for TimeLeft {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SHORT" => Ok(TimeLeft::Short),
            "MEDIUM" => Ok(TimeLeft::Medium),
            "LONG" => Ok(TimeLeft::Long),
            "VERY_LONG" => Ok(TimeLeft::VeryLong),
            _ => Err(ParseError::TimeLeft(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemModifier {
    #[serde(rename = "type")]
    pub kind: i64,
    pub value: i64,
}

/// One active auction at pull time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctionListing {
    pub auction_id: i64,
    pub item_id: i64,
    pub quantity: i64,
    pub unit_price: Option<i64>,
    pub buyout: Option<i64>,
    pub bid: Option<i64>,
    pub time_left: TimeLeft,
    #[serde(default)]
    pub bonus_lists: Vec<i64>,
    #[serde(default)]
    pub modifiers: Vec<ItemModifier>,
}

impl AuctionListing {
    /// Fixed-order textual form fed into the snapshot content hash.
    fn canonical_line(&self) -> String {
        let price = |p: Option<i64>| p.map(|v| v.to_string()).unwrap_or_default();
        let bonus = self
            .bonus_lists
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let modifiers = self
            .modifiers
            .iter()
            .map(|m| format!("{}={}", m.kind, m.value))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}\n",
            self.auction_id,
            self.item_id,
            self.quantity,
            price(self.unit_price),
            price(self.buyout),
            price(self.bid),
            self.time_left.as_str(),
            bonus,
            modifiers
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotAnObject,
    MissingAuctionId,
    MissingItemId,
    MissingQuantity,
    NonPositiveQuantity,
    InvalidTimeLeft,
    MissingPrice,
    NegativePrice,
    DuplicateAuctionId,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NotAnObject => "not_an_object",
            SkipReason::MissingAuctionId => "missing_auction_id",
            SkipReason::MissingItemId => "missing_item_id",
            SkipReason::MissingQuantity => "missing_quantity",
            SkipReason::NonPositiveQuantity => "non_positive_quantity",
            SkipReason::InvalidTimeLeft => "invalid_time_left",
            SkipReason::MissingPrice => "missing_price",
            SkipReason::NegativePrice => "negative_price",
            SkipReason::DuplicateAuctionId => "duplicate_auction_id",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw record that could not be turned into an [`AuctionListing`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub reason: SkipReason,
    pub auction_id: Option<i64>,
}

/// Width of the time window that identifies one logical pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BucketGranularity {
    #[default]
    Hour,
    Day,
    Minutes(u32),
}

impl BucketGranularity {
    fn step_secs(&self) -> i64 {
        match self {
            BucketGranularity::Hour => 3_600,
            BucketGranularity::Day => 86_400,
            BucketGranularity::Minutes(m) => i64::from((*m).max(1)) * 60,
        }
    }

    pub fn bucket_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let secs = at.timestamp();
        let start = secs - secs.rem_euclid(self.step_secs());
        DateTime::from_timestamp(start, 0).unwrap_or(at)
    }

    /// Human-readable bucket identifier used in ledger keys.
    pub fn label(&self, at: DateTime<Utc>) -> String {
        let start = self.bucket_start(at);
        match self {
            BucketGranularity::Hour => start.format("%Y-%m-%dT%H").to_string(),
            BucketGranularity::Day => start.format("%Y-%m-%d").to_string(),
            BucketGranularity::Minutes(_) => start.format("%Y-%m-%dT%H%M").to_string(),
        }
    }
}

impl fmt::Display for BucketGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketGranularity::Hour => f.write_str("hour"),
            BucketGranularity::Day => f.write_str("day"),
            BucketGranularity::Minutes(m) => write!(f, "minutes:{m}"),
        }
    }
}

impl FromStr for BucketGranularity {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "hour" | "hourly" => return Ok(BucketGranularity::Hour),
            "day" | "daily" => return Ok(BucketGranularity::Day),
            _ => {}
        }
        lower
            .strip_prefix("minutes:")
            .and_then(|m| m.parse::<u32>().ok())
            .filter(|m| *m > 0 && 1_440 % *m == 0)
            .map(BucketGranularity::Minutes)
            .ok_or_else(|| ParseError::Granularity(s.to_string()))
    }
}

/// In-memory accumulation of one pull cycle, before the content hash exists.
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    region: Region,
    realm_id: u32,
    captured_at: DateTime<Utc>,
    listings: Vec<AuctionListing>,
    skipped: Vec<SkippedRecord>,
    seen_auction_ids: HashSet<i64>,
    pages: usize,
}

impl SnapshotBuilder {
    pub fn new(region: Region, realm_id: u32, captured_at: DateTime<Utc>) -> Self {
        Self {
            region,
            realm_id,
            captured_at,
            listings: Vec::new(),
            skipped: Vec::new(),
            seen_auction_ids: HashSet::new(),
            pages: 0,
        }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn realm_id(&self) -> u32 {
        self.realm_id
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Appends a listing in arrival order. A repeated auction id is recorded as skipped.
    pub fn push_listing(&mut self, listing: AuctionListing) {
        if !self.seen_auction_ids.insert(listing.auction_id) {
            self.skipped.push(SkippedRecord {
                reason: SkipReason::DuplicateAuctionId,
                auction_id: Some(listing.auction_id),
            });
            return;
        }
        self.listings.push(listing);
    }

    pub fn push_skipped(&mut self, skipped: SkippedRecord) {
        self.skipped.push(skipped);
    }

    pub fn record_page(&mut self) {
        self.pages += 1;
    }

    pub fn listing_count(&self) -> usize {
        self.listings.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    pub fn page_count(&self) -> usize {
        self.pages
    }

    pub fn skip_rate(&self) -> f64 {
        skip_rate(self.listings.len(), self.skipped.len())
    }

    pub fn skip_breakdown(&self) -> BTreeMap<SkipReason, usize> {
        breakdown(&self.skipped)
    }

    pub fn finalize(self) -> Snapshot {
        let content_hash = content_hash(&self.listings);
        Snapshot {
            region: self.region,
            realm_id: self.realm_id,
            captured_at: self.captured_at,
            listings: self.listings,
            skipped: self.skipped,
            pages: self.pages,
            content_hash,
        }
    }
}

/// The full, hashed auction house state for one (region, realm) at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub region: Region,
    pub realm_id: u32,
    pub captured_at: DateTime<Utc>,
    pub listings: Vec<AuctionListing>,
    pub skipped: Vec<SkippedRecord>,
    pub pages: usize,
    pub content_hash: String,
}

impl Snapshot {
    pub fn is_commodities(&self) -> bool {
        self.realm_id == COMMODITIES_REALM_ID
    }

    pub fn skip_rate(&self) -> f64 {
        skip_rate(self.listings.len(), self.skipped.len())
    }

    pub fn skip_breakdown(&self) -> BTreeMap<SkipReason, usize> {
        breakdown(&self.skipped)
    }

    pub fn run_key(&self, granularity: BucketGranularity) -> RunKey {
        RunKey {
            region: self.region,
            realm_id: self.realm_id,
            bucket: granularity.label(self.captured_at),
            revision: 0,
        }
    }
}

fn skip_rate(listings: usize, skipped: usize) -> f64 {
    let total = listings + skipped;
    if total == 0 {
        0.0
    } else {
        skipped as f64 / total as f64
    }
}

fn breakdown(skipped: &[SkippedRecord]) -> BTreeMap<SkipReason, usize> {
    let mut out = BTreeMap::new();
    for record in skipped {
        *out.entry(record.reason).or_default() += 1;
    }
    out
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Digest over the listing set, independent of page arrival order.
pub fn content_hash(listings: &[AuctionListing]) -> String {
    let mut ordered = listings.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|l| l.auction_id);
    let mut hasher = Sha256::new();
    for listing in ordered {
        hasher.update(listing.canonical_line().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Ledger identity of a committed snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunKey {
    pub region: Region,
    pub realm_id: u32,
    pub bucket: String,
    pub revision: u32,
}

impl RunKey {
    pub fn with_revision(&self, revision: u32) -> Self {
        Self {
            revision,
            ..self.clone()
        }
    }

    pub fn ledger_id(&self) -> String {
        format!(
            "{}/{}/{}#{}",
            self.region, self.realm_id, self.bucket, self.revision
        )
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.ledger_id())
    }
}

/// Where a committed snapshot file lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLocation {
    pub relative_path: String,
    pub uri: String,
}

impl fmt::Display for FileLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

/// Persisted fact that a snapshot was durably written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub key: RunKey,
    pub content_hash: String,
    pub file: FileLocation,
    pub written_at: DateTime<Utc>,
    pub listing_count: usize,
}

/// Reference data for one connected realm, refreshed alongside auction pulls.
///
/// `status` and `population` keep the upstream type strings (`UP`, `FULL`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedRealm {
    pub id: u32,
    pub realm_names: Vec<String>,
    pub realm_slugs: Vec<String>,
    pub status: String,
    pub population: String,
    pub has_queue: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    Transient,
    Permanent,
    SchemaDrift,
    Storage,
    Conflict,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::SchemaDrift => "schema_drift",
            ErrorKind::Storage => "storage",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn listing(auction_id: i64, buyout: Option<i64>) -> AuctionListing {
        AuctionListing {
            auction_id,
            item_id: 19019,
            quantity: 1,
            unit_price: None,
            buyout,
            bid: None,
            time_left: TimeLeft::Long,
            bonus_lists: vec![],
            modifiers: vec![],
        }
    }

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, s).single().unwrap()
    }

    #[test]
    fn content_hash_ignores_arrival_order() {
        let a = vec![listing(1, Some(100)), listing(2, Some(200))];
        let b = vec![listing(2, Some(200)), listing(1, Some(100))];
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn content_hash_is_sensitive_to_buyout() {
        let a = vec![listing(1, Some(100)), listing(2, Some(200))];
        let b = vec![listing(1, Some(100)), listing(2, Some(201))];
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn builder_preserves_arrival_order_and_rejects_duplicate_ids() {
        let mut builder = SnapshotBuilder::new(Region::Eu, 1305, ts(14, 5, 32));
        builder.push_listing(listing(9, Some(1)));
        builder.push_listing(listing(3, Some(1)));
        builder.push_listing(listing(9, Some(2)));
        let snapshot = builder.finalize();

        let ids = snapshot.listings.iter().map(|l| l.auction_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![9, 3]);
        assert_eq!(snapshot.skipped.len(), 1);
        assert_eq!(snapshot.skipped[0].reason, SkipReason::DuplicateAuctionId);
    }

    #[test]
    fn skip_rate_of_empty_snapshot_is_zero() {
        let builder = SnapshotBuilder::new(Region::Us, 1, ts(0, 0, 0));
        assert_eq!(builder.skip_rate(), 0.0);
    }

    #[test]
    fn bucket_labels_truncate_capture_time() {
        let at = ts(14, 37, 12);
        assert_eq!(BucketGranularity::Hour.label(at), "2024-01-15T14");
        assert_eq!(BucketGranularity::Day.label(at), "2024-01-15");
        assert_eq!(BucketGranularity::Minutes(15).label(at), "2024-01-15T1430");
        assert_eq!(BucketGranularity::Hour.bucket_start(at), ts(14, 0, 0));
    }

    #[test]
    fn granularity_parses_config_values() {
        assert_eq!("hour".parse::<BucketGranularity>(), Ok(BucketGranularity::Hour));
        assert_eq!("Daily".parse::<BucketGranularity>(), Ok(BucketGranularity::Day));
        assert_eq!(
            "minutes:30".parse::<BucketGranularity>(),
            Ok(BucketGranularity::Minutes(30))
        );
        assert!("minutes:7".parse::<BucketGranularity>().is_err());
        assert!("weekly".parse::<BucketGranularity>().is_err());
    }

    #[test]
    fn region_endpoints_follow_battle_net_layout() {
        assert_eq!(Region::Eu.api_base_url(), "https://eu.api.blizzard.com");
        assert_eq!(Region::Cn.api_base_url(), "https://gateway.battlenet.com.cn");
        assert_eq!(Region::Kr.dynamic_namespace(), "dynamic-kr");
        assert_eq!("TW".parse::<Region>(), Ok(Region::Tw));
    }

    #[test]
    fn run_key_ledger_id_includes_revision() {
        let snapshot = SnapshotBuilder::new(Region::Eu, 1305, ts(14, 5, 0)).finalize();
        let key = snapshot.run_key(BucketGranularity::Hour);
        assert_eq!(key.ledger_id(), "eu/1305/2024-01-15T14#0");
        assert_eq!(key.with_revision(2).ledger_id(), "eu/1305/2024-01-15T14#2");
    }
}
