//! Snapshot to parquet encoding.

use std::str::FromStr;
use std::sync::Arc;

use ahf_core::{AuctionListing, ConnectedRealm, Snapshot};
use arrow_array::types::Int8Type;
use arrow_array::{
    ArrayRef, BooleanArray, DictionaryArray, Int32Array, Int64Array, RecordBatch, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema, SchemaRef, TimeUnit};
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;

use crate::StorageError;

pub const DEFAULT_ROWS_PER_BATCH: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionCodec {
    #[default]
    Snappy,
    Zstd,
    Gzip,
    None,
}

impl CompressionCodec {
    fn to_parquet(self) -> Compression {
        match self {
            CompressionCodec::Snappy => Compression::SNAPPY,
            CompressionCodec::Zstd => Compression::ZSTD(ZstdLevel::default()),
            CompressionCodec::Gzip => Compression::GZIP(GzipLevel::default()),
            CompressionCodec::None => Compression::UNCOMPRESSED,
        }
    }
}

impl FromStr for CompressionCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "snappy" => Ok(CompressionCodec::Snappy),
            "zstd" => Ok(CompressionCodec::Zstd),
            "gzip" => Ok(CompressionCodec::Gzip),
            "none" | "uncompressed" => Ok(CompressionCodec::None),
            other => Err(format!("unsupported compression `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParquetOptions {
    pub compression: CompressionCodec,
    pub rows_per_batch: usize,
}

impl Default for ParquetOptions {
    fn default() -> Self {
        Self {
            compression: CompressionCodec::default(),
            rows_per_batch: DEFAULT_ROWS_PER_BATCH,
        }
    }
}

pub fn snapshot_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        ArrowField::new("auction_id", DataType::Int64, false),
        ArrowField::new("item_id", DataType::Int64, false),
        ArrowField::new("quantity", DataType::Int64, false),
        ArrowField::new("unit_price", DataType::Int64, true),
        ArrowField::new("buyout", DataType::Int64, true),
        ArrowField::new("bid", DataType::Int64, true),
        ArrowField::new("time_left", DataType::Utf8, false),
        ArrowField::new("bonus_lists", DataType::Utf8, false),
        ArrowField::new("modifiers", DataType::Utf8, false),
        ArrowField::new("region", DataType::Utf8, false),
        ArrowField::new("realm_id", DataType::Int64, false),
        ArrowField::new(
            "captured_at",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
        ArrowField::new("content_hash", DataType::Utf8, false),
        ArrowField::new("date", DataType::Utf8, false),
        ArrowField::new("hour", DataType::Utf8, false),
    ]))
}

fn listing_batch(
    schema: &SchemaRef,
    snapshot: &Snapshot,
    listings: &[AuctionListing],
) -> Result<RecordBatch, StorageError> {
    let rows = listings.len();
    let bonus_lists = listings
        .iter()
        .map(|l| serde_json::to_string(&l.bonus_lists))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StorageError::Encode(format!("bonus_lists: {e}")))?;
    let modifiers = listings
        .iter()
        .map(|l| serde_json::to_string(&l.modifiers))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StorageError::Encode(format!("modifiers: {e}")))?;

    let region = snapshot.region.as_str();
    let date = snapshot.captured_at.format("%Y-%m-%d").to_string();
    let hour = snapshot.captured_at.format("%H").to_string();
    let captured_at = snapshot.captured_at.timestamp_micros();

    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from_iter_values(listings.iter().map(|l| l.auction_id))),
        Arc::new(Int64Array::from_iter_values(listings.iter().map(|l| l.item_id))),
        Arc::new(Int64Array::from_iter_values(listings.iter().map(|l| l.quantity))),
        Arc::new(Int64Array::from(listings.iter().map(|l| l.unit_price).collect::<Vec<_>>())),
        Arc::new(Int64Array::from(listings.iter().map(|l| l.buyout).collect::<Vec<_>>())),
        Arc::new(Int64Array::from(listings.iter().map(|l| l.bid).collect::<Vec<_>>())),
        Arc::new(StringArray::from_iter_values(listings.iter().map(|l| l.time_left.as_str()))),
        Arc::new(StringArray::from(bonus_lists)),
        Arc::new(StringArray::from(modifiers)),
        Arc::new(StringArray::from(vec![region; rows])),
        Arc::new(Int64Array::from(vec![i64::from(snapshot.realm_id); rows])),
        Arc::new(TimestampMicrosecondArray::from(vec![captured_at; rows]).with_timezone("UTC")),
        Arc::new(StringArray::from(vec![snapshot.content_hash.as_str(); rows])),
        Arc::new(StringArray::from(vec![date.as_str(); rows])),
        Arc::new(StringArray::from(vec![hour.as_str(); rows])),
    ];

    RecordBatch::try_new(schema.clone(), columns)
        .map_err(|e| StorageError::Encode(format!("building auctions record batch: {e}")))
}

/// Serializes the whole snapshot into one in-memory parquet file.
///
/// Nothing is handed to a store until this returns, so a multipart upload is
/// only ever started for a fully serialized snapshot.
pub fn encode_snapshot(
    snapshot: &Snapshot,
    bucket: &str,
    options: ParquetOptions,
) -> Result<Vec<u8>, StorageError> {
    let schema = snapshot_schema();
    let kv_metadata = vec![
        KeyValue::new("ahf:region".to_string(), snapshot.region.to_string()),
        KeyValue::new("ahf:realm-id".to_string(), snapshot.realm_id.to_string()),
        KeyValue::new("ahf:bucket".to_string(), bucket.to_string()),
        KeyValue::new("ahf:content-hash".to_string(), snapshot.content_hash.clone()),
        KeyValue::new("ahf:captured-at".to_string(), snapshot.captured_at.to_rfc3339()),
        KeyValue::new("ahf:skipped-records".to_string(), snapshot.skipped.len().to_string()),
    ];
    let props = WriterProperties::builder()
        .set_compression(options.compression.to_parquet())
        .set_key_value_metadata(Some(kv_metadata))
        .set_created_by(format!("ah-feeder {}", env!("CARGO_PKG_VERSION")))
        .build();

    let mut writer = ArrowWriter::try_new(Vec::new(), schema.clone(), Some(props))
        .map_err(|e| StorageError::Encode(format!("creating parquet writer: {e}")))?;
    for chunk in snapshot.listings.chunks(options.rows_per_batch.max(1)) {
        let batch = listing_batch(&schema, snapshot, chunk)?;
        writer
            .write(&batch)
            .map_err(|e| StorageError::Encode(format!("writing parquet batch: {e}")))?;
    }
    writer
        .into_inner()
        .map_err(|e| StorageError::Encode(format!("closing parquet writer: {e}")))
}

fn dictionary_utf8() -> DataType {
    DataType::Dictionary(Box::new(DataType::Int8), Box::new(DataType::Utf8))
}

/// One row per connected realm; member realm names and slugs are comma-joined.
pub fn realm_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Int32, false),
        ArrowField::new("realm_names", DataType::Utf8, false),
        ArrowField::new("realm_slugs", DataType::Utf8, false),
        ArrowField::new("status", dictionary_utf8(), false),
        ArrowField::new("population", dictionary_utf8(), false),
        ArrowField::new("has_queue", DataType::Boolean, false),
    ]))
}

pub fn encode_connected_realms(
    realms: &[ConnectedRealm],
    options: ParquetOptions,
) -> Result<Vec<u8>, StorageError> {
    let schema = realm_schema();
    let ids = realms
        .iter()
        .map(|r| i32::try_from(r.id))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StorageError::Encode(format!("connected realm id: {e}")))?;

    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int32Array::from(ids)),
        Arc::new(StringArray::from_iter_values(realms.iter().map(|r| r.realm_names.join(",")))),
        Arc::new(StringArray::from_iter_values(realms.iter().map(|r| r.realm_slugs.join(",")))),
        Arc::new(realms.iter().map(|r| r.status.as_str()).collect::<DictionaryArray<Int8Type>>()),
        Arc::new(
            realms
                .iter()
                .map(|r| r.population.as_str())
                .collect::<DictionaryArray<Int8Type>>(),
        ),
        Arc::new(BooleanArray::from(realms.iter().map(|r| r.has_queue).collect::<Vec<_>>())),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns)
        .map_err(|e| StorageError::Encode(format!("building connected realm batch: {e}")))?;

    let props = WriterProperties::builder()
        .set_compression(options.compression.to_parquet())
        .set_created_by(format!("ah-feeder {}", env!("CARGO_PKG_VERSION")))
        .build();
    let mut writer = ArrowWriter::try_new(Vec::new(), schema, Some(props))
        .map_err(|e| StorageError::Encode(format!("creating parquet writer: {e}")))?;
    writer
        .write(&batch)
        .map_err(|e| StorageError::Encode(format!("writing parquet batch: {e}")))?;
    writer
        .into_inner()
        .map_err(|e| StorageError::Encode(format!("closing parquet writer: {e}")))
}
