//! Parquet archive for the time series.
//!
//! Buffers rows and writes one Parquet file per flush under the archive
//! root. Within a buffer, rows are keyed by `(point, source_timestamp)` so
//! replays do not duplicate; across files, readers take the last record per
//! key (the files are append-only archives, not a random-access store).

use crate::{Result, TimeSeriesSink};
use arrow::array::{ArrayRef, Float64Array, Int64Array, StringArray, TimestampMillisecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gridflow_protocol::{PointRef, TimestampedValue};
use parking_lot::Mutex;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ParquetTimeSeriesSink {
    root: PathBuf,
    flush_rows: usize,
    schema: Arc<Schema>,
    buffer: Mutex<HashMap<(PointRef, DateTime<Utc>), TimestampedValue>>,
    file_seq: Mutex<u64>,
}

impl ParquetTimeSeriesSink {
    pub fn new(root: PathBuf, flush_rows: usize) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        info!("Parquet archive at {}", root.display());
        Ok(Self {
            root,
            flush_rows: flush_rows.max(1),
            schema: Arc::new(Self::schema()),
            buffer: Mutex::new(HashMap::new()),
            file_seq: Mutex::new(0),
        })
    }

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("point_kind", DataType::Utf8, false),
            Field::new("point_id", DataType::Int64, false),
            Field::new("tenant_id", DataType::Int64, false),
            Field::new("value_num", DataType::Float64, true),
            Field::new("value_text", DataType::Utf8, true),
            Field::new("quality", DataType::Utf8, false),
            Field::new(
                "ts_source",
                DataType::Timestamp(TimeUnit::Millisecond, None),
                false,
            ),
            Field::new(
                "ts_received",
                DataType::Timestamp(TimeUnit::Millisecond, None),
                false,
            ),
        ])
    }

    fn to_record_batch(&self, rows: &[TimestampedValue]) -> Result<RecordBatch> {
        let point_kind: StringArray = rows
            .iter()
            .map(|tv| match tv.point {
                PointRef::DataPoint(_) => Some("dp"),
                PointRef::VirtualPoint(_) => Some("vp"),
            })
            .collect();
        let point_id = Int64Array::from_iter_values(rows.iter().map(|tv| tv.point.as_i64()));
        let tenant_id = Int64Array::from_iter_values(rows.iter().map(|tv| tv.tenant_id.as_i64()));
        let value_num: Float64Array = rows.iter().map(|tv| tv.value.as_f64()).collect();
        let value_text: StringArray = rows
            .iter()
            .map(|tv| match &tv.value {
                gridflow_protocol::Value::Text(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        let quality: StringArray = rows.iter().map(|tv| Some(tv.quality.tag())).collect();
        let ts_source = TimestampMillisecondArray::from_iter_values(
            rows.iter().map(|tv| tv.source_timestamp.timestamp_millis()),
        );
        let ts_received = TimestampMillisecondArray::from_iter_values(
            rows.iter().map(|tv| tv.received_timestamp.timestamp_millis()),
        );

        let columns: Vec<ArrayRef> = vec![
            Arc::new(point_kind),
            Arc::new(point_id),
            Arc::new(tenant_id),
            Arc::new(value_num),
            Arc::new(value_text),
            Arc::new(quality),
            Arc::new(ts_source),
            Arc::new(ts_received),
        ];
        Ok(RecordBatch::try_new(Arc::clone(&self.schema), columns)?)
    }

    /// Write all buffered rows to a fresh file. No-op when empty.
    pub fn flush(&self) -> Result<Option<PathBuf>> {
        let rows: Vec<TimestampedValue> = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() {
                return Ok(None);
            }
            let mut rows: Vec<_> = buffer.drain().map(|(_, tv)| tv).collect();
            rows.sort_by_key(|tv| (tv.point, tv.source_timestamp));
            rows
        };

        let path = {
            let mut seq = self.file_seq.lock();
            *seq += 1;
            self.root.join(format!(
                "values-{}-{:06}.parquet",
                Utc::now().format("%Y%m%dT%H%M%S"),
                *seq
            ))
        };

        let batch = self.to_record_batch(&rows)?;
        let file = File::create(&path)?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(file, Arc::clone(&self.schema), Some(props))?;
        writer.write(&batch)?;
        writer.close()?;
        debug!("Flushed {} rows to {}", rows.len(), path.display());
        Ok(Some(path))
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }
}

#[async_trait]
impl TimeSeriesSink for ParquetTimeSeriesSink {
    async fn write_points(&self, batch: &[TimestampedValue]) -> Result<()> {
        let should_flush = {
            let mut buffer = self.buffer.lock();
            for tv in batch {
                buffer.insert((tv.point, tv.source_timestamp), tv.clone());
            }
            buffer.len() >= self.flush_rows
        };
        if should_flush {
            self.flush()?;
        }
        Ok(())
    }
}
