use arrow::array::{Array, ArrayRef};
use arrow::ipc::reader::StreamReader;
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use ocss_core::{CoreError, DatasetError, DatasetRow};
use std::collections::BTreeMap;
use std::io::Cursor;
use tracing::debug;

const KNOWN_COLUMNS: [&str; 6] = ["id", "subreddit", "title", "selftext", "body", "created_utc"];

/// Decodes an Arrow IPC stream into dataset rows.
///
/// Submissions carry their text in `selftext`, comments in `body`; both end
/// up in [`DatasetRow::body`]. Nulls become empty strings.
pub fn decode_rows(bytes: &[u8]) -> Result<Vec<DatasetRow>, CoreError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    let reader = StreamReader::try_new(Cursor::new(bytes), None).map_err(invalid_payload)?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.map_err(invalid_payload)?;
        append_batch(&batch, &mut rows)?;
    }

    debug!("Decoded {} rows from arrow stream", rows.len());
    Ok(rows)
}

fn append_batch(batch: &RecordBatch, rows: &mut Vec<DatasetRow>) -> Result<(), CoreError> {
    let schema = batch.schema();
    let column = |name: &str| batch.column_by_name(name);

    let id = column("id");
    let subreddit = column("subreddit");
    let title = column("title");
    let selftext = column("selftext");
    let body = column("body");
    let created_utc = column("created_utc");

    let extras: Vec<(&str, &ArrayRef)> = schema
        .fields()
        .iter()
        .zip(batch.columns())
        .filter(|(field, _)| !KNOWN_COLUMNS.contains(&field.name().as_str()))
        .map(|(field, array)| (field.name().as_str(), array))
        .collect();

    for row in 0..batch.num_rows() {
        let text = match cell(selftext, row)? {
            s if !s.is_empty() => s,
            _ => cell(body, row)?,
        };

        let mut extra = BTreeMap::new();
        for (name, array) in &extras {
            extra.insert(name.to_string(), cell(Some(*array), row)?);
        }

        rows.push(DatasetRow {
            id: cell(id, row)?,
            subreddit: cell(subreddit, row)?,
            title: cell(title, row)?,
            body: text,
            created_utc: cell(created_utc, row)?,
            extra,
        });
    }
    Ok(())
}

fn cell(array: Option<&ArrayRef>, row: usize) -> Result<String, CoreError> {
    match array {
        Some(array) if !array.is_null(row) => {
            array_value_to_string(array, row).map_err(invalid_payload)
        }
        _ => Ok(String::new()),
    }
}

fn invalid_payload(e: arrow::error::ArrowError) -> CoreError {
    DatasetError::InvalidPayload {
        details: e.to_string(),
    }
    .into()
}
