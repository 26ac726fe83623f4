//! Trip schema and Arrow conversions.
//!
//! The flat dataset written by ingestion has one row per trip:
//!
//! | column | type | required |
//! |---|---|---|
//! | `route_id`, `user_id`, `model` | Utf8 | no |
//! | `travel_time`, `distance` | Float64 | no |
//! | `start_timestamp`, `end_timestamp` | Timestamp(µs) | yes |
//! | `path` | List<List<Float64>> | yes |
//!
//! Optional columns are omitted from a file when the source CSV does not have
//! them. Each `path` element is a three-value list `[timestamp, lat, lon]`.
//!
//! Readers in this module accept whatever the engine hands back (view string
//! types, missing optional columns) and produce plain Rust values, so no
//! Arrow type leaks past the serving layer.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, Float64Array, Float64Builder, ListArray, ListBuilder, RecordBatch,
    StringArray, TimestampMicrosecondArray,
};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::error::ArrowError;
use chrono::{DateTime, NaiveDateTime};
use snafu::prelude::*;

use crate::route::PathSample;

/// Trip identifier column.
pub const ROUTE_ID: &str = "route_id";
/// Rider identifier column.
pub const USER_ID: &str = "user_id";
/// Vehicle model column.
pub const MODEL: &str = "model";
/// Trip duration column.
pub const TRAVEL_TIME: &str = "travel_time";
/// Trip distance column.
pub const DISTANCE: &str = "distance";
/// Trip start column.
pub const START_TIMESTAMP: &str = "start_timestamp";
/// Trip end column.
pub const END_TIMESTAMP: &str = "end_timestamp";
/// Path column: list of `[timestamp, lat, lon]`.
pub const PATH: &str = "path";

/// Index of the latitude value inside one path element.
pub const SAMPLE_LAT_INDEX: usize = 1;
/// Index of the longitude value inside one path element.
pub const SAMPLE_LON_INDEX: usize = 2;

/// Descriptive columns that may be missing from a source export, in output order.
pub const OPTIONAL_TEXT_COLUMNS: [&str; 3] = [ROUTE_ID, USER_ID, MODEL];
/// Numeric descriptive columns that may be missing, in output order.
pub const OPTIONAL_NUMBER_COLUMNS: [&str; 2] = [TRAVEL_TIME, DISTANCE];

/// Errors reading trips back out of Arrow data.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TripError {
    /// A required column is not present.
    #[snafu(display("Missing required column '{column}'"))]
    MissingColumn {
        /// Column name.
        column: String,
    },

    /// A column has a type that cannot be read as expected.
    #[snafu(display("Column '{column}' has unexpected type {data_type}"))]
    ColumnType {
        /// Column name.
        column: String,
        /// The actual Arrow type.
        data_type: DataType,
    },

    /// A path element does not hold three non-null floats.
    #[snafu(display("Malformed path element at row {row}, sample {sample}"))]
    PathShape {
        /// Row in the batch.
        row: usize,
        /// Element position inside the path.
        sample: usize,
    },

    /// Arrow rejected a cast or batch construction.
    #[snafu(display("Arrow error: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: ArrowError,
    },
}

/// Result alias for trip conversions.
pub type TripResult<T> = Result<T, TripError>;

/// One trip as read back from the dataset.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Trip {
    /// Trip identifier.
    pub route_id: Option<String>,
    /// Rider identifier.
    pub user_id: Option<String>,
    /// Vehicle model.
    pub model: Option<String>,
    /// Duration as exported.
    pub travel_time: Option<f64>,
    /// Distance as exported.
    pub distance: Option<f64>,
    /// Trip start (UTC, naive).
    pub start_timestamp: Option<NaiveDateTime>,
    /// Trip end (UTC, naive).
    pub end_timestamp: Option<NaiveDateTime>,
    /// Ordered samples; never empty for rows that made it into the dataset.
    pub path: Vec<PathSample>,
}

/// Arrow type of one path element: `[timestamp, lat, lon]`.
pub fn sample_data_type() -> DataType {
    DataType::List(Arc::new(Field::new_list_field(DataType::Float64, true)))
}

/// Arrow type of the `path` column.
pub fn path_data_type() -> DataType {
    DataType::List(Arc::new(Field::new_list_field(sample_data_type(), true)))
}

/// Arrow type of the trip timestamp columns.
pub fn timestamp_data_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, None)
}

/// Full flat schema with every optional column present.
pub fn trip_schema() -> SchemaRef {
    let mut fields = Vec::with_capacity(8);
    for name in OPTIONAL_TEXT_COLUMNS {
        fields.push(Field::new(name, DataType::Utf8, true));
    }
    for name in OPTIONAL_NUMBER_COLUMNS {
        fields.push(Field::new(name, DataType::Float64, true));
    }
    fields.push(Field::new(START_TIMESTAMP, timestamp_data_type(), true));
    fields.push(Field::new(END_TIMESTAMP, timestamp_data_type(), true));
    fields.push(Field::new(PATH, path_data_type(), true));
    Arc::new(Schema::new(fields))
}

/// Build a `path` column from per-row sample lists.
pub fn path_array<'a>(paths: impl IntoIterator<Item = &'a [PathSample]>) -> ListArray {
    let mut builder = ListBuilder::new(ListBuilder::new(Float64Builder::new()));
    for path in paths {
        for sample in path {
            let inner = builder.values();
            inner.values().append_value(sample.timestamp);
            inner.values().append_value(sample.latitude);
            inner.values().append_value(sample.longitude);
            inner.append(true);
        }
        builder.append(true);
    }
    builder.finish()
}

fn as_list<'a>(column: &str, array: &'a dyn Array) -> TripResult<&'a ListArray> {
    array
        .as_any()
        .downcast_ref::<ListArray>()
        .ok_or_else(|| TripError::ColumnType {
            column: column.to_string(),
            data_type: array.data_type().clone(),
        })
}

fn read_sample(row: usize, index: usize, element: &ArrayRef) -> TripResult<PathSample> {
    let values = element
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| TripError::ColumnType {
            column: PATH.to_string(),
            data_type: element.data_type().clone(),
        })?;

    if values.len() < 3 || values.null_count() > 0 {
        return PathShapeSnafu { row, sample: index }.fail();
    }

    Ok(PathSample::new(
        values.value(0),
        values.value(SAMPLE_LAT_INDEX),
        values.value(SAMPLE_LON_INDEX),
    ))
}

/// Read every row of a `path` column. Null rows become empty paths.
pub fn paths_from_array(array: &dyn Array) -> TripResult<Vec<Vec<PathSample>>> {
    let outer = as_list(PATH, array)?;
    let mut out = Vec::with_capacity(outer.len());

    for row in 0..outer.len() {
        if outer.is_null(row) {
            out.push(Vec::new());
            continue;
        }

        let elements = outer.value(row);
        let elements = as_list(PATH, elements.as_ref())?;
        let mut path = Vec::with_capacity(elements.len());
        for index in 0..elements.len() {
            if elements.is_null(index) {
                return PathShapeSnafu { row, sample: index }.fail();
            }
            path.push(read_sample(row, index, &elements.value(index))?);
        }
        out.push(path);
    }

    Ok(out)
}

/// Latitude/longitude of the first sample of `row`, if the path has one.
///
/// Reads a single element instead of materializing the whole path.
pub fn first_position(paths: &ListArray, row: usize) -> Option<(f64, f64)> {
    if paths.is_null(row) {
        return None;
    }
    let elements = paths.value(row);
    let elements = elements.as_any().downcast_ref::<ListArray>()?;
    if elements.is_empty() || elements.is_null(0) {
        return None;
    }
    let first = elements.value(0);
    let values = first.as_any().downcast_ref::<Float64Array>()?;
    if values.len() < 3
        || values.is_null(SAMPLE_LAT_INDEX)
        || values.is_null(SAMPLE_LON_INDEX)
    {
        return None;
    }
    Some((values.value(SAMPLE_LAT_INDEX), values.value(SAMPLE_LON_INDEX)))
}

/// Cast a timestamp column to microseconds without timezone.
pub fn timestamps_micros(column: &str, array: &ArrayRef) -> TripResult<TimestampMicrosecondArray> {
    if !matches!(array.data_type(), DataType::Timestamp(_, _)) {
        return ColumnTypeSnafu {
            column,
            data_type: array.data_type().clone(),
        }
        .fail();
    }
    let casted = cast(array, &timestamp_data_type()).context(ArrowSnafu)?;
    Ok(casted
        .as_primitive::<arrow::datatypes::TimestampMicrosecondType>()
        .clone())
}

/// Convert microseconds since the epoch to a naive UTC timestamp.
pub fn naive_from_micros(micros: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_micros(micros).map(|dt| dt.naive_utc())
}

fn optional_strings(batch: &RecordBatch, name: &str) -> TripResult<Option<StringArray>> {
    let Some(array) = batch.column_by_name(name) else {
        return Ok(None);
    };
    let casted = cast(array, &DataType::Utf8).context(ArrowSnafu)?;
    Ok(Some(casted.as_string::<i32>().clone()))
}

fn optional_floats(batch: &RecordBatch, name: &str) -> TripResult<Option<Float64Array>> {
    let Some(array) = batch.column_by_name(name) else {
        return Ok(None);
    };
    let casted = cast(array, &DataType::Float64).context(ArrowSnafu)?;
    Ok(Some(casted.as_primitive::<arrow::datatypes::Float64Type>().clone()))
}

fn optional_timestamps(
    batch: &RecordBatch,
    name: &str,
) -> TripResult<Option<TimestampMicrosecondArray>> {
    batch
        .column_by_name(name)
        .map(|array| timestamps_micros(name, array))
        .transpose()
}

fn string_at(array: &Option<StringArray>, row: usize) -> Option<String> {
    array
        .as_ref()
        .filter(|a| a.is_valid(row))
        .map(|a| a.value(row).to_string())
}

fn float_at(array: &Option<Float64Array>, row: usize) -> Option<f64> {
    array.as_ref().filter(|a| a.is_valid(row)).map(|a| a.value(row))
}

fn timestamp_at(array: &Option<TimestampMicrosecondArray>, row: usize) -> Option<NaiveDateTime> {
    array
        .as_ref()
        .filter(|a| a.is_valid(row))
        .and_then(|a| naive_from_micros(a.value(row)))
}

/// Read trips out of a batch. Only `path` is required; any other column that
/// is absent comes back as `None`.
pub fn trips_from_batch(batch: &RecordBatch) -> TripResult<Vec<Trip>> {
    let path_col = batch
        .column_by_name(PATH)
        .context(MissingColumnSnafu { column: PATH })?;
    let paths = paths_from_array(path_col.as_ref())?;

    let route_ids = optional_strings(batch, ROUTE_ID)?;
    let user_ids = optional_strings(batch, USER_ID)?;
    let models = optional_strings(batch, MODEL)?;
    let travel_times = optional_floats(batch, TRAVEL_TIME)?;
    let distances = optional_floats(batch, DISTANCE)?;
    let starts = optional_timestamps(batch, START_TIMESTAMP)?;
    let ends = optional_timestamps(batch, END_TIMESTAMP)?;

    Ok(paths
        .into_iter()
        .enumerate()
        .map(|(row, path)| Trip {
            route_id: string_at(&route_ids, row),
            user_id: string_at(&user_ids, row),
            model: string_at(&models, row),
            travel_time: float_at(&travel_times, row),
            distance: float_at(&distances, row),
            start_timestamp: timestamp_at(&starts, row),
            end_timestamp: timestamp_at(&ends, row),
            path,
        })
        .collect())
}

/// Build a batch with the full [`trip_schema`] from trips.
pub fn trips_to_batch(trips: &[Trip]) -> TripResult<RecordBatch> {
    let micros = |ts: Option<NaiveDateTime>| ts.map(|ts| ts.and_utc().timestamp_micros());

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter(trips.iter().map(|t| t.route_id.as_deref()))),
        Arc::new(StringArray::from_iter(trips.iter().map(|t| t.user_id.as_deref()))),
        Arc::new(StringArray::from_iter(trips.iter().map(|t| t.model.as_deref()))),
        Arc::new(Float64Array::from_iter(trips.iter().map(|t| t.travel_time))),
        Arc::new(Float64Array::from_iter(trips.iter().map(|t| t.distance))),
        Arc::new(TimestampMicrosecondArray::from_iter(
            trips.iter().map(|t| micros(t.start_timestamp)),
        )),
        Arc::new(TimestampMicrosecondArray::from_iter(
            trips.iter().map(|t| micros(t.end_timestamp)),
        )),
        Arc::new(path_array(trips.iter().map(|t| t.path.as_slice()))),
    ];

    RecordBatch::try_new(trip_schema(), columns).context(ArrowSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 5, 1)
            .and_then(|d| d.and_hms_opt(h, m, s))
            .unwrap()
    }

    fn sample_trip(id: &str, lat: f64, lon: f64) -> Trip {
        Trip {
            route_id: Some(id.to_string()),
            user_id: Some("u1".to_string()),
            model: None,
            travel_time: Some(120.0),
            distance: None,
            start_timestamp: Some(ts(8, 0, 0)),
            end_timestamp: Some(ts(8, 2, 0)),
            path: vec![
                PathSample::new(1_682_928_000.0, lat, lon),
                PathSample::new(1_682_928_060.5, lat + 0.001, lon - 0.001),
            ],
        }
    }

    #[test]
    fn path_array_has_declared_type() {
        let arr = path_array([[PathSample::new(1.0, 2.0, 3.0)].as_slice()]);
        assert_eq!(arr.data_type(), &path_data_type());
    }

    #[test]
    fn trips_survive_batch_conversion() -> TripResult<()> {
        let trips = vec![sample_trip("a", 47.6, -122.3), sample_trip("b", 40.7, -74.0)];
        let batch = trips_to_batch(&trips)?;
        assert_eq!(batch.schema(), trip_schema());

        let back = trips_from_batch(&batch)?;
        assert_eq!(back, trips);
        Ok(())
    }

    #[test]
    fn missing_optional_columns_read_as_none() -> TripResult<()> {
        let trips = vec![sample_trip("a", 47.6, -122.3)];
        let full = trips_to_batch(&trips)?;
        let keep: Vec<usize> = [START_TIMESTAMP, PATH]
            .iter()
            .map(|name| full.schema().index_of(name).unwrap())
            .collect();
        let narrow = full.project(&keep).context(ArrowSnafu)?;

        let back = trips_from_batch(&narrow)?;
        assert_eq!(back[0].route_id, None);
        assert_eq!(back[0].end_timestamp, None);
        assert_eq!(back[0].start_timestamp, Some(ts(8, 0, 0)));
        assert_eq!(back[0].path, trips[0].path);
        Ok(())
    }

    #[test]
    fn first_position_reads_only_the_first_sample() -> TripResult<()> {
        let paths = path_array([
            [PathSample::new(0.0, 47.61, -122.31), PathSample::new(1.0, 10.0, 10.0)].as_slice(),
            [].as_slice(),
        ]);
        assert_eq!(first_position(&paths, 0), Some((47.61, -122.31)));
        assert_eq!(first_position(&paths, 1), None);
        Ok(())
    }

    #[test]
    fn short_path_element_is_an_error() {
        let mut builder = ListBuilder::new(ListBuilder::new(Float64Builder::new()));
        builder.values().values().append_value(1.0);
        builder.values().values().append_value(2.0);
        builder.values().append(true);
        builder.append(true);
        let arr = builder.finish();

        let err = paths_from_array(&arr).unwrap_err();
        assert!(matches!(err, TripError::PathShape { row: 0, sample: 0 }));
    }

    #[test]
    fn missing_path_column_is_an_error() {
        let schema = Arc::new(Schema::new(vec![Field::new(ROUTE_ID, DataType::Utf8, true)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(StringArray::from(vec![Some("a")])) as ArrayRef],
        )
        .unwrap();
        assert!(matches!(
            trips_from_batch(&batch),
            Err(TripError::MissingColumn { .. })
        ));
    }
}
