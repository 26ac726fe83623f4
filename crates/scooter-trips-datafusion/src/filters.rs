//! Filter expressions over the trips table.
//!
//! Every user-supplied value enters the plan as a typed literal; nothing is
//! spliced into SQL text.

use chrono::{NaiveDate, NaiveDateTime};
use datafusion::functions_nested::expr_fn::{array_element, cardinality};
use datafusion::logical_expr::{Expr, col, lit};
use datafusion::scalar::ScalarValue;
use scooter_trips_core::partition::{GRID_LAT_KEY, GRID_LON_KEY, grid_cell};
use scooter_trips_core::trip::{END_TIMESTAMP, PATH, START_TIMESTAMP};

use crate::error::{EngineResult, InvalidYearSnafu};

/// 1-based list index of latitude within a path sample.
const LAT_ELEMENT: i64 = 2;
/// 1-based list index of longitude within a path sample.
const LON_ELEMENT: i64 = 3;

/// Literal for a naive UTC timestamp at microsecond precision.
pub fn timestamp_lit(ts: NaiveDateTime) -> Expr {
    lit(ScalarValue::TimestampMicrosecond(
        Some(ts.and_utc().timestamp_micros()),
        None,
    ))
}

/// `start_timestamp >= start`
pub fn starts_at_or_after(start: NaiveDateTime) -> Expr {
    col(START_TIMESTAMP).gt_eq(timestamp_lit(start))
}

/// `end_timestamp <= end`
pub fn ends_at_or_before(end: NaiveDateTime) -> Expr {
    col(END_TIMESTAMP).lt_eq(timestamp_lit(end))
}

/// Trips whose path has at least one sample.
pub fn has_path() -> Expr {
    cardinality(col(PATH)).gt(lit(0u64))
}

/// Trips starting in calendar year `year`.
pub fn starts_in_year(year: i32) -> EngineResult<Expr> {
    let bound = |y: i32| {
        NaiveDate::from_ymd_opt(y, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .ok_or_else(|| InvalidYearSnafu { year }.build())
    };
    let from = bound(year)?;
    let to = bound(year.saturating_add(1))?;
    Ok(col(START_TIMESTAMP)
        .gt_eq(timestamp_lit(from))
        .and(col(START_TIMESTAMP).lt(timestamp_lit(to))))
}

fn first_sample_element(index: i64) -> Expr {
    array_element(array_element(col(PATH), lit(1i64)), lit(index))
}

/// First path point inside the box (inclusive on all edges).
pub fn first_point_within(north: f64, south: f64, east: f64, west: f64) -> Expr {
    first_sample_element(LAT_ELEMENT)
        .between(lit(south), lit(north))
        .and(first_sample_element(LON_ELEMENT).between(lit(west), lit(east)))
}

/// Grid cells that can hold a first point inside the box.
///
/// Only meaningful against the partitioned layout.
pub fn grid_cells_within(north: f64, south: f64, east: f64, west: f64) -> Expr {
    col(GRID_LAT_KEY)
        .between(lit(grid_cell(south)), lit(grid_cell(north)))
        .and(col(GRID_LON_KEY).between(lit(grid_cell(west)), lit(grid_cell(east))))
}

/// AND together `filters`; `None` when empty.
pub fn conjunction(filters: impl IntoIterator<Item = Expr>) -> Option<Expr> {
    filters.into_iter().reduce(Expr::and)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrepresentable_years_are_rejected() {
        assert!(starts_in_year(2023).is_ok());
        assert!(matches!(
            starts_in_year(i32::MAX),
            Err(crate::error::EngineError::InvalidYear { year: i32::MAX })
        ));
    }

    #[test]
    fn grid_bounds_floor_both_edges() {
        let text = grid_cells_within(47.65, 47.55, -122.25, -122.35).to_string();
        assert!(text.contains("grid_lat BETWEEN Int32(475) AND Int32(476)"));
        assert!(text.contains("grid_lon BETWEEN Int32(-1224) AND Int32(-1223)"));
    }

    #[test]
    fn conjunction_of_nothing_is_none() {
        assert!(conjunction(Vec::new()).is_none());
        assert!(conjunction([has_path()]).is_some());
    }
}
