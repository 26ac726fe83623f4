use scooter_trips_core::{CorpusMetadata, IntervalSummary};
use scooter_trips_datafusion::TripSample;
use tabled::{
    builder::Builder,
    settings::{Style, object::Rows, style::LineText, width::MinWidth},
};

fn render_table(label: &str, columns: &[&str], rows: &[Vec<String>]) -> String {
    if columns.is_empty() {
        return String::new();
    }

    const LABEL_OFFSET: usize = 6;
    let min_width = LABEL_OFFSET + label.len() + 4;

    let mut builder = Builder::default();
    builder.push_record(columns.iter().copied());
    for row in rows {
        builder.push_record(row);
    }

    let mut table = builder.build();

    table.with(Style::rounded());
    table.with(MinWidth::new(min_width));
    table.with(LineText::new(label, Rows::first()).offset(LABEL_OFFSET));
    // LineText re-estimates dimensions, so re-apply MinWidth afterwards.
    table.with(MinWidth::new(min_width));
    table.to_string()
}

fn or_dash(value: Option<&str>) -> String {
    value.unwrap_or("-").to_string()
}

pub fn render_stats(stats: &CorpusMetadata) -> String {
    let mut rows = vec![
        vec!["total_records".to_string(), stats.total_records.to_string()],
        vec!["start_date".to_string(), or_dash(stats.start_date.as_deref())],
        vec!["end_date".to_string(), or_dash(stats.end_date.as_deref())],
    ];
    if let Some(at) = stats.generated_at {
        rows.push(vec!["generated_at".to_string(), format!("{at:.3}")]);
    }
    render_table("Stats", &["field", "value"], &rows)
}

pub fn render_sample(samples: &[TripSample]) -> String {
    let rows: Vec<Vec<String>> = samples
        .iter()
        .map(|s| {
            let first = s
                .path
                .first()
                .map(|p| format!("{:.5}, {:.5}", p.latitude, p.longitude))
                .unwrap_or_else(|| "-".to_string());
            vec![
                or_dash(s.route_id.as_deref()),
                or_dash(s.start_timestamp.as_deref()),
                or_dash(s.end_timestamp.as_deref()),
                s.path.len().to_string(),
                first,
            ]
        })
        .collect();

    render_table(
        "Sample",
        &["route_id", "start", "end", "points", "first point"],
        &rows,
    )
}

pub fn render_intervals(summary: &IntervalSummary) -> String {
    let spread = vec![
        vec!["trips".to_string(), summary.trips.to_string()],
        vec!["intervals".to_string(), summary.intervals.to_string()],
        vec!["mean".to_string(), format!("{:.4} s", summary.mean)],
        vec!["median".to_string(), format!("{:.4} s", summary.median)],
        vec!["min".to_string(), format!("{:.4} s", summary.min)],
        vec!["max".to_string(), format!("{:.4} s", summary.max)],
    ];
    let common: Vec<Vec<String>> = summary
        .common
        .iter()
        .map(|c| vec![format!("{:.1} s", c.seconds), c.count.to_string()])
        .collect();

    format!(
        "{}\n{}",
        render_table("Intervals", &["field", "value"], &spread),
        render_table("Common", &["interval", "count"], &common)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use scooter_trips_core::PathSample;

    #[test]
    fn sample_table_lists_one_row_per_trip() {
        let samples = vec![
            TripSample {
                route_id: Some("r1".to_string()),
                start_timestamp: Some("2023-05-01T00:00:17.660000".to_string()),
                end_timestamp: None,
                path: vec![PathSample::new(1682899217.66, 47.6, -122.3)],
            },
            TripSample {
                route_id: None,
                start_timestamp: None,
                end_timestamp: None,
                path: Vec::new(),
            },
        ];
        let out = render_sample(&samples);
        assert!(out.contains("Sample"));
        assert!(out.contains("r1"));
        assert!(out.contains("47.60000, -122.30000"));
    }

    #[test]
    fn stats_table_shows_missing_dates_as_dash() {
        let out = render_stats(&CorpusMetadata::empty());
        assert!(out.contains("total_records"));
        assert!(out.contains("│ 0"));
        assert!(!out.contains("generated_at"));
    }

    #[test]
    fn interval_tables_list_spread_and_common_values() {
        let summary = IntervalSummary::from_intervals(2, vec![1.0, 1.0, 1.5]).unwrap();
        let out = render_intervals(&summary);
        assert!(out.contains("Intervals"));
        assert!(out.contains("1.1667 s"));
        assert!(out.contains("1.0 s"));
        assert!(out.contains("1.5 s"));
    }
}
