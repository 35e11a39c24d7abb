//! Session comparison
//!
//! Both sessions are reduced to [`LogStats`]; every statistic becomes one
//! [`DeltaRow`] with `delta = right - left` and
//! `delta_percent = delta / left * 100`. A row improves when its delta percent
//! is below -2.5 and regresses above +2.5.

use super::Session;
use serde::Serialize;
use std::fmt::{self, Write as _};

/// Delta percent beyond which a row counts as changed
pub const SIGNIFICANCE_PERCENT: f64 = 2.5;

/// Summary statistics of one session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogStats {
    pub entries: i64,
    pub total_calls: i64,
    pub total_time: f64,
    pub mean_time_per_call: f64,
    pub mean_calls_per_cycle: f64,
    pub mean_time_per_cycle: f64,
    pub median_calls: i64,
    pub median_time: f64,
    pub max_time: f64,
    pub max_calls_per_cycle: i64,
}

impl LogStats {
    pub fn gather(session: &Session) -> Self {
        let entries = session.len();
        let calls: Vec<i64> = (0..entries)
            .map(|i| i64::from(session.calls_at(i)))
            .collect();

        let total_calls: i64 = calls.iter().sum();
        let total_time: f64 = session.durations.iter().sum();
        let per = |value: f64, count: f64| if count > 0.0 { value / count } else { 0.0 };

        let mut sorted_calls = calls.clone();
        sorted_calls.sort_unstable();

        Self {
            entries: entries as i64,
            total_calls,
            total_time,
            mean_time_per_call: per(total_time, total_calls as f64),
            mean_calls_per_cycle: per(total_calls as f64, entries as f64),
            mean_time_per_cycle: per(total_time, entries as f64),
            median_calls: sorted_calls.get(entries / 2).copied().unwrap_or(0),
            median_time: crate::aggregator::median(&session.durations),
            max_time: session.durations.iter().copied().fold(0.0, f64::max),
            max_calls_per_cycle: calls.iter().copied().max().unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RowValue {
    Int(i64),
    Float(f64),
}

impl RowValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            RowValue::Int(v) => *v as f64,
            RowValue::Float(v) => *v,
        }
    }
}

impl fmt::Display for RowValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowValue::Int(v) => write!(f, "{}", v),
            RowValue::Float(v) => write!(f, "{:.5}", v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaClass {
    Improvement,
    Regression,
    Neutral,
}

impl DeltaClass {
    pub fn classify(delta_percent: f64) -> Self {
        if delta_percent < -SIGNIFICANCE_PERCENT {
            DeltaClass::Improvement
        } else if delta_percent > SIGNIFICANCE_PERCENT {
            DeltaClass::Regression
        } else {
            DeltaClass::Neutral
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeltaRow {
    pub name: &'static str,
    pub left: RowValue,
    pub right: RowValue,
    pub delta: RowValue,
    pub delta_percent: f64,
    pub class: DeltaClass,
}

impl DeltaRow {
    fn new(name: &'static str, left: RowValue, right: RowValue, coloured: bool) -> Self {
        let delta = match (left, right) {
            (RowValue::Int(l), RowValue::Int(r)) => RowValue::Int(r - l),
            _ => RowValue::Float(right.as_f64() - left.as_f64()),
        };
        let delta_percent = percent_change(left.as_f64(), delta.as_f64());
        let class = if coloured {
            DeltaClass::classify(delta_percent)
        } else {
            DeltaClass::Neutral
        };
        Self {
            name,
            left,
            right,
            delta,
            delta_percent,
            class,
        }
    }

    /// Delta cell, e.g. `+0.50000 ( +25.00% )`
    pub fn delta_text(&self) -> String {
        let sign = if self.delta.as_f64() > 0.0 { "+" } else { "" };
        format!(
            "{sign}{} ( {sign}{:.2}% )",
            self.delta,
            self.delta_percent,
            sign = sign
        )
    }
}

/// `delta / left * 100`; a zero baseline gives 0 for no change, ±∞ otherwise
fn percent_change(left: f64, delta: f64) -> f64 {
    if left == 0.0 {
        if delta == 0.0 {
            0.0
        } else {
            f64::INFINITY.copysign(delta)
        }
    } else {
        delta / left * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeltaReport {
    pub left_name: String,
    pub right_name: String,
    pub left: LogStats,
    pub right: LogStats,
    pub rows: Vec<DeltaRow>,
}

impl DeltaReport {
    pub fn compare(left: &Session, right: &Session) -> Self {
        let l = LogStats::gather(left);
        let r = LogStats::gather(right);

        let int = |name, a: i64, b: i64, coloured| {
            DeltaRow::new(name, RowValue::Int(a), RowValue::Int(b), coloured)
        };
        let float = |name, a: f64, b: f64| DeltaRow::new(name, RowValue::Float(a), RowValue::Float(b), true);

        let rows = vec![
            int("Entries", l.entries, r.entries, false),
            int("Total Calls", l.total_calls, r.total_calls, true),
            float("Total Time", l.total_time, r.total_time),
            float("Avg Time/Call", l.mean_time_per_call, r.mean_time_per_call),
            float("Avg Calls/Update", l.mean_calls_per_cycle, r.mean_calls_per_cycle),
            float("Avg Time/Update", l.mean_time_per_cycle, r.mean_time_per_cycle),
            int("Median Calls", l.median_calls, r.median_calls, true),
            float("Median Time", l.median_time, r.median_time),
            float("Max Time", l.max_time, r.max_time),
            int("Max Calls/Update", l.max_calls_per_cycle, r.max_calls_per_cycle, true),
        ];

        Self {
            left_name: left.header.display_name().to_string(),
            right_name: right.header.display_name().to_string(),
            left: l,
            right: r,
            rows,
        }
    }

    pub fn row(&self, name: &str) -> Option<&DeltaRow> {
        self.rows.iter().find(|row| row.name == name)
    }

    pub fn improvements(&self) -> usize {
        self.count(DeltaClass::Improvement)
    }

    pub fn regressions(&self) -> usize {
        self.count(DeltaClass::Regression)
    }

    fn count(&self, class: DeltaClass) -> usize {
        self.rows.iter().filter(|row| row.class == class).count()
    }

    /// Plain-text comparison table
    pub fn to_report_string(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<18} {:>18} {:>18} {:>28}",
            "Row Value", "Left Stats", "Right Stats", "Delta"
        );
        let _ = writeln!(
            out,
            "{:<18} {:>18} {:>18}",
            "", self.left_name, self.right_name
        );
        let _ = writeln!(out, "{}", "-".repeat(85));
        for row in &self.rows {
            let marker = match row.class {
                DeltaClass::Improvement => "  improved",
                DeltaClass::Regression => "  REGRESSED",
                DeltaClass::Neutral => "",
            };
            let _ = writeln!(
                out,
                "{:<18} {:>18} {:>18} {:>28}{}",
                row.name,
                row.left.to_string(),
                row.right.to_string(),
                row.delta_text(),
                marker
            );
        }
        out
    }
}
