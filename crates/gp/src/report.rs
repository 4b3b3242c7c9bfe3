//! Progress reporting of fitting and sampling.
//!
//! Inference loops build a [`Report`] once per burst and hand it to a
//! [`Reporter`]. The default [`LogReporter`] writes one formatted line with
//! `log::info!`, [`NoopReporter`] discards reports and any closure taking a
//! `&Report` can be used as a custom sink.

use crate::param::ParamValues;
use log::info;
use std::fmt;

/// A value of a report entry
#[derive(Clone, Debug, PartialEq)]
pub enum ReportValue {
    /// Counter
    Int(usize),
    /// Measurement
    Float(f64),
    /// Several measurements, e.g. one per chain
    Array(Vec<f64>),
}

impl fmt::Display for ReportValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReportValue::Int(v) => write!(f, "{v:5}"),
            ReportValue::Float(v) => write!(f, "{v:5.2}"),
            ReportValue::Array(vs) => {
                let items: Vec<String> = vs.iter().map(|v| format!("{v:5.2}")).collect();
                write!(f, "{}", items.join(" "))
            }
        }
    }
}

/// Ordered diagnostic entries of one burst
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Report {
    /// Optional line prefix, e.g. `05%ile`
    pub prefix: Option<String>,
    /// Entries in display order
    pub entries: Vec<(String, ReportValue)>,
}

impl Report {
    /// An empty report
    pub fn new() -> Self {
        Report::default()
    }

    /// Sets the line prefix
    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefix = Some(prefix.to_string());
        self
    }

    /// Appends a counter
    pub fn int(mut self, key: &str, v: usize) -> Self {
        self.entries.push((key.to_string(), ReportValue::Int(v)));
        self
    }

    /// Appends a measurement
    pub fn float(mut self, key: &str, v: f64) -> Self {
        self.entries.push((key.to_string(), ReportValue::Float(v)));
        self
    }

    /// Appends several measurements
    pub fn array(mut self, key: &str, vs: Vec<f64>) -> Self {
        self.entries.push((key.to_string(), ReportValue::Array(vs)));
        self
    }

    /// Appends parameter values in name order
    pub fn params(mut self, params: &ParamValues) -> Self {
        for (name, &v) in params.iter() {
            self.entries.push((name.clone(), ReportValue::Float(v)));
        }
        self
    }

    /// Value of the first entry named `key`
    pub fn get(&self, key: &str) -> Option<&ReportValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(f, "{prefix} ")?;
        }
        let items: Vec<String> = self
            .entries
            .iter()
            .map(|(k, v)| format!("[{k} {v}]"))
            .collect();
        write!(f, "{}", items.join(" "))
    }
}

/// A sink for progress reports
pub trait Reporter: Send + Sync {
    /// Handles one report
    fn report(&self, report: &Report);

    /// Handles a phase banner such as `BURNIN`
    fn banner(&self, title: &str) {
        info!("{title}");
    }
}

/// Writes reports with `log::info!`
#[derive(Clone, Copy, Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, report: &Report) {
        info!("{report}");
    }
}

/// Discards reports
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn report(&self, _report: &Report) {}

    fn banner(&self, _title: &str) {}
}

impl<F> Reporter for F
where
    F: Fn(&Report) + Send + Sync,
{
    fn report(&self, report: &Report) {
        self(report)
    }
}
