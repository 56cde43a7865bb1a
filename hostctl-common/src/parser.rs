//! Parsing of platform CLI tables.
//!
//! The platform CLI prints ASCII tables framed with `+---+` borders and
//! `|` separated cells. [`TableParser`] turns `system host-list` and
//! `system host-show` output into [`HostRecord`]s; richer parsers can be
//! plugged in through [`HostListParser`].

use crate::types::{HostRecord, HostState, Personality, UnknownStateValue};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("no table found in output")]
    NoTable,

    #[error("missing column '{0}'")]
    MissingColumn(&'static str),

    #[error("row {row}: {source}")]
    BadValue {
        row: usize,
        #[source]
        source: UnknownStateValue,
    },
}

/// Cells of one CLI table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Parse the first table in `text`. Lines outside the table are ignored.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut cells = text
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with('|'))
            .map(split_row);

        let headers = cells.next().ok_or(ParseError::NoTable)?;
        Ok(Self {
            headers,
            rows: cells.collect(),
        })
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h.eq_ignore_ascii_case(name))
    }

    /// Two-column Property/Value tables as a map.
    pub fn properties(&self) -> HashMap<String, String> {
        self.rows
            .iter()
            .filter(|row| row.len() >= 2)
            .map(|row| (row[0].to_ascii_lowercase(), row[1].clone()))
            .collect()
    }
}

fn split_row(line: &str) -> Vec<String> {
    let inner = line.trim_start_matches('|').trim_end_matches('|');
    inner.split('|').map(|cell| cell.trim().to_string()).collect()
}

/// Newer releases call compute hosts "worker".
fn parse_personality(value: &str) -> Result<Personality, UnknownStateValue> {
    match value.trim().to_ascii_lowercase().as_str() {
        "worker" => Ok(Personality::Compute),
        other => other.parse(),
    }
}

/// Turns CLI output into typed host records.
pub trait HostListParser: Send + Sync {
    fn parse_host_list(&self, output: &str) -> Result<Vec<HostRecord>, ParseError>;

    fn parse_host_show(&self, output: &str) -> Result<HostRecord, ParseError>;
}

/// Parser for the stock ASCII table layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableParser;

impl HostListParser for TableParser {
    fn parse_host_list(&self, output: &str) -> Result<Vec<HostRecord>, ParseError> {
        let table = Table::parse(output)?;
        let col = |name: &'static str| table.column(name).ok_or(ParseError::MissingColumn(name));
        let name_col = col("hostname")?;
        let personality_col = col("personality")?;
        let admin_col = col("administrative")?;
        let oper_col = col("operational")?;
        let avail_col = col("availability")?;
        let task_col = table.column("task");

        table
            .rows
            .iter()
            .enumerate()
            .map(|(row, cells)| {
                let cell = |i: usize| cells.get(i).map(String::as_str).unwrap_or_default();
                let bad = |source| ParseError::BadValue { row, source };
                Ok(HostRecord {
                    name: cell(name_col).to_string(),
                    personality: parse_personality(cell(personality_col)).map_err(bad)?,
                    state: HostState::new(
                        cell(admin_col).parse().map_err(bad)?,
                        cell(oper_col).parse().map_err(bad)?,
                        cell(avail_col).parse().map_err(bad)?,
                    ),
                    task: task_col.map(cell).unwrap_or_default().to_string(),
                })
            })
            .collect()
    }

    fn parse_host_show(&self, output: &str) -> Result<HostRecord, ParseError> {
        let props = Table::parse(output)?.properties();
        let get = |name: &'static str| {
            props
                .get(name)
                .map(String::as_str)
                .ok_or(ParseError::MissingColumn(name))
        };
        let bad = |source| ParseError::BadValue { row: 0, source };

        Ok(HostRecord {
            name: get("hostname")?.to_string(),
            personality: parse_personality(get("personality")?).map_err(bad)?,
            state: HostState::new(
                get("administrative")?.parse().map_err(bad)?,
                get("operational")?.parse().map_err(bad)?,
                get("availability")?.parse().map_err(bad)?,
            ),
            task: props.get("task").cloned().unwrap_or_default(),
        })
    }
}
