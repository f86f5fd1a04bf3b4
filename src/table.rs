//! Column-oriented trial table
//!
//! Rows are trials, columns are trial attributes. Every operation keeps the
//! global row order of its input; the lookback projector in
//! [`crate::recency`] does index arithmetic on that order.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::PipelineError;
use crate::types::{TableCounts, USER_ID};

/// Tokens read as a missing value, in addition to the empty field
const NA_TOKENS: &[&str] = &[
    "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

/// A single table cell
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Missing,
    /// Computed value, written through [`format_number`]
    Number(f64),
    /// Numeric field read from a file; labels and output use the source text
    Parsed { value: f64, raw: String },
    Text(String),
}

impl Cell {
    /// Numeric cell; NaN and infinities become `Missing`
    pub fn number(value: f64) -> Self {
        if value.is_finite() {
            Cell::Number(value)
        } else {
            Cell::Missing
        }
    }

    pub fn from_option(value: Option<f64>) -> Self {
        value.map_or(Cell::Missing, Cell::number)
    }

    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    /// Boolean flag, written the way the downstream analysis reads it
    pub fn flag(value: bool) -> Self {
        Cell::Text(if value { "True" } else { "False" }.to_string())
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Cell::Missing)
    }

    /// Numeric view of the cell; text that does not parse is `None`
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Number(v) | Cell::Parsed { value: v, .. } => Some(*v),
            Cell::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            Cell::Missing => None,
        }
    }

    /// Label view of the cell, used for grouping keys and categorical levels
    pub fn as_label(&self) -> Option<String> {
        match self {
            Cell::Number(v) => Some(format_number(*v)),
            Cell::Parsed { raw, .. } | Cell::Text(raw) => Some(raw.clone()),
            Cell::Missing => None,
        }
    }

    /// Parse a raw CSV field
    pub fn parse(field: &str) -> Self {
        if field.is_empty() || NA_TOKENS.contains(&field) {
            return Cell::Missing;
        }
        match field.parse::<f64>() {
            Ok(value) if value.is_finite() => Cell::Parsed {
                value,
                raw: field.to_string(),
            },
            Ok(_) => Cell::Missing,
            Err(_) => Cell::Text(field.to_string()),
        }
    }

    fn to_field(&self) -> String {
        match self {
            Cell::Missing => String::new(),
            Cell::Number(v) => format_number(*v),
            Cell::Parsed { raw, .. } | Cell::Text(raw) => raw.clone(),
        }
    }
}

/// Integral values are written without a fractional part
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Sort labels numerically when every label is a number, else lexically
pub fn sort_labels(labels: &mut [String]) {
    let numeric: Option<Vec<f64>> = labels.iter().map(|l| l.parse::<f64>().ok()).collect();
    if numeric.is_some() {
        labels.sort_by(|a, b| {
            let (x, y) = (a.parse::<f64>().unwrap_or(0.0), b.parse::<f64>().unwrap_or(0.0));
            x.total_cmp(&y)
        });
    } else {
        labels.sort();
    }
}

/// Rows sharing one grouping key, in table order
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub key: Vec<String>,
    pub rows: Vec<usize>,
}

/// In-memory trial table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    names: Vec<String>,
    columns: Vec<Vec<Cell>>,
    n_rows: usize,
}

impl Table {
    /// Build a table from named columns of equal length
    pub fn from_columns(columns: Vec<(String, Vec<Cell>)>) -> Result<Self, PipelineError> {
        let mut table = Table::default();
        for (name, cells) in columns {
            table.set_column(&name, cells)?;
        }
        Ok(table)
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn is_empty(&self) -> bool {
        self.n_rows == 0
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Cells of a column; a missing column is a schema error
    pub fn column(&self, name: &str) -> Result<&[Cell], PipelineError> {
        self.position(name)
            .map(|i| self.columns[i].as_slice())
            .ok_or_else(|| PipelineError::MissingColumn(name.to_string()))
    }

    pub fn numbers(&self, name: &str) -> Result<Vec<Option<f64>>, PipelineError> {
        Ok(self.column(name)?.iter().map(Cell::as_f64).collect())
    }

    pub fn labels(&self, name: &str) -> Result<Vec<Option<String>>, PipelineError> {
        Ok(self.column(name)?.iter().map(Cell::as_label).collect())
    }

    /// Fail early when any of the named columns is absent
    pub fn require(&self, names: &[&str]) -> Result<(), PipelineError> {
        for name in names {
            self.column(name)?;
        }
        Ok(())
    }

    /// Insert or replace a column. The first column fixes the row count.
    pub fn set_column(&mut self, name: &str, cells: Vec<Cell>) -> Result<(), PipelineError> {
        if self.names.is_empty() {
            self.n_rows = cells.len();
        } else if cells.len() != self.n_rows {
            return Err(PipelineError::ColumnLength {
                column: name.to_string(),
                expected: self.n_rows,
                actual: cells.len(),
            });
        }
        match self.position(name) {
            Some(i) => self.columns[i] = cells,
            None => {
                self.names.push(name.to_string());
                self.columns.push(cells);
            }
        }
        Ok(())
    }

    pub fn set_numbers(
        &mut self,
        name: &str,
        values: Vec<Option<f64>>,
    ) -> Result<(), PipelineError> {
        self.set_column(name, values.into_iter().map(Cell::from_option).collect())
    }

    /// Keep the rows whose mask entry is true
    pub fn retain(&mut self, keep: &[bool]) {
        for column in &mut self.columns {
            let mut flags = keep.iter();
            column.retain(|_| flags.next().copied().unwrap_or(false));
        }
        self.n_rows = keep.iter().take(self.n_rows).filter(|k| **k).count();
    }

    /// New table made of the given rows, in the given order
    pub fn take(&self, rows: &[usize]) -> Table {
        Table {
            names: self.names.clone(),
            columns: self
                .columns
                .iter()
                .map(|c| rows.iter().map(|&r| c[r].clone()).collect())
                .collect(),
            n_rows: rows.len(),
        }
    }

    /// Left join on a key column. Right rows are matched by first occurrence of
    /// the key; unmatched left rows get missing cells. Right columns with a name
    /// already present on the left replace the left column.
    pub fn left_join(&self, right: &Table, key: &str) -> Result<Table, PipelineError> {
        let left_keys = self.labels(key)?;
        let right_keys = right.labels(key)?;

        let mut lookup: HashMap<&str, usize> = HashMap::new();
        for (row, k) in right_keys.iter().enumerate() {
            if let Some(k) = k {
                lookup.entry(k.as_str()).or_insert(row);
            }
        }

        let matches: Vec<Option<usize>> = left_keys
            .iter()
            .map(|k| k.as_deref().and_then(|k| lookup.get(k).copied()))
            .collect();

        let mut joined = self.clone();
        for (name, cells) in right.names.iter().zip(&right.columns) {
            if name == key {
                continue;
            }
            let projected = matches
                .iter()
                .map(|m| m.map_or(Cell::Missing, |r| cells[r].clone()))
                .collect();
            joined.set_column(name, projected)?;
        }
        Ok(joined)
    }

    /// Group rows by the labels of the key columns, in order of first
    /// appearance. Rows with a missing key are left out.
    pub fn groups(&self, keys: &[&str]) -> Result<Vec<Group>, PipelineError> {
        let key_columns = keys
            .iter()
            .map(|k| self.labels(k))
            .collect::<Result<Vec<_>, _>>()?;

        let mut groups: Vec<Group> = Vec::new();
        let mut index: HashMap<Vec<String>, usize> = HashMap::new();
        for row in 0..self.n_rows {
            let key: Option<Vec<String>> = key_columns.iter().map(|c| c[row].clone()).collect();
            let Some(key) = key else { continue };
            match index.get(&key) {
                Some(&g) => groups[g].rows.push(row),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push(Group {
                        key,
                        rows: vec![row],
                    });
                }
            }
        }
        Ok(groups)
    }

    /// Number of distinct users
    pub fn user_count(&self) -> Result<usize, PipelineError> {
        let mut users: Vec<String> = self.labels(USER_ID)?.into_iter().flatten().collect();
        users.sort();
        users.dedup();
        Ok(users.len())
    }

    pub fn counts(&self) -> Result<TableCounts, PipelineError> {
        Ok(TableCounts {
            rows: self.n_rows,
            users: self.user_count()?,
        })
    }

    /// Read a delimited table
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self, PipelineError> {
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
        let names: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut columns: Vec<Vec<Cell>> = vec![Vec::new(); names.len()];
        for record in reader.records() {
            let record = record?;
            for (column, field) in columns.iter_mut().zip(record.iter()) {
                column.push(Cell::parse(field));
            }
        }
        let n_rows = columns.first().map_or(0, Vec::len);
        Ok(Table {
            names,
            columns,
            n_rows,
        })
    }

    /// Write the table as a delimited file with a header row
    pub fn to_csv_writer<W: Write>(&self, writer: W) -> Result<(), PipelineError> {
        let mut writer = csv::Writer::from_writer(writer);
        writer.write_record(&self.names)?;
        for row in 0..self.n_rows {
            writer.write_record(self.columns.iter().map(|c| c[row].to_field()))?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_csv(path: &Path) -> Result<Self, PipelineError> {
        if !path.exists() {
            return Err(PipelineError::MissingFile(path.to_path_buf()));
        }
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(std::io::BufReader::new(file))
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), PipelineError> {
        let file = std::fs::File::create(path)?;
        self.to_csv_writer(std::io::BufWriter::new(file))
    }
}
