pub mod flatfile;

pub use flatfile::{read_csv, write_csv};

use crate::error::{EtlError, Result};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

/// Cell spellings that pandas' `read_csv` treats as missing by default.
pub const DEFAULT_NULL_MARKERS: &[&str] = &[
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

/// Set of cell spellings normalized to null when a flat file is read.
#[derive(Debug, Clone)]
pub struct NullMarkers {
    markers: HashSet<String>,
}

impl NullMarkers {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut markers: HashSet<String> = markers.into_iter().map(Into::into).collect();
        // an empty cell is always missing, whatever the caller configured
        markers.insert(String::new());
        Self { markers }
    }

    pub fn is_null(&self, cell: &str) -> bool {
        self.markers.contains(cell)
    }
}

impl Default for NullMarkers {
    fn default() -> Self {
        Self::new(DEFAULT_NULL_MARKERS.iter().copied())
    }
}

/// An in-memory table: ordered column names plus rows of nullable string cells.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordSet {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl RecordSet {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a record set from literal rows; every row must match the column count.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Result<Self> {
        let mut set = Self::new(columns);
        for row in rows {
            set.push_row(row)?;
        }
        Ok(set)
    }

    pub fn push_row(&mut self, row: Vec<Option<String>>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(EtlError::Schema(format!(
                "row {} has {} cells but the record set has {} columns",
                self.rows.len(),
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Map any cell matching `markers` to `None`.
    pub fn normalize_nulls(&mut self, markers: &NullMarkers) -> usize {
        let mut nulled = 0;
        for cell in self.rows.iter_mut().flat_map(|r| r.iter_mut()) {
            if cell.as_deref().is_some_and(|c| markers.is_null(c)) {
                *cell = None;
                nulled += 1;
            }
        }
        nulled
    }

    /// Rename columns by `source name -> target name`. Unknown source names are ignored.
    pub fn rename_columns(&mut self, renames: &BTreeMap<String, String>) -> usize {
        let mut renamed = 0;
        for (from, to) in renames {
            match self.columns.iter_mut().find(|c| *c == from) {
                Some(col) => {
                    debug!(from = %from, to = %to, "renaming column");
                    *col = to.clone();
                    renamed += 1;
                }
                None => warn!(column = %from, "rename requested for unknown column"),
            }
        }
        renamed
    }

    /// The `(column, value)` pairs of row `idx` whose value is present.
    pub fn non_null_fields(&self, idx: usize) -> Vec<(&str, &str)> {
        self.columns
            .iter()
            .zip(&self.rows[idx])
            .filter_map(|(c, v)| v.as_deref().map(|v| (c.as_str(), v)))
            .collect()
    }

    /// Render the first `n` rows as text lines for previews.
    pub fn head(&self, n: usize) -> Vec<String> {
        self.rows
            .iter()
            .take(n)
            .map(|row| {
                row.iter()
                    .map(|c| c.as_deref().unwrap_or("<null>"))
                    .collect::<Vec<_>>()
                    .join(" | ")
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Option<String> {
        Some(v.to_string())
    }

    #[test]
    fn push_row_rejects_wrong_width() {
        let mut set = RecordSet::new(vec!["a".into(), "b".into()]);
        assert!(set.push_row(vec![s("1")]).is_err());
        assert!(set.push_row(vec![s("1"), None]).is_ok());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn pandas_style_markers_become_null() {
        let mut set = RecordSet::from_rows(
            vec!["a".into(), "b".into(), "c".into()],
            vec![vec![s("NaN"), s("x"), s("")], vec![s("null"), s("nan"), s("0")]],
        )
        .unwrap();
        let nulled = set.normalize_nulls(&NullMarkers::default());
        assert_eq!(nulled, 4);
        assert_eq!(set.rows()[0], vec![None, s("x"), None]);
        assert_eq!(set.rows()[1], vec![None, None, s("0")]);
    }

    #[test]
    fn custom_markers_still_null_empty_cells() {
        let markers = NullMarkers::new(["-"]);
        assert!(markers.is_null(""));
        assert!(markers.is_null("-"));
        assert!(!markers.is_null("NaN"));
    }

    #[test]
    fn non_null_fields_skip_missing_cells() {
        let set = RecordSet::from_rows(
            vec!["day".into(), "city".into(), "isp".into()],
            vec![vec![s("2024-01-01"), None, s("AS1")]],
        )
        .unwrap();
        assert_eq!(
            set.non_null_fields(0),
            vec![("day", "2024-01-01"), ("isp", "AS1")]
        );
    }

    #[test]
    fn rename_ignores_unknown_columns() {
        let mut set = RecordSet::new(vec!["client.Geo.City".into(), "date".into()]);
        let mut renames = BTreeMap::new();
        renames.insert("client.Geo.City".to_string(), "city".to_string());
        renames.insert("missing".to_string(), "nope".to_string());
        assert_eq!(set.rename_columns(&renames), 1);
        assert_eq!(set.columns(), &["city".to_string(), "date".to_string()]);
    }
}
