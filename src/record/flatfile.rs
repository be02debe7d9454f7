use csv::{QuoteStyle, ReaderBuilder, WriterBuilder};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

use super::{NullMarkers, RecordSet};
use crate::error::{EtlError, Result};

/// Read a header-first CSV file into a [`RecordSet`], mapping null markers to `None`.
pub fn read_csv<P: AsRef<Path>>(path: P, markers: &NullMarkers) -> Result<RecordSet> {
    let path = path.as_ref();
    let csv_err = |source| EtlError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let file = fs::File::open(path).map_err(|e| EtlError::io(path, e))?;
    let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(file);

    let columns: Vec<String> = rdr
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if columns.is_empty() || columns.iter().all(|c| c.is_empty()) {
        return Err(EtlError::Schema(format!("{} has no header row", path.display())));
    }

    let mut set = RecordSet::new(columns);
    for record in rdr.records() {
        let record = record.map_err(csv_err)?;
        set.push_row(record.iter().map(|cell| Some(cell.to_string())).collect())?;
    }
    let nulled = set.normalize_nulls(markers);

    info!(
        path = %path.display(),
        rows = set.len(),
        columns = set.num_columns(),
        nulled,
        "read flat file"
    );
    Ok(set)
}

/// Write `set` as CSV, header first. Null cells become empty fields.
///
/// The data goes to a hidden sibling file that is renamed over `path`, so an
/// existing destination is replaced only once the new file is complete.
pub fn write_csv<P: AsRef<Path>>(path: P, set: &RecordSet) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| EtlError::io(parent, e))?;
    }

    let tmp_path = tmp_sibling(path);
    let written = write_tmp(&tmp_path, set)
        .and_then(|()| fs::rename(&tmp_path, path).map_err(|e| EtlError::io(path, e)));
    if let Err(e) = written {
        if let Err(rm) = fs::remove_file(&tmp_path) {
            if rm.kind() != io::ErrorKind::NotFound {
                warn!(path = %tmp_path.display(), error = %rm, "could not remove partial file");
            }
        }
        return Err(e);
    }

    debug!(path = %path.display(), rows = set.len(), "wrote flat file");
    Ok(())
}

fn write_tmp(tmp_path: &Path, set: &RecordSet) -> Result<()> {
    let csv_err = |source| EtlError::Csv {
        path: tmp_path.to_path_buf(),
        source,
    };

    let mut wtr = WriterBuilder::new()
        .quote_style(QuoteStyle::Necessary)
        .from_path(tmp_path)
        .map_err(csv_err)?;

    wtr.write_record(set.columns()).map_err(csv_err)?;
    for row in set.rows() {
        wtr.write_record(row.iter().map(|c| c.as_deref().unwrap_or("")))
            .map_err(csv_err)?;
    }
    wtr.flush().map_err(|e| EtlError::io(tmp_path, e))
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "out.csv".to_string());
    path.with_file_name(format!(".{}.tmp", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::io::Write;
    use tempfile::tempdir;

    fn s(v: &str) -> Option<String> {
        Some(v.to_string())
    }

    #[test]
    fn missing_cells_read_as_null() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("in.csv");
        fs::File::create(&path)?.write_all(b"a,b\n1,\n,2\n")?;

        let set = read_csv(&path, &NullMarkers::default())?;
        assert_eq!(set.columns(), &["a".to_string(), "b".to_string()]);
        assert_eq!(set.rows(), &[vec![s("1"), None], vec![None, s("2")]]);
        Ok(())
    }

    #[test]
    fn nan_text_is_not_kept() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("in.csv");
        fs::write(&path, "city,MinRTT\nParis,NaN\n")?;

        let set = read_csv(&path, &NullMarkers::default())?;
        assert_eq!(set.rows()[0], vec![s("Paris"), None]);
        Ok(())
    }

    #[test]
    fn ragged_rows_are_rejected() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("in.csv");
        fs::write(&path, "a,b\n1,2,3\n")?;

        let err = read_csv(&path, &NullMarkers::default()).unwrap_err();
        assert_eq!(err.class(), "IOError");
        Ok(())
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = read_csv("/definitely/not/here.csv", &NullMarkers::default()).unwrap_err();
        assert!(matches!(err, EtlError::Io { .. }));
    }

    #[test]
    fn empty_set_writes_header_only() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("out.csv");
        let set = RecordSet::new(vec!["date".into(), "a".into()]);

        write_csv(&path, &set)?;
        assert_eq!(fs::read_to_string(&path)?, "date,a\n");
        Ok(())
    }

    #[test]
    fn write_quotes_when_needed_and_overwrites() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("out.csv");
        fs::write(&path, "stale contents\n")?;

        let set = RecordSet::from_rows(
            vec!["city".into(), "isp".into()],
            vec![vec![s("Washington, DC"), None]],
        )?;
        write_csv(&path, &set)?;

        assert_eq!(fs::read_to_string(&path)?, "city,isp\n\"Washington, DC\",\n");
        assert!(!dir.path().join(".out.csv.tmp").exists());

        let back = read_csv(&path, &NullMarkers::default())?;
        assert_eq!(back, set);
        Ok(())
    }

    #[test]
    fn failed_write_leaves_no_partial_file() -> Result<()> {
        let dir = tempdir()?;
        // a non-empty directory in the way makes the final rename fail
        let path = dir.path().join("out.csv");
        fs::create_dir(&path)?;
        fs::write(path.join("keep"), "x")?;

        let set = RecordSet::from_rows(vec!["a".into()], vec![vec![s("1")]])?;
        let err = write_csv(&path, &set).unwrap_err();
        assert_eq!(err.class(), "IOError");
        assert!(!dir.path().join(".out.csv.tmp").exists());
        assert!(path.join("keep").exists());
        Ok(())
    }

    #[test]
    fn custom_markers_only_null_what_they_name() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("in.csv");
        fs::write(&path, "a,b
-,NaN
")?;

        let set = read_csv(&path, &NullMarkers::new(["-"]))?;
        assert_eq!(set.rows()[0], vec![None, s("NaN")]);
        Ok(())
    }
}
