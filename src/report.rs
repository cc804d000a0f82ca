//! "All Lists" report reader.
//!
//! The report is a CSV export with one row per reading list. Builds use it
//! as their source of list URLs, narrowed by time period, status and privacy
//! control.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use csv::{ByteRecord, Reader, ReaderBuilder};
use thiserror::Error;

pub const LIST_LINK: &str = "List Link";
pub const TIME_PERIOD: &str = "Time Period";
pub const STATUS: &str = "Status";
pub const PRIVACY_CONTROL: &str = "Privacy Control";

#[derive(Debug, Error)]
pub enum ReportError {
  #[error("failed to open report {}: {source}", path.display())]
  Open {
    path: PathBuf,
    #[source]
    source: csv::Error,
  },
  #[error("report has no {0:?} column")]
  MissingColumn(&'static str),
  #[error("malformed report row: {0}")]
  Row(#[from] csv::Error),
}

/// Row filter. Every criterion that is set must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
  /// Accepted time periods. When empty, only rows without a time period
  /// match.
  pub time_periods: Vec<String>,
  /// Prefix of the list status, e.g. `Published`.
  pub status: Option<String>,
  pub privacy_control: Option<String>,
}

impl ListFilter {
  pub fn matches(&self, row: &ListRow) -> bool {
    let periods: Vec<&str> = self
      .time_periods
      .iter()
      .map(String::as_str)
      .filter(|p| !p.is_empty())
      .collect();
    let period_ok = if periods.is_empty() {
      row.time_period.is_empty()
    } else {
      periods.contains(&row.time_period.as_str())
    };
    let status_ok = match self.status.as_deref() {
      Some(status) if !status.is_empty() => row.status.starts_with(status),
      _ => true,
    };
    let privacy_ok = match self.privacy_control.as_deref() {
      Some(privacy) if !privacy.is_empty() => row.privacy_control == privacy,
      _ => true,
    };
    period_ok && status_ok && privacy_ok
  }
}

/// The columns of a report row used for filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRow {
  pub link: String,
  pub time_period: String,
  pub status: String,
  pub privacy_control: String,
}

#[derive(Debug, Clone, Copy)]
struct Columns {
  link: usize,
  time_period: Option<usize>,
  status: Option<usize>,
  privacy_control: Option<usize>,
}

/// Iterator over the list links of matching report rows.
pub struct ListReport<R> {
  reader: Reader<R>,
  columns: Columns,
  filter: ListFilter,
  record: ByteRecord,
}

impl ListReport<File> {
  pub fn open(path: &Path, filter: ListFilter) -> Result<Self, ReportError> {
    let reader = ReaderBuilder::new()
      .flexible(true)
      .from_path(path)
      .map_err(|source| ReportError::Open {
        path: path.to_path_buf(),
        source,
      })?;
    Self::new(reader, filter)
  }
}

impl<R: Read> ListReport<R> {
  pub fn from_reader(reader: R, filter: ListFilter) -> Result<Self, ReportError> {
    Self::new(ReaderBuilder::new().flexible(true).from_reader(reader), filter)
  }

  fn new(mut reader: Reader<R>, filter: ListFilter) -> Result<Self, ReportError> {
    let headers: Vec<String> = reader.byte_headers()?.iter().map(decode).collect();
    let find = |name: &str| headers.iter().position(|h| h.trim() == name);
    let columns = Columns {
      link: find(LIST_LINK).ok_or(ReportError::MissingColumn(LIST_LINK))?,
      time_period: find(TIME_PERIOD),
      status: find(STATUS),
      privacy_control: find(PRIVACY_CONTROL),
    };
    Ok(Self {
      reader,
      columns,
      filter,
      record: ByteRecord::new(),
    })
  }

  fn row(&self) -> ListRow {
    let field = |index: Option<usize>| {
      index
        .and_then(|i| self.record.get(i))
        .map(|value| decode(value).trim().to_string())
        .unwrap_or_default()
    };
    ListRow {
      link: field(Some(self.columns.link)),
      time_period: field(self.columns.time_period),
      status: field(self.columns.status),
      privacy_control: field(self.columns.privacy_control),
    }
  }
}

impl<R: Read> Iterator for ListReport<R> {
  type Item = Result<String, ReportError>;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      match self.reader.read_byte_record(&mut self.record) {
        Ok(false) => return None,
        Err(e) => return Some(Err(e.into())),
        Ok(true) => {
          let row = self.row();
          if !row.link.is_empty() && self.filter.matches(&row) {
            return Some(Ok(row.link));
          }
        }
      }
    }
  }
}

/// Reports are exported as UTF-8 or Latin-1; anything that isn't valid
/// UTF-8 is read as Latin-1.
fn decode(bytes: &[u8]) -> String {
  match std::str::from_utf8(bytes) {
    Ok(s) => s.to_string(),
    Err(_) => bytes.iter().map(|&b| b as char).collect(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const REPORT: &str = "\
List Name,List Link,Time Period,Status,Privacy Control
Physics,http://uni.rl.talis.com/lists/L1,2017-18,Published,Public
Chemistry,http://uni.rl.talis.com/lists/L2,2016-17,Published,Public
Biology,http://uni.rl.talis.com/lists/L3,,Draft,Public
History,http://uni.rl.talis.com/lists/L4,2017-18,Published with changes,Private
Empty,,2017-18,Published,Public
";

  fn links(filter: ListFilter) -> Vec<String> {
    ListReport::from_reader(REPORT.as_bytes(), filter)
      .unwrap()
      .collect::<Result<_, _>>()
      .unwrap()
  }

  fn list(id: &str) -> String {
    format!("http://uni.rl.talis.com/lists/{}", id)
  }

  #[test]
  fn test_time_period_filter() {
    let filter = ListFilter {
      time_periods: vec!["2017-18".into()],
      ..Default::default()
    };
    assert_eq!(links(filter), vec![list("L1"), list("L4")]);
  }

  #[test]
  fn test_no_time_period_matches_blank_periods() {
    assert_eq!(links(ListFilter::default()), vec![list("L3")]);
    let filter = ListFilter {
      time_periods: vec![String::new()],
      ..Default::default()
    };
    assert_eq!(links(filter), vec![list("L3")]);
  }

  #[test]
  fn test_status_prefix_and_privacy() {
    let filter = ListFilter {
      time_periods: vec!["2017-18".into(), "2016-17".into()],
      status: Some("Published".into()),
      privacy_control: Some("Public".into()),
    };
    assert_eq!(links(filter), vec![list("L1"), list("L2")]);

    let filter = ListFilter {
      time_periods: vec!["2017-18".into()],
      status: Some("Published".into()),
      privacy_control: Some("Private".into()),
    };
    assert_eq!(links(filter), vec![list("L4")]);
  }

  #[test]
  fn test_missing_link_column() {
    let err = ListReport::from_reader("Name,Status\nx,y\n".as_bytes(), ListFilter::default())
      .err()
      .unwrap();
    assert!(matches!(err, ReportError::MissingColumn(LIST_LINK)));
  }

  #[test]
  fn test_latin1_fields() {
    assert_eq!(decode(b"Caf\xe9"), "Café");
    assert_eq!(decode("Café".as_bytes()), "Café");
  }

  #[test]
  fn test_open_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lists.csv");
    std::fs::write(&path, REPORT).unwrap();
    let filter = ListFilter {
      time_periods: vec!["2016-17".into()],
      ..Default::default()
    };
    let links: Vec<String> = ListReport::open(&path, filter)
      .unwrap()
      .map(Result::unwrap)
      .collect();
    assert_eq!(links, vec![list("L2")]);
    assert!(ListReport::open(&dir.path().join("missing.csv"), ListFilter::default()).is_err());
  }
}
