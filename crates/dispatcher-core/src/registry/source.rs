//! Sources of destination rows
//!
//! A row is `(group, uri, flags, priority, attrs)`. The file source reads one
//! row per line:
//!
//! ```text
//! # group  uri                     flags priority attrs
//! 1        sip:10.0.0.1:5060       0     10       duid=gw1;weight=80
//! 1        sip:gw2.example.com     8     20       duid=gw2;weight=20
//! 2        sip:[2001:db8::5]:5080
//! ```
//!
//! `#` starts a comment, blank lines are ignored and trailing columns may be
//! left out.

use std::path::{Path, PathBuf};

use crate::error::{DispatcherError, Result};
use crate::types::SetId;

/// Columns a source provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SchemaVersion {
    /// group, uri
    V1,
    /// + flags
    V2,
    /// + priority
    V3,
    /// + attrs
    V4,
}

/// One destination row
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationRow {
    pub group: SetId,
    pub uri: String,
    pub flags: u32,
    pub priority: i32,
    pub attrs: String,
}

impl DestinationRow {
    pub fn new(group: SetId, uri: impl Into<String>) -> Self {
        Self {
            group,
            uri: uri.into(),
            ..Default::default()
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_attrs(mut self, attrs: impl Into<String>) -> Self {
        self.attrs = attrs.into();
        self
    }

    /// Drop the columns `version` does not carry
    pub fn restrict_to(mut self, version: SchemaVersion) -> Self {
        if version < SchemaVersion::V2 {
            self.flags = 0;
        }
        if version < SchemaVersion::V3 {
            self.priority = 0;
        }
        if version < SchemaVersion::V4 {
            self.attrs.clear();
        }
        self
    }
}

/// Provider of destination rows for a reload
///
/// A hard failure (the source cannot be read at all) is returned as `Err` and
/// aborts the reload. Individual rows that cannot be parsed are returned as
/// `Err` entries and only skip that row.
pub trait DestinationSource: Send {
    fn schema_version(&self) -> SchemaVersion {
        SchemaVersion::V4
    }

    fn load_rows(&mut self) -> Result<Vec<Result<DestinationRow>>>;
}

/// Rows read from a list file
#[derive(Debug, Clone)]
pub struct ListFileSource {
    path: PathBuf,
}

impl ListFileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DestinationSource for ListFileSource {
    fn load_rows(&mut self) -> Result<Vec<Result<DestinationRow>>> {
        let content = std::fs::read_to_string(&self.path)?;
        Ok(parse_list(&content))
    }
}

/// Rows supplied in memory
#[derive(Debug, Clone)]
pub struct StaticSource {
    version: SchemaVersion,
    rows: Vec<DestinationRow>,
}

impl StaticSource {
    pub fn new(rows: Vec<DestinationRow>) -> Self {
        Self::with_version(SchemaVersion::V4, rows)
    }

    pub fn with_version(version: SchemaVersion, rows: Vec<DestinationRow>) -> Self {
        Self { version, rows }
    }
}

impl DestinationSource for StaticSource {
    fn schema_version(&self) -> SchemaVersion {
        self.version
    }

    fn load_rows(&mut self) -> Result<Vec<Result<DestinationRow>>> {
        let version = self.version;
        Ok(self.rows.iter().cloned().map(|row| Ok(row.restrict_to(version))).collect())
    }
}

/// Parse list file content. Comment and blank lines produce nothing.
pub fn parse_list(content: &str) -> Vec<Result<DestinationRow>> {
    content
        .lines()
        .enumerate()
        .filter_map(|(n, line)| {
            parse_list_line(line).map(|row| {
                row.map_err(|e| DispatcherError::Config(format!("line {}: {}", n + 1, e)))
            })
        })
        .collect()
}

/// Parse a single list line, `None` for blank and comment lines
pub fn parse_list_line(line: &str) -> Option<Result<DestinationRow>> {
    let mut columns = line
        .split_whitespace()
        .take_while(|column| !column.starts_with('#'));

    let group = columns.next()?;
    Some(parse_columns(group, &mut columns))
}

fn parse_columns<'a>(group: &str, columns: &mut impl Iterator<Item = &'a str>) -> Result<DestinationRow> {
    let group: SetId = group
        .parse()
        .map_err(|_| DispatcherError::Config(format!("bad group id '{}'", group)))?;

    let token = columns.next().unwrap_or_default();
    // a comment glued to the uri ends the line
    let (uri, commented) = match token.split_once('#') {
        Some((uri, _)) => (uri, true),
        None => (token, false),
    };
    if uri.is_empty() {
        return Err(DispatcherError::Config(format!("no uri for group {}", group)));
    }

    let mut row = DestinationRow::new(group, uri);
    if commented {
        return Ok(row);
    }

    if let Some(flags) = columns.next() {
        row.flags = flags
            .parse()
            .map_err(|_| DispatcherError::Config(format!("bad flags '{}'", flags)))?;
    }
    if let Some(priority) = columns.next() {
        row.priority = priority
            .parse()
            .map_err(|_| DispatcherError::Config(format!("bad priority '{}'", priority)))?;
    }
    if let Some(attrs) = columns.next() {
        row.attrs = attrs.to_string();
    }

    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_full_line() {
        let row = parse_list_line("1 sip:10.0.0.1:5060 8 10 duid=gw1;weight=80 # primary")
            .unwrap()
            .unwrap();
        assert_eq!(
            row,
            DestinationRow {
                group: 1,
                uri: "sip:10.0.0.1:5060".into(),
                flags: 8,
                priority: 10,
                attrs: "duid=gw1;weight=80".into(),
            }
        );
    }

    #[test]
    fn test_optional_columns() {
        let row = parse_list_line("  2\tsip:gw.example.com").unwrap().unwrap();
        assert_eq!(row, DestinationRow::new(2, "sip:gw.example.com"));

        let row = parse_list_line("2 sip:gw.example.com 0 -5").unwrap().unwrap();
        assert_eq!(row.priority, -5);
        assert_eq!(row.attrs, "");
    }

    #[test]
    fn test_comments_and_blank_lines() {
        assert!(parse_list_line("").is_none());
        assert!(parse_list_line("   ").is_none());
        assert!(parse_list_line("# 1 sip:10.0.0.1").is_none());
        let row = parse_list_line("3 sip:10.0.0.3 # 1 2 3").unwrap().unwrap();
        assert_eq!(row.flags, 0);
        let row = parse_list_line("3 sip:10.0.0.3#backup 8").unwrap().unwrap();
        assert_eq!(row.uri, "sip:10.0.0.3");
        assert_eq!(row.flags, 0);
    }

    #[test]
    fn test_bad_rows_are_errors() {
        assert!(parse_list_line("x sip:10.0.0.1").unwrap().is_err());
        assert!(parse_list_line("1").unwrap().is_err());
        assert!(parse_list_line("1 sip:10.0.0.1 active").unwrap().is_err());
        assert!(parse_list_line("1 sip:10.0.0.1 0 high").unwrap().is_err());
    }

    #[test]
    fn test_parse_list_reports_line_numbers() {
        let rows = parse_list("# header\n1 sip:10.0.0.1\n\nbad sip:10.0.0.2\n");
        assert_eq!(rows.len(), 2);
        assert!(rows[0].is_ok());
        let err = rows[1].as_ref().unwrap_err().to_string();
        assert!(err.contains("line 4"), "{}", err);
    }

    #[test]
    fn test_static_source_schema_versions() {
        let row = DestinationRow::new(1, "sip:10.0.0.1")
            .with_flags(8)
            .with_priority(3)
            .with_attrs("duid=a");

        let mut source = StaticSource::with_version(SchemaVersion::V2, vec![row.clone()]);
        assert_eq!(source.schema_version(), SchemaVersion::V2);
        let loaded = source.load_rows().unwrap().remove(0).unwrap();
        assert_eq!(loaded.flags, 8);
        assert_eq!(loaded.priority, 0);
        assert_eq!(loaded.attrs, "");

        let mut source = StaticSource::new(vec![row.clone()]);
        assert_eq!(source.load_rows().unwrap().remove(0).unwrap(), row);
    }

    #[test]
    fn test_list_file_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"1 sip:10.0.0.1\n1 sip:10.0.0.2 0 5\n").unwrap();

        let mut source = ListFileSource::new(file.path());
        let rows = source.load_rows().unwrap();
        assert_eq!(rows.len(), 2);

        let mut missing = ListFileSource::new("/nonexistent/dispatcher.list");
        assert!(matches!(missing.load_rows(), Err(DispatcherError::Io(_))));
    }
}
