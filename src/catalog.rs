//! Plain-text tables: SExtractor `ASCII_HEAD` catalogues and `files.info`
//! exposure listings.

use anyhow::{anyhow, bail, Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

/// A column of an `ASCII_HEAD` catalogue. Vector-valued columns cover
/// `width` consecutive fields.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogColumn {
    /// 1-based field index
    pub index: usize,
    pub name: String,
    pub width: usize,
}

#[derive(Debug, Clone)]
pub struct SexCatalog {
    pub path: PathBuf,
    header: Vec<String>,
    columns: Vec<CatalogColumn>,
    rows: Vec<Vec<String>>,
}

impl SexCatalog {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalogue {}", path.display()))?;
        Self::parse(path, &text)
    }

    pub fn parse(path: &Path, text: &str) -> Result<Self> {
        let mut header = Vec::new();
        let mut columns: Vec<CatalogColumn> = Vec::new();
        let mut rows: Vec<(usize, Vec<String>)> = Vec::new();

        for (lineno, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some(rest) = trimmed.strip_prefix('#') {
                header.push(line.to_string());
                let mut parts = rest.split_whitespace();
                let (Some(index), Some(name)) = (parts.next(), parts.next()) else {
                    continue;
                };
                let Ok(index) = index.parse::<usize>() else {
                    continue;
                };
                columns.push(CatalogColumn {
                    index,
                    name: name.to_string(),
                    width: 1,
                });
                continue;
            }
            let fields: Vec<String> = trimmed.split_whitespace().map(str::to_string).collect();
            rows.push((lineno + 1, fields));
        }

        if columns.is_empty() {
            bail!("{} has no ASCII_HEAD column definitions", path.display());
        }
        columns.sort_by_key(|c| c.index);
        let nfields = rows.first().map(|(_, f)| f.len());
        for i in 0..columns.len() {
            let next = match columns.get(i + 1) {
                Some(c) => c.index,
                None => nfields.map_or(columns[i].index + 1, |n| n + 1),
            };
            columns[i].width = next.saturating_sub(columns[i].index).max(1);
        }

        let expected = columns
            .last()
            .map_or(0, |c| c.index + c.width - 1);
        let mut checked = Vec::with_capacity(rows.len());
        for (lineno, fields) in rows {
            if fields.len() != expected {
                bail!(
                    "{}:{}: expected {} fields, found {}",
                    path.display(),
                    lineno,
                    expected,
                    fields.len()
                );
            }
            checked.push(fields);
        }

        Ok(Self {
            path: path.to_path_buf(),
            header,
            columns,
            rows: checked,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> &[CatalogColumn] {
        &self.columns
    }

    fn find_column(&self, name: &str) -> Result<&CatalogColumn> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| anyhow!("Column {} not found in {}", name, self.path.display()))
    }

    /// First field of column `name` as floating point values.
    pub fn column(&self, name: &str) -> Result<Vec<f64>> {
        let col = self.find_column(name)?;
        self.rows
            .iter()
            .map(|row| {
                let field = &row[col.index - 1];
                field
                    .parse::<f64>()
                    .with_context(|| format!("Bad {} value '{}'", col.name, field))
            })
            .collect()
    }

    /// Object ids from the `NUMBER` column.
    pub fn ids(&self) -> Result<Vec<i64>> {
        let col = self.find_column("NUMBER")?;
        self.rows
            .iter()
            .map(|row| {
                let field = &row[col.index - 1];
                field
                    .parse::<i64>()
                    .with_context(|| format!("Bad NUMBER value '{}'", field))
            })
            .collect()
    }

    /// Drop the rows whose `NUMBER` is in `ids`. Returns how many were removed.
    pub fn remove_ids(&mut self, ids: &[i64]) -> Result<usize> {
        let all = self.ids()?;
        let before = self.rows.len();
        let mut keep = all.iter().map(|id| !ids.contains(id));
        self.rows.retain(|_| keep.next().unwrap_or(true));
        Ok(before - self.rows.len())
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut out = String::new();
        for line in &self.header {
            writeln!(out, "{}", line)?;
        }
        for row in &self.rows {
            writeln!(out, " {}", row.join(" "))?;
        }
        fs::write(path, out).with_context(|| format!("Failed to write {}", path.display()))
    }
}

/// Whitespace table whose first line is `# name name ...`.
#[derive(Debug, Clone)]
pub struct InfoTable {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl InfoTable {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let head = lines.next().ok_or_else(|| anyhow!("Empty table"))?;
        let Some(head) = head.trim().strip_prefix('#') else {
            bail!("First line must be a '#' column header");
        };
        let columns: Vec<String> = head.split_whitespace().map(|s| s.to_lowercase()).collect();

        let mut rows = Vec::new();
        for line in lines {
            if line.trim_start().starts_with('#') {
                continue;
            }
            let fields: Vec<String> = line.split_whitespace().map(str::to_string).collect();
            if fields.len() != columns.len() {
                bail!(
                    "Row has {} fields but the header names {} columns: {}",
                    fields.len(),
                    columns.len(),
                    line
                );
            }
            rows.push(fields);
        }
        Ok(Self { columns, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        let lower = name.to_lowercase();
        self.columns
            .iter()
            .position(|c| *c == lower)
            .ok_or_else(|| anyhow!("Column {} not found", name))
    }

    pub fn column_str(&self, name: &str) -> Result<Vec<&str>> {
        let i = self.index_of(name)?;
        Ok(self.rows.iter().map(|r| r[i].as_str()).collect())
    }

    pub fn column_f64(&self, name: &str) -> Result<Vec<f64>> {
        let i = self.index_of(name)?;
        self.rows
            .iter()
            .map(|r| {
                r[i].parse::<f64>()
                    .with_context(|| format!("Bad {} value '{}'", name, r[i]))
            })
            .collect()
    }
}
