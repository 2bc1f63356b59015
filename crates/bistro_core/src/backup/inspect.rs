//! Static checks on dump files before they are restored.

use crate::error::{CoreError, CoreResult};
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// Statement and row counts from a plain SQL dump.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DumpAnalysis {
    /// `INSERT` statements.
    pub inserts: usize,
    /// `COPY ... FROM stdin` blocks.
    pub copies: usize,
    /// `CREATE` statements.
    pub creates: usize,
    /// `ALTER` statements.
    pub alters: usize,
    /// `SELECT` statements.
    pub selects: usize,
    /// Statements of any other kind.
    pub other: usize,
    /// Rows destined for the restaurants table.
    pub restaurant_rows: usize,
    /// Rows destined for the reviews table.
    pub review_rows: usize,
    /// Sequence maintenance (`setval`, `sqlite_sequence` writes).
    pub sequence_commands: usize,
    /// The dump announces restaurant data (a data section, a `COPY` or an
    /// `INSERT` for the table), whether or not rows follow.
    pub mentions_restaurant_data: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Restaurants,
    Reviews,
    Sequences,
    Other,
}

fn target_of(table: &str) -> Target {
    let table = table
        .trim_matches(|c| c == '"' || c == '`' || c == '[' || c == ']')
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .trim_matches(|c| c == '"' || c == '`');
    match table.to_ascii_lowercase().as_str() {
        "restaurants" => Target::Restaurants,
        "reviews" => Target::Reviews,
        "sqlite_sequence" => Target::Sequences,
        _ => Target::Other,
    }
}

/// The identifier following `keyword` in `stmt`, if any.
fn word_after<'a>(stmt: &'a str, keyword: &str) -> Option<&'a str> {
    let upper = stmt.to_ascii_uppercase();
    let mut words = stmt.split_whitespace().zip(upper.split_whitespace());
    words.find(|(_, u)| *u == keyword)?;
    words.next().map(|(w, _)| {
        w.split(|c| c == '(' || c == ';')
            .next()
            .unwrap_or_default()
    })
}

/// Counts top-level parenthesised tuples after `VALUES`.
fn count_tuples(stmt: &str) -> usize {
    let upper = stmt.to_ascii_uppercase();
    let Some(start) = upper.find("VALUES") else {
        return 0;
    };
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut tuples = 0;
    for c in stmt[start..].chars() {
        match c {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => {
                if depth == 0 {
                    tuples += 1;
                }
                depth += 1;
            }
            ')' if !in_quote => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    tuples
}

fn toggles_quote(line: &str, in_quote: bool) -> bool {
    line.chars()
        .filter(|c| *c == '\'')
        .fold(in_quote, |q, _| !q)
}

impl DumpAnalysis {
    /// Analyses a plain dump read from `reader`.
    pub fn from_reader(reader: impl BufRead) -> CoreResult<Self> {
        let mut analysis = Self::default();
        let mut copy_target: Option<Target> = None;
        let mut statement = String::new();
        let mut in_quote = false;

        for line in reader.split(b'\n') {
            let line = String::from_utf8_lossy(&line?).into_owned();
            let trimmed = line.trim();

            if let Some(target) = copy_target {
                if trimmed == "\\." {
                    copy_target = None;
                } else if !trimmed.is_empty() {
                    analysis.count_rows(target, 1);
                }
                continue;
            }

            if statement.is_empty() {
                if trimmed.is_empty() {
                    continue;
                }
                if let Some(comment) = trimmed.strip_prefix("--") {
                    if comment.contains("Data for Name: restaurants") {
                        analysis.mentions_restaurant_data = true;
                    }
                    continue;
                }
            }

            statement.push_str(&line);
            statement.push('\n');
            in_quote = toggles_quote(&line, in_quote);
            if !in_quote && trimmed.ends_with(';') {
                copy_target = analysis.classify(&statement);
                statement.clear();
            }
        }
        if !statement.trim().is_empty() {
            analysis.classify(&statement);
        }
        Ok(analysis)
    }

    /// Analyses the plain dump at `path`.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }

    fn count_rows(&mut self, target: Target, rows: usize) {
        match target {
            Target::Restaurants => {
                self.mentions_restaurant_data = true;
                self.restaurant_rows += rows;
            }
            Target::Reviews => self.review_rows += rows,
            Target::Sequences => self.sequence_commands += 1,
            Target::Other => {}
        }
    }

    /// Records one complete statement. Returns the table a `COPY` block
    /// that starts here feeds.
    fn classify(&mut self, stmt: &str) -> Option<Target> {
        let keyword = stmt
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        match keyword.as_str() {
            "INSERT" => {
                self.inserts += 1;
                let target = word_after(stmt, "INTO").map_or(Target::Other, target_of);
                if target == Target::Restaurants {
                    self.mentions_restaurant_data = true;
                }
                self.count_rows(target, count_tuples(stmt));
                None
            }
            "COPY" => {
                self.copies += 1;
                let target = word_after(stmt, "COPY").map_or(Target::Other, target_of);
                if target == Target::Restaurants {
                    self.mentions_restaurant_data = true;
                }
                stmt.to_ascii_uppercase()
                    .contains("FROM STDIN")
                    .then_some(target)
            }
            "CREATE" => {
                self.creates += 1;
                None
            }
            "ALTER" => {
                self.alters += 1;
                None
            }
            "SELECT" => {
                self.selects += 1;
                if stmt.contains("setval") {
                    self.sequence_commands += 1;
                }
                None
            }
            "UPDATE" | "DELETE" if stmt.contains("sqlite_sequence") => {
                self.sequence_commands += 1;
                None
            }
            _ => {
                self.other += 1;
                None
            }
        }
    }

    /// `INSERT` plus `COPY` statements.
    pub fn data_statements(&self) -> usize {
        self.inserts + self.copies
    }

    /// Rejects dumps that would restore nothing useful.
    ///
    /// A dump with no data statements, or one that announces restaurant
    /// data but carries zero restaurant rows, is refused before any state
    /// is touched.
    pub fn ensure_restorable(&self, file: &str) -> CoreResult<()> {
        if self.data_statements() == 0 {
            return Err(CoreError::invalid_backup(
                file,
                "no INSERT or COPY statements found",
            ));
        }
        if self.mentions_restaurant_data && self.restaurant_rows == 0 {
            return Err(CoreError::invalid_backup(
                file,
                "declares restaurant data but contains zero restaurant rows",
            ));
        }
        Ok(())
    }
}

/// Returns true if the file at `path` starts with `magic`.
pub fn has_magic(path: &Path, magic: &[u8]) -> CoreResult<bool> {
    let mut head = vec![0u8; magic.len()];
    let mut file = File::open(path)?;
    let mut read = 0;
    while read < head.len() {
        match file.read(&mut head[read..])? {
            0 => return Ok(false),
            n => read += n,
        }
    }
    Ok(head == magic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn analyse(text: &str) -> DumpAnalysis {
        DumpAnalysis::from_reader(Cursor::new(text.as_bytes())).unwrap()
    }

    #[test]
    fn counts_sqlite_style_inserts() {
        let a = analyse(
            "PRAGMA foreign_keys=OFF;\n\
             BEGIN TRANSACTION;\n\
             INSERT INTO restaurants VALUES(1,'Cafe X','Downtown',3.0);\n\
             INSERT INTO \"restaurants\" VALUES(2,'Bar; Grill','Uptown',0.0);\n\
             INSERT INTO reviews VALUES(1,1,4,'good (really)','2024-01-01',NULL);\n\
             DELETE FROM sqlite_sequence;\n\
             INSERT INTO sqlite_sequence VALUES('restaurants',2);\n\
             COMMIT;\n",
        );
        assert_eq!(a.inserts, 4);
        assert_eq!(a.restaurant_rows, 2);
        assert_eq!(a.review_rows, 1);
        assert_eq!(a.sequence_commands, 2);
        assert!(a.mentions_restaurant_data);
        a.ensure_restorable("x.sql").unwrap();
    }

    #[test]
    fn counts_copy_blocks_and_multi_row_inserts() {
        let a = analyse(
            "-- Data for Name: restaurants; Type: TABLE DATA\n\
             COPY public.restaurants (id, name, location, rating) FROM stdin;\n\
             1\tCafe X\tDowntown\t3\n\
             2\tDiner\tMain St\t0\n\
             \\.\n\
             INSERT INTO public.reviews (id, restaurant_id, rating) VALUES (1, 1, 4), (2, 1, 2);\n\
             SELECT pg_catalog.setval('public.restaurants_id_seq', 2, true);\n",
        );
        assert_eq!(a.copies, 1);
        assert_eq!(a.restaurant_rows, 2);
        assert_eq!(a.review_rows, 2);
        assert_eq!(a.selects, 1);
        assert_eq!(a.sequence_commands, 1);
    }

    #[test]
    fn multi_line_statement_with_quoted_newline() {
        let a = analyse(
            "INSERT INTO reviews VALUES(1,1,5,'line one;\nline two',NULL,NULL);\n\
             INSERT INTO restaurants VALUES(1,'A','B',5.0);\n",
        );
        assert_eq!(a.inserts, 2);
        assert_eq!(a.review_rows, 1);
        assert_eq!(a.restaurant_rows, 1);
    }

    #[test]
    fn no_data_is_rejected() {
        let a = analyse("CREATE TABLE restaurants (id INTEGER);\n-- nothing else\n");
        assert_eq!(a.creates, 1);
        assert!(matches!(
            a.ensure_restorable("empty.sql"),
            Err(CoreError::InvalidBackup { .. })
        ));
    }

    #[test]
    fn declared_restaurant_data_without_rows_is_rejected() {
        let a = analyse(
            "-- Data for Name: restaurants; Type: TABLE DATA\n\
             COPY public.restaurants (id, name, location, rating) FROM stdin;\n\
             \\.\n\
             INSERT INTO reviews VALUES(1,1,4,'x',NULL,NULL);\n",
        );
        assert!(a.mentions_restaurant_data);
        assert_eq!(a.restaurant_rows, 0);
        let err = a.ensure_restorable("hollow.sql").unwrap_err();
        assert!(err.to_string().contains("zero restaurant rows"));
    }

    #[test]
    fn magic_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.backup");
        std::fs::write(&path, b"PGDMP\x01\x0e").unwrap();
        assert!(has_magic(&path, b"PGDMP").unwrap());
        assert!(!has_magic(&path, b"SQLite format 3\0").unwrap());
    }
}
