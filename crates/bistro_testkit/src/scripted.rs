//! A scripted dump tool that works against a [`MemoryBackend`].
//!
//! [`ScriptedDialect`] produces invocations of three fake programs
//! (`mock_dump`, `mock_restore`, `mock_sql`). [`ScriptedRunner`] interprets
//! them in-process: dumps render the backend's tables as SQL `INSERT`
//! statements, loads parse them back, and truncate/repair call straight into
//! the backend. Every step can be made to fail, time out or print warnings,
//! and hooks can run code while a step is in flight.

use bistro_core::backup::{BackupFormat, DumpDialect, Invocation, ToolOutput, ToolRunner};
use bistro_core::{CoreError, CoreResult};
use bistro_store::{
    MemoryBackend, Rating, Restaurant, RestaurantId, Review, ReviewId, StoreBackend, Tables,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Header of a scripted custom-format archive.
pub const SCRIPTED_MAGIC: &[u8] = b"MOCKDMP\n";

/// Program writing dumps.
pub const DUMP_PROGRAM: &str = "mock_dump";
/// Program loading custom archives.
pub const RESTORE_PROGRAM: &str = "mock_restore";
/// Program running SQL and loading plain dumps.
pub const SQL_PROGRAM: &str = "mock_sql";

/// One kind of invocation the scripted tools understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// `--version`.
    Probe,
    /// Connection check.
    Ping,
    /// Writing a dump.
    Dump,
    /// Killing other sessions.
    Terminate,
    /// Creating tables.
    Schema,
    /// Emptying tables.
    Truncate,
    /// Loading a dump.
    Load,
    /// Resetting id sequences.
    Repair,
}

impl Step {
    const ALL: [Step; 8] = [
        Step::Probe,
        Step::Ping,
        Step::Dump,
        Step::Terminate,
        Step::Schema,
        Step::Truncate,
        Step::Load,
        Step::Repair,
    ];

    /// The first argument identifying this step.
    pub fn as_arg(self) -> &'static str {
        match self {
            Step::Probe => "--version",
            Step::Ping => "ping",
            Step::Dump => "dump",
            Step::Terminate => "terminate",
            Step::Schema => "schema",
            Step::Truncate => "truncate",
            Step::Load => "load",
            Step::Repair => "repair",
        }
    }

    /// Recognises the step an invocation performs.
    pub fn of(invocation: &Invocation) -> Option<Step> {
        let first = invocation.args.first()?.to_string_lossy();
        Self::ALL.into_iter().find(|s| s.as_arg() == first)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

/// [`DumpDialect`] emitting scripted invocations.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDialect;

impl ScriptedDialect {
    /// Creates the dialect.
    pub fn new() -> Self {
        Self
    }

    fn call(program: &str, step: Step) -> Invocation {
        Invocation::new(program)
            .arg(step.as_arg())
            .env("MOCK_PASSWORD", "secret")
    }
}

fn format_arg(format: BackupFormat) -> &'static str {
    match format {
        BackupFormat::Custom => "--format=custom",
        BackupFormat::Plain => "--format=plain",
    }
}

impl DumpDialect for ScriptedDialect {
    fn name(&self) -> &str {
        "scripted"
    }

    fn custom_magic(&self) -> &'static [u8] {
        SCRIPTED_MAGIC
    }

    fn dump_probe(&self) -> Invocation {
        Self::call(DUMP_PROGRAM, Step::Probe)
    }

    fn load_probe(&self, format: BackupFormat) -> Invocation {
        match format {
            BackupFormat::Custom => Self::call(RESTORE_PROGRAM, Step::Probe),
            BackupFormat::Plain => Self::call(SQL_PROGRAM, Step::Probe),
        }
    }

    fn check_connection(&self) -> Invocation {
        Self::call(SQL_PROGRAM, Step::Ping)
    }

    fn dump(&self, format: BackupFormat, output: &Path) -> Invocation {
        Self::call(DUMP_PROGRAM, Step::Dump)
            .arg(format_arg(format))
            .arg(output)
    }

    fn terminate_connections(&self) -> Option<Invocation> {
        Some(Self::call(SQL_PROGRAM, Step::Terminate))
    }

    fn prepare_schema(&self) -> Invocation {
        Self::call(SQL_PROGRAM, Step::Schema)
    }

    fn truncate(&self) -> Invocation {
        Self::call(SQL_PROGRAM, Step::Truncate)
    }

    fn load(&self, format: BackupFormat, input: &Path) -> Invocation {
        let program = match format {
            BackupFormat::Custom => RESTORE_PROGRAM,
            BackupFormat::Plain => SQL_PROGRAM,
        };
        Self::call(program, Step::Load)
            .arg(format_arg(format))
            .arg(input)
    }

    fn repair_sequences(&self) -> Invocation {
        Self::call(SQL_PROGRAM, Step::Repair)
    }
}

/// Code run when a step starts.
pub type StepHook = Arc<dyn Fn(&Invocation) + Send + Sync>;

#[derive(Default)]
struct Script {
    missing: HashSet<String>,
    failing: HashMap<Step, (i32, Vec<String>)>,
    timing_out: HashSet<Step>,
    warnings: HashMap<Step, Vec<String>>,
    hooks: HashMap<Step, StepHook>,
    hollow_dumps: bool,
    hollow_loads: bool,
}

/// [`ToolRunner`] interpreting [`ScriptedDialect`] invocations against a
/// [`MemoryBackend`].
pub struct ScriptedRunner {
    backend: MemoryBackend,
    script: Mutex<Script>,
    log: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    /// Creates a runner over `backend`.
    pub fn new(backend: MemoryBackend) -> Self {
        Self {
            backend,
            script: Mutex::new(Script::default()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Makes `program` fail to start.
    pub fn remove_program(&self, program: &str) {
        self.script.lock().missing.insert(program.to_string());
    }

    /// Makes `step` exit with `code` and print `lines`.
    pub fn fail(&self, step: Step, code: i32, lines: &[&str]) {
        let lines = lines.iter().map(|l| (*l).to_string()).collect();
        self.script.lock().failing.insert(step, (code, lines));
    }

    /// Makes `step` overrun its deadline.
    pub fn time_out(&self, step: Step) {
        self.script.lock().timing_out.insert(step);
    }

    /// Makes `step` succeed but print `line`.
    pub fn warn(&self, step: Step, line: &str) {
        self.script
            .lock()
            .warnings
            .entry(step)
            .or_default()
            .push(line.to_string());
    }

    /// Runs `hook` every time `step` starts.
    pub fn on(&self, step: Step, hook: impl Fn(&Invocation) + Send + Sync + 'static) {
        self.script.lock().hooks.insert(step, Arc::new(hook));
    }

    /// Dumps succeed but write only a comment.
    pub fn hollow_dumps(&self, hollow: bool) {
        self.script.lock().hollow_dumps = hollow;
    }

    /// Loads succeed but insert nothing.
    pub fn hollow_loads(&self, hollow: bool) {
        self.script.lock().hollow_loads = hollow;
    }

    /// Removes every scripted fault and hook.
    pub fn reset(&self) {
        *self.script.lock() = Script::default();
    }

    /// Every invocation seen so far.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.log.lock().clone()
    }

    /// The steps seen so far, in order.
    pub fn steps(&self) -> Vec<Step> {
        self.log.lock().iter().filter_map(Step::of).collect()
    }

    /// Forgets recorded invocations.
    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    fn perform(&self, step: Step, invocation: &Invocation, hollow: (bool, bool)) -> ToolOutput {
        let result = match step {
            Step::Probe => Ok(vec![format!("{} (scripted) 1.0", invocation.program)]),
            Step::Ping => self
                .backend
                .connect()
                .and_then(|mut s| s.ping())
                .map(|()| vec!["ok".to_string()])
                .map_err(|e| e.to_string()),
            Step::Dump => path_arg(invocation).and_then(|(format, path)| {
                let text = if hollow.0 {
                    "-- empty\n".to_string()
                } else {
                    render_dump(&self.backend.snapshot())
                };
                let mut bytes = Vec::new();
                if format == BackupFormat::Custom {
                    bytes.extend_from_slice(SCRIPTED_MAGIC);
                }
                bytes.extend_from_slice(text.as_bytes());
                fs::write(&path, bytes).map_err(|e| e.to_string())?;
                Ok(vec![format!("dumped to {}", path.display())])
            }),
            Step::Terminate => {
                let n = self.backend.terminate_sessions();
                Ok(vec![format!("terminated {n} session(s)")])
            }
            Step::Schema => Ok(vec!["schema ready".to_string()]),
            Step::Truncate => {
                self.backend.truncate();
                Ok(vec!["TRUNCATE TABLE".to_string()])
            }
            Step::Load => path_arg(invocation).and_then(|(format, path)| {
                let bytes = fs::read(&path).map_err(|e| e.to_string())?;
                let body = match format {
                    BackupFormat::Custom => bytes
                        .strip_prefix(SCRIPTED_MAGIC)
                        .ok_or("input file does not appear to be a valid archive")?,
                    BackupFormat::Plain => &bytes[..],
                };
                if hollow.1 {
                    return Ok(vec!["loaded 0 row(s)".to_string()]);
                }
                let mut tables = self.backend.snapshot();
                let rows = load_dump(&String::from_utf8_lossy(body), &mut tables)?;
                self.backend.replace(tables);
                Ok(vec![format!("loaded {rows} row(s)")])
            }),
            Step::Repair => {
                self.backend.repair_sequences();
                Ok(vec!["sequences repaired".to_string()])
            }
        };
        match result {
            Ok(lines) => ToolOutput {
                status: Some(0),
                lines,
            },
            Err(message) => ToolOutput {
                status: Some(1),
                lines: vec![format!("ERROR: {message}")],
            },
        }
    }
}

impl ToolRunner for ScriptedRunner {
    fn run(&self, invocation: &Invocation, timeout: Duration) -> CoreResult<ToolOutput> {
        self.log.lock().push(invocation.clone());
        let step = Step::of(invocation).ok_or_else(|| CoreError::ToolFailed {
            program: invocation.program.clone(),
            code: Some(64),
            output: vec![format!("unknown command {:?}", invocation.args_lossy())],
        })?;
        tracing::debug!(program = %invocation.program, %step, "scripted tool");

        let (hook, failing, warnings, hollow) = {
            let script = self.script.lock();
            if script.missing.contains(&invocation.program) {
                return Err(CoreError::ToolMissing {
                    program: invocation.program.clone(),
                });
            }
            (
                script.hooks.get(&step).cloned(),
                script.failing.get(&step).cloned(),
                script.warnings.get(&step).cloned().unwrap_or_default(),
                (script.hollow_dumps, script.hollow_loads),
            )
        };
        if let Some(hook) = hook {
            hook(invocation);
        }
        if self.script.lock().timing_out.contains(&step) {
            return Err(CoreError::ToolTimeout {
                program: invocation.program.clone(),
                timeout,
            });
        }
        if let Some((code, lines)) = failing {
            return Ok(ToolOutput {
                status: Some(code),
                lines,
            });
        }

        let mut output = self.perform(step, invocation, hollow);
        if output.success() {
            output.lines.extend(warnings);
        }
        Ok(output)
    }
}

impl fmt::Debug for ScriptedRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedRunner")
            .field("invocations", &self.log.lock().len())
            .finish()
    }
}

fn path_arg(invocation: &Invocation) -> Result<(BackupFormat, PathBuf), String> {
    let format = match invocation.args.get(1).map(|a| a.to_string_lossy()) {
        Some(f) if f == "--format=custom" => BackupFormat::Custom,
        Some(f) if f == "--format=plain" => BackupFormat::Plain,
        other => return Err(format!("bad format argument {other:?}")),
    };
    let path = invocation
        .args
        .get(2)
        .map(PathBuf::from)
        .ok_or("missing file argument")?;
    Ok((format, path))
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Renders `tables` as a plain SQL data dump.
pub fn render_dump(tables: &Tables) -> String {
    let mut out = String::from("-- Scripted database dump\n\n");
    out.push_str("-- Data for Name: restaurants\n");
    for (id, r) in &tables.restaurants {
        out.push_str(&format!(
            "INSERT INTO restaurants (id, name, location, rating) VALUES ({id}, {}, {}, {});\n",
            quote(r.name()),
            quote(r.location()),
            r.rating()
        ));
    }
    out.push_str("\n-- Data for Name: reviews\n");
    for (id, r) in &tables.reviews {
        let updated = r
            .updated_at()
            .map_or_else(|| "NULL".to_string(), |t| quote(&t.to_rfc3339()));
        out.push_str(&format!(
            "INSERT INTO reviews (id, restaurant_id, rating, comment, created_at, updated_at) VALUES ({id}, {}, {}, {}, {}, {updated});\n",
            r.restaurant_id(),
            r.rating(),
            quote(r.comment()),
            quote(&r.created_at().to_rfc3339()),
        ));
    }
    out.push_str(&format!(
        "\nSELECT setval('restaurants_id_seq', {});\nSELECT setval('reviews_id_seq', {});\n",
        tables.restaurant_seq.max(1),
        tables.review_seq.max(1)
    ));
    out
}

/// Splits `text` into statements on `;` outside quotes, dropping comment
/// lines.
fn statements(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    for line in text.lines() {
        if !in_quote && current.trim().is_empty() && line.trim_start().starts_with("--") {
            continue;
        }
        for c in line.chars() {
            match c {
                '\'' => {
                    in_quote = !in_quote;
                    current.push(c);
                }
                ';' if !in_quote => {
                    out.push(std::mem::take(&mut current).trim().to_string());
                }
                _ => current.push(c),
            }
        }
        current.push('\n');
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

/// Parses the value list of an `INSERT ... VALUES (...)` statement.
fn values(stmt: &str) -> Result<Vec<Option<String>>, String> {
    let upper = stmt.to_ascii_uppercase();
    let start = upper.find("VALUES").ok_or("INSERT without VALUES")?;
    let rest = &stmt[start + "VALUES".len()..];
    let open = rest.find('(').ok_or("VALUES without tuple")?;
    let mut chars = rest[open + 1..].chars().peekable();
    let mut fields = Vec::new();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let field = if chars.peek() == Some(&'\'') {
            chars.next();
            let mut s = String::new();
            loop {
                match chars.next() {
                    Some('\'') if chars.peek() == Some(&'\'') => {
                        chars.next();
                        s.push('\'');
                    }
                    Some('\'') => break,
                    Some(c) => s.push(c),
                    None => return Err("unterminated string".into()),
                }
            }
            Some(s)
        } else {
            let mut s = String::new();
            while let Some(&c) = chars.peek() {
                if c == ',' || c == ')' {
                    break;
                }
                s.push(c);
                chars.next();
            }
            let s = s.trim().to_string();
            (!s.eq_ignore_ascii_case("NULL")).then_some(s)
        };
        fields.push(field);
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        match chars.next() {
            Some(',') => continue,
            Some(')') => return Ok(fields),
            _ => return Err("malformed tuple".into()),
        }
    }
}

fn field<'a>(fields: &'a [Option<String>], i: usize, name: &str) -> Result<&'a str, String> {
    fields
        .get(i)
        .and_then(|f| f.as_deref())
        .ok_or_else(|| format!("null value in column \"{name}\""))
}

fn number<T: std::str::FromStr>(
    fields: &[Option<String>],
    i: usize,
    name: &str,
) -> Result<T, String> {
    field(fields, i, name)?
        .parse()
        .map_err(|_| format!("invalid input syntax for column \"{name}\""))
}

fn timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp {value:?}: {e}"))
}

/// Applies the `INSERT` statements in `text` to `tables`.
///
/// Enforces the unique name and the foreign key like the real schema does.
/// Returns the number of rows inserted. Nothing is applied on error.
pub fn load_dump(text: &str, tables: &mut Tables) -> Result<usize, String> {
    let mut staged = tables.clone();
    let mut rows = 0;
    for stmt in statements(text) {
        let upper = stmt.to_ascii_uppercase();
        if upper.starts_with("INSERT INTO RESTAURANTS") {
            let f = values(&stmt)?;
            let id = RestaurantId::new(number(&f, 0, "id")?);
            let restaurant = Restaurant::from_stored(
                id,
                field(&f, 1, "name")?.to_string(),
                field(&f, 2, "location")?.to_string(),
                number(&f, 3, "rating")?,
            )
            .map_err(|e| e.to_string())?;
            if staged.restaurants.contains_key(&id)
                || staged.restaurants.values().any(|r| r.name() == restaurant.name())
            {
                return Err(format!(
                    "duplicate key value violates unique constraint on restaurants: {}",
                    restaurant.name()
                ));
            }
            staged.restaurants.insert(id, restaurant);
        } else if upper.starts_with("INSERT INTO REVIEWS") {
            let f = values(&stmt)?;
            let id = ReviewId::new(number(&f, 0, "id")?);
            let restaurant_id = RestaurantId::new(number(&f, 1, "restaurant_id")?);
            if !staged.restaurants.contains_key(&restaurant_id) {
                return Err(format!(
                    "insert on table reviews violates foreign key constraint: restaurant {restaurant_id}"
                ));
            }
            let rating = Rating::new(number(&f, 2, "rating")?).map_err(|e| e.to_string())?;
            let updated_at = match f.get(5).and_then(|v| v.as_deref()) {
                Some(v) => Some(timestamp(v)?),
                None => None,
            };
            let review = Review::from_stored(
                id,
                restaurant_id,
                rating,
                field(&f, 3, "comment")?.to_string(),
                timestamp(field(&f, 4, "created_at")?)?,
                updated_at,
            );
            staged.reviews.insert(id, review);
        } else {
            continue;
        }
        rows += 1;
    }
    *tables = staged;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bistro_core::backup::DumpAnalysis;

    fn sample() -> Tables {
        let mut tables = Tables::default();
        let cafe = RestaurantId::new(1);
        tables.restaurants.insert(
            cafe,
            Restaurant::from_stored(cafe, "O'Brien's; Pub".into(), "Dock (east)".into(), 3.5)
                .unwrap(),
        );
        tables.reviews.insert(
            ReviewId::new(7),
            Review::from_stored(
                ReviewId::new(7),
                cafe,
                Rating::new(4).unwrap(),
                "two\nlines, 'quoted'".into(),
                Utc::now(),
                None,
            ),
        );
        tables.restaurant_seq = 1;
        tables.review_seq = 7;
        tables
    }

    #[test]
    fn dump_loads_back_into_empty_tables() {
        let tables = sample();
        let text = render_dump(&tables);
        let mut loaded = Tables::default();
        assert_eq!(load_dump(&text, &mut loaded).unwrap(), 2);
        assert_eq!(loaded.restaurants, tables.restaurants);
        assert_eq!(
            loaded.reviews[&ReviewId::new(7)].comment(),
            "two\nlines, 'quoted'"
        );
    }

    #[test]
    fn rendered_dump_is_understood_by_the_analyser() {
        let text = render_dump(&sample());
        let analysis = DumpAnalysis::from_reader(text.as_bytes()).unwrap();
        assert_eq!(analysis.restaurant_rows, 1);
        assert_eq!(analysis.review_rows, 1);
        assert_eq!(analysis.sequence_commands, 2);
        analysis.ensure_restorable("sample.sql").unwrap();
    }

    #[test]
    fn load_rejects_orphan_reviews_atomically() {
        let text = "INSERT INTO restaurants (id, name, location, rating) VALUES (1, 'A', 'B', 0);\n\
                    INSERT INTO reviews (id, restaurant_id, rating, comment, created_at, updated_at) \
                    VALUES (1, 9, 3, '', '2024-01-01T00:00:00Z', NULL);\n";
        let mut tables = Tables::default();
        let err = load_dump(text, &mut tables).unwrap_err();
        assert!(err.contains("foreign key"));
        assert!(tables.restaurants.is_empty());
    }

    #[test]
    fn runner_reports_missing_program_and_failures() {
        let runner = ScriptedRunner::new(MemoryBackend::new());
        let dialect = ScriptedDialect::new();
        runner.remove_program(RESTORE_PROGRAM);
        assert!(matches!(
            runner.run(&dialect.load_probe(BackupFormat::Custom), Duration::from_secs(1)),
            Err(CoreError::ToolMissing { .. })
        ));

        runner.fail(Step::Truncate, 3, &["permission denied"]);
        let out = runner
            .run(&dialect.truncate(), Duration::from_secs(1))
            .unwrap();
        assert_eq!(out.status, Some(3));
        assert_eq!(runner.steps(), [Step::Probe, Step::Truncate]);
    }

    #[test]
    fn custom_load_requires_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.backup");
        fs::write(&path, render_dump(&sample())).unwrap();
        let runner = ScriptedRunner::new(MemoryBackend::new());
        let out = runner
            .run(
                &ScriptedDialect::new().load(BackupFormat::Custom, &path),
                Duration::from_secs(1),
            )
            .unwrap();
        assert!(!out.success());
        assert!(out.lines[0].contains("valid archive"));
    }
}
