//! Command lines for each supported database's dump and restore tools.
//!
//! A dialect only builds [`Invocation`]s; running them, timeouts and
//! output capture belong to the [`ToolRunner`](super::ToolRunner).

use super::naming::BackupFormat;
use super::tool::Invocation;
use bistro_store::SCHEMA_SQL;
use std::path::{Path, PathBuf};

/// How to dump, truncate, load and repair one kind of database.
pub trait DumpDialect: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Leading bytes of a custom-format dump.
    fn custom_magic(&self) -> &'static [u8];

    /// Cheap invocation that proves the dump tool is installed.
    fn dump_probe(&self) -> Invocation;

    /// Cheap invocation that proves the tool used to load `format` is installed.
    fn load_probe(&self, format: BackupFormat) -> Invocation;

    /// Round trip against the live database.
    fn check_connection(&self) -> Invocation;

    /// Writes a dump of the live database to `output`.
    fn dump(&self, format: BackupFormat, output: &Path) -> Invocation;

    /// Terminates other sessions on the database, if the engine has any.
    fn terminate_connections(&self) -> Option<Invocation>;

    /// Creates missing tables before a plain load.
    fn prepare_schema(&self) -> Invocation;

    /// Empties both tables with referential checks suspended.
    fn truncate(&self) -> Invocation;

    /// Loads `input` into the emptied tables.
    fn load(&self, format: BackupFormat, input: &Path) -> Invocation;

    /// Moves id counters past the largest restored id.
    fn repair_sequences(&self) -> Invocation;
}

fn quoted(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', "''"))
}

/// SQLite through the `sqlite3` shell.
///
/// Custom dumps are page-level copies made with `.backup` and restored
/// with `.restore`. Plain dumps hold data only; the schema comes from
/// [`SCHEMA_SQL`].
#[derive(Debug, Clone)]
pub struct SqliteDialect {
    program: PathBuf,
    database: PathBuf,
}

impl SqliteDialect {
    /// Dialect for the database file at `database`, using `sqlite3` from `PATH`.
    pub fn new(database: impl Into<PathBuf>) -> Self {
        Self {
            program: PathBuf::from("sqlite3"),
            database: database.into(),
        }
    }

    /// Uses a specific `sqlite3` binary.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn shell(&self) -> Invocation {
        Invocation::new(self.program.display().to_string()).arg(self.database.as_os_str())
    }
}

impl DumpDialect for SqliteDialect {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn custom_magic(&self) -> &'static [u8] {
        b"SQLite format 3\0"
    }

    fn dump_probe(&self) -> Invocation {
        Invocation::new(self.program.display().to_string()).arg("-version")
    }

    fn load_probe(&self, _format: BackupFormat) -> Invocation {
        self.dump_probe()
    }

    fn check_connection(&self) -> Invocation {
        self.shell().arg("SELECT 1;")
    }

    fn dump(&self, format: BackupFormat, output: &Path) -> Invocation {
        match format {
            BackupFormat::Custom => self.shell().arg(format!(".backup {}", quoted(output))),
            BackupFormat::Plain => self
                .shell()
                .arg(format!(".output {}", quoted(output)))
                .arg(".dump --data-only"),
        }
    }

    fn terminate_connections(&self) -> Option<Invocation> {
        None
    }

    fn prepare_schema(&self) -> Invocation {
        self.shell().arg(SCHEMA_SQL)
    }

    fn truncate(&self) -> Invocation {
        self.shell().arg(
            "PRAGMA foreign_keys=OFF; \
             DELETE FROM reviews; \
             DELETE FROM restaurants; \
             PRAGMA foreign_keys=ON;",
        )
    }

    fn load(&self, format: BackupFormat, input: &Path) -> Invocation {
        match format {
            BackupFormat::Custom => self.shell().arg(format!(".restore {}", quoted(input))),
            BackupFormat::Plain => Invocation::new(self.program.display().to_string())
                .arg("-bail")
                .arg(self.database.as_os_str())
                .arg(format!(".read {}", quoted(input))),
        }
    }

    fn repair_sequences(&self) -> Invocation {
        self.shell().arg(
            "DELETE FROM sqlite_sequence WHERE name IN ('restaurants', 'reviews'); \
             INSERT INTO sqlite_sequence (name, seq) SELECT 'restaurants', COALESCE(MAX(id), 0) FROM restaurants; \
             INSERT INTO sqlite_sequence (name, seq) SELECT 'reviews', COALESCE(MAX(id), 0) FROM reviews;",
        )
    }
}

/// Tables for a plain PostgreSQL restore into an empty database.
pub const POSTGRES_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS restaurants (
    id       BIGSERIAL PRIMARY KEY,
    name     VARCHAR(255) NOT NULL UNIQUE,
    location VARCHAR(255) NOT NULL,
    rating   DOUBLE PRECISION NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS reviews (
    id            BIGSERIAL PRIMARY KEY,
    restaurant_id BIGINT NOT NULL REFERENCES restaurants(id) ON DELETE CASCADE,
    rating        INTEGER NOT NULL CHECK (rating BETWEEN 1 AND 5),
    comment       TEXT NOT NULL DEFAULT '',
    created_at    TIMESTAMPTZ NOT NULL,
    updated_at    TIMESTAMPTZ
);
";

/// PostgreSQL through `pg_dump`, `pg_restore` and `psql`.
///
/// Connection settings reach the tools only through `PGHOST`, `PGPORT`,
/// `PGUSER`, `PGPASSWORD` and `PGDATABASE`.
#[derive(Clone)]
pub struct PostgresDialect {
    host: String,
    port: u16,
    user: String,
    password: String,
    database: String,
    bin_dir: Option<PathBuf>,
}

impl PostgresDialect {
    /// Dialect for `database` on `localhost:5432`.
    pub fn new(
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: user.into(),
            password: password.into(),
            database: database.into(),
            bin_dir: None,
        }
    }

    /// Sets host and port.
    #[must_use]
    pub fn with_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Looks for the client tools in `dir` instead of `PATH`.
    #[must_use]
    pub fn with_bin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = Some(dir.into());
        self
    }

    fn tool(&self, name: &str) -> Invocation {
        let program = match &self.bin_dir {
            Some(dir) => dir.join(name).display().to_string(),
            None => name.to_string(),
        };
        Invocation::new(program)
            .env("PGHOST", &self.host)
            .env("PGPORT", self.port.to_string())
            .env("PGUSER", &self.user)
            .env("PGPASSWORD", &self.password)
            .env("PGDATABASE", &self.database)
    }

    fn psql(&self, sql: &str) -> Invocation {
        self.tool("psql")
            .args(["-X", "-q", "-v", "ON_ERROR_STOP=1", "-c"])
            .arg(sql)
    }
}

impl std::fmt::Debug for PostgresDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDialect")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl DumpDialect for PostgresDialect {
    fn name(&self) -> &str {
        "postgres"
    }

    fn custom_magic(&self) -> &'static [u8] {
        b"PGDMP"
    }

    fn dump_probe(&self) -> Invocation {
        self.tool("pg_dump").arg("--version")
    }

    fn load_probe(&self, format: BackupFormat) -> Invocation {
        match format {
            BackupFormat::Custom => self.tool("pg_restore").arg("--version"),
            BackupFormat::Plain => self.tool("psql").arg("--version"),
        }
    }

    fn check_connection(&self) -> Invocation {
        self.psql("SELECT 1")
    }

    fn dump(&self, format: BackupFormat, output: &Path) -> Invocation {
        let inv = match format {
            BackupFormat::Custom => self.tool("pg_dump").args(["--format=c", "--blobs"]),
            BackupFormat::Plain => self.tool("pg_dump").args(["--format=p", "--data-only"]),
        };
        let mut file = std::ffi::OsString::from("--file=");
        file.push(output.as_os_str());
        inv.args(["--encoding=UTF8", "--verbose"]).arg(file)
    }

    fn terminate_connections(&self) -> Option<Invocation> {
        Some(self.psql(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = current_database() AND pid <> pg_backend_pid()",
        ))
    }

    fn prepare_schema(&self) -> Invocation {
        self.psql(POSTGRES_SCHEMA_SQL)
    }

    fn truncate(&self) -> Invocation {
        self.psql(
            "SET session_replication_role = replica; \
             TRUNCATE TABLE reviews, restaurants; \
             SET session_replication_role = origin;",
        )
    }

    fn load(&self, format: BackupFormat, input: &Path) -> Invocation {
        match format {
            BackupFormat::Custom => self
                .tool("pg_restore")
                .args(["--data-only", "--no-owner", "--verbose", "-d"])
                .arg(&self.database)
                .arg(input.as_os_str()),
            BackupFormat::Plain => self
                .tool("psql")
                .args(["-X", "-v", "ON_ERROR_STOP=1", "-f"])
                .arg(input.as_os_str()),
        }
    }

    fn repair_sequences(&self) -> Invocation {
        self.psql(
            "SELECT setval('public.restaurants_id_seq', COALESCE((SELECT MAX(id) FROM public.restaurants), 1), true); \
             SELECT setval('public.reviews_id_seq', COALESCE((SELECT MAX(id) FROM public.reviews), 1), true);",
        )
    }
}
