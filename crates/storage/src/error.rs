use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("storage entity '{entity}' with id '{id}' was not found"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("storage invariant violation: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("failed to create sqlite directory at {path}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse sqlite connection URL '{database_url}'"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to connect sqlite database '{database_url}'"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to configure sqlite pragma '{pragma}'"))]
    SqlitePragma {
        stage: &'static str,
        pragma: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("failed to run sqlite migrations"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("sqlite query failed at {stage}: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("failed to spawn sqlite worker thread"))]
    SqliteThreadSpawn {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to initialize sqlite worker runtime"))]
    SqliteRuntimeInit {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to encode {entity} on `{stage}`: {source}"))]
    EncodeJson {
        stage: &'static str,
        entity: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to decode {entity} on `{stage}`: {source}"))]
    DecodeJson {
        stage: &'static str,
        entity: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("timestamp '{raw}' is not RFC 3339 on `{stage}`: {source}"))]
    InvalidTimestamp {
        stage: &'static str,
        raw: String,
        source: chrono::ParseError,
    },
    #[snafu(display("failed to read dump file at {path:?}: {source}"))]
    ReadDump {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to write dump file at {path:?} on `{stage}`: {source}"))]
    WriteDump {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("dump version {found} is not supported (expected {expected})"))]
    UnsupportedDumpVersion {
        stage: &'static str,
        found: u32,
        expected: u32,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;
