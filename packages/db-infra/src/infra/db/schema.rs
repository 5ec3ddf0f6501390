//! Schema definitions applied by the bootstrapper.
//!
//! A schema is either the built-in definition below or an external script of
//! `;`-separated statements. Splitting is deliberately naive: it does not
//! understand string literals or procedure bodies, so scripts must not put a
//! `;` inside either. Statements run one by one with no rollback across them,
//! which is why every statement should be written as `IF NOT EXISTS`.

use std::fmt;
use std::io;
use std::path::PathBuf;

use tracing::{debug, warn};

pub const DEFAULT_USERS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS users (
        id INT AUTO_INCREMENT PRIMARY KEY,
        user_name VARCHAR(50) UNIQUE NOT NULL,
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP
    )
"#;

/// Statements applied when no script is supplied.
pub const DEFAULT_SCHEMA: &[&str] = &[DEFAULT_USERS_TABLE];

/// Where the schema statements come from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SchemaSource {
    #[default]
    BuiltIn,
    Script(PathBuf),
}

impl SchemaSource {
    pub fn from_path(path: Option<PathBuf>) -> Self {
        match path {
            Some(p) => SchemaSource::Script(p),
            None => SchemaSource::BuiltIn,
        }
    }

    /// Load the statements to run.
    ///
    /// A named script that does not exist falls back to the built-in schema
    /// and is reported as [`SchemaOrigin::MissingScript`]. A script that
    /// exists but cannot be read is an error.
    pub async fn resolve(&self) -> io::Result<ResolvedSchema> {
        let path = match self {
            SchemaSource::BuiltIn => return Ok(ResolvedSchema::built_in(SchemaOrigin::BuiltIn)),
            SchemaSource::Script(path) => path,
        };

        // Only a definite "not found" falls back; other I/O errors surface.
        if !tokio::fs::try_exists(path).await? {
            warn!(
                schema_source = "missing_script",
                path = %path.display(),
                "schema script not found; applying built-in schema"
            );
            return Ok(ResolvedSchema::built_in(SchemaOrigin::MissingScript(
                path.clone(),
            )));
        }

        let text = tokio::fs::read_to_string(path).await?;
        let statements = split_statements(&text);
        debug!(
            schema_source = "script",
            path = %path.display(),
            statements = statements.len()
        );
        Ok(ResolvedSchema {
            origin: SchemaOrigin::Script(path.clone()),
            statements,
        })
    }
}

/// Where the resolved statements actually came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaOrigin {
    BuiltIn,
    Script(PathBuf),
    /// A script was named but absent; the built-in schema was used.
    MissingScript(PathBuf),
}

impl fmt::Display for SchemaOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaOrigin::BuiltIn => f.write_str("built-in"),
            SchemaOrigin::Script(p) => write!(f, "script {}", p.display()),
            SchemaOrigin::MissingScript(p) => {
                write!(f, "built-in (script {} not found)", p.display())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSchema {
    pub origin: SchemaOrigin,
    pub statements: Vec<String>,
}

impl ResolvedSchema {
    fn built_in(origin: SchemaOrigin) -> Self {
        Self {
            origin,
            statements: DEFAULT_SCHEMA.iter().map(|s| s.trim().to_string()).collect(),
        }
    }
}

/// Split script text on `;`, trimming each piece and dropping blanks.
pub fn split_statements(script: &str) -> Vec<String> {
    script
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
