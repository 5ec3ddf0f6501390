use std::fmt;

use thiserror::Error;

/// Bootstrap stages that can fail independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootstrapStage {
    AdminConnect,
    UserCreate,
    SchemaCreate,
}

impl BootstrapStage {
    pub fn as_str(self) -> &'static str {
        match self {
            BootstrapStage::AdminConnect => "admin_connect",
            BootstrapStage::UserCreate => "user_create",
            BootstrapStage::SchemaCreate => "schema_create",
        }
    }
}

impl fmt::Display for BootstrapStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum DbInfraError {
    #[error("Configuration error: {message}")]
    Config { message: String },
    #[error("Invalid {kind} identifier: {value:?}")]
    InvalidIdentifier { kind: &'static str, value: String },
    #[error("Bootstrap stage {stage} failed: {message}")]
    Stage {
        stage: BootstrapStage,
        message: String,
    },
    #[error("Fatal provisioning error: {message}")]
    FatalProvision { message: String },
}

impl DbInfraError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn stage(stage: BootstrapStage, message: impl Into<String>) -> Self {
        Self::Stage {
            stage,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::FatalProvision {
            message: message.into(),
        }
    }
}
