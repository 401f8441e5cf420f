use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid obligation definition '{definition}': {details}")]
    InvalidDefinition { definition: String, details: String },

    #[error("Invalid workflow '{workflow}': {details}")]
    InvalidWorkflow { workflow: String, details: String },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Date calculation error: {0}")]
    DateError(String),

    #[error("Task already exists for client {client}, obligation {definition}, period {period_key}")]
    DuplicateTask {
        client: Uuid,
        definition: Uuid,
        period_key: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Task {task} is not on step {step}")]
    StepMismatch { task: Uuid, step: Uuid },

    #[error("User {user} is not allowed to approve step {step}: requires role '{role}'")]
    NotAuthorized { user: Uuid, step: Uuid, role: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Errors that must abort a whole generation run instead of being recorded per item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Storage(_) | EngineError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
