use thiserror::Error;

#[derive(Error, Debug)]
pub enum StagerError {
    #[error("No local copy available for {dataset}")]
    NotStaged { dataset: String },

    #[error("File is not tracked by the stager: {0}")]
    UnknownFile(String),

    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, StagerError>;
