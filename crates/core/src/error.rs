pub type Result<T> = eyre::Result<T>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("cannot read rules file {path}: {source}")]
    RulesFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid ruleset: {0}")]
    InvalidRuleset(String),
    #[error("ruleset update rejected: {0}")]
    UpdateRejected(String),
    #[error("invalid engine input: {0}")]
    InvalidInput(String),
}
