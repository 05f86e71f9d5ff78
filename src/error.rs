use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("template syntax error: {0}")]
    TemplateSyntax(String),

    #[error("unknown input string method '.{0}'")]
    UnknownField(String),

    #[error("invalid replacement index in '{template}'")]
    TemplateIndex { template: String },

    #[error("--env: variable '{name}' not found in {rule}")]
    Substitution { name: String, rule: String },

    #[error("multiple args not allowed after '{0}'")]
    MultipleFileArgs(String),

    #[error("invalid idset '{0}'")]
    InvalidIdset(String),

    #[error("{option}: invalid value '{value}'")]
    InvalidOption { option: String, value: String },

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("invalid pattern: {0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("{0}")]
    Submission(String),

    #[error("remote unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
