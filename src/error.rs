use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A named symbol, GOT entry or script variable is absent from the metadata.
    #[error("symbol '{name}' doesn't exist in {table}")]
    MissingSymbol { table: String, name: String },

    /// A chain still holds a placeholder when full evaluation was requested.
    #[error("unhandled placeholder expr found: {0}")]
    UnhandledPlaceholder(String),

    #[error("expression is not concrete: {0}")]
    NotConcrete(String),

    #[error("{technique} is not viable: {reason}")]
    Infeasible { technique: String, reason: String },

    #[error("unknown technique: {0}")]
    UnknownTechnique(String),

    #[error("gadget error: {0}")]
    Gadget(String),

    #[error("one_gadget error: {0}")]
    OneGadget(String),

    #[error("ELF error: {0}")]
    Elf(String),

    #[error("state error: {0}")]
    State(String),

    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
