use thiserror::Error;

#[derive(Error, Debug)]
pub enum Aff4Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    HttpError(#[from] reqwest::Error),

    #[error("unknown urn: {0}")]
    NotFound(String),

    #[error("{subject} has no {attribute}")]
    MissingAttribute { subject: String, attribute: String },

    #[error("{urn} is not a {expected}")]
    WrongType { urn: String, expected: &'static str },

    #[error("malformed data: {0}")]
    FormatError(String),

    #[error("integrity check failed: {0}")]
    IntegrityError(String),

    #[error("crypto failure: {0}")]
    CryptoError(String),

    #[error("{0} is not writable")]
    ReadOnly(String),

    #[error("resolver has been dropped")]
    ResolverGone,

    #[error("invariant violated: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, Aff4Error>;

impl Aff4Error {
    pub fn missing(subject: &str, attribute: &str) -> Self {
        Aff4Error::MissingAttribute {
            subject: subject.to_string(),
            attribute: attribute.to_string(),
        }
    }

    pub fn format<S: Into<String>>(msg: S) -> Self {
        Aff4Error::FormatError(msg.into())
    }
}

impl From<Aff4Error> for std::io::Error {
    fn from(err: Aff4Error) -> Self {
        match err {
            Aff4Error::IOError(e) => e,
            e => std::io::Error::other(e),
        }
    }
}
