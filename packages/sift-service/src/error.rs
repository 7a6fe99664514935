pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Configuration error: {message}")]
	Configuration { message: String },
	#[error("Invalid request: {message}")]
	InvalidRequest { message: String },
	#[error("Provider error: {message}")]
	Provider { message: String },
	#[error("Storage error: {message}")]
	Storage { message: String },
	#[error("Consistency error: {message}")]
	Consistency { message: String },
}
impl Error {
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::Configuration { .. } => ErrorKind::Configuration,
			Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
			Self::Provider { .. } | Self::Storage { .. } => ErrorKind::Upstream,
			Self::Consistency { .. } => ErrorKind::Consistency,
		}
	}
}

/// Coarse classification callers use to pick a response; upstream failures cover every
/// out-of-process call (embedding, store, filter, reranker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	Configuration,
	InvalidRequest,
	Upstream,
	Consistency,
}

impl From<sqlx::Error> for Error {
	fn from(err: sqlx::Error) -> Self {
		Self::Storage { message: err.to_string() }
	}
}

impl From<sift_storage::Error> for Error {
	fn from(err: sift_storage::Error) -> Self {
		match err {
			sift_storage::Error::Sqlx(inner) => Self::Storage { message: inner.to_string() },
			sift_storage::Error::InvalidArgument(message) => Self::Configuration { message },
			sift_storage::Error::CorruptRow(message) => Self::Storage { message },
		}
	}
}

impl From<sift_providers::Error> for Error {
	fn from(err: sift_providers::Error) -> Self {
		Self::Provider { message: err.to_string() }
	}
}
