use ledger_crdt::{ClockError, Dataset, EncodingError, EnvelopeError, MessageError};

/// Boxed error from a store backend or collaborator.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while applying or exchanging change messages.
///
/// Any error raised while a batch is being applied rolls the whole batch
/// back before it is returned.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A row write was rejected, or the dataset is unknown.
    #[error("cannot apply {dataset}.{column}: {source}")]
    Schema {
        /// Dataset name as received.
        dataset: String,
        /// Column being written.
        column: String,
        /// Underlying failure.
        #[source]
        source: BoxError,
    },
    /// The clock refused a timestamp.
    #[error(transparent)]
    Clock(#[from] ClockError),
    /// A value could not be decoded.
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    /// Preferences cannot be written while importing.
    #[error("cannot set prefs while importing")]
    ModeViolation,
    /// Reading or writing the log, clock record or rows failed.
    #[error("store error: {0}")]
    Store(#[source] BoxError),
    /// The persisted clock record cannot be decoded.
    #[error("corrupt clock record: {0}")]
    CorruptClock(String),
    /// The full-sync loop kept finding differences.
    #[error("replica is out of sync after {rounds} rounds")]
    OutOfSync {
        /// Rounds attempted.
        rounds: usize,
    },
    /// The transport could not complete an exchange.
    #[error("transport error: {0}")]
    Transport(String),
    /// A sync envelope did not decode.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

impl SyncError {
    /// Wrap a store failure.
    pub fn store<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
        Self::Store(Box::new(e))
    }

    /// Wrap a failed row write.
    pub fn schema<E: std::error::Error + Send + Sync + 'static>(
        dataset: Dataset,
        column: &str,
        e: E,
    ) -> Self {
        Self::Schema {
            dataset: dataset.name().to_string(),
            column: column.to_string(),
            source: Box::new(e),
        }
    }

    /// Short stable code, used in [`SyncEvent::Error`](crate::SyncEvent::Error).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Schema { .. } => "invalid-schema",
            Self::Clock(ClockError::Skew(_)) => "clock-skew",
            Self::Clock(ClockError::Drift { .. }) => "clock-drift",
            Self::Clock(_) => "clock",
            Self::Encoding(_) => "encoding",
            Self::ModeViolation => "mode-violation",
            Self::Store(_) => "store",
            Self::CorruptClock(_) => "corrupt-clock",
            Self::OutOfSync { .. } => "out-of-sync",
            Self::Transport(_) => "network",
            Self::Envelope(_) => "envelope",
        }
    }

    /// Text suitable for showing to a user.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::OutOfSync { .. } => {
                "This device could not get back in sync with the server. Try resetting sync."
            }
            Self::Schema { .. } => {
                "A change could not be applied to the budget. Try updating the app."
            }
            Self::ModeViolation => "Preferences cannot be changed while importing.",
            _ => "Sync failed. It will be retried automatically.",
        }
    }
}

impl From<MessageError> for SyncError {
    fn from(e: MessageError) -> Self {
        match e {
            MessageError::Dataset(unknown) => Self::Schema {
                dataset: unknown.0.clone(),
                column: String::new(),
                source: Box::new(unknown),
            },
            MessageError::Encoding(e) => Self::Encoding(e),
            MessageError::Timestamp(e) => Self::Clock(e),
        }
    }
}
