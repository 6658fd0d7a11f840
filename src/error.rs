//! Error handling for Voice Ferry Core

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("SIP error: {0}")]
    Sip(String),

    #[error("SIP parse error at offset {offset}: {message}")]
    Parse { message: String, offset: usize },

    #[error("Transaction timeout: {0}")]
    TransactionTimeout(String),

    #[error("Dialog error: {0}")]
    Dialog(String),

    #[error("RTPEngine error: {0}")]
    RtpEngine(String),

    #[error("RTPEngine timeout: {0}")]
    RtpEngineTimeout(String),

    #[error("RTPEngine rejected request: {0}")]
    RtpEngineRejected(String),

    #[error("Session store error: {0}")]
    Store(String),

    #[error("Session limit exceeded for user {0}")]
    SessionLimitExceeded(String),

    #[error("No routing rule matched")]
    RoutingNoMatch,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("B2BUA error: {0}")]
    B2bua(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn sip<S: Into<String>>(msg: S) -> Self {
        Self::Sip(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S, offset: usize) -> Self {
        Self::Parse { message: msg.into(), offset }
    }

    pub fn rtp_engine<S: Into<String>>(msg: S) -> Self {
        Self::RtpEngine(msg.into())
    }

    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn not_supported<S: Into<String>>(msg: S) -> Self {
        Self::NotSupported(msg.into())
    }

    pub fn b2bua<S: Into<String>>(msg: S) -> Self {
        Self::B2bua(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Maps an error to the SIP status the B2BUA core should return to the
    /// A-leg UAC, per spec.md §7's error taxonomy.
    pub fn to_sip_status(&self) -> (u16, &'static str) {
        match self {
            Error::SessionLimitExceeded(_) => (486, "Busy Here"),
            Error::RoutingNoMatch => (404, "Not Found"),
            Error::RtpEngineTimeout(_) => (503, "Service Unavailable"),
            Error::RtpEngineRejected(_) => (488, "Not Acceptable Here"),
            Error::TransactionTimeout(_) => (408, "Request Timeout"),
            Error::Timeout(_) => (504, "Server Time-out"),
            Error::Store(_) => (503, "Service Unavailable"),
            Error::Parse { .. } => (400, "Bad Request"),
            _ => (500, "Server Internal Error"),
        }
    }
}
