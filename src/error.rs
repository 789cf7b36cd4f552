use thiserror::Error;

pub type AccordResult<T> = Result<T, AccordError>;

#[derive(Debug, Error)]
pub enum AccordError {
    #[error(transparent)]
    Room(#[from] RoomError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    System(#[from] SystemError),
}

/// Errors occurring in room lifecycle and membership handling.
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("Invalid identifier '{0}': must match [A-Za-z0-9_-]{{1,64}}")]
    InvalidIdentifier(String),

    #[error("Room '{0}' is full")]
    RoomFull(String),

    #[error("Room '{0}' not found")]
    RoomNotFound(String),

    #[error("User '{0}' is not a member of this room")]
    NotAMember(String),

    #[error("Room is shutting down")]
    ShuttingDown,
}

/// Errors occurring within agent drivers and their tool loop.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid input to agent tool: {0}")]
    InvalidInput(String),

    #[error("Unknown tool: '{0}'")]
    UnknownTool(String),

    #[error("Tool loop exceeded maximum depth of {0}")]
    RecursionLimit(usize),

    #[error("LLM provider failure: {0}")]
    Provider(String),

    #[error("Agent execution failure: {0}")]
    Execution(String),
}

/// Errors related to negotiation creation and state transitions.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("Negotiation '{0}' not found")]
    NotFound(String),

    #[error("A negotiation is already active in this room: '{0}'")]
    AlreadyActive(String),

    #[error("Negotiation '{id}' is terminal ({status}); no further transitions")]
    Terminal { id: String, status: String },

    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),
}

/// Errors related to document generation and signing.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Document '{0}' not found")]
    NotFound(String),

    #[error("User '{0}' is not a party to this document")]
    NotAParty(String),

    #[error("Document '{0}' is already fully signed")]
    AlreadySigned(String),

    #[error("Document generation failed: {0}")]
    Generation(String),

    #[error("Milestone '{0}' not found")]
    MilestoneNotFound(String),
}

/// Errors related to payment execution and escrow holds.
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("Invalid payment request: {0}")]
    InvalidRequest(String),

    #[error("Escrow hold '{0}' not found")]
    HoldNotFound(String),

    #[error("Escrow hold '{id}' is not held (status: {status})")]
    NotHeld { id: String, status: String },

    #[error("Capture amount {requested} exceeds authorized amount {authorized}")]
    CaptureExceedsAuthorization { requested: i64, authorized: i64 },

    #[error("Payment provider declined: {0}")]
    Declined(String),

    #[error("Payment provider failure: {0}")]
    Provider(String),
}

/// Errors related to milestone verification sessions.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("Verification session already running for milestone '{0}'")]
    AlreadyRunning(String),

    #[error("Recommended amount {amount} outside [{min}, {max}]")]
    AmountOutOfRange { amount: i64, min: i64, max: i64 },

    #[error("Verification timed out")]
    TimedOut,

    #[error("Phone verification failure: {0}")]
    Phone(String),
}

/// Errors related to trigger detection.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("Trigger classifier returned malformed output: {0}")]
    MalformedClassifierOutput(String),

    #[error("Trigger already fired for this room")]
    AlreadyFired,
}

/// Errors related to network transport (WebSocket, HTTP providers).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization failed")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while assembling the startup configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid value for {var}: {msg}")]
    InvalidVar { var: String, msg: String },
}

/// Errors related to internal invariants and bugs. Fatal at room level.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Missing internal field: {0}")]
    MissingField(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}
