//! tryon-session — runs one try-on session: the tracker thread, the
//! Loading/Scanning/Running/Error state machine and its configuration.

pub mod config;
pub mod engine;
pub mod session;

pub use config::Config;
pub use engine::{
    spawn_tracker, EngineError, SubmitOutcome, TrackerHandle, TrackerOutput, TrackerStats,
};
pub use session::{
    DetectorFactory, FailureKind, RendererFactory, Session, SessionBackends, SessionError,
    SessionFailure, SessionSnapshot, SessionStatus, TickReport,
};
