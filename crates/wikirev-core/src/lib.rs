//! wikirev core - batch revision fetch engine for the MediaWiki API
//!
//! Fetches the latest revision of many articles, or the complete revision
//! history of individual articles, under a shared rate limit, and verifies
//! each assembled history is ordered, duplicate-free and complete.

pub mod assembler;
pub mod cancel;
pub mod collab;
pub mod config;
pub mod continuation;
pub mod decode;
pub mod error;
pub mod limiter;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod transport;
pub mod work_queue;

// Re-exports for convenience
pub use assembler::ArticleHistory;
pub use cancel::CancelFlag;
pub use collab::{CleanError, CleanStats, OutcomeSink, TextCleaner, clean_history};
pub use config::{BackoffConfig, ConfigError, FetchConfig, LatestContent};
pub use continuation::{ContinuationManager, CursorState};
pub use decode::{DecodeEvent, FetchResponse, decode_query};
pub use error::{FetchError, IssueError, VerificationFailure};
pub use limiter::{Permit, RateLimiter, Signal};
pub use logging::{IndicatifLogger, init_logging};
pub use model::{
    ArticleTarget, CompletedHistory, ContinuationToken, Endpoint, FetchOutcome, FetchRequest,
    Mode, RevisionRecord,
};
pub use orchestrator::{ArticleResult, BatchReport, Orchestrator};
pub use progress::{ProgressContext, SharedProgress, fmt_num};
pub use transport::{HttpTransport, ResponseBody, SHARED_RUNTIME, Transport};
