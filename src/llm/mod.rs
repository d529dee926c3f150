pub mod provider;
pub mod queue;
pub mod verifier;

pub use provider::{create_provider, VisionProvider};
pub use queue::{AnalysisSummary, VerificationQueue};
pub use verifier::{LlmVerifier, SeriesVerifier, VerifyError};
