//! Run-id and resume-token generation.

use uuid::Uuid;

/// Generates run ids and resume tokens. A struct rather than free functions
/// so a deterministic generator can be swapped in if ids ever need to be
/// reproducible.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdGenerator;

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[must_use]
    pub fn generate_run_id(&self) -> String {
        format!("run-{}", Uuid::new_v4())
    }

    /// Resume tokens are unguessable capability tokens, not just ids.
    #[must_use]
    pub fn generate_resume_token(&self) -> String {
        format!("tok-{}", Uuid::new_v4().simple())
    }
}
