//! CLI command implementations
//!
//! Every command returns its process exit code:
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | `query` produced an error result |
//! | 2 | Configuration or usage error |
//! | 5 | Fatal runtime error (e.g. database unreachable at startup) |

pub mod daemon;
pub mod query;
pub mod validate;

use crate::domain::TallyError;

/// Success
pub const EXIT_OK: i32 = 0;
/// A one-shot query resolved to an error result
pub const EXIT_TASK_FAILED: i32 = 1;
/// Configuration or usage error
pub const EXIT_CONFIG: i32 = 2;
/// Fatal runtime error
pub const EXIT_FATAL: i32 = 5;

/// Exit code for an application error
pub fn exit_code(err: &TallyError) -> i32 {
    match err {
        TallyError::Configuration(_) => EXIT_CONFIG,
        _ => EXIT_FATAL,
    }
}
