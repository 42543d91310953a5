use thiserror::Error;

use crate::checker::PrepareError;
use crate::compiler::CompileError;
use crate::core::models::Status;
use crate::db::DbError;
use crate::sandbox::SandboxError;

/// Errors that end grading of a submission
#[derive(Debug, Error)]
pub enum GradeError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("compilation pipeline failed: {0}")]
    Compile(#[from] CompileError),

    #[error("checker preparation failed: {0}")]
    CheckerPrepare(#[from] PrepareError),

    #[error("unknown language {0:?}")]
    UnknownLanguage(String),

    #[error("language {0:?} is disabled on this grader")]
    LanguageDisabled(String),

    #[error("submission {id} is {status}, expected {expected}")]
    InvalidState {
        id: i64,
        status: Status,
        expected: Status,
    },

    #[error("grading cancelled")]
    Cancelled,
}

impl GradeError {
    /// Rejections of the request itself, as opposed to failures while grading
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            GradeError::UnknownLanguage(_)
                | GradeError::LanguageDisabled(_)
                | GradeError::InvalidState { .. }
                | GradeError::Db(DbError::NotFound(..))
        )
    }
}

pub type GradeResult<T> = std::result::Result<T, GradeError>;
