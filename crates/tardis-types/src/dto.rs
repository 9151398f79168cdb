//! Response envelope shared by every HTTP route.

use serde::{Deserialize, Serialize};

/// `{code, message, data}` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseResponse<T> {
    #[serde(default = "default_code")]
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<T>,
}

fn default_code() -> i32 {
    200
}

impl<T> BaseResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: 200,
            message: "Success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Maps a module error to an envelope status code.
pub trait ErrorCode {
    fn code(&self) -> i32;
}

impl<T> BaseResponse<T> {
    pub fn from_result<E: ErrorCode + std::fmt::Display>(result: Result<T, E>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::error(e.code(), e.to_string()),
        }
    }
}
