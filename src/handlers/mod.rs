//! Request handlers for the WX Gateway

pub mod tools;
pub mod webhook;

use std::collections::HashMap;

use crate::error::{AppError, AppResult};

/// Non-empty value of `key`
pub(crate) fn optional<'a>(params: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

/// Non-empty value of `key`, or a client error naming the parameter as `label`
pub(crate) fn require<'a>(
    params: &'a HashMap<String, String>,
    key: &str,
    label: &'static str,
) -> AppResult<&'a str> {
    optional(params, key).ok_or(AppError::MissingParam(label))
}
