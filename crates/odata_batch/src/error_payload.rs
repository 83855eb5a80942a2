// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! OData error payloads.
//!
//! A failed operation inside a batch response carries an error payload of the form
//!
//! ```json
//! {
//!   "error": {
//!     "code": "...",
//!     "message": "...",
//!     "target": "...",
//!     "details": [{ "code": "...", "message": "...", "target": "..." }],
//!     "innererror": {
//!       "message": "...",
//!       "type": "...",
//!       "stacktrace": "...",
//!       "internalexception": { ... }
//!     }
//!   }
//! }
//! ```
//!
//! Inner errors nest without limit in the format, so both directions count the nesting depth
//! with a [`RecursionDepthGuard`]: the first `innererror` is level 1 and a level beyond the
//! configured maximum fails with [`Error::RecursionDepthExceeded`].

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{Level, event};

use crate::depth;
use crate::{Error, RecursionDepthGuard, Result};

const ERROR: &str = "error";
const CODE: &str = "code";
const MESSAGE: &str = "message";
const TARGET: &str = "target";
const DETAILS: &str = "details";
const INNER_ERROR: &str = "innererror";
const TYPE: &str = "type";
const STACK_TRACE: &str = "stacktrace";
const INTERNAL_EXCEPTION: &str = "internalexception";

/// The error reported by a service for a failed request or operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ODataError {
    /// Service-defined error code.
    pub code: String,
    /// Human-readable description of the error.
    pub message: String,
    /// The target of the error, e.g. the name of the property in error.
    pub target: Option<String>,
    /// Additional errors, e.g. one per invalid property.
    pub details: Vec<ErrorDetail>,
    /// Debugging information, only exchanged when the service is configured to include it.
    pub inner_error: Option<InnerError>,
}

impl ODataError {
    /// Creates an error with a code and a message.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    /// Sets the target.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Adds a detail.
    #[must_use]
    pub fn with_detail(mut self, detail: ErrorDetail) -> Self {
        self.details.push(detail);
        self
    }

    /// Sets the inner error.
    #[must_use]
    pub fn with_inner_error(mut self, inner_error: InnerError) -> Self {
        self.inner_error = Some(inner_error);
        self
    }
}

/// One entry of the `details` array of an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorDetail {
    /// Service-defined error code.
    pub code: String,
    /// Human-readable description of the error.
    pub message: String,
    /// The target of the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl ErrorDetail {
    /// Creates a detail with a code and a message.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            target: None,
        }
    }
}

/// Debugging information attached to an error, possibly wrapping the exception that caused it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InnerError {
    /// Description of the inner error.
    pub message: String,
    /// Name of the type of the exception.
    pub type_name: String,
    /// Stack trace of the exception.
    pub stack_trace: String,
    /// The exception that caused this one.
    pub internal_exception: Option<Box<InnerError>>,
}

impl InnerError {
    /// Creates an inner error with a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Sets the type name.
    #[must_use]
    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = type_name.into();
        self
    }

    /// Sets the stack trace.
    #[must_use]
    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = stack_trace.into();
        self
    }

    /// Sets the exception that caused this one.
    #[must_use]
    pub fn with_internal_exception(mut self, internal_exception: Self) -> Self {
        self.internal_exception = Some(Box::new(internal_exception));
        self
    }
}

/// Converts `error` to its JSON representation.
///
/// The inner error is only included when `include_debug_info` is set.
///
/// # Errors
///
/// Returns [`Error::RecursionDepthExceeded`] if the included inner errors nest deeper than
/// `max_depth`.
pub fn to_json(error: &ODataError, include_debug_info: bool, max_depth: usize) -> Result<Value> {
    let mut body = Map::new();
    body.insert(CODE.to_owned(), Value::from(error.code.as_str()));
    body.insert(MESSAGE.to_owned(), Value::from(error.message.as_str()));

    if let Some(target) = &error.target {
        body.insert(TARGET.to_owned(), Value::from(target.as_str()));
    }

    if !error.details.is_empty() {
        let details = serde_json::to_value(&error.details).map_err(Error::json)?;
        body.insert(DETAILS.to_owned(), details);
    }

    if include_debug_info && let Some(inner_error) = &error.inner_error {
        let mut guard = RecursionDepthGuard::new(max_depth);
        body.insert(INNER_ERROR.to_owned(), inner_error_to_json(inner_error, &mut guard)?);
    }

    let mut payload = Map::new();
    payload.insert(ERROR.to_owned(), Value::Object(body));
    Ok(Value::Object(payload))
}

/// Parses an error from its JSON representation.
///
/// Missing `code` and `message` members are read as empty strings.
///
/// # Errors
///
/// * [`Error::Format`] if `value` is not an error payload or a member has the wrong type.
/// * [`Error::RecursionDepthExceeded`] if inner errors nest deeper than `max_depth`.
pub fn from_json(value: &Value, max_depth: usize) -> Result<ODataError> {
    let body = value
        .get(ERROR)
        .and_then(Value::as_object)
        .ok_or_else(|| Error::format("an error payload must be an object with an 'error' object member"))?;

    let details = match body.get(DETAILS) {
        None | Some(Value::Null) => Vec::new(),
        Some(details) => {
            Vec::<ErrorDetail>::deserialize(details).map_err(|error| Error::format(format!("invalid error details: {error}")))?
        }
    };

    let inner_error = match body.get(INNER_ERROR) {
        None | Some(Value::Null) => None,
        Some(inner_error) => {
            let mut guard = RecursionDepthGuard::new(max_depth);
            Some(inner_error_from_json(inner_error, &mut guard)?)
        }
    };

    Ok(ODataError {
        code: string_member(body, CODE)?.unwrap_or_default(),
        message: string_member(body, MESSAGE)?.unwrap_or_default(),
        target: string_member(body, TARGET)?,
        details,
        inner_error,
    })
}

/// Writes `error` as JSON to `writer`.
///
/// # Errors
///
/// Returns the errors of [`to_json()`] and [`Error::Transport`] if `writer` fails.
pub fn write_error(writer: impl io::Write, error: &ODataError, include_debug_info: bool, max_depth: usize) -> Result<()> {
    let value = to_json(error, include_debug_info, max_depth)?;
    serde_json::to_writer(writer, &value).map_err(Error::json)?;

    event!(
        name: "odata_batch.error_payload.written",
        Level::TRACE,
        error.code = %error.code,
        include_debug_info,
    );

    Ok(())
}

/// Reads a JSON error payload from `reader`.
///
/// # Errors
///
/// Returns the errors of [`from_json()`], [`Error::Format`] if the input is not JSON and
/// [`Error::Transport`] if `reader` fails.
pub fn read_error(reader: impl io::Read, max_depth: usize) -> Result<ODataError> {
    let value = depth::parse_json(serde_json::Deserializer::from_reader(reader))?;
    from_json(&value, max_depth)
}

fn inner_error_to_json(inner_error: &InnerError, guard: &mut RecursionDepthGuard) -> Result<Value> {
    guard.enter()?;

    let mut object = Map::new();
    object.insert(MESSAGE.to_owned(), Value::from(inner_error.message.as_str()));
    object.insert(TYPE.to_owned(), Value::from(inner_error.type_name.as_str()));
    object.insert(STACK_TRACE.to_owned(), Value::from(inner_error.stack_trace.as_str()));

    if let Some(internal_exception) = &inner_error.internal_exception {
        object.insert(INTERNAL_EXCEPTION.to_owned(), inner_error_to_json(internal_exception, guard)?);
    }

    guard.leave();
    Ok(Value::Object(object))
}

fn inner_error_from_json(value: &Value, guard: &mut RecursionDepthGuard) -> Result<InnerError> {
    guard.enter()?;

    let object = value
        .as_object()
        .ok_or_else(|| Error::format("an inner error must be a JSON object"))?;

    let internal_exception = match object.get(INTERNAL_EXCEPTION) {
        None | Some(Value::Null) => None,
        Some(nested) => Some(Box::new(inner_error_from_json(nested, guard)?)),
    };

    guard.leave();

    Ok(InnerError {
        message: string_member(object, MESSAGE)?.unwrap_or_default(),
        type_name: string_member(object, TYPE)?.unwrap_or_default(),
        stack_trace: string_member(object, STACK_TRACE)?.unwrap_or_default(),
        internal_exception,
    })
}

fn string_member(object: &Map<String, Value>, name: &str) -> Result<Option<String>> {
    match object.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(other) => Err(Error::format(format!("the '{name}' member must be a string, found {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::testing::FailingWrite;

    fn nested(levels: usize) -> InnerError {
        let mut inner_error = InnerError::new(format!("level {levels}"));
        for level in (1..levels).rev() {
            inner_error = InnerError::new(format!("level {level}")).with_internal_exception(inner_error);
        }
        inner_error
    }

    fn sample() -> ODataError {
        ODataError::new("InvalidValue", "The value is invalid.")
            .with_target("Name")
            .with_detail(ErrorDetail::new("TooLong", "Name is too long."))
            .with_inner_error(
                InnerError::new("outer")
                    .with_type_name("ArgumentException")
                    .with_stack_trace("at A")
                    .with_internal_exception(InnerError::new("inner")),
            )
    }

    #[test]
    fn writes_odata_shape() {
        let value = to_json(&sample(), true, 10).unwrap();

        assert_eq!(
            value,
            json!({
                "error": {
                    "code": "InvalidValue",
                    "message": "The value is invalid.",
                    "target": "Name",
                    "details": [{ "code": "TooLong", "message": "Name is too long." }],
                    "innererror": {
                        "message": "outer",
                        "type": "ArgumentException",
                        "stacktrace": "at A",
                        "internalexception": { "message": "inner", "type": "", "stacktrace": "" }
                    }
                }
            })
        );
    }

    #[test]
    fn debug_info_is_opt_in() {
        let value = to_json(&sample(), false, 10).unwrap();

        assert!(value["error"].get("innererror").is_none());
        assert_eq!(value["error"]["code"], "InvalidValue");
    }

    #[test]
    fn parses_what_it_writes() {
        let error = sample();
        let value = to_json(&error, true, 10).unwrap();

        assert_eq!(from_json(&value, 10).unwrap(), error);
    }

    #[test]
    fn nesting_depth_is_bounded_on_write() {
        let error = ODataError::new("c", "m").with_inner_error(nested(3));

        to_json(&error, true, 3).unwrap();
        assert!(matches!(
            to_json(&error, true, 2),
            Err(Error::RecursionDepthExceeded { max: 2 })
        ));
        // Nothing nested is written without debug info.
        to_json(&error, false, 0).unwrap();
    }

    #[test]
    fn nesting_depth_is_bounded_on_read() {
        let value = json!({
            "error": {
                "code": "c",
                "message": "m",
                "innererror": { "internalexception": { "internalexception": {} } }
            }
        });

        assert_eq!(
            from_json(&value, 3).unwrap().inner_error.unwrap().internal_exception.unwrap().message,
            ""
        );
        assert!(matches!(from_json(&value, 2), Err(Error::RecursionDepthExceeded { max: 2 })));
    }

    #[test]
    fn malformed_payloads_are_format_errors() {
        for value in [
            json!([]),
            json!({ "error": "nope" }),
            json!({ "error": { "code": 42 } }),
            json!({ "error": { "details": {} } }),
            json!({ "error": { "innererror": [] } }),
        ] {
            assert!(matches!(from_json(&value, 10), Err(Error::Format(_))), "{value}");
        }
    }

    #[test]
    fn missing_members_default_to_empty() {
        let error = from_json(&json!({ "error": {} }), 10).unwrap();

        assert_eq!(error, ODataError::default());
    }

    #[test]
    fn write_and_read_through_io() {
        let mut buffer = Vec::new();
        write_error(&mut buffer, &sample(), false, 10).unwrap();

        let error = read_error(buffer.as_slice(), 10).unwrap();
        assert_eq!(error.code, "InvalidValue");
        assert_eq!(error.inner_error, None);

        assert!(matches!(read_error(&b"{ not json"[..], 10), Err(Error::Format(_))));
    }

    #[test]
    fn deep_nesting_is_bounded_only_by_max_depth() {
        let shallow = ODataError::new("c", "m").with_inner_error(nested(150));
        let mut buffer = Vec::new();
        write_error(&mut buffer, &shallow, true, 200).unwrap();

        assert_eq!(read_error(buffer.as_slice(), 200).unwrap(), shallow);
        assert!(matches!(
            read_error(buffer.as_slice(), 140),
            Err(Error::RecursionDepthExceeded { max: 140 })
        ));

        let deep = ODataError::new("c", "m").with_inner_error(nested(201));
        let mut buffer = Vec::new();
        write_error(&mut buffer, &deep, true, 201).unwrap();

        assert!(matches!(
            read_error(buffer.as_slice(), 200),
            Err(Error::RecursionDepthExceeded { max: 200 })
        ));
    }

    #[test]
    fn sink_failure_is_transport_error() {
        let result = write_error(FailingWrite::after(4), &sample(), false, 10);

        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
