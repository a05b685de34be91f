use serde_json::Value;
use serde_json_path::JsonPath;

use super::{Capture, MetricBackend, Query};
use crate::error::CaptureError;

/// Evaluate a path expression against a document, expecting a single number
///
/// Accepts `{.data.value}`, `.data.value`, `data.value` and `$.data.value`. A string
/// match is parsed as a number.
///
/// # Errors
///
/// Fails when the expression does not parse, matches other than exactly once, or the
/// match is not numeric.
pub fn evaluate(doc: &Value, path: &str) -> Result<f64, CaptureError> {
    let expr = normalize(path);
    let compiled = JsonPath::parse(&expr).map_err(|e| CaptureError::InvalidPath {
        path: path.to_owned(),
        message: e.to_string(),
    })?;

    let nodes = compiled.query(doc).all();
    let [node] = nodes.as_slice() else {
        return Err(CaptureError::NoMatch(path.to_owned()));
    };

    match node {
        Value::Number(n) => n.as_f64().ok_or(CaptureError::NotNumeric),
        Value::String(s) => s.trim().parse().map_err(|_| CaptureError::NotNumeric),
        _ => Err(CaptureError::NotNumeric),
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim();
    let inner = trimmed
        .strip_prefix('{')
        .and_then(|p| p.strip_suffix('}'))
        .unwrap_or(trimmed)
        .trim();
    if inner.starts_with('$') {
        inner.to_owned()
    } else if inner.starts_with('.') || inner.starts_with('[') {
        format!("${inner}")
    } else {
        format!("$.{inner}")
    }
}

/// Fetch a document and evaluate the query against it
pub(super) async fn capture(
    backend: &dyn MetricBackend,
    url: &str,
    q: &Query<'_>,
) -> Result<Capture, CaptureError> {
    let doc = backend.fetch_json(url).await?;
    let value = evaluate(&doc, q.query)?;
    let error = match q.error_query {
        Some(error_query) => evaluate(&doc, error_query)?,
        None => 0.0,
    };
    Ok(Capture::Value { value, error })
}
