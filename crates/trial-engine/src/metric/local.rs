use super::Capture;
use crate::error::CaptureError;

/// The rendered query is the value
pub(super) fn capture(query: &str) -> Result<Capture, CaptureError> {
    let value = query
        .trim()
        .parse::<f64>()
        .map_err(|_| CaptureError::InvalidValue(query.trim().to_owned()))?;
    Ok(Capture::Value { value, error: 0.0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rendered_duration() {
        assert_eq!(capture("90.0").unwrap(), Capture::Value { value: 90.0, error: 0.0 });
    }

    #[test]
    fn rejects_text() {
        let err = capture("ninety").unwrap_err();
        assert_eq!(err.to_string(), "invalid metric value 'ninety'");
    }
}
