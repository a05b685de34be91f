//! Label selector helpers

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::BTreeMap;
use thiserror::Error;

/// Selector that cannot be expressed as a query
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    /// Unsupported match expression operator
    #[error("invalid label selector operator '{0}'")]
    Operator(String),
    /// `In`/`NotIn` without values
    #[error("label selector operator '{operator}' on '{key}' requires values")]
    MissingValues {
        /// Label key
        key: String,
        /// Operator
        operator: String,
    },
}

/// Render a selector in the `labelSelector` query syntax
///
/// # Errors
///
/// Returns [`SelectorError`] for unsupported operators or missing values.
pub fn to_query(selector: &LabelSelector) -> Result<String, SelectorError> {
    let mut parts = Vec::new();
    for (k, v) in selector.match_labels.iter().flatten() {
        parts.push(format!("{k}={v}"));
    }
    for expr in selector.match_expressions.iter().flatten() {
        let values = expr.values.as_deref().unwrap_or_default();
        let needs_values = || {
            if values.is_empty() {
                Err(SelectorError::MissingValues {
                    key: expr.key.clone(),
                    operator: expr.operator.clone(),
                })
            } else {
                Ok(values.join(","))
            }
        };
        match expr.operator.as_str() {
            "In" => parts.push(format!("{} in ({})", expr.key, needs_values()?)),
            "NotIn" => parts.push(format!("{} notin ({})", expr.key, needs_values()?)),
            "Exists" => parts.push(expr.key.clone()),
            "DoesNotExist" => parts.push(format!("!{}", expr.key)),
            other => return Err(SelectorError::Operator(other.to_owned())),
        }
    }
    Ok(parts.join(","))
}

/// Whether a label set satisfies a selector
#[must_use]
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let labels_ok = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(k, v)| labels.get(k) == Some(v));
    let exprs_ok = selector.match_expressions.iter().flatten().all(|expr| {
        let value = labels.get(&expr.key);
        let values = expr.values.as_deref().unwrap_or_default();
        match expr.operator.as_str() {
            "In" => value.is_some_and(|v| values.contains(v)),
            "NotIn" => value.map_or(true, |v| !values.contains(v)),
            "Exists" => value.is_some(),
            "DoesNotExist" => value.is_none(),
            _ => false,
        }
    });
    labels_ok && exprs_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn requirement(key: &str, operator: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.into(),
            operator: operator.into(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| (*v).to_owned()).collect())
            },
        }
    }

    #[test]
    fn query_renders_labels_and_expressions() {
        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([("app".into(), "web".into())])),
            match_expressions: Some(vec![
                requirement("tier", "In", &["a", "b"]),
                requirement("canary", "DoesNotExist", &[]),
            ]),
        };
        assert_eq!(to_query(&selector).unwrap(), "app=web,tier in (a,b),!canary");
    }

    #[test]
    fn query_rejects_bad_operator() {
        let selector = LabelSelector {
            match_expressions: Some(vec![requirement("x", "Like", &["y"])]),
            ..Default::default()
        };
        assert_eq!(
            to_query(&selector),
            Err(SelectorError::Operator("Like".into()))
        );
    }

    #[test]
    fn matching_honors_operators() {
        let labels = BTreeMap::from([("app".to_owned(), "web".to_owned())]);
        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([("app".into(), "web".into())])),
            match_expressions: Some(vec![requirement("tier", "NotIn", &["db"])]),
        };
        assert!(matches(&selector, &labels));
        assert!(matches(&LabelSelector::default(), &labels));

        let exists = LabelSelector {
            match_expressions: Some(vec![requirement("tier", "Exists", &[])]),
            ..Default::default()
        };
        assert!(!matches(&exists, &labels));
    }
}
