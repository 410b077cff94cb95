//! Per-destination notification filter.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::notification::{Notification, NotificationType, Priority};

/// Metadata key that supports threshold conditions.
const CONFIDENCE_KEY: &str = "confidence";

/// Which notifications a destination receives.
///
/// Empty lists match everything. Metadata filters compare the stringified
/// value when the notification carries the key; `confidence` instead accepts
/// a threshold such as `">0.8"` or `"<0.5"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushFilter {
    pub types: Vec<NotificationType>,
    pub priorities: Vec<Priority>,
    pub components: Vec<String>,
    pub metadata_filters: Map<String, Value>,
}

impl PushFilter {
    pub fn matches(&self, notification: &Notification) -> bool {
        if !self.types.is_empty() && !self.types.contains(&notification.notification_type) {
            return false;
        }
        if !self.priorities.is_empty() && !self.priorities.contains(&notification.priority) {
            return false;
        }
        if !self.components.is_empty() && !self.components.contains(&notification.component) {
            return false;
        }

        self.metadata_filters.iter().all(|(key, expected)| {
            if key == CONFIDENCE_KEY {
                // Only string thresholds are understood; anything else is ignored.
                return match expected {
                    Value::String(condition) => {
                        confidence_matches(condition, notification.metadata.get(key))
                    }
                    _ => true,
                };
            }
            match notification.metadata.get(key) {
                Some(actual) => display(actual) == display(expected),
                None => true,
            }
        })
    }
}

fn confidence_matches(condition: &str, actual: Option<&Value>) -> bool {
    let actual = actual.and_then(as_f64).unwrap_or(0.0);
    let condition = condition.trim();

    let (op, rest) = if let Some(rest) = condition.strip_prefix(">=") {
        (">=", rest)
    } else if let Some(rest) = condition.strip_prefix("<=") {
        ("<=", rest)
    } else if let Some(rest) = condition.strip_prefix('>') {
        (">", rest)
    } else if let Some(rest) = condition.strip_prefix('<') {
        ("<", rest)
    } else {
        // Bare values are not thresholds.
        return true;
    };
    let threshold: f64 = rest.trim().parse().unwrap_or(0.0);

    match op {
        ">=" => actual >= threshold,
        "<=" => actual <= threshold,
        ">" => actual > threshold,
        _ => actual < threshold,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Strings compare by content, everything else by its JSON rendering.
fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn detection(confidence: f64) -> Notification {
        Notification::new(NotificationType::Detection, Priority::Medium, "Bird", "seen")
            .with_component("detector")
            .with_metadata("confidence", confidence)
            .with_metadata("species", "Robin")
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(PushFilter::default().matches(&detection(0.1)));
    }

    #[test]
    fn test_type_priority_component() {
        let n = detection(0.9);
        let filter = PushFilter {
            types: vec![NotificationType::Error],
            ..Default::default()
        };
        assert!(!filter.matches(&n));

        let filter = PushFilter {
            types: vec![NotificationType::Detection],
            priorities: vec![Priority::Medium, Priority::High],
            components: vec!["detector".into()],
            ..Default::default()
        };
        assert!(filter.matches(&n));

        let filter = PushFilter {
            components: vec!["system".into()],
            ..Default::default()
        };
        assert!(!filter.matches(&n));
    }

    #[test]
    fn test_confidence_thresholds() {
        let mut filter = PushFilter::default();
        filter
            .metadata_filters
            .insert("confidence".into(), json!(">0.8"));
        assert!(filter.matches(&detection(0.9)));
        assert!(!filter.matches(&detection(0.8)));

        filter
            .metadata_filters
            .insert("confidence".into(), json!("<0.5"));
        assert!(filter.matches(&detection(0.4)));
        assert!(!filter.matches(&detection(0.6)));

        let missing = Notification::new(NotificationType::Detection, Priority::Low, "t", "m");
        filter
            .metadata_filters
            .insert("confidence".into(), json!(">0.1"));
        assert!(!filter.matches(&missing));
    }

    #[test]
    fn test_non_string_confidence_is_ignored() {
        let mut filter = PushFilter::default();
        filter
            .metadata_filters
            .insert("confidence".into(), json!(0.8));
        assert!(filter.matches(&detection(0.9)));
        assert!(filter.matches(&detection(0.1)));
    }

    #[test]
    fn test_exact_metadata_match() {
        let mut filter = PushFilter::default();
        filter
            .metadata_filters
            .insert("species".into(), json!("Robin"));
        assert!(filter.matches(&detection(0.5)));

        filter
            .metadata_filters
            .insert("species".into(), json!("Crow"));
        assert!(!filter.matches(&detection(0.5)));

        // Absent keys do not exclude.
        let mut filter = PushFilter::default();
        filter.metadata_filters.insert("camera".into(), json!("north"));
        assert!(filter.matches(&detection(0.5)));
    }

    #[test]
    fn test_deserialize_from_config() {
        let filter: PushFilter = serde_json::from_value(json!({
            "types": ["detection"],
            "priorities": ["high"],
            "metadata_filters": { "confidence": ">0.7" }
        }))
        .unwrap();
        assert_eq!(filter.types, vec![NotificationType::Detection]);
        assert_eq!(filter.priorities, vec![Priority::High]);
    }
}
