use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const APP_AVAILABLE: &str = "AppAvailable";
pub const APP_PROGRESSING: &str = "AppProgressing";
pub const ADDONS_PROVISIONED: &str = "AddOnsProvisioned";
pub const HOOKS_FINISHED: &str = "HooksFinished";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Insert or replace the condition with the same type, keeping list order stable.
/// The transition time only moves when the status actually changes.
pub fn set(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: impl Into<String>,
    message: impl Into<String>,
    observed_generation: Option<i64>,
) {
    let reason = reason.into();
    let message = message.into();

    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != status.as_str() {
                existing.last_transition_time = Time(Utc::now());
            }
            existing.status = status.as_str().into();
            existing.reason = reason;
            existing.message = message;
            existing.observed_generation = observed_generation;
        }
        None => conditions.push(Condition {
            last_transition_time: Time(Utc::now()),
            message,
            observed_generation,
            reason,
            status: status.as_str().into(),
            type_: type_.into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn set_appends_new_types_in_order() {
        let mut conditions = Vec::new();
        set(&mut conditions, APP_AVAILABLE, ConditionStatus::False, "Progressing", "first deployment", Some(1));
        set(&mut conditions, APP_PROGRESSING, ConditionStatus::True, "NewDeploy", "", Some(1));

        let types: Vec<_> = conditions.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(types, vec![APP_AVAILABLE, APP_PROGRESSING]);
        assert_eq!(find(&conditions, APP_PROGRESSING).unwrap().status, "True");
        assert!(find(&conditions, HOOKS_FINISHED).is_none());
    }

    #[test]
    fn set_keeps_transition_time_when_status_unchanged() {
        let mut conditions = Vec::new();
        set(&mut conditions, APP_AVAILABLE, ConditionStatus::False, "Progressing", "0/1 processes available", Some(1));
        let old = Time(Utc::now() - Duration::hours(1));
        conditions[0].last_transition_time = old.clone();

        set(&mut conditions, APP_AVAILABLE, ConditionStatus::False, "Progressing", "1/2 processes available", Some(2));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, old);
        assert_eq!(conditions[0].message, "1/2 processes available");
        assert_eq!(conditions[0].observed_generation, Some(2));

        set(&mut conditions, APP_AVAILABLE, ConditionStatus::True, "AppAvailable", "", Some(2));
        assert_ne!(conditions[0].last_transition_time, old);
        assert_eq!(conditions[0].status, "True");
    }
}
