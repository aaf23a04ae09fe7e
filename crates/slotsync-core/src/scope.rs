use crate::wire::InboundEvent;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Branch {
    All,
    Baitursynov,
    Gagarina,
}

impl Default for Branch {
    fn default() -> Self {
        Self::All
    }
}

impl Branch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Branch::All => "all",
            Branch::Baitursynov => "baitursynov",
            Branch::Gagarina => "gagarina",
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Branch::All)
    }

    /// `all` on either side matches every branch.
    pub fn covers(&self, other: Branch) -> bool {
        self.is_wildcard() || other.is_wildcard() || *self == other
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Branch {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "all" => Ok(Branch::All),
            "baitursynov" => Ok(Branch::Baitursynov),
            "gagarina" => Ok(Branch::Gagarina),
            other => Err(format!("Unknown branch: {other}")),
        }
    }
}

/// The (branch, date) pair a view is filtered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub branch: Branch,
    pub date: NaiveDate,
}

impl Scope {
    pub fn new(branch: Branch, date: NaiveDate) -> Self {
        Self { branch, date }
    }

    pub fn today() -> Self {
        Self::new(Branch::All, Utc::now().date_naive())
    }

    /// Single relevance predicate for inbound events. Events without a
    /// parseable branch or date never match.
    pub fn is_relevant(&self, event: &InboundEvent) -> bool {
        let (Some(branch), Some(date)) = (event.branch, event.date) else {
            return false;
        };
        self.branch.covers(branch) && self.date == date
    }

    /// Value for the `branch` query parameter; omitted for `all`.
    pub fn branch_query(&self) -> Option<&'static str> {
        if self.branch.is_wildcard() {
            None
        } else {
            Some(self.branch.as_str())
        }
    }

    pub fn date_key(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.branch, self.date_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").expect("valid date")
    }

    fn event(branch: &str, day: &str) -> InboundEvent {
        let payload = json!({"branch": branch, "date": day});
        let serde_json::Value::Object(fields) = payload else {
            panic!("object payload")
        };
        InboundEvent::new("appointment_created", fields)
    }

    #[test]
    fn relevance_requires_branch_and_date_match() {
        let scope = Scope::new(Branch::Baitursynov, date("2024-06-01"));

        assert!(scope.is_relevant(&event("baitursynov", "2024-06-01")));
        assert!(!scope.is_relevant(&event("baitursynov", "2024-06-02")));
        assert!(!scope.is_relevant(&event("gagarina", "2024-06-01")));
        assert!(!scope.is_relevant(&event("gagarina", "2024-06-02")));
    }

    #[test]
    fn wildcard_event_branch_matches_any_scope() {
        let scope = Scope::new(Branch::Gagarina, date("2024-06-01"));
        assert!(scope.is_relevant(&event("all", "2024-06-01")));
        assert!(!scope.is_relevant(&event("all", "2024-05-31")));
    }

    #[test]
    fn wildcard_scope_matches_any_event_branch() {
        let scope = Scope::new(Branch::All, date("2024-06-01"));
        assert!(scope.is_relevant(&event("gagarina", "2024-06-01")));
        assert!(scope.is_relevant(&event("baitursynov", "2024-06-01")));
    }

    #[test]
    fn events_without_scope_fields_are_not_relevant() {
        let scope = Scope::new(Branch::All, date("2024-06-01"));
        let missing = InboundEvent::new("task_completed", serde_json::Map::new());
        assert!(!scope.is_relevant(&missing));
        assert!(!scope.is_relevant(&event("downtown", "2024-06-01")));
        assert!(!scope.is_relevant(&event("all", "01.06.2024")));
    }

    #[test]
    fn branch_query_skips_wildcard() {
        let mut scope = Scope::new(Branch::All, date("2024-06-01"));
        assert_eq!(scope.branch_query(), None);
        scope.branch = Branch::Gagarina;
        assert_eq!(scope.branch_query(), Some("gagarina"));
        assert_eq!(scope.to_string(), "gagarina@2024-06-01");
    }

    #[test]
    fn branch_parses_loosely() {
        assert_eq!(" Gagarina ".parse::<Branch>(), Ok(Branch::Gagarina));
        assert_eq!("ALL".parse::<Branch>(), Ok(Branch::All));
        assert!("downtown".parse::<Branch>().is_err());
    }
}
