//! Database selection for backup fan-out.
//!
//! Rules are evaluated top-down and the first one that matches decides:
//! no access > manual exclude > manual include > system database > exclude regex >
//! include regex > default-exclude flag > include.

use std::collections::HashSet;

use regex::Regex;
use serde::Serialize;

use crate::models::{CreateBackupSettings, Database};

/// Which rule decided a database's fate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterReason {
    NoAccess,
    ManualExclude,
    ManualInclude,
    SystemDatabase,
    RegexExclude,
    RegexInclude,
    DefaultExclude,
    NoRuleMatched,
}

impl FilterReason {
    pub fn includes(self) -> bool {
        matches!(self, Self::ManualInclude | Self::RegexInclude | Self::NoRuleMatched)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilteredDatabase {
    pub database_name: String,
    pub include: bool,
    pub reason: FilterReason,
}

#[derive(Clone, Debug)]
pub struct DatabaseFilter {
    default_exclude: bool,
    exclude_system: bool,
    include_regex: Option<Regex>,
    exclude_regex: Option<Regex>,
    include_manual: HashSet<String>,
    exclude_manual: HashSet<String>,
}

impl DatabaseFilter {
    pub fn from_settings(settings: &CreateBackupSettings) -> Result<Self, regex::Error> {
        Ok(Self {
            default_exclude: settings.backup_default_exclude,
            exclude_system: settings.backup_exclude_system_databases,
            include_regex: compile(settings.backup_include_regex.as_deref())?,
            exclude_regex: compile(settings.backup_exclude_regex.as_deref())?,
            include_manual: names(&settings.backup_include_manual),
            exclude_manual: names(&settings.backup_exclude_manual),
        })
    }

    pub fn evaluate(&self, database: &Database) -> FilteredDatabase {
        let reason = self.reason(database);
        FilteredDatabase {
            database_name: database.database_name.clone(),
            include: reason.includes(),
            reason,
        }
    }

    fn reason(&self, database: &Database) -> FilterReason {
        let name = database.database_name.as_str();
        if !database.has_access {
            return FilterReason::NoAccess;
        }
        if self.exclude_manual.contains(name) {
            return FilterReason::ManualExclude;
        }
        if self.include_manual.contains(name) {
            return FilterReason::ManualInclude;
        }
        if self.exclude_system && database.is_system {
            return FilterReason::SystemDatabase;
        }
        if self.exclude_regex.as_ref().is_some_and(|r| r.is_match(name)) {
            return FilterReason::RegexExclude;
        }
        if self.include_regex.as_ref().is_some_and(|r| r.is_match(name)) {
            return FilterReason::RegexInclude;
        }
        if self.default_exclude {
            return FilterReason::DefaultExclude;
        }
        FilterReason::NoRuleMatched
    }

    pub fn apply(&self, databases: &[Database]) -> Vec<FilteredDatabase> {
        databases.iter().map(|db| self.evaluate(db)).collect()
    }

    /// Names of included databases, in listing order.
    pub fn included(&self, databases: &[Database]) -> Vec<String> {
        self.apply(databases)
            .into_iter()
            .filter(|d| d.include)
            .map(|d| d.database_name)
            .collect()
    }
}

fn compile(pattern: Option<&str>) -> Result<Option<Regex>, regex::Error> {
    match pattern.map(str::trim) {
        Some(p) if !p.is_empty() => Regex::new(p).map(Some),
        _ => Ok(None),
    }
}

fn names(list: &[String]) -> HashSet<String> {
    list.iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect()
}
