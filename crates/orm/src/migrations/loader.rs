//! Turns configured migrations into ordered [`MigrationUnit`]s

use std::collections::HashSet;
use std::sync::Arc;

use super::definitions::{Migration, MigrationUnit};
use crate::error::{OrmError, OrmResult};

/// Length of the millisecond timestamp every migration name ends with
pub const TIMESTAMP_SUFFIX_LEN: usize = 13;

/// Parse the timestamp suffix of a migration name
pub fn parse_timestamp(name: &str) -> OrmResult<i64> {
    let invalid = || {
        OrmError::Configuration(format!(
            "{} migration name is wrong; migration names must end with a {}-digit millisecond timestamp",
            name, TIMESTAMP_SUFFIX_LEN
        ))
    };

    let suffix = name
        .len()
        .checked_sub(TIMESTAMP_SUFFIX_LEN)
        .and_then(|start| name.get(start..))
        .ok_or_else(invalid)?;

    if !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    match suffix.parse::<i64>() {
        Ok(timestamp) if timestamp > 0 => Ok(timestamp),
        _ => Err(invalid()),
    }
}

/// Build units from configured migrations, ascending by timestamp
///
/// Units sharing a timestamp keep their configuration order. Fails on the
/// first malformed name, then on duplicate names (all of them listed).
pub fn load_units(migrations: &[Arc<dyn Migration>]) -> OrmResult<Vec<MigrationUnit>> {
    let mut units = migrations
        .iter()
        .map(|migration| {
            let name = migration.name().to_string();
            let timestamp = parse_timestamp(&name)?;
            Ok(MigrationUnit::new(timestamp, name, Arc::clone(migration)))
        })
        .collect::<OrmResult<Vec<_>>>()?;

    let mut seen = HashSet::new();
    let mut duplicates: Vec<&str> = Vec::new();
    for unit in &units {
        if !seen.insert(unit.name.as_str()) && !duplicates.contains(&unit.name.as_str()) {
            duplicates.push(unit.name.as_str());
        }
    }
    if !duplicates.is_empty() {
        return Err(OrmError::Configuration(format!(
            "Duplicate migrations: {}",
            duplicates.join(", ")
        )));
    }

    // sort_by_key is stable
    units.sort_by_key(|unit| unit.timestamp);
    Ok(units)
}
