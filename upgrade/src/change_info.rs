//! Validate the upgrade changes reported by a node.

use crate::Error;
use sequencer_harness_client::ChangeInfo;
use std::collections::HashMap;

/// A named set of changes activated together at a single height.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpgradeGroup {
    pub name: String,
    pub changes: Vec<String>,
    pub activation_height: u64,
}

impl UpgradeGroup {
    pub fn new(name: &str, changes: &[&str], activation_height: u64) -> Self {
        Self {
            name: name.to_string(),
            changes: changes.iter().map(|change| change.to_string()).collect(),
            activation_height,
        }
    }
}

/// Every upgrade group a node may report changes for.
#[derive(Clone, Debug, Default)]
pub struct Upgrades {
    groups: Vec<UpgradeGroup>,
}

impl Upgrades {
    /// Creates a registry of `groups`, failing if any change is claimed by more than one group.
    pub fn new(groups: Vec<UpgradeGroup>) -> Result<Self, Error> {
        let mut owners: HashMap<&str, &str> = HashMap::new();
        for group in &groups {
            for change in &group.changes {
                if let Some(first) = owners.insert(change, &group.name) {
                    return Err(Error::AmbiguousChange {
                        change: change.clone(),
                        first: first.to_string(),
                        second: group.name.clone(),
                    });
                }
            }
        }
        Ok(Self { groups })
    }

    /// Returns the group that claims `change_name`, if any.
    pub fn group_of(&self, change_name: &str) -> Option<&UpgradeGroup> {
        self.groups
            .iter()
            .find(|group| group.changes.iter().any(|change| change == change_name))
    }

    pub fn groups(&self) -> &[UpgradeGroup] {
        &self.groups
    }
}

/// Checks a non-empty list of reported changes against the known upgrade groups.
///
/// Every change must belong to a group and activate at that group's height. When
/// `expected_app_version` is provided, only the last change is compared against it: earlier
/// entries belong to prior upgrades.
pub fn check_change_infos(
    infos: &[ChangeInfo],
    upgrades: &Upgrades,
    expected_app_version: Option<u64>,
) -> Result<(), Error> {
    let Some(last) = infos.last() else {
        return Err(Error::NoChangeInfos);
    };
    for info in infos {
        let group = upgrades
            .group_of(&info.change_name)
            .ok_or_else(|| Error::UnknownChange(info.change_name.clone()))?;
        if info.activation_height != group.activation_height {
            return Err(Error::ActivationHeightMismatch {
                change: info.change_name.clone(),
                expected: group.activation_height,
                actual: info.activation_height,
            });
        }
    }
    if let Some(expected) = expected_app_version {
        if last.app_version != expected {
            return Err(Error::AppVersionMismatch {
                change: last.change_name.clone(),
                expected,
                actual: last.app_version,
            });
        }
    }
    Ok(())
}
