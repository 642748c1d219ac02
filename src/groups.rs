// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Saved groups — named regular expressions with a materialized list of
//! matching series.
//!
//! Membership is maintained by a background task: newly created groups are
//! tested against every series, newly created series against every group.
//! Dropped entries are compacted by a periodic cleanup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, info};

use crate::error::{Result, TdbError};
use crate::qpack::{Packer, Unpacker};

pub const GROUPS_FN: &str = "groups.dat";
pub const GROUPS_SCHEMA: i64 = 1;

pub const GROUP_FLAG_JUST_CREATED: u8 = 1 << 0;
pub const GROUP_FLAG_DROPPED: u8 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Init,
    Running,
    Stopping,
    Closed,
}

pub struct Group {
    pub name: String,
    pub pattern: String,
    pub re: Regex,
    pub series: Vec<u32>,
    pub flags: u8,
}

impl Group {
    fn new(name: String, pattern: String) -> Result<Group> {
        let re = compile_pattern(&pattern)?;
        Ok(Group {
            name,
            pattern,
            re,
            series: Vec::new(),
            flags: GROUP_FLAG_JUST_CREATED,
        })
    }

    pub fn is_dropped(&self) -> bool {
        self.flags & GROUP_FLAG_DROPPED != 0
    }
}

/// Accepts `/pattern/` with an optional trailing `i` flag, or a bare
/// pattern.
pub fn compile_pattern(pattern: &str) -> Result<Regex> {
    let (body, insensitive) = match pattern.strip_prefix('/') {
        Some(rest) => match rest.rsplit_once('/') {
            Some((body, "")) => (body, false),
            Some((body, "i")) => (body, true),
            _ => {
                return Err(TdbError::Query(format!(
                    "invalid regular expression: '{pattern}'"
                )))
            }
        },
        None => (pattern, false),
    };
    let source = if insensitive {
        format!("(?i){body}")
    } else {
        body.to_string()
    };
    Regex::new(&source)
        .map_err(|e| TdbError::Query(format!("invalid regular expression: {e}")))
}

pub struct Groups {
    path: PathBuf,
    groups: BTreeMap<String, Group>,
    /// Series awaiting assignment against every group.
    nseries: Vec<(u32, String)>,
    /// Groups awaiting assignment against every series.
    ngroups: Vec<String>,
    pub status: Status,
}

impl Groups {
    pub fn load(db_path: &Path) -> Result<Groups> {
        let path = db_path.join(GROUPS_FN);
        let mut groups = Groups {
            path,
            groups: BTreeMap::new(),
            nseries: Vec::new(),
            ngroups: Vec::new(),
            status: Status::Init,
        };
        if !groups.path.exists() {
            groups.save()?;
            return Ok(groups);
        }
        let data = std::fs::read(&groups.path)?;
        let mut up = Unpacker::new(&data);
        let schema = up.expect_int()?;
        if schema != GROUPS_SCHEMA {
            return Err(TdbError::Corrupt(format!(
                "unsupported groups schema {schema}"
            )));
        }
        while !up.at_end() {
            let name = up.expect_str()?.to_string();
            let pattern = up.expect_str()?.to_string();
            let group = Group::new(name.clone(), pattern)?;
            groups.ngroups.push(name.clone());
            groups.groups.insert(name, group);
        }
        info!(groups = groups.groups.len(), "Groups loaded");
        Ok(groups)
    }

    pub fn save(&self) -> Result<()> {
        let mut packer = Packer::new();
        packer.add_int(GROUPS_SCHEMA);
        for group in self.groups.values() {
            if group.is_dropped() {
                continue;
            }
            packer.add_string(&group.name);
            packer.add_string(&group.pattern);
        }
        std::fs::write(&self.path, packer.as_slice())?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.groups.values().filter(|g| !g.is_dropped()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, name: &str) -> Option<&Group> {
        self.groups.get(name).filter(|g| !g.is_dropped())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Group> {
        self.groups.values().filter(|g| !g.is_dropped())
    }

    pub fn create(&mut self, name: &str, pattern: &str) -> Result<()> {
        if self.get(name).is_some() {
            return Err(TdbError::Query(format!("group '{name}' already exists")));
        }
        let group = Group::new(name.to_string(), pattern.to_string())?;
        self.groups.insert(name.to_string(), group);
        self.ngroups.push(name.to_string());
        self.save()
    }

    pub fn drop_group(&mut self, name: &str) -> Result<()> {
        match self.groups.get_mut(name) {
            Some(group) if !group.is_dropped() => {
                group.flags |= GROUP_FLAG_DROPPED;
                self.save()
            }
            _ => Err(TdbError::Query(format!("group '{name}' does not exist"))),
        }
    }

    /// Queue a new series for the assignment task.
    pub fn add_series(&mut self, id: u32, name: &str) {
        self.nseries.push((id, name.to_string()));
    }

    /// One assignment round: new series × all groups, new groups × all
    /// series. `all_series` is only asked for when a new group exists.
    pub fn work<F>(&mut self, all_series: F)
    where
        F: FnOnce() -> Vec<(u32, String)>,
    {
        if self.status == Status::Init {
            self.status = Status::Running;
        }
        let nseries = std::mem::take(&mut self.nseries);
        let ngroups = std::mem::take(&mut self.ngroups);

        if !nseries.is_empty() {
            for group in self.groups.values_mut().filter(|g| !g.is_dropped()) {
                for (id, name) in &nseries {
                    if group.re.is_match(name) {
                        group.series.push(*id);
                    }
                }
            }
        }

        if !ngroups.is_empty() {
            let series = all_series();
            for gname in ngroups {
                let Some(group) = self.groups.get_mut(&gname) else {
                    continue;
                };
                if group.is_dropped() {
                    continue;
                }
                group.series = series
                    .iter()
                    .filter(|(_, name)| group.re.is_match(name))
                    .map(|(id, _)| *id)
                    .collect();
                group.flags &= !GROUP_FLAG_JUST_CREATED;
                debug!(group = gname, matches = group.series.len(), "Group assigned");
            }
        }
    }

    /// Compact: remove ids of dropped series from every group and forget
    /// dropped groups entirely.
    pub fn cleanup<F>(&mut self, is_live: F)
    where
        F: Fn(u32) -> bool,
    {
        self.groups.retain(|_, g| !g.is_dropped());
        for group in self.groups.values_mut() {
            group.series.retain(|&id| is_live(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series_fixture() -> Vec<(u32, String)> {
        vec![
            (1, "cpu.load".to_string()),
            (2, "cpu.temp".to_string()),
            (3, "mem.free".to_string()),
        ]
    }

    #[test]
    fn test_new_group_matches_existing_series() {
        let dir = tempfile::tempdir().unwrap();
        let mut groups = Groups::load(dir.path()).unwrap();
        groups.create("cpu", "^cpu\\.").unwrap();
        groups.work(series_fixture);
        assert_eq!(groups.get("cpu").unwrap().series, vec![1, 2]);
    }

    #[test]
    fn test_new_series_matches_existing_groups() {
        let dir = tempfile::tempdir().unwrap();
        let mut groups = Groups::load(dir.path()).unwrap();
        groups.create("cpu", "^cpu\\.").unwrap();
        groups.work(Vec::new);
        groups.add_series(9, "cpu.steal");
        groups.add_series(10, "disk.io");
        groups.work(|| unreachable!("no new groups queued"));
        assert_eq!(groups.get("cpu").unwrap().series, vec![9]);
    }

    #[test]
    fn test_slash_pattern_with_flag() {
        let re = compile_pattern("/^CPU/i").unwrap();
        assert!(re.is_match("cpu.load"));
        let re = compile_pattern("/^cpu/").unwrap();
        assert!(!re.is_match("CPU"));
        assert!(compile_pattern("/unterminated").is_err());
    }

    #[test]
    fn test_save_load_keeps_patterns() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut groups = Groups::load(dir.path()).unwrap();
            groups.create("mem", "^mem").unwrap();
        }
        let groups = Groups::load(dir.path()).unwrap();
        assert!(groups.get("mem").is_some());
    }

    #[test]
    fn test_dropped_group_gone_after_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let mut groups = Groups::load(dir.path()).unwrap();
        groups.create("cpu", "^cpu").unwrap();
        groups.drop_group("cpu").unwrap();
        assert!(groups.get("cpu").is_none());
        groups.cleanup(|_| true);
        assert_eq!(groups.len(), 0);
    }

    #[test]
    fn test_cleanup_drops_dead_series() {
        let dir = tempfile::tempdir().unwrap();
        let mut groups = Groups::load(dir.path()).unwrap();
        groups.create("all", ".*").unwrap();
        groups.work(series_fixture);
        assert_eq!(groups.get("all").unwrap().series.len(), 3);
        groups.cleanup(|id| id != 2);
        assert_eq!(groups.get("all").unwrap().series, vec![1, 3]);
    }
}
