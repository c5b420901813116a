use std::collections::HashMap;

use graph_types::{Location, ResultReturnPolicy};
use tracing::{debug, trace, warn};

use crate::clock::PathClock;
use crate::config::PathTimeoutInfo;
use crate::message::Message;
use crate::path::conversion::ResultConversion;
use crate::path::group::{GroupId, GroupResolution, PathGroup};
use crate::path::list::{PathId, PathList};
use crate::path::path::{Path, PathType};

/// Above this many paths in one direction a table is probably leaking.
pub const PATH_LEAK_THRESHOLD: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachTo {
    Extension(Location),
    Engine(Location),
}

impl AttachTo {
    pub fn loc(&self) -> &Location {
        match self {
            AttachTo::Extension(loc) | AttachTo::Engine(loc) => loc,
        }
    }
}

/// IN and OUT paths of one extension or engine. Only ever touched by the
/// task that owns it.
#[derive(Debug)]
pub struct PathTable {
    attach_to: AttachTo,
    in_paths: PathList,
    out_paths: PathList,
    groups: HashMap<GroupId, PathGroup>,
    next_group_id: u64,
    timeouts: PathTimeoutInfo,
    clock: PathClock,
}

impl PathTable {
    pub fn new(attach_to: AttachTo, timeouts: PathTimeoutInfo) -> Self {
        let timeouts = match attach_to {
            AttachTo::Engine(_) => PathTimeoutInfo::never(),
            AttachTo::Extension(_) => timeouts,
        };
        Self {
            attach_to,
            in_paths: PathList::new(PathType::In),
            out_paths: PathList::new(PathType::Out),
            groups: HashMap::new(),
            next_group_id: 0,
            timeouts,
            clock: PathClock::default(),
        }
    }

    pub fn with_clock(mut self, clock: PathClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn attach_to(&self) -> &AttachTo {
        &self.attach_to
    }

    pub fn timeouts(&self) -> &PathTimeoutInfo {
        &self.timeouts
    }

    pub fn now_us(&self) -> u64 {
        self.clock.now_us()
    }

    fn list(&self, path_type: PathType) -> &PathList {
        match path_type {
            PathType::In => &self.in_paths,
            PathType::Out => &self.out_paths,
        }
    }

    fn list_mut(&mut self, path_type: PathType) -> &mut PathList {
        match path_type {
            PathType::In => &mut self.in_paths,
            PathType::Out => &mut self.out_paths,
        }
    }

    pub fn len(&self, path_type: PathType) -> usize {
        self.list(path_type).len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_paths.is_empty() && self.out_paths.is_empty()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn path(&self, id: PathId) -> Option<&Path> {
        self.list(id.path_type).get(id)
    }

    pub fn group(&self, id: GroupId) -> Option<&PathGroup> {
        self.groups.get(&id)
    }

    pub fn path_ids(&self, path_type: PathType) -> Vec<PathId> {
        self.list(path_type).ids()
    }

    /// Record a command entering the owner. A `cmd_id` already present in
    /// the IN list means the command looped back here; it is renamed and
    /// the old id kept as the id to restore on its result.
    pub fn add_in_path(
        &mut self,
        cmd: &mut Message,
        result_conversion: Option<ResultConversion>,
    ) -> PathId {
        let timeout = self.timeouts.in_path_timeout_us;
        self.add_path(PathType::In, cmd, result_conversion, timeout)
    }

    /// Record a command leaving the owner towards its single destination.
    /// The command's result handler moves onto the path.
    pub fn add_out_path(&mut self, cmd: &mut Message) -> PathId {
        debug_assert!(cmd.dest_locs.len() == 1, "out path needs exactly one destination");
        let timeout = self.timeouts.out_path_timeout_us;
        let id = self.add_path(PathType::Out, cmd, None, timeout);
        let handler = cmd.result_handler.take();
        if let Some(path) = self.out_paths.get_mut(id) {
            path.result_handler = handler;
        }
        id
    }

    fn add_path(
        &mut self,
        path_type: PathType,
        cmd: &mut Message,
        result_conversion: Option<ResultConversion>,
        timeout_us: u64,
    ) -> PathId {
        debug_assert!(cmd.msg_type.is_cmd(), "paths are only created for commands");
        if cmd.cmd_id.is_empty() || self.list(path_type).find(&cmd.cmd_id).is_some() {
            let old = cmd.cmd_id.clone();
            cmd.regenerate_cmd_id();
            debug!(
                path_type = %path_type,
                old_cmd_id = %old,
                cmd_id = %cmd.cmd_id,
                "renamed command to keep path ids unique"
            );
            assert!(
                self.list(path_type).find(&cmd.cmd_id).is_none(),
                "duplicate cmd_id {} after regeneration",
                cmd.cmd_id
            );
        }

        let expired_time_us = if timeout_us == u64::MAX {
            u64::MAX
        } else {
            self.clock.now_us().saturating_add(timeout_us)
        };
        let path = Path::new(path_type, cmd, result_conversion, expired_time_us);
        cmd.parent_cmd_id.clear();

        trace!(path_type = %path_type, cmd_id = %path.cmd_id, cmd = %path.cmd_name, "path added");
        self.list_mut(path_type).push(path)
    }

    /// Group the OUT (or IN) paths created for one fan-out. Fewer than two
    /// members need no group.
    pub fn create_path_group(
        &mut self,
        path_type: PathType,
        policy: ResultReturnPolicy,
        members: &[PathId],
    ) -> Option<GroupId> {
        if members.len() < 2 {
            return None;
        }
        let group_id = GroupId(self.next_group_id);
        self.next_group_id += 1;
        for id in members {
            let path = self.list_mut(path_type).get_mut(*id)?;
            debug_assert!(path.group.is_none(), "path already belongs to a group");
            path.group = Some(group_id);
        }
        self.groups.insert(group_id, PathGroup::new(policy, members.to_vec()));
        Some(group_id)
    }

    pub fn find_path_from_cmd_id(&self, path_type: PathType, cmd_id: &str) -> Option<PathId> {
        let list = self.list(path_type);
        if list.len() > PATH_LEAK_THRESHOLD {
            warn!(
                path_type = %path_type,
                size = list.len(),
                owner = %self.attach_to.loc(),
                "too many paths, results are probably never arriving"
            );
        }
        list.find(cmd_id)
    }

    /// Cache `cmd_result` on the path it answers. `None` when that path is
    /// already gone, in which case the result should be dropped.
    pub fn set_result(&mut self, path_type: PathType, cmd_result: &Message) -> Option<PathId> {
        let id = self.find_path_from_cmd_id(path_type, &cmd_result.cmd_id)?;
        let path = self.list_mut(path_type).get_mut(id)?;
        path.set_result(cmd_result);
        if let Some(group_id) = path.group {
            if let Some(group) = self.groups.get_mut(&group_id) {
                group.move_to_tail(id);
            }
        }
        Some(id)
    }

    /// Turn the result cached on `id` into the result that flows on, or
    /// `None` while its group is still collecting.
    ///
    /// `remove_path` tells whether the command is finished from the
    /// caller's point of view (usually the result's `is_final`).
    /// Under `EachOkAndError` a non-final result leaves its member in the
    /// group, unlike a plain unconditional removal, so streamed results
    /// keep flowing until the member's final one.
    pub fn determine_actual_cmd_result(
        &mut self,
        path_type: PathType,
        id: PathId,
        remove_path: bool,
    ) -> Option<Message> {
        let list = self.list(path_type);
        let path = list.get(id)?;

        let target = match path.group.and_then(|g| self.groups.get(&g)) {
            Some(group) => {
                let resolution = group.resolve(id, |member| {
                    list.get(member)
                        .and_then(|p| p.cached_cmd_result.as_ref())
                        .map(|r| r.status.is_error())
                });
                match resolution {
                    GroupResolution::Release(target) => target,
                    GroupResolution::Wait => {
                        trace!(cmd_id = %path.cmd_id, "result cached, group not settled");
                        return None;
                    }
                }
            }
            None => id,
        };

        let path = list.get(target)?;
        let mut result = path.cached_cmd_result.clone()?;
        result.name = path.cmd_name.clone();
        if !path.original_cmd_id.is_empty() {
            result.cmd_id = path.original_cmd_id.clone();
        }
        result.dest_locs = vec![path.src_loc.clone()];
        if path_type == PathType::Out {
            result.result_handler = path.result_handler.clone();
        }

        let group = path.group;
        match group.and_then(|g| self.groups.get(&g).map(|grp| (g, grp.policy()))) {
            Some((group_id, ResultReturnPolicy::EachOkAndError)) => {
                result.completed =
                    remove_path && self.remove_from_group(path_type, group_id, target);
            }
            Some((group_id, _)) => {
                self.remove_group_and_paths(path_type, group_id);
                result.completed = true;
            }
            None => {
                if remove_path {
                    self.list_mut(path_type).remove(target);
                }
                result.completed = result.is_final;
            }
        }
        Some(result)
    }

    /// Returns whether the group emptied (and was dropped).
    fn remove_from_group(&mut self, path_type: PathType, group_id: GroupId, id: PathId) -> bool {
        self.list_mut(path_type).remove(id);
        let emptied = self
            .groups
            .get_mut(&group_id)
            .is_none_or(|group| group.remove_member(id));
        if emptied {
            self.groups.remove(&group_id);
        }
        emptied
    }

    fn remove_group_and_paths(&mut self, path_type: PathType, group_id: GroupId) {
        if let Some(group) = self.groups.remove(&group_id) {
            let list = self.list_mut(path_type);
            for member in group.members() {
                list.remove(*member);
            }
        }
    }

    /// Drop one path, detaching it from its group.
    pub fn remove_path(&mut self, id: PathId) -> Option<Path> {
        let path = self.list_mut(id.path_type).remove(id)?;
        if let Some(group_id) = path.group {
            let emptied = self
                .groups
                .get_mut(&group_id)
                .is_none_or(|group| group.remove_member(id));
            if emptied {
                self.groups.remove(&group_id);
            }
        }
        Some(path)
    }

    pub fn expired_paths(&self, path_type: PathType) -> Vec<PathId> {
        let now = self.now_us();
        self.list(path_type)
            .iter()
            .filter(|(_, p)| p.is_expired(now))
            .map(|(id, _)| id)
            .collect()
    }

    /// Remove expired IN paths. Nothing is synthesized for them.
    pub fn remove_expired_in_paths(&mut self) -> usize {
        let expired = self.expired_paths(PathType::In);
        for id in &expired {
            self.remove_path(*id);
        }
        expired.len()
    }

    /// ERROR results answering every expired OUT path. The paths stay in
    /// the table so the results correlate through the normal inbound flow.
    pub fn timeout_results_for_expired_out_paths(&self, detail: &str) -> Vec<Message> {
        self.expired_paths(PathType::Out)
            .into_iter()
            .filter_map(|id| self.out_paths.get(id))
            .map(|p| {
                let mut result = Message::error_result(&p.cmd_id, &p.cmd_name, detail);
                result.src_loc = p.dest_loc.clone();
                result
            })
            .collect()
    }

    /// ERROR results for every OUT path still open, oldest first.
    pub fn flush_results_for_out_paths(&self, detail: &str) -> Vec<Message> {
        self.out_paths
            .iter()
            .map(|(_, p)| {
                let mut result = Message::error_result(&p.cmd_id, &p.cmd_name, detail);
                result.src_loc = p.dest_loc.clone();
                result
            })
            .collect()
    }

    pub fn clear_in_paths(&mut self) -> usize {
        let ids = self.in_paths.ids();
        for id in &ids {
            self.remove_path(*id);
        }
        ids.len()
    }

    /// Both lists must be empty when the owner goes away.
    pub fn check_empty(&self) {
        assert!(
            self.in_paths.is_empty(),
            "{} IN paths left at {}",
            self.in_paths.len(),
            self.attach_to.loc()
        );
        assert!(
            self.out_paths.is_empty(),
            "{} OUT paths left at {}",
            self.out_paths.len(),
            self.attach_to.loc()
        );
        debug_assert!(self.groups.is_empty(), "path groups outlived their paths");
    }
}
