use graph_types::ResultReturnPolicy;

use crate::path::list::PathId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub(crate) u64);

/// Sibling paths created by one fan-out. Members are kept in the order
/// their latest result arrived (members without a result first), so the
/// first and last responders sit at the ends of the list.
#[derive(Debug, Clone)]
pub struct PathGroup {
    policy: ResultReturnPolicy,
    members: Vec<PathId>,
}

/// Outcome of asking a group whether a cached result may be released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupResolution {
    /// Release the cached result of this member.
    Release(PathId),
    /// Keep caching; nothing goes out yet.
    Wait,
}

impl PathGroup {
    pub(crate) fn new(policy: ResultReturnPolicy, members: Vec<PathId>) -> Self {
        Self { policy, members }
    }

    pub fn policy(&self) -> ResultReturnPolicy {
        self.policy
    }

    pub fn members(&self) -> &[PathId] {
        &self.members
    }

    pub(crate) fn move_to_tail(&mut self, id: PathId) {
        if let Some(pos) = self.members.iter().position(|m| *m == id) {
            let member = self.members.remove(pos);
            self.members.push(member);
        }
    }

    /// Returns true once the group is left without members.
    pub(crate) fn remove_member(&mut self, id: PathId) -> bool {
        self.members.retain(|m| *m != id);
        self.members.is_empty()
    }

    /// Decide which member's cached result (if any) goes out now. `path` is
    /// the member that just received a result; `status_of` reports the
    /// cached result of a member as `Some(is_error)` or `None` when it has
    /// not answered yet. Pure query; callers perform the removal.
    pub(crate) fn resolve<F>(&self, path: PathId, status_of: F) -> GroupResolution
    where
        F: Fn(PathId) -> Option<bool>,
    {
        match self.policy {
            ResultReturnPolicy::EachOkAndError => GroupResolution::Release(path),
            ResultReturnPolicy::FirstErrorOrFirstOk => {
                // Answered members trail the silent ones in arrival order.
                match self.members.iter().copied().find(|m| status_of(*m).is_some()) {
                    Some(first) => GroupResolution::Release(first),
                    None => GroupResolution::Wait,
                }
            }
            ResultReturnPolicy::FirstErrorOrLastOk => {
                if let Some(err) = self
                    .members
                    .iter()
                    .copied()
                    .find(|m| status_of(*m) == Some(true))
                {
                    return GroupResolution::Release(err);
                }
                if self.members.iter().all(|m| status_of(*m).is_some()) {
                    match self.members.last() {
                        Some(last) => GroupResolution::Release(*last),
                        None => GroupResolution::Wait,
                    }
                } else {
                    GroupResolution::Wait
                }
            }
        }
    }
}
