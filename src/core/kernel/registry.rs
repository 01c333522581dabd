use crate::core::errors::KiwoomError;
use crate::core::types::{Envelope, Subscription};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Most items a single group may hold across all of its subjects
pub const MAX_GROUP_ITEMS: usize = 100;

/// Realtime callback handle
///
/// Callbacks run inside the shared dispatch task and must not block; an `Err`
/// or a panic is logged and isolated from the other callbacks.
pub type Callback = Arc<dyn Fn(&Envelope) -> anyhow::Result<()> + Send + Sync>;

struct SubjectEntry {
    code: String,
    items: Vec<String>,
    callbacks: Vec<Callback>,
}

struct Group {
    key: String,
    subjects: Vec<SubjectEntry>,
}

impl Group {
    fn items(&self) -> Vec<String> {
        let mut items: Vec<String> = Vec::new();
        for entry in &self.subjects {
            merge(&mut items, &entry.items);
        }
        items
    }
}

/// Append the values of `extra` missing from `target`, keeping first-seen order
fn merge(target: &mut Vec<String>, extra: &[String]) {
    for value in extra {
        if !target.contains(value) {
            target.push(value.clone());
        }
    }
}

fn dedup(values: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(values.len());
    merge(&mut out, values);
    out
}

/// Desired realtime subscriptions, grouped and ordered by registration
///
/// Each (group, subject) pair owns the items it was registered with; a group's
/// item set is the union over its subjects and never exceeds
/// [`MAX_GROUP_ITEMS`]. Mutations take the write lock for their whole
/// duration, so concurrent register/remove calls are atomic with respect to
/// each other while dispatch lookups read a consistent snapshot.
#[derive(Default)]
pub struct SubscriptionRegistry {
    groups: RwLock<Vec<Group>>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("active_pairs", &self.active_pairs())
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register subjects for items in a group without binding a callback
    pub fn register(
        &self,
        group: &str,
        items: &[String],
        subjects: &[String],
    ) -> Result<Subscription, KiwoomError> {
        self.register_with(group, items, subjects, None)
    }

    /// Register subjects for items in a group, binding `callback` to every
    /// (group, subject) pair
    ///
    /// # Arguments
    /// * `group` - Caller-chosen group key
    /// * `items` - Instrument codes to merge into the group
    /// * `subjects` - Subject codes to activate for those items
    /// * `callback` - Optional handle appended after any existing bindings
    ///
    /// # Returns
    /// The subscription to announce to the server. On `CapacityExceeded` the
    /// registry is left untouched.
    pub fn register_with(
        &self,
        group: &str,
        items: &[String],
        subjects: &[String],
        callback: Option<Callback>,
    ) -> Result<Subscription, KiwoomError> {
        if group.is_empty() {
            return Err(KiwoomError::InvalidParameters(
                "group key must not be empty".to_string(),
            ));
        }
        if items.is_empty() || subjects.is_empty() {
            return Err(KiwoomError::InvalidParameters(format!(
                "group {} needs at least one item and one subject",
                group
            )));
        }

        let items = dedup(items);
        let subjects = dedup(subjects);

        let mut groups = self.groups.write();
        let existing = groups.iter().position(|g| g.key == group);

        let mut union = existing.map(|idx| groups[idx].items()).unwrap_or_default();
        merge(&mut union, &items);
        if union.len() > MAX_GROUP_ITEMS {
            return Err(KiwoomError::CapacityExceeded {
                group: group.to_string(),
                requested: union.len(),
                max: MAX_GROUP_ITEMS,
            });
        }

        let idx = match existing {
            Some(idx) => idx,
            None => {
                groups.push(Group {
                    key: group.to_string(),
                    subjects: Vec::new(),
                });
                groups.len() - 1
            }
        };
        let entry_group = &mut groups[idx];

        for code in &subjects {
            let position = entry_group.subjects.iter().position(|s| &s.code == code);
            let entry = match position {
                Some(pos) => &mut entry_group.subjects[pos],
                None => {
                    entry_group.subjects.push(SubjectEntry {
                        code: code.clone(),
                        items: Vec::new(),
                        callbacks: Vec::new(),
                    });
                    let last = entry_group.subjects.len() - 1;
                    &mut entry_group.subjects[last]
                }
            };
            merge(&mut entry.items, &items);
            if let Some(callback) = &callback {
                entry.callbacks.push(callback.clone());
            }
        }

        debug!(group, subjects = ?subjects, item_count = union.len(), "registered");
        Ok(Subscription::new(group, items, subjects))
    }

    /// Deactivate subjects of a group
    ///
    /// Subjects that are not active are ignored. Returns the subscription to
    /// withdraw from the server, or `None` when nothing was active. A group
    /// left with no subjects is dropped with its items.
    pub fn remove(&self, group: &str, subjects: &[String]) -> Option<Subscription> {
        let mut groups = self.groups.write();
        let idx = groups.iter().position(|g| g.key == group)?;

        let mut removed_subjects = Vec::new();
        let mut removed_items = Vec::new();
        groups[idx].subjects.retain(|entry| {
            if subjects.contains(&entry.code) {
                if !removed_subjects.contains(&entry.code) {
                    removed_subjects.push(entry.code.clone());
                }
                merge(&mut removed_items, &entry.items);
                false
            } else {
                true
            }
        });

        if groups[idx].subjects.is_empty() {
            groups.remove(idx);
        }

        if removed_subjects.is_empty() {
            return None;
        }

        debug!(group, subjects = ?removed_subjects, "removed");
        Some(Subscription::new(group, removed_items, removed_subjects))
    }

    /// Callbacks bound to a subject, in registration order
    ///
    /// A message tagged with a group resolves against that group only; an
    /// untagged message resolves against every group whose subject covers the
    /// item, in group order. Never fails; returns empty when nothing is bound.
    pub fn resolve_callbacks(&self, subject: &str, group: Option<&str>, item: &str) -> Vec<Callback> {
        let groups = self.groups.read();
        match group {
            Some(group) => groups
                .iter()
                .filter(|g| g.key == group)
                .flat_map(|g| g.subjects.iter())
                .filter(|entry| entry.code == subject)
                .flat_map(|entry| entry.callbacks.iter().cloned())
                .collect(),
            None => groups
                .iter()
                .flat_map(|g| g.subjects.iter())
                .filter(|entry| entry.code == subject && entry.items.iter().any(|i| i == item))
                .flat_map(|entry| entry.callbacks.iter().cloned())
                .collect(),
        }
    }

    /// One subscription per active (group, subject) pair, in group-then-registration order
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.groups
            .read()
            .iter()
            .flat_map(|g| {
                g.subjects.iter().map(move |entry| {
                    Subscription::new(
                        g.key.clone(),
                        entry.items.clone(),
                        vec![entry.code.clone()],
                    )
                })
            })
            .collect()
    }

    /// Active (group, subject) pairs in registration order
    pub fn active_pairs(&self) -> Vec<(String, String)> {
        self.groups
            .read()
            .iter()
            .flat_map(|g| {
                g.subjects
                    .iter()
                    .map(move |entry| (g.key.clone(), entry.code.clone()))
            })
            .collect()
    }

    /// Items currently held by a group
    pub fn group_items(&self, group: &str) -> Vec<String> {
        self.groups
            .read()
            .iter()
            .find(|g| g.key == group)
            .map(Group::items)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }

    pub fn clear(&self) {
        self.groups.write().clear();
    }
}
