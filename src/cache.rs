use std::collections::HashMap;

use crate::model::{notification_cmp, Notification};

/// In-memory notifications keyed by id. Merges are last-write-wins and never
/// drop entries; only [`NotificationCache::clear`] shrinks it.
#[derive(Debug, Clone, Default)]
pub struct NotificationCache {
    entries: HashMap<i64, Notification>,
}

/// Previous `is_read` values captured before an optimistic update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadSnapshot {
    previous: Vec<(i64, bool)>,
}

impl ReadSnapshot {
    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }
}

impl NotificationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: i64) -> Option<&Notification> {
        self.entries.get(&id)
    }

    /// Returns `true` when the entry was new.
    pub fn upsert_one(&mut self, notification: Notification) -> bool {
        self.entries.insert(notification.id, notification).is_none()
    }

    /// Returns how many entries were new.
    pub fn upsert_many<I>(&mut self, notifications: I) -> usize
    where
        I: IntoIterator<Item = Notification>,
    {
        notifications
            .into_iter()
            .map(|notification| self.upsert_one(notification))
            .filter(|inserted| *inserted)
            .count()
    }

    /// No-op for unknown ids.
    pub fn mark_read(&mut self, id: i64) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.is_read = true;
        }
    }

    pub fn mark_all_read(&mut self) {
        for entry in self.entries.values_mut() {
            entry.is_read = true;
        }
    }

    pub fn begin_mark_read(&mut self, id: i64) -> ReadSnapshot {
        let previous = match self.entries.get_mut(&id) {
            Some(entry) => {
                let was_read = entry.is_read;
                entry.is_read = true;
                vec![(id, was_read)]
            }
            None => Vec::new(),
        };
        ReadSnapshot { previous }
    }

    pub fn begin_mark_all_read(&mut self) -> ReadSnapshot {
        let previous = self
            .entries
            .values_mut()
            .map(|entry| {
                let was_read = entry.is_read;
                entry.is_read = true;
                (entry.id, was_read)
            })
            .collect();
        ReadSnapshot { previous }
    }

    /// Restores the captured flags. Entries removed since the snapshot are not
    /// recreated.
    pub fn rollback(&mut self, snapshot: ReadSnapshot) {
        for (id, was_read) in snapshot.previous {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.is_read = was_read;
            }
        }
    }

    pub fn unread_count(&self) -> usize {
        self.entries.values().filter(|entry| !entry.is_read).count()
    }

    /// The `limit` newest entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Notification> {
        let mut sorted: Vec<&Notification> = self.entries.values().collect();
        sorted.sort_by(|a, b| notification_cmp(a, b));
        sorted.into_iter().take(limit).cloned().collect()
    }

    /// Explicit reset, e.g. on logout.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
