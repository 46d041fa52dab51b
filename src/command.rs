//! Undo/redo history of local mutations.
//!
//! A command carries whole-entity snapshots of its target before and after, so
//! applying and inverting it are both a single [`EntityStore::put`].

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::limits::{DEFAULT_MAX_UNDO_DEPTH, NOTIFY_CHANNEL_CAPACITY};
use crate::model::{Entity, EntityKey};
use crate::store::EntityStore;

pub type CommandId = Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub id: CommandId,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub key: EntityKey,
    /// `None` means the entity did not exist (create).
    pub before: Option<Entity>,
    /// `None` means the entity no longer exists (delete).
    pub after: Option<Entity>,
}

impl Command {
    pub fn new(
        description: impl Into<String>,
        key: EntityKey,
        before: Option<Entity>,
        after: Option<Entity>,
    ) -> Self {
        Self {
            id: Ulid::new(),
            description: description.into(),
            created_at: Utc::now(),
            key,
            before,
            after,
        }
    }

    pub fn apply(&self, store: &mut EntityStore) {
        store.put(self.key, self.after.clone());
    }

    pub fn invert(&self, store: &mut EntityStore) {
        store.put(self.key, self.before.clone());
    }

    pub fn info(&self) -> CommandInfo {
        CommandInfo {
            id: self.id,
            description: self.description.clone(),
            created_at: self.created_at,
        }
    }
}

/// What history listings expose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandInfo {
    pub id: CommandId,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackChange {
    Executed(CommandId),
    Undone(CommandId),
    Redone(CommandId),
    /// Removed from history after its backend call failed.
    Revoked(CommandId),
    Cleared,
}

/// How [`CommandStack::revoke`] found the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revoked {
    /// Was applied; its inverse has been run against the store.
    Inverted(Command),
    /// Was sitting on the redo stack (already inverted); dropped.
    Dropped(Command),
    /// Already evicted or cleared.
    Missing,
}

pub struct CommandStack {
    undo: VecDeque<Command>,
    redo: Vec<Command>,
    max_depth: usize,
    changes: broadcast::Sender<StackChange>,
}

impl Default for CommandStack {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UNDO_DEPTH)
    }
}

impl CommandStack {
    pub fn new(max_depth: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: Vec::new(),
            max_depth: max_depth.max(1),
            changes: broadcast::channel(NOTIFY_CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StackChange> {
        self.changes.subscribe()
    }

    fn publish(&self, change: StackChange) {
        let _ = self.changes.send(change);
    }

    /// Apply and record. Discards the redo stack and evicts the oldest entry past
    /// the depth limit.
    pub fn execute(&mut self, command: Command, store: &mut EntityStore) -> CommandId {
        command.apply(store);
        let id = command.id;
        self.redo.clear();
        self.undo.push_back(command);
        while self.undo.len() > self.max_depth {
            if let Some(evicted) = self.undo.pop_front() {
                tracing::debug!("undo history full, evicted {}", evicted.id);
            }
        }
        self.publish(StackChange::Executed(id));
        id
    }

    pub fn undo(&mut self, store: &mut EntityStore) -> Option<CommandInfo> {
        let command = self.undo.pop_back()?;
        command.invert(store);
        let info = command.info();
        self.redo.push(command);
        self.publish(StackChange::Undone(info.id));
        Some(info)
    }

    pub fn redo(&mut self, store: &mut EntityStore) -> Option<CommandInfo> {
        let command = self.redo.pop()?;
        command.apply(store);
        let info = command.info();
        self.undo.push_back(command);
        self.publish(StackChange::Redone(info.id));
        Some(info)
    }

    /// Undo repeatedly until `target` itself has been undone. Returns how many
    /// commands were inverted; zero if `target` is not on the undo stack.
    pub fn undo_to(&mut self, target: CommandId, store: &mut EntityStore) -> usize {
        if !self.undo.iter().any(|c| c.id == target) {
            return 0;
        }
        let mut count = 0;
        while let Some(info) = self.undo(store) {
            count += 1;
            if info.id == target {
                break;
            }
        }
        count
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    /// Undo stack, newest first.
    pub fn history(&self) -> Vec<CommandInfo> {
        self.undo.iter().rev().map(Command::info).collect()
    }

    /// Redo stack, next-to-redo first.
    pub fn redo_history(&self) -> Vec<CommandInfo> {
        self.redo.iter().rev().map(Command::info).collect()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
        self.publish(StackChange::Cleared);
    }

    pub fn is_applied(&self, id: CommandId) -> bool {
        self.undo.iter().any(|c| c.id == id)
    }

    pub fn contains(&self, id: CommandId) -> bool {
        self.is_applied(id) || self.redo.iter().any(|c| c.id == id)
    }

    /// Take a command out of history entirely. An applied command is inverted
    /// first; no redo entry is left behind either way.
    pub fn revoke(&mut self, id: CommandId, store: &mut EntityStore) -> Revoked {
        if let Some(pos) = self.undo.iter().position(|c| c.id == id)
            && let Some(command) = self.undo.remove(pos)
        {
            command.invert(store);
            self.publish(StackChange::Revoked(id));
            return Revoked::Inverted(command);
        }
        if let Some(pos) = self.redo.iter().position(|c| c.id == id) {
            let command = self.redo.remove(pos);
            self.publish(StackChange::Revoked(id));
            return Revoked::Dropped(command);
        }
        Revoked::Missing
    }

    /// Replace the `after` snapshot of a recorded command, e.g. once the backend has
    /// assigned the real id and version. Returns false if it is no longer held.
    pub fn amend(&mut self, id: CommandId, key: EntityKey, after: Option<Entity>) -> bool {
        let found = self
            .undo
            .iter_mut()
            .chain(self.redo.iter_mut())
            .find(|c| c.id == id);
        match found {
            Some(command) => {
                command.key = key;
                command.after = after;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.undo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.undo.is_empty() && self.redo.is_empty()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }
}
