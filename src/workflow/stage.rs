// file: src/workflow/stage.rs
// version: 1.0.0
// guid: 2f8c6e04-b9d1-4a73-8e5f-a4c3d71b6e29

use super::action::Action;
use super::context::StageInfo;
use super::store::Store;
use std::any::Any;
use uuid::Uuid;

/// Ordered actions plus store entries merged in before the first one runs
#[derive(Debug)]
pub struct Stage {
    id: Uuid,
    name: String,
    description: String,
    tags: Vec<String>,
    actions: Vec<Action>,
    initial: Store,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            tags: Vec::new(),
            actions: Vec::new(),
            initial: Store::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn actions(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.actions.extend(actions);
        self
    }

    /// Seed a store entry for this stage
    pub fn with_value<T: Any + Send + Sync>(self, key: impl Into<String>, value: T) -> Self {
        self.initial.set(key, value);
        self
    }

    pub fn add_action(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn action_list(&self) -> &[Action] {
        &self.actions
    }

    pub fn action_names(&self) -> Vec<String> {
        self.actions.iter().map(|a| a.name().to_string()).collect()
    }

    pub fn initial_store(&self) -> &Store {
        &self.initial
    }

    pub fn info(&self) -> StageInfo {
        StageInfo {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            tags: self.tags.clone(),
        }
    }
}
