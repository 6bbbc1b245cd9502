//! Name → action lookup with alias support and similarity suggestions for
//! unknown names.

use crate::actions::control::{BreakAction, ContinueAction, ExitAction, FailAction, WaitAction};
use crate::actions::shell::ShellAction;
use crate::actions::Action;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: BTreeMap<String, Arc<dyn Action>>,
    aliases: BTreeMap<String, String>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in shell and control actions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ShellAction));
        registry.register(Arc::new(ExitAction));
        registry.register(Arc::new(FailAction));
        registry.register(Arc::new(BreakAction));
        registry.register(Arc::new(ContinueAction));
        registry.register(Arc::new(WaitAction));
        registry
    }

    pub fn register(&mut self, action: Arc<dyn Action>) {
        self.actions
            .insert(action.action_type().to_string(), action);
    }

    pub fn register_alias(&mut self, alias: impl Into<String>, target: impl Into<String>) {
        self.aliases.insert(alias.into(), target.into());
    }

    pub fn unregister(&mut self, action_type: &str) -> bool {
        let removed = self.actions.remove(action_type).is_some();
        if removed {
            self.aliases.retain(|_, target| target != action_type);
        }
        removed
    }

    fn resolve<'a>(&'a self, action_type: &'a str) -> &'a str {
        self.aliases
            .get(action_type)
            .map(String::as_str)
            .unwrap_or(action_type)
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.actions.contains_key(self.resolve(action_type))
    }

    pub fn get(&self, action_type: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(self.resolve(action_type)).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.actions.keys().map(String::as_str).collect()
    }

    /// Closest registered name to an unknown one, for error messages.
    pub fn suggest(&self, unknown: &str) -> Option<String> {
        let mut best: Option<(usize, &str)> = None;
        for candidate in self.actions.keys() {
            // Same namespace prefix beats raw edit distance.
            if let Some((namespace, _)) = unknown.split_once('/') {
                if candidate.starts_with(namespace) {
                    let distance = edit_distance(unknown, candidate);
                    if best.map(|(d, _)| distance < d).unwrap_or(true) {
                        best = Some((distance, candidate));
                    }
                    continue;
                }
            }
            let distance = edit_distance(unknown, candidate);
            if distance <= unknown.len() / 2 && best.map(|(d, _)| distance < d).unwrap_or(true) {
                best = Some((distance, candidate));
            }
        }
        best.map(|(_, name)| name.to_string())
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("aliases", &self.aliases)
            .finish()
    }
}

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = ActionRegistry::with_builtins();
        assert!(registry.contains("shell"));
        assert!(registry.contains("control/exit"));
        assert!(registry.contains("control/break"));
    }

    #[test]
    fn aliases_resolve() {
        let mut registry = ActionRegistry::with_builtins();
        registry.register_alias("sh", "shell");
        assert!(registry.contains("sh"));
        assert_eq!(
            registry.get("sh").map(|a| a.action_type().to_string()),
            Some("shell".to_string())
        );
    }

    #[test]
    fn suggests_similar_names() {
        let registry = ActionRegistry::with_builtins();
        assert_eq!(registry.suggest("control/exot"), Some("control/exit".to_string()));
        assert_eq!(registry.suggest("shel"), Some("shell".to_string()));
        assert_eq!(registry.suggest("http/request"), None);
    }
}
