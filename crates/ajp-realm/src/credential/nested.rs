// SPDX-License-Identifier: AGPL-3.0-only
use super::CredentialHandler;
use std::sync::Arc;

/// Tries several handlers, typically while stored credentials migrate from
/// one format to another. Any handler may match; new stored forms come from
/// the first handler.
#[derive(Default, Clone)]
pub struct NestedCredentialHandler {
    handlers: Vec<Arc<dyn CredentialHandler>>,
}

impl NestedCredentialHandler {
    pub fn new(handlers: Vec<Arc<dyn CredentialHandler>>) -> Self {
        Self { handlers }
    }

    pub fn add(&mut self, handler: Arc<dyn CredentialHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl CredentialHandler for NestedCredentialHandler {
    fn matches(&self, input: &str, stored: &str) -> bool {
        self.handlers.iter().any(|h| h.matches(input, stored))
    }

    fn mutate(&self, input: &str) -> Option<String> {
        self.handlers.first()?.mutate(input)
    }
}
