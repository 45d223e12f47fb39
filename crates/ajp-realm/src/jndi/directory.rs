// SPDX-License-Identifier: AGPL-3.0-only
//! Directory connection abstraction used by the JNDI realm.

use crate::error::DirectoryError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

/// Attribute values keyed by lower-cased attribute name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(BTreeMap<String, Vec<String>>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, values: Vec<String>) {
        self.0.insert(name.to_ascii_lowercase(), values);
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.0
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
        self
    }

    pub fn values(&self, name: &str) -> &[String] {
        self.0
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.values(name).first().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchEntry {
    pub dn: String,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    OneLevel,
    Subtree,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base: String,
    pub filter: String,
    pub scope: SearchScope,
    pub attributes: Vec<String>,
    /// 0 for no limit.
    pub size_limit: usize,
    pub time_limit: Duration,
}

/// An open directory connection. Not shared: the realm serializes access.
#[async_trait]
pub trait DirContext: Send {
    /// Authenticates the connection as `dn`.
    async fn bind(&mut self, dn: &str, password: &str) -> Result<(), DirectoryError>;

    /// Drops back to an anonymous identity.
    async fn unbind(&mut self) -> Result<(), DirectoryError>;

    /// Reads one entry; `None` when it does not exist.
    async fn lookup(
        &mut self,
        dn: &str,
        attributes: &[String],
    ) -> Result<Option<Attributes>, DirectoryError>;

    async fn search(&mut self, request: &SearchRequest) -> Result<Vec<SearchEntry>, DirectoryError>;

    async fn close(&mut self);
}

#[async_trait]
pub trait DirContextFactory: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn DirContext>, DirectoryError>;
}
