// SPDX-License-Identifier: AGPL-3.0-only
//! Authenticated identity handed back by a realm.

use std::collections::BTreeMap;

/// Role name that every authenticated principal holds.
pub const ANY_ROLE: &str = "*";

/// A principal produced by an external login system and kept as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalPrincipal {
    pub class_name: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    name: String,
    /// Sorted and deduplicated for binary-search lookups.
    roles: Vec<String>,
    user_principal: Option<ExternalPrincipal>,
    delegated_credential: Option<Vec<u8>>,
    attributes: BTreeMap<String, String>,
}

impl Principal {
    pub fn new<I, S>(name: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut roles: Vec<String> = roles.into_iter().map(Into::into).collect();
        roles.sort();
        roles.dedup();
        Self {
            name: name.into(),
            roles,
            user_principal: None,
            delegated_credential: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_user_principal(mut self, principal: ExternalPrincipal) -> Self {
        self.user_principal = Some(principal);
        self
    }

    pub fn with_delegated_credential(mut self, credential: Vec<u8>) -> Self {
        self.delegated_credential = Some(credential);
        self
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    pub fn has_role(&self, role: &str) -> bool {
        if role == ANY_ROLE {
            return true;
        }
        self.roles
            .binary_search_by(|r| r.as_str().cmp(role))
            .is_ok()
    }

    pub fn user_principal(&self) -> Option<&ExternalPrincipal> {
        self.user_principal.as_ref()
    }

    pub fn delegated_credential(&self) -> Option<&[u8]> {
        self.delegated_credential.as_deref()
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GenericPrincipal[{}(", self.name)?;
        for role in &self.roles {
            write!(f, "{role},")?;
        }
        write!(f, ")]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_are_sorted_and_searchable() {
        let p = Principal::new("bob", ["manager", "admin", "manager"]);
        assert_eq!(p.roles(), &["admin".to_string(), "manager".to_string()]);
        assert!(p.has_role("admin"));
        assert!(p.has_role("manager"));
        assert!(!p.has_role("guest"));
        assert!(p.has_role(ANY_ROLE));
    }

    #[test]
    fn display_lists_roles() {
        let p = Principal::new("bob", ["b", "a"]);
        assert_eq!(p.to_string(), "GenericPrincipal[bob(a,b,)]");
    }

    #[test]
    fn optional_parts() {
        let mut attrs = BTreeMap::new();
        attrs.insert("mail".to_string(), "bob@example.com".to_string());
        let p = Principal::new("bob", Vec::<String>::new())
            .with_user_principal(ExternalPrincipal {
                class_name: "UserPrincipal".into(),
                name: "bob".into(),
            })
            .with_delegated_credential(vec![1, 2])
            .with_attributes(attrs);
        assert_eq!(p.user_principal().map(|u| u.name.as_str()), Some("bob"));
        assert_eq!(p.delegated_credential(), Some(&[1u8, 2][..]));
        assert_eq!(p.attribute("mail"), Some("bob@example.com"));
        assert_eq!(p.attribute("phone"), None);
    }
}
