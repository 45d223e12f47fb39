// SPDX-License-Identifier: AGPL-3.0-only
//! Escaping for values placed into search filters and DNs, and user pattern parsing.

/// RFC 4515 escaping for a value inside a search filter.
pub fn escape_filter(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\5c"),
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\0' => out.push_str("\\00"),
            _ => out.push(c),
        }
    }
    out
}

/// RFC 4514 escaping for a value used as an attribute value inside a DN.
pub fn escape_dn(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 4);
    let last = value.chars().count().saturating_sub(1);
    for (i, c) in value.chars().enumerate() {
        match c {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                out.push('\\');
                out.push(c);
            }
            '#' if i == 0 => out.push_str("\\#"),
            ' ' if i == 0 || i == last => out.push_str("\\ "),
            '\0' => out.push_str("\\00"),
            _ => out.push(c),
        }
    }
    out
}

/// Substitutes `{0}` and `{1}` in a pattern.
pub fn format_pattern(pattern: &str, arg0: &str, arg1: &str) -> String {
    pattern.replace("{0}", arg0).replace("{1}", arg1)
}

/// Splits `(p1)(p2)...` into its patterns; anything else is one pattern.
/// Parentheses inside a pattern are kept when balanced.
pub fn parse_user_patterns(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    if !raw.starts_with('(') {
        return vec![raw.to_string()];
    }
    let mut patterns = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in raw.chars() {
        match c {
            '(' => {
                if depth > 0 {
                    current.push(c);
                }
                depth += 1;
            }
            ')' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if !current.is_empty() {
                        patterns.push(std::mem::take(&mut current));
                    }
                } else {
                    current.push(c);
                }
            }
            _ if depth > 0 => current.push(c),
            _ => {}
        }
    }
    patterns
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_escaping() {
        assert_eq!(escape_filter("alice"), "alice");
        assert_eq!(escape_filter("a*)(uid=*"), "a\\2a\\29\\28uid=\\2a");
        assert_eq!(escape_filter("back\\slash"), "back\\5cslash");
        assert_eq!(escape_filter("nul\0"), "nul\\00");
    }

    #[test]
    fn dn_escaping() {
        assert_eq!(escape_dn("Smith, John"), "Smith\\, John");
        assert_eq!(escape_dn("#admin"), "\\#admin");
        assert_eq!(escape_dn(" padded "), "\\ padded\\ ");
        assert_eq!(escape_dn("a+b=c"), "a\\+b\\=c");
    }

    #[test]
    fn user_patterns() {
        assert_eq!(
            parse_user_patterns("uid={0},ou=people,dc=example,dc=com"),
            vec!["uid={0},ou=people,dc=example,dc=com".to_string()]
        );
        assert_eq!(
            parse_user_patterns("(uid={0},ou=a)(cn={0},ou=b)"),
            vec!["uid={0},ou=a".to_string(), "cn={0},ou=b".to_string()]
        );
        assert_eq!(
            parse_user_patterns("(cn={0},ou=x(y))"),
            vec!["cn={0},ou=x(y)".to_string()]
        );
        assert!(parse_user_patterns("  ").is_empty());
    }

    #[test]
    fn pattern_substitution() {
        assert_eq!(
            format_pattern("(&(member={0})(cn={1}))", "uid=a,dc=x", "a"),
            "(&(member=uid=a,dc=x)(cn=a))"
        );
    }
}
