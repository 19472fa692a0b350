//! Identifier normalization shared by both planes.

/// Uppercased slug used as the remote resource pool id.
/// Non-alphanumeric runs collapse to a single hyphen.
pub fn pool_slug(identifier: &str) -> String {
    let mut out = String::with_capacity(identifier.len());
    let mut pending_sep = false;
    for c in identifier.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('-');
            }
            pending_sep = false;
            out.push(c.to_ascii_uppercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// DNS-safe hostname derived from a display name: lowercase ascii,
/// whitespace/underscore runs become hyphens, must start with a letter
/// and end with a letter or digit.
pub fn hostname(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('-');
            }
            pending_sep = false;
            out.push(c.to_ascii_lowercase());
        } else if c.is_whitespace() || c == '-' || c == '_' {
            pending_sep = true;
        }
        // Other punctuation and non-ascii are dropped outright.
    }
    // Must start with a letter.
    while let Some(first) = out.chars().next() {
        if first.is_ascii_alphabetic() {
            break;
        }
        out.remove(0);
    }
    // Must end with a letter or digit.
    while let Some(last) = out.chars().last() {
        if last.is_ascii_alphanumeric() {
            break;
        }
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_slug_collapses_separators() {
        assert_eq!(pool_slug("act 2024/17"), "ACT-2024-17");
        assert_eq!(pool_slug("ACT--01"), "ACT-01");
        assert_eq!(pool_slug("  act01  "), "ACT01");
    }

    #[test]
    fn pool_slug_empty_input() {
        assert_eq!(pool_slug("///"), "");
    }

    #[test]
    fn hostname_is_dns_safe() {
        assert_eq!(hostname("Kali Attack Box"), "kali-attack-box");
        assert_eq!(hostname("01 web server"), "web-server");
        assert_eq!(hostname("db_primary!"), "db-primary");
        assert_eq!(hostname("Città"), "citt");
    }

    #[test]
    fn hostname_trims_trailing_separators() {
        assert_eq!(hostname("web--"), "web");
        assert_eq!(hostname("---"), "");
    }
}
