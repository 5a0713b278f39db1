/// Glob matching for `KEYS`: `*`, `?`, `[abc]`, `[^a-z]` and `\` escapes.
pub fn glob_match(pattern: &str, key: &str) -> bool {
    matches(pattern.as_bytes(), key.as_bytes())
}

fn matches(pattern: &[u8], key: &[u8]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((b'*', rest)) => {
            // collapse runs of stars
            let rest = trim_stars(rest);
            if rest.is_empty() {
                return true;
            }
            (0..=key.len()).any(|skip| matches(rest, &key[skip..]))
        }
        Some((b'?', rest)) => !key.is_empty() && matches(rest, &key[1..]),
        Some((b'[', rest)) => {
            let Some((&ch, tail)) = key.split_first() else {
                return false;
            };
            match class(rest, ch) {
                Some((true, after)) => matches(after, tail),
                Some((false, _)) => false,
                // unterminated class: treat '[' literally
                None => ch == b'[' && matches(rest, tail),
            }
        }
        Some((b'\\', rest)) if !rest.is_empty() => {
            key.first() == Some(&rest[0]) && matches(&rest[1..], &key[1..])
        }
        Some((&c, rest)) => key.first() == Some(&c) && matches(rest, &key[1..]),
    }
}

fn trim_stars(mut pattern: &[u8]) -> &[u8] {
    while let Some((b'*', rest)) = pattern.split_first() {
        pattern = rest;
    }
    pattern
}

/// Match `ch` against a character class whose opening `[` is already
/// consumed. Returns whether it matched and the pattern after the closing `]`.
fn class(pattern: &[u8], ch: u8) -> Option<(bool, &[u8])> {
    let (negate, mut p) = match pattern.split_first() {
        Some((b'^', rest)) => (true, rest),
        _ => (false, pattern),
    };
    let mut hit = false;
    loop {
        match p {
            [] => return None,
            [b']', rest @ ..] => return Some((hit != negate, rest)),
            [b'\\', c, rest @ ..] => {
                hit |= *c == ch;
                p = rest;
            }
            [lo, b'-', hi, rest @ ..] if *hi != b']' => {
                let (lo, hi) = if lo <= hi { (*lo, *hi) } else { (*hi, *lo) };
                hit |= (lo..=hi).contains(&ch);
                p = rest;
            }
            [c, rest @ ..] => {
                hit |= *c == ch;
                p = rest;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcards() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("*", ""));
        assert!(glob_match("user:*", "user:42"));
        assert!(!glob_match("user:*", "session:42"));
        assert!(glob_match("h?llo", "hello"));
        assert!(!glob_match("h?llo", "hllo"));
        assert!(glob_match("a**b", "axxb"));
        assert!(glob_match("*:*:end", "a:b:end"));
    }

    #[test]
    fn test_classes_and_escapes() {
        assert!(glob_match("h[ae]llo", "hallo"));
        assert!(!glob_match("h[ae]llo", "hillo"));
        assert!(glob_match("h[^e]llo", "hallo"));
        assert!(!glob_match("h[^e]llo", "hello"));
        assert!(glob_match("k[0-9]", "k7"));
        assert!(!glob_match("k[0-9]", "kx"));
        assert!(glob_match("a\\*b", "a*b"));
        assert!(!glob_match("a\\*b", "axb"));
        assert!(glob_match("[", "["));
    }
}
