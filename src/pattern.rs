//! Address pattern matching.
//!
//! A pattern matches one slash-delimited address component at a time:
//!
//! - `*` matches zero or more characters
//! - `?` matches exactly one character
//! - `[set]` matches any character in the set; `[!set]` negates; ranges
//!   like `a-z` are inclusive; a `]` right after `[`/`[!` and a `-` at the
//!   set boundary are literal
//! - `{a,bb,c}` matches any of the comma-separated alternatives
//!
//! The pattern argument may be a suffix of a whole address, so matching
//! stops at a `/` or at the end of the pattern; the candidate component must
//! be fully consumed for a match.

/// True when `component` contains any of the pattern metacharacters.
pub fn has_pattern_chars(component: &str) -> bool {
    component.bytes().any(|b| matches!(b, b'*' | b'?' | b'[' | b'{'))
}

/// Match one component against the leading component of `pattern`.
pub fn component_match(component: &str, pattern: &str) -> bool {
    match_bytes(component.as_bytes(), pattern.as_bytes())
}

const NEGATE: u8 = b'!';

fn match_bytes(mut s: &[u8], mut p: &[u8]) -> bool {
    while let Some(&c) = p.first() {
        if c == b'/' {
            break;
        }
        // [!...] handling assumes a character to consume; '*' may still
        // match the empty remainder
        if s.is_empty() && c != b'*' {
            return false;
        }
        p = &p[1..];
        match c {
            b'*' => {
                while p.first() == Some(&b'*') {
                    p = &p[1..];
                }
                // trailing '*' matches the rest of the component
                if p.is_empty() || p[0] == b'/' {
                    return true;
                }
                // skip characters that cannot start a match of the next
                // literal pattern character
                if !matches!(p[0], b'?' | b'[' | b'{') {
                    while !s.is_empty() && s[0] != p[0] {
                        s = &s[1..];
                    }
                }
                while !s.is_empty() {
                    if match_bytes(s, p) {
                        return true;
                    }
                    s = &s[1..];
                }
                return false;
            }
            b'?' => {}
            b'[' => {
                let negate = if p.first() == Some(&NEGATE) {
                    p = &p[1..];
                    true
                } else {
                    false
                };
                let target = s[0];
                let mut matched = false;
                // scan the set; leave p just past the closing ']'
                let mut first = true;
                loop {
                    let c = match p.first() {
                        None => return false,
                        Some(&b'/') => return false,
                        Some(&c) => c,
                    };
                    if c == b']' && !first {
                        p = &p[1..];
                        break;
                    }
                    first = false;
                    p = &p[1..];
                    if p.first() == Some(&b'-') && p.get(1).is_some_and(|&n| n != b']') {
                        let hi = p[1];
                        if hi == b'/' || hi == 0 {
                            return false;
                        }
                        p = &p[2..];
                        if !matched {
                            matched = target >= c && target <= hi;
                        }
                    } else if !matched {
                        matched = c == target;
                    }
                }
                if negate == matched {
                    return false;
                }
            }
            b'{' => {
                // alternation: try each comma-separated choice, matching
                // the remainder after '}' from the same point on mismatch
                let close = match find_brace_end(p) {
                    Some(i) => i,
                    None => return false,
                };
                let rest = &p[close + 1..];
                let mut choices = p[..close].split(|&b| b == b',');
                return choices.any(|choice| {
                    s.len() >= choice.len()
                        && &s[..choice.len()] == choice
                        && match_bytes(&s[choice.len()..], rest)
                });
            }
            _ => {
                if c != s[0] {
                    return false;
                }
            }
        }
        s = &s[1..];
    }
    s.is_empty()
}

fn find_brace_end(p: &[u8]) -> Option<usize> {
    p.iter().position(|&b| b == b'}').filter(|&i| {
        // a '/' before the closing brace means the pattern is malformed
        !p[..i].contains(&b'/')
    })
}
