//! Redis-style glob patterns (`KEYS`/`SCAN MATCH` semantics)

const SPECIAL: &[char] = &['*', '?', '[', ']', '\\'];

/// Escape every glob metacharacter so `literal` only ever matches itself
pub fn escape(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if SPECIAL.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Pattern selecting every key under `prefix:`
pub fn prefix_pattern(prefix: &str) -> String {
    format!("{}:*", escape(prefix))
}

/// Match `text` against a glob supporting `*`, `?`, `[abc]`, `[^a-z]` and
/// backslash escapes
pub fn matches(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    match_from(&pattern, &text)
}

// Single pass with one backtrack point: on a mismatch, resume just after the
// most recent `*` with that star absorbing one more character.
fn match_from(p: &[char], t: &[char]) -> bool {
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    while pi < p.len() && p[pi] == '*' {
                        pi += 1;
                    }
                    star = Some((pi, ti));
                    continue;
                }
                '?' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                '[' => {
                    let (matched, next) = match_class(p, pi + 1, t[ti]);
                    if matched {
                        pi = next;
                        ti += 1;
                        continue;
                    }
                }
                '\\' if pi + 1 < p.len() => {
                    if t[ti] == p[pi + 1] {
                        pi += 2;
                        ti += 1;
                        continue;
                    }
                }
                literal => {
                    if t[ti] == literal {
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                }
            }
        }

        match star {
            Some((after_star, absorbed)) => {
                pi = after_star;
                ti = absorbed + 1;
                star = Some((after_star, ti));
            }
            None => return false,
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Returns whether `c` is in the class starting at `i` and the index just
/// past its closing bracket. An unterminated class runs to the end.
fn match_class(p: &[char], mut i: usize, c: char) -> (bool, usize) {
    let negate = i < p.len() && p[i] == '^';
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < p.len() && p[i] != ']' {
        if p[i] == '\\' && i + 1 < p.len() {
            matched |= p[i + 1] == c;
            i += 2;
        } else if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            let (low, high) = if p[i] <= p[i + 2] {
                (p[i], p[i + 2])
            } else {
                (p[i + 2], p[i])
            };
            matched |= low <= c && c <= high;
            i += 3;
        } else {
            matched |= p[i] == c;
            i += 1;
        }
    }

    let next = if i < p.len() { i + 1 } else { i };
    (matched != negate, next)
}
