//! Glob matching.
//!
//! There are two distinct engines here, and they are deliberately kept apart:
//!
//!  - [`glob_match`] is a minimal shell-style matcher used for zip manifests.  `*` matches any run
//!    of characters *including* `/`, and `?` matches exactly one character.
//!  - [`Pattern`] is a path-segment-aware glob used for directory, image and tar traversal.  `*`,
//!    `?` and character classes never match `/`, `**` matches any number of whole path segments,
//!    and `{a,b}` alternation is supported.

use regex_automata::{
    dfa::{dense, Automaton},
    Anchored, Input,
};

use crate::error::{ArchiveError, Result};

/// Reports whether `name` matches the shell pattern `pattern`.
///
/// This is the classic two-pointer backtracking matcher: on a mismatch we go back to the most
/// recent `*` and let it swallow one more character, failing only once there is no `*` left to
/// retry from.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let pattern = pattern.as_bytes();
    let name = name.as_bytes();

    let (mut px, mut nx) = (0, 0);
    let (mut next_px, mut next_nx) = (0, 0);

    while px < pattern.len() || nx < name.len() {
        if px < pattern.len() {
            match pattern[px] {
                b'?' if nx < name.len() => {
                    px += 1;
                    nx += 1;
                    continue;
                }
                b'*' => {
                    // try to match at nx; if that fails, restart at nx + 1
                    next_px = px;
                    next_nx = nx + 1;
                    px += 1;
                    continue;
                }
                c if c != b'?' && nx < name.len() && name[nx] == c => {
                    px += 1;
                    nx += 1;
                    continue;
                }
                _ => {}
            }
        }

        if 0 < next_nx && next_nx <= name.len() {
            px = next_px;
            nx = next_nx;
            continue;
        }
        return false;
    }

    true
}

/// A compiled path-segment-aware glob ("doublestar") pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    pattern: String,
    dfa: dense::DFA<Vec<u32>>,
}

impl Pattern {
    /// Compiles `pattern`.  Fails with [`ArchiveError::Pattern`] on unbalanced brackets or braces.
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = glob_to_regex(pattern)?;
        let dfa = dense::DFA::new(&regex)
            .map_err(|e| ArchiveError::Pattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Pattern {
            pattern: pattern.to_string(),
            dfa,
        })
    }

    /// Reports whether the entire `path` matches.
    pub fn matches(&self, path: &str) -> bool {
        let input = Input::new(path.as_bytes()).anchored(Anchored::Yes);
        matches!(self.dfa.try_search_fwd(&input), Ok(Some(_)))
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

/// Compiles a list of patterns, failing on the first invalid one.
pub fn compile_all<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Pattern>> {
    patterns.iter().map(|p| Pattern::new(p.as_ref())).collect()
}

fn invalid(pattern: &str, reason: &str) -> ArchiveError {
    ArchiveError::Pattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    }
}

fn push_literal(regex: &mut String, c: char) {
    if "\\.+*?()|[]{}^$#&-~".contains(c) {
        regex.push('\\');
    }
    regex.push(c);
}

fn glob_to_regex(pattern: &str) -> Result<String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut regex = String::from("(?s)^");
    let mut brace_depth = 0usize;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                let at_segment_start = i == 0 || chars[i - 1] == '/';
                match chars.get(i + 2) {
                    // "**/" matches zero or more whole directories
                    Some('/') if at_segment_start => {
                        regex.push_str("(?:.*/)?");
                        i += 3;
                    }
                    None if at_segment_start => {
                        regex.push_str(".*");
                        i += 2;
                    }
                    // "a**b" is just two stars within a segment
                    _ => {
                        regex.push_str("[^/]*");
                        i += 2;
                    }
                }
                continue;
            }
            '*' => regex.push_str("[^/]*"),
            '?' => regex.push_str("[^/]"),
            '[' => {
                let mut j = i + 1;
                let negated = matches!(chars.get(j), Some('!' | '^'));
                if negated {
                    j += 1;
                }
                let class_start = j;
                let mut class = String::new();
                loop {
                    match chars.get(j) {
                        None => return Err(invalid(pattern, "unterminated character class")),
                        Some(']') if j > class_start => break,
                        Some('\\') => {
                            let Some(&escaped) = chars.get(j + 1) else {
                                return Err(invalid(pattern, "trailing escape"));
                            };
                            push_literal(&mut class, escaped);
                            j += 2;
                        }
                        Some('-') => {
                            class.push('-');
                            j += 1;
                        }
                        Some(&c) => {
                            push_literal(&mut class, c);
                            j += 1;
                        }
                    }
                }
                // classes never match the separator
                if negated {
                    regex.push_str(&format!("[^{class}/]"));
                } else {
                    regex.push_str(&format!("[{class}&&[^/]]"));
                }
                i = j + 1;
                continue;
            }
            '{' => {
                brace_depth += 1;
                regex.push_str("(?:");
            }
            ',' if brace_depth > 0 => regex.push('|'),
            '}' if brace_depth > 0 => {
                brace_depth -= 1;
                regex.push(')');
            }
            '\\' => {
                let Some(&escaped) = chars.get(i + 1) else {
                    return Err(invalid(pattern, "trailing escape"));
                };
                push_literal(&mut regex, escaped);
                i += 2;
                continue;
            }
            c => push_literal(&mut regex, c),
        }
        i += 1;
    }

    if brace_depth != 0 {
        return Err(invalid(pattern, "unterminated alternation"));
    }

    regex.push('$');
    Ok(regex)
}
