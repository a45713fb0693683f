//! Topic pattern expansion.
//!
//! A published topic is expanded into the ordered list of subscription
//! patterns it must notify. Working from the last segment towards the first,
//! each step keeps the head literal and masks the tail to `+`, except where
//! a tail segment happens to equal the anchor segment; steps past the second
//! position also emit a variant with `+` substituted for the segment just
//! before the anchor. The scheme is intentionally narrower than the full
//! MQTT match closure and must stay that way; subscribers on the global `#`
//! are handled by the caller appending it after expansion.

/// The catch-all pattern matched by every publish.
pub const GLOBAL_WILDCARD: &str = "#";

/// Expand `topic` into the ordered list of patterns to notify.
///
/// Deterministic and duplicate-free; the leading empty segment of a topic
/// starting with `/` is preserved, and `#` is never produced here. A topic
/// without any `/` expands to nothing.
pub fn expand(topic: &str) -> Vec<String> {
    let sections: Vec<&str> = topic.split('/').collect();
    let mut patterns: Vec<String> = Vec::new();

    for i in (1..sections.len()).rev() {
        let anchor = sections[i];

        let mut parts: Vec<&str> = Vec::with_capacity(sections.len());
        parts.extend_from_slice(&sections[..i]);
        for &section in &sections[i..] {
            parts.push(if section == anchor { section } else { "+" });
        }
        push_unique(&mut patterns, parts.join("/"));

        // Wildcard substituted for the segment just before the anchor.
        if i > 2 && i <= sections.len() - 1 {
            let mut parts: Vec<&str> = Vec::with_capacity(sections.len());
            parts.extend_from_slice(&sections[..i - 1]);
            parts.push("+");
            parts.extend_from_slice(&sections[i..]);
            push_unique(&mut patterns, parts.join("/"));
        }
    }

    patterns
}

fn push_unique(patterns: &mut Vec<String>, candidate: String) {
    if !patterns.iter().any(|p| *p == candidate) {
        patterns.push(candidate);
    }
}
