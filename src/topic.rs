//! Topic pattern matching.
//!
//! Topics are `.`-separated segment strings. Patterns may use `*` to match
//! exactly one segment and `**` to match zero or more consecutive segments.

/// Decides whether a concrete `topic` matches a subscription `pattern`.
///
/// Matching is segment-by-segment: literal segments must be byte-equal, `*`
/// consumes exactly one segment, and `**` consumes zero or more segments with
/// greedy backtracking, so patterns with several `**` anchors such as
/// `a.**.b.**.c` are well-defined. The empty topic matches the empty pattern,
/// `*`, and `**`.
pub fn matches(topic: &str, pattern: &str) -> bool {
    let topic: Vec<&str> = topic.split('.').collect();
    let pattern: Vec<&str> = pattern.split('.').collect();

    let mut t = 0;
    let mut p = 0;
    // Position of the most recent `**` and the topic index bound to it.
    let mut backtrack: Option<(usize, usize)> = None;

    while t < topic.len() {
        if p < pattern.len() && (pattern[p] == "*" || pattern[p] == topic[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == "**" {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = backtrack {
            // The tail after `**` failed to match; extend the `**` by one
            // segment and retry from there.
            backtrack = Some((star_p, star_t + 1));
            t = star_t + 1;
            p = star_p + 1;
        } else {
            return false;
        }
    }

    // Remaining pattern segments may only be `**`, which match zero segments.
    while p < pattern.len() && pattern[p] == "**" {
        p += 1;
    }
    p == pattern.len()
}
