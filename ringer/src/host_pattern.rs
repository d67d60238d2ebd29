//! Expansion of host patterns such as `ring-(0-3).(east|west).internal`.
//!
//! A group is either an alternation `(a|b|c)` or an inclusive numeric range
//! `(n-m)`. The last group in the string is expanded first and each
//! variation is expanded recursively, producing the full cross product.

/// Expands every group in `pattern`. A pattern without groups expands to
/// itself.
pub fn expand(pattern: &str) -> Vec<String> {
    let Some((open, close)) = last_group(pattern) else {
        return vec![pattern.to_string()];
    };

    let (head, group, tail) = (&pattern[..open], &pattern[open + 1..close], &pattern[close + 1..]);
    variations(group)
        .into_iter()
        .flat_map(|variation| expand(&format!("{head}{variation}{tail}")))
        .collect()
}

/// Byte offsets of the parentheses around the last non-empty group.
fn last_group(pattern: &str) -> Option<(usize, usize)> {
    pattern
        .match_indices('(')
        .rev()
        .find_map(|(open, _)| match pattern[open + 1..].find(')') {
            Some(0) | None => None,
            Some(len) => Some((open, open + 1 + len)),
        })
}

fn variations(group: &str) -> Vec<String> {
    if let Some((first, last)) = numeric_range(group) {
        return (first..=last).map(|n| n.to_string()).collect();
    }
    group.split('|').map(str::to_string).collect()
}

fn numeric_range(group: &str) -> Option<(u64, u64)> {
    let (first, last) = group.split_once('-')?;
    Some((first.trim().parse().ok()?, last.trim().parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_hosts_expand_to_themselves() {
        assert_eq!(expand("ring.local"), vec!["ring.local"]);
        assert_eq!(expand("odd()name"), vec!["odd()name"]);
    }

    #[test]
    fn expands_numeric_ranges() {
        assert_eq!(
            expand("ring-(0-2).local"),
            vec!["ring-0.local", "ring-1.local", "ring-2.local"]
        );
        assert!(expand("ring-(3-1)").is_empty());
    }

    #[test]
    fn expands_alternation() {
        assert_eq!(expand("(a|b|c).example"), vec!["a.example", "b.example", "c.example"]);
    }

    #[test]
    fn expands_cross_product_last_group_outermost() {
        assert_eq!(
            expand("(a|b)-(1-2)"),
            vec!["a-1", "b-1", "a-2", "b-2"]
        );
        assert_eq!(expand("h(1-3)(x|y|z)").len(), 9);
    }
}
