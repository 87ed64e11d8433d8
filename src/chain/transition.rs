//! Transition branch evaluation.
//!
//! After a task produces its `transition_eval` string, branches are walked
//! in declaration order; the first matching non-default branch wins, then
//! the first `default`. Numeric operators go through a tolerant parser so
//! a model answering `"Score: 7.5"` still routes.

use once_cell::sync::Lazy;
use regex::Regex;

use super::definition::{TransitionBranch, TransitionOperator};

static NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-+]?\d*\.?\d+").expect("number regex"));

/// Extract the first numeric occurrence from a noisy string.
///
/// Tolerates surrounding whitespace, quotes, and leading or trailing
/// garbage. Returns `None` when no number is present at all.
pub fn parse_number(s: &str) -> Option<f64> {
    let trimmed = s.trim().trim_matches(|c| c == '"' || c == '\'').trim();
    NUMBER_RE
        .find(trimmed)
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Parse an `in_range` bound of the form `"lo-hi"`, whitespace tolerated.
fn parse_range_bounds(when: &str) -> Option<(f64, f64)> {
    let mut numbers = NUMBER_RE.find_iter(when);
    let lo = numbers.next()?.as_str().parse::<f64>().ok()?;
    let hi = numbers.next()?.as_str().parse::<f64>().ok()?;
    Some((lo, hi))
}

/// Does `response` satisfy a single branch?
///
/// Unparseable numbers fail the branch, not the chain; evaluation simply
/// moves on to the next branch.
pub fn branch_matches(operator: TransitionOperator, response: &str, when: &str) -> bool {
    match operator {
        TransitionOperator::Equals => response == when,
        TransitionOperator::Contains => response.contains(when),
        TransitionOperator::StartsWith => response.starts_with(when),
        TransitionOperator::EndsWith => response.ends_with(when),
        TransitionOperator::GreaterThan => match (parse_number(response), parse_number(when)) {
            (Some(r), Some(w)) => r > w,
            _ => false,
        },
        TransitionOperator::LessThan => match (parse_number(response), parse_number(when)) {
            (Some(r), Some(w)) => r < w,
            _ => false,
        },
        TransitionOperator::InRange => match (parse_number(response), parse_range_bounds(when)) {
            (Some(r), Some((lo, hi))) => lo <= r && r <= hi,
            _ => false,
        },
        TransitionOperator::Default => false,
    }
}

/// Select the branch for `response`: first matching non-default branch in
/// declaration order, else the first `default`, else `None`.
pub fn select_branch<'a>(
    branches: &'a [TransitionBranch],
    response: &str,
) -> Option<&'a TransitionBranch> {
    branches
        .iter()
        .filter(|b| b.operator != TransitionOperator::Default)
        .find(|b| branch_matches(b.operator, response, &b.when))
        .or_else(|| {
            branches
                .iter()
                .find(|b| b.operator == TransitionOperator::Default)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(op: TransitionOperator, when: &str, goto: &str) -> TransitionBranch {
        TransitionBranch {
            operator: op,
            when: when.to_string(),
            goto: goto.to_string(),
            compose: None,
        }
    }

    #[test]
    fn test_parse_number_tolerant() {
        assert_eq!(parse_number("7.5"), Some(7.5));
        assert_eq!(parse_number("  \"42\"  "), Some(42.0));
        assert_eq!(parse_number("Score: -3.25 points"), Some(-3.25));
        assert_eq!(parse_number(".5"), Some(0.5));
        assert_eq!(parse_number("no digits"), None);
    }

    #[test]
    fn test_string_operators() {
        assert!(branch_matches(TransitionOperator::Equals, "yes", "yes"));
        assert!(!branch_matches(TransitionOperator::Equals, "yes!", "yes"));
        assert!(branch_matches(TransitionOperator::Contains, "a yes b", "yes"));
        assert!(branch_matches(TransitionOperator::StartsWith, "yes sir", "yes"));
        assert!(branch_matches(TransitionOperator::EndsWith, "oh yes", "yes"));
    }

    #[test]
    fn test_numeric_operators() {
        assert!(branch_matches(TransitionOperator::GreaterThan, "10", "5"));
        assert!(!branch_matches(TransitionOperator::GreaterThan, "3", "5"));
        assert!(branch_matches(TransitionOperator::LessThan, "3", "5"));
        // Unparseable response fails the branch quietly.
        assert!(!branch_matches(TransitionOperator::GreaterThan, "n/a", "5"));
    }

    #[test]
    fn test_in_range() {
        assert!(branch_matches(TransitionOperator::InRange, "7.5", "5-8"));
        assert!(branch_matches(TransitionOperator::InRange, "5", "5 - 8"));
        assert!(branch_matches(TransitionOperator::InRange, "8", "5-8"));
        assert!(!branch_matches(TransitionOperator::InRange, "8.1", "5-8"));
        assert!(!branch_matches(TransitionOperator::InRange, "x", "5-8"));
        assert!(!branch_matches(TransitionOperator::InRange, "6", "garbage"));
    }

    #[test]
    fn test_select_branch_precedence() {
        let branches = vec![
            branch(TransitionOperator::Default, "", "fallback"),
            branch(TransitionOperator::Equals, "yes", "a"),
            branch(TransitionOperator::Contains, "e", "b"),
        ];
        // First matching non-default wins even though default is declared first.
        assert_eq!(select_branch(&branches, "yes").unwrap().goto, "a");
        // Second branch matches by substring.
        assert_eq!(select_branch(&branches, "nope").unwrap().goto, "b");
        // Nothing matches: the default.
        assert_eq!(select_branch(&branches, "zzz").unwrap().goto, "fallback");
    }

    #[test]
    fn test_select_branch_none() {
        let branches = vec![branch(TransitionOperator::Equals, "yes", "a")];
        assert!(select_branch(&branches, "no").is_none());
    }

    #[test]
    fn test_unparseable_branch_does_not_abort_evaluation() {
        let branches = vec![
            branch(TransitionOperator::GreaterThan, "5", "big"),
            branch(TransitionOperator::Equals, "n/a", "excuse"),
        ];
        assert_eq!(select_branch(&branches, "n/a").unwrap().goto, "excuse");
    }
}
