//! Ordered multi-token verification of human-readable command output.
//!
//! Output such as `describe` listings has no structure to parse, only an
//! expected top-to-bottom layout. Each [`RequirementGroup`] names an anchor
//! token that selects a line plus tokens that must share that line. Groups
//! are matched with a cursor that only moves forward, so a later anchor can
//! never be satisfied by text from an earlier section.

use tracing::debug;

use crate::errors::{HarnessError, HarnessResult};

/// Anchor token followed by tokens required on the same line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementGroup {
    tokens: Vec<String>,
}

impl RequirementGroup {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    pub fn anchor(&self) -> Option<&str> {
        self.tokens.first().map(String::as_str)
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Parse a comma-separated group, e.g. `"Replicas:,1 current,1 desired"`.
    pub fn parse(group: &str) -> Self {
        Self::new(group.split(',').map(str::trim).filter(|t| !t.is_empty()))
    }
}

impl AsRef<[String]> for RequirementGroup {
    fn as_ref(&self) -> &[String] {
        &self.tokens
    }
}

/// Check that `output`, split by line, contains every group in order.
///
/// Returns the index of the line each group matched. Consecutive groups may
/// match the same line; they may never match an earlier one.
pub fn check_output<G, S>(output: &str, required: &[G]) -> HarnessResult<Vec<usize>>
where
    G: AsRef<[S]>,
    S: AsRef<str>,
{
    let lines: Vec<&str> = output.split('\n').collect();
    let mut current = 0;
    let mut matched = Vec::with_capacity(required.len());

    for group in required {
        let tokens = group.as_ref();
        let Some((anchor, rest)) = tokens.split_first() else {
            return Err(HarnessError::VerificationMismatch {
                missing: "<empty requirement group>".to_string(),
                context: output.to_string(),
            });
        };
        let anchor = anchor.as_ref();

        while current < lines.len() && !lines[current].contains(anchor) {
            current += 1;
        }
        if current == lines.len() {
            return Err(HarnessError::VerificationMismatch {
                missing: anchor.to_string(),
                context: output.to_string(),
            });
        }

        let line = lines[current];
        for item in rest {
            let item = item.as_ref();
            if !line.contains(item) {
                return Err(HarnessError::VerificationMismatch {
                    missing: item.to_string(),
                    context: line.to_string(),
                });
            }
        }

        debug!(anchor, line = current, "Requirement group matched");
        matched.push(current);
    }

    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const DESCRIBE_RC: &str = "Name:\t\tredis-master\n\
        Namespace:\te2e-tests-kubectl\n\
        Selector:\tapp=redis,role=master\n\
        Labels:\t\tapp=redis\n\
        Replicas:\t1 current / 1 desired\n\
        Pods Status:\t1 Running / 0 Waiting / 0 Succeeded / 0 Failed\n\
        No volumes.\n";

    #[test]
    fn test_matches_first_occurrence_then_later_anchor() {
        let lines = check_output("A\nB\nA\n", &[["A"], ["B"]]).unwrap();
        assert_eq!(lines, vec![0, 1]);
    }

    #[test]
    fn test_cursor_never_moves_backward() {
        let err = check_output("B\nA\n", &[["A"], ["B"]]).unwrap_err();
        match err {
            HarnessError::VerificationMismatch { missing, context } => {
                assert_eq!(missing, "B");
                assert_eq!(context, "B\nA\n");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_describe_output_in_order() {
        let required = vec![
            vec!["Name:", "redis-master"],
            vec!["Namespace:", "e2e-tests-kubectl"],
            vec!["Selector:", "app=redis,role=master"],
            vec!["Replicas:", "1 current", "1 desired"],
            vec!["Pods Status:", "1 Running", "0 Waiting", "0 Succeeded", "0 Failed"],
        ];
        let lines = check_output(DESCRIBE_RC, &required).unwrap();
        assert_eq!(lines, vec![0, 1, 2, 4, 5]);
    }

    #[test]
    fn test_missing_secondary_token_names_the_line() {
        let required = vec![vec!["Replicas:", "2 desired"]];
        let err = check_output(DESCRIBE_RC, &required).unwrap_err();
        match err {
            HarnessError::VerificationMismatch { missing, context } => {
                assert_eq!(missing, "2 desired");
                assert_eq!(context, "Replicas:\t1 current / 1 desired");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_earlier_duplicate_anchor_is_not_reused() {
        // "Labels:" also appears in the header; the second group must bind to
        // the line after "Pod Template:".
        let output = "Labels:\tapp=web\nPod Template:\n  Labels:\trun=web\n";
        let required = vec![vec!["Pod Template:"], vec!["Labels:", "run=web"]];
        assert_eq!(check_output(output, &required).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_groups_may_share_a_line() {
        let lines = check_output("a b c\n", &[vec!["a"], vec!["b", "c"]]).unwrap();
        assert_eq!(lines, vec![0, 0]);
    }

    #[test]
    fn test_empty_group_is_a_mismatch() {
        let empty: Vec<Vec<&str>> = vec![vec![]];
        assert!(check_output("x\n", &empty).is_err());
    }

    #[test]
    fn test_requirement_group_parse() {
        let group = RequirementGroup::parse("Replicas:, 1 current ,,1 desired");
        assert_eq!(group.anchor(), Some("Replicas:"));
        assert_eq!(group.tokens().len(), 3);
        check_output(DESCRIBE_RC, &[group]).unwrap();
    }

    proptest! {
        #[test]
        fn prop_increasing_selection_matches_its_own_lines(
            count in 1usize..24,
            picks in proptest::collection::vec(any::<bool>(), 24),
        ) {
            let output: String = (0..count).map(|i| format!("row-{i:03} value-{i}\n")).collect();
            let chosen: Vec<usize> = (0..count).filter(|i| picks[*i]).collect();
            let groups: Vec<Vec<String>> = chosen
                .iter()
                .map(|i| vec![format!("row-{i:03}"), format!("value-{i}")])
                .collect();
            prop_assert_eq!(check_output(&output, &groups).unwrap(), chosen);
        }

        #[test]
        fn prop_reversed_pair_never_matches(count in 2usize..24, a in 0usize..24, b in 0usize..24) {
            let (x, y) = (a % count, b % count);
            let (lo, hi) = (x.min(y), x.max(y));
            prop_assume!(lo < hi);
            let output: String = (0..count).map(|i| format!("row-{i:03}\n")).collect();
            let groups = vec![vec![format!("row-{hi:03}")], vec![format!("row-{lo:03}")]];
            prop_assert!(check_output(&output, &groups).is_err());
        }
    }
}
