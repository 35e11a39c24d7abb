//! Myers O(ND) diff over call-instruction streams
//!
//! Used by diff-target registration to find the calls that exist only in the
//! current version of a body.

use super::target::CallInstruction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOp {
    /// `left[i]` matches `right[j]`
    Equal(usize, usize),
    /// `right[j]` is present only on the right
    Insert(usize),
    /// `left[i]` is present only on the left
    Delete(usize),
}

/// Shortest edit script turning `left` into `right`, in sequence order
pub fn edit_script<T, F>(left: &[T], right: &[T], same: F) -> Vec<EditOp>
where
    F: Fn(&T, &T) -> bool,
{
    let n = left.len() as isize;
    let m = right.len() as isize;

    if n == 0 {
        return (0..right.len()).map(EditOp::Insert).collect();
    }
    if m == 0 {
        return (0..left.len()).map(EditOp::Delete).collect();
    }

    let max_d = n + m;
    let offset = max_d;
    let mut v = vec![0isize; (2 * max_d + 1) as usize];
    let mut trace: Vec<Vec<isize>> = Vec::new();

    'outer: for d in 0..=max_d {
        trace.push(v.clone());

        let mut k = -d;
        while k <= d {
            let ki = (k + offset) as usize;
            let mut x = if k == -d || (k != d && v[ki - 1] < v[ki + 1]) {
                v[ki + 1]
            } else {
                v[ki - 1] + 1
            };
            let mut y = x - k;

            while x < n && y < m && same(&left[x as usize], &right[y as usize]) {
                x += 1;
                y += 1;
            }
            v[ki] = x;

            if x >= n && y >= m {
                break 'outer;
            }
            k += 2;
        }
    }

    backtrack(&trace, n, m, offset)
}

fn backtrack(trace: &[Vec<isize>], n: isize, m: isize, offset: isize) -> Vec<EditOp> {
    let mut ops = Vec::new();
    let mut x = n;
    let mut y = m;

    for (d, v) in trace.iter().enumerate().rev() {
        let d = d as isize;
        let k = x - y;

        let prev_k = if k == -d || (k != d && v[(k - 1 + offset) as usize] < v[(k + 1 + offset) as usize]) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = if d == 0 { 0 } else { v[(prev_k + offset) as usize] };
        let prev_y = if d == 0 { 0 } else { prev_x - prev_k };

        while x > prev_x && y > prev_y {
            x -= 1;
            y -= 1;
            ops.push(EditOp::Equal(x as usize, y as usize));
        }

        if d > 0 {
            if x == prev_x {
                ops.push(EditOp::Insert(prev_y as usize));
            } else {
                ops.push(EditOp::Delete(prev_x as usize));
            }
        }

        x = prev_x;
        y = prev_y;
    }

    ops.reverse();
    ops
}

/// Positions in `current` of calls absent from `baseline`.
///
/// Calls emitted by the instrumentation itself are never reported. Matching
/// compares call targets only, so overloads sharing a name are treated as the
/// same call.
pub fn inserted_calls(baseline: &[CallInstruction], current: &[CallInstruction]) -> Vec<usize> {
    edit_script(baseline, current, CallInstruction::same_target)
        .into_iter()
        .filter_map(|op| match op {
            EditOp::Insert(j) if !current[j].instrumentation => Some(j),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn calls(names: &[&str]) -> Vec<CallInstruction> {
        names.iter().map(|n| CallInstruction::parse(n)).collect()
    }

    fn apply(left: &[char], right: &[char], ops: &[EditOp]) -> Vec<char> {
        let mut out = Vec::new();
        for op in ops {
            match *op {
                EditOp::Equal(i, _) => out.push(left[i]),
                EditOp::Insert(j) => out.push(right[j]),
                EditOp::Delete(_) => {}
            }
        }
        out
    }

    #[test]
    fn test_identical_sequences_are_all_equal() {
        let a = ['a', 'b', 'c'];
        let ops = edit_script(&a, &a, |x, y| x == y);
        assert_eq!(
            ops,
            vec![EditOp::Equal(0, 0), EditOp::Equal(1, 1), EditOp::Equal(2, 2)]
        );
    }

    #[test]
    fn test_empty_sides() {
        let a: [char; 0] = [];
        let b = ['x', 'y'];
        assert_eq!(
            edit_script(&a, &b, |x, y| x == y),
            vec![EditOp::Insert(0), EditOp::Insert(1)]
        );
        assert_eq!(
            edit_script(&b, &a, |x, y| x == y),
            vec![EditOp::Delete(0), EditOp::Delete(1)]
        );
    }

    #[test]
    fn test_insertions_around_common_run() {
        let baseline = calls(&["A.a", "B.b", "C.c"]);
        let current = calls(&["A.a", "X.x", "B.b", "C.c", "Y.y"]);
        assert_eq!(inserted_calls(&baseline, &current), vec![1, 4]);
    }

    #[test]
    fn test_instrumentation_calls_are_skipped() {
        let baseline = calls(&["A.a"]);
        let mut current = calls(&["Probe.Start", "A.a", "X.x"]);
        current[0] = current[0].clone().instrumentation();
        assert_eq!(inserted_calls(&baseline, &current), vec![2]);
    }

    #[test]
    fn test_overloads_compare_equal() {
        let baseline = vec![CallInstruction::parse("Pawn.Tick").with_arguments(["int"])];
        let current = vec![CallInstruction::parse("Pawn.Tick").with_arguments(["float"])];
        assert!(inserted_calls(&baseline, &current).is_empty());
    }

    #[test]
    fn test_deletions_are_not_reported_as_insertions() {
        let baseline = calls(&["A.a", "B.b", "C.c"]);
        let current = calls(&["A.a", "C.c"]);
        assert!(inserted_calls(&baseline, &current).is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_script_rebuilds_right(
            left in prop::collection::vec(prop::sample::select(vec!['a', 'b', 'c', 'd']), 0..24),
            right in prop::collection::vec(prop::sample::select(vec!['a', 'b', 'c', 'd']), 0..24),
        ) {
            let ops = edit_script(&left, &right, |x, y| x == y);
            prop_assert_eq!(apply(&left, &right, &ops), right.clone());

            let consumed_left = ops
                .iter()
                .filter(|op| !matches!(op, EditOp::Insert(_)))
                .count();
            prop_assert_eq!(consumed_left, left.len());
        }

        #[test]
        fn prop_pure_insertions_are_isolated(
            base in prop::collection::vec(prop::sample::select(vec!['a', 'b', 'c']), 0..16),
            extra in prop::collection::vec((0usize..17, prop::sample::select(vec!['x', 'y'])), 0..6),
        ) {
            let mut current = base.clone();
            for (at, c) in &extra {
                let at = (*at).min(current.len());
                current.insert(at, *c);
            }
            let ops = edit_script(&base, &current, |x, y| x == y);
            let inserted: Vec<char> = ops
                .iter()
                .filter_map(|op| match op {
                    EditOp::Insert(j) => Some(current[*j]),
                    _ => None,
                })
                .collect();
            prop_assert_eq!(inserted.len(), extra.len());
            prop_assert!(inserted.iter().all(|c| *c == 'x' || *c == 'y'));
        }
    }
}
