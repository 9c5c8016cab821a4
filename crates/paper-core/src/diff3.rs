//! Text diff, patch and three-way merge.
//!
//! Offsets are counted in `char`s. A [`Patch`] records the length of the text it
//! was produced against and, for every hunk, the text it removes. Applying it to
//! any other text fails instead of silently producing garbage, which is how
//! stale client state is detected.
//!
//! Diffing trims the common prefix and suffix and runs Myers' O(ND) algorithm
//! over the remaining chars. When the edit distance exceeds the budget it
//! retries over lines, and if that also fails the whole middle becomes a single
//! replacement hunk.

use serde::{Deserialize, Serialize};

/// Upper bound on the edit distance explored by a single Myers run.
const MAX_EDIT_DISTANCE: usize = 1024;

/// Upper bound on `(n + m) * d` for a single Myers run.
const DIFF_COST_BUDGET: usize = 50_000_000;

/// One contiguous change: replace `delete` at `start` (in base chars) with `insert`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hunk {
    pub start: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub delete: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub insert: String,
}

/// An order-sensitive transformation from one text to another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    /// Length in chars of the text this patch applies to
    pub base_len: usize,
    /// Non-overlapping hunks ordered by `start`
    pub hunks: Vec<Hunk>,
}

impl Patch {
    /// True if applying the patch leaves the base unchanged.
    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    /// Map a char offset in the base text to the corresponding offset in the
    /// patched text.
    ///
    /// Offsets before or at the start of a hunk stay put, offsets inside a
    /// replaced range collapse to the start of the replacement, and offsets
    /// after it shift by the hunk's length change.
    pub fn map_offset(&self, offset: usize) -> usize {
        let mut shifted = offset;
        for hunk in &self.hunks {
            if offset <= hunk.start {
                break;
            }
            let deleted = hunk.delete.chars().count();
            let inserted = hunk.insert.chars().count();
            let end = hunk.start + deleted;
            if offset < end {
                // Collapse into the replacement; everything before this hunk
                // has already been accounted for in `shifted - offset`.
                return shifted - (offset - hunk.start);
            }
            shifted = shifted + inserted - deleted;
        }
        shifted
    }
}

/// A selection range in char offsets, carried alongside editable text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub start: usize,
    pub end: usize,
}

impl Selection {
    pub fn new(start: usize, end: usize) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self { start: end, end: start }
        }
    }

    /// A collapsed selection (plain caret).
    pub fn caret(offset: usize) -> Self {
        Self {
            start: offset,
            end: offset,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.start == self.end
    }

    /// Carry this selection across the edit described by `patch`.
    pub fn map_through(&self, patch: &Patch) -> Self {
        Self::new(patch.map_offset(self.start), patch.map_offset(self.end))
    }

    /// Clamp both ends to a text of `len` chars.
    pub fn clamp(&self, len: usize) -> Self {
        Self::new(self.start.min(len), self.end.min(len))
    }
}

/// Compute a patch that turns `base` into `target`.
pub fn create_patch(base: &str, target: &str) -> Patch {
    let base_chars: Vec<char> = base.chars().collect();
    let target_chars: Vec<char> = target.chars().collect();

    let hunks = diff_spans(&base_chars, &target_chars)
        .into_iter()
        .map(|span| Hunk {
            start: span.start,
            delete: base_chars[span.start..span.end].iter().collect(),
            insert: span.insert.into_iter().collect(),
        })
        .collect();

    Patch {
        base_len: base_chars.len(),
        hunks,
    }
}

/// Apply `patch` to `base`.
///
/// Returns `None` if `base` is not the text the patch was produced against
/// (length mismatch, removed text mismatch, or hunks out of order/range).
pub fn apply_patch(base: &str, patch: &Patch) -> Option<String> {
    let chars: Vec<char> = base.chars().collect();
    if chars.len() != patch.base_len {
        return None;
    }

    let mut out = String::with_capacity(base.len());
    let mut pos = 0;
    for hunk in &patch.hunks {
        if hunk.start < pos || hunk.start > chars.len() {
            return None;
        }
        let end = hunk.start.checked_add(hunk.delete.chars().count())?;
        if end > chars.len() {
            return None;
        }
        if !chars[hunk.start..end].iter().copied().eq(hunk.delete.chars()) {
            return None;
        }
        out.extend(&chars[pos..hunk.start]);
        out.push_str(&hunk.insert);
        pos = end;
    }
    out.extend(&chars[pos..]);

    Some(out)
}

/// Three-way merge of `theirs` and `mine`, both derived from `base`.
///
/// Returns `None` when the two sides touch the same region differently:
/// overlapping replaced ranges, or different insertions at the same offset.
/// Identical changes on both sides are taken once.
pub fn merge3(theirs: &str, base: &str, mine: &str) -> Option<String> {
    let base_chars: Vec<char> = base.chars().collect();
    let theirs_chars: Vec<char> = theirs.chars().collect();
    let mine_chars: Vec<char> = mine.chars().collect();

    let theirs_spans = diff_spans(&base_chars, &theirs_chars);
    let mine_spans = diff_spans(&base_chars, &mine_chars);

    let mut merged: Vec<&Span> = Vec::with_capacity(theirs_spans.len() + mine_spans.len());
    let (mut i, mut j) = (0, 0);
    loop {
        let next = match (theirs_spans.get(i), mine_spans.get(j)) {
            (Some(a), Some(b)) if a == b => {
                i += 1;
                j += 1;
                a
            }
            (Some(a), Some(b)) => {
                if a.conflicts_with(b) {
                    return None;
                }
                if a.precedes(b) {
                    i += 1;
                    a
                } else {
                    j += 1;
                    b
                }
            }
            (Some(a), None) => {
                i += 1;
                a
            }
            (None, Some(b)) => {
                j += 1;
                b
            }
            (None, None) => break,
        };
        merged.push(next);
    }

    let mut out = String::with_capacity(base.len().max(theirs.len()).max(mine.len()));
    let mut pos = 0;
    for span in merged {
        if span.start < pos {
            return None;
        }
        out.extend(&base_chars[pos..span.start]);
        out.extend(&span.insert);
        pos = span.end;
    }
    out.extend(&base_chars[pos..]);

    Some(out)
}

/// A change in base coordinates: `base[start..end]` becomes `insert`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
    insert: Vec<char>,
}

impl Span {
    fn is_insertion(&self) -> bool {
        self.start == self.end
    }

    fn conflicts_with(&self, other: &Span) -> bool {
        if self.is_insertion() && other.is_insertion() {
            return self.start == other.start;
        }
        self.start < other.end && other.start < self.end
    }

    fn precedes(&self, other: &Span) -> bool {
        self.start < other.start || (self.start == other.start && self.is_insertion())
    }
}

fn diff_spans(base: &[char], target: &[char]) -> Vec<Span> {
    let prefix = base
        .iter()
        .zip(target)
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = base[prefix..]
        .iter()
        .rev()
        .zip(target[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let a = &base[prefix..base.len() - suffix];
    let b = &target[prefix..target.len() - suffix];

    if a.is_empty() && b.is_empty() {
        return Vec::new();
    }

    let whole = || {
        vec![Span {
            start: 0,
            end: a.len(),
            insert: b.to_vec(),
        }]
    };

    let spans = if a.is_empty() || b.is_empty() {
        whole()
    } else {
        let a_chars: Vec<&[char]> = a.chunks(1).collect();
        let b_chars: Vec<&[char]> = b.chunks(1).collect();
        diff_tokens(&a_chars, &b_chars)
            .or_else(|| {
                let a_lines: Vec<&[char]> = a.split_inclusive(|c| *c == '\n').collect();
                let b_lines: Vec<&[char]> = b.split_inclusive(|c| *c == '\n').collect();
                diff_tokens(&a_lines, &b_lines)
            })
            .unwrap_or_else(whole)
    };

    spans
        .into_iter()
        .map(|span| Span {
            start: span.start + prefix,
            end: span.end + prefix,
            insert: span.insert,
        })
        .collect()
}

/// Diff two token sequences, returning spans in char offsets relative to `a`.
fn diff_tokens(a: &[&[char]], b: &[&[char]]) -> Option<Vec<Span>> {
    let ops = myers(a, b)?;

    let mut spans = Vec::new();
    let mut current: Option<Span> = None;
    let (mut pos, mut i, mut j) = (0, 0, 0);
    for op in ops {
        match op {
            Op::Equal => {
                if let Some(span) = current.take() {
                    spans.push(span);
                }
                pos += a[i].len();
                i += 1;
                j += 1;
            }
            Op::Delete => {
                let span = current.get_or_insert_with(|| Span {
                    start: pos,
                    end: pos,
                    insert: Vec::new(),
                });
                pos += a[i].len();
                span.end = pos;
                i += 1;
            }
            Op::Insert => {
                let span = current.get_or_insert_with(|| Span {
                    start: pos,
                    end: pos,
                    insert: Vec::new(),
                });
                span.insert.extend_from_slice(b[j]);
                j += 1;
            }
        }
    }
    if let Some(span) = current {
        spans.push(span);
    }

    Some(spans)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal,
    Delete,
    Insert,
}

/// Myers' greedy shortest-edit-script search.
///
/// Returns `None` when no script exists within the edit-distance limit.
fn myers<T: PartialEq>(a: &[T], b: &[T]) -> Option<Vec<Op>> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let total = a.len() + b.len();
    let limit = MAX_EDIT_DISTANCE
        .min(DIFF_COST_BUDGET / total.max(1))
        .min(total)
        .max(1);

    let offset = limit as isize + 1;
    let mut v = vec![0isize; 2 * limit + 3];
    // trace[d] holds v[-d-1..=d+1] as it was before round d
    let mut trace: Vec<Vec<isize>> = Vec::new();

    for d in 0..=limit as isize {
        let lo = (offset - d - 1) as usize;
        let hi = (offset + d + 1) as usize;
        trace.push(v[lo..=hi].to_vec());

        let mut k = -d;
        while k <= d {
            let idx = (k + offset) as usize;
            let mut x = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
                v[idx + 1]
            } else {
                v[idx - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx] = x;
            if x >= n && y >= m {
                return Some(backtrack(&trace, n, m));
            }
            k += 2;
        }
    }

    None
}

fn backtrack(trace: &[Vec<isize>], n: isize, m: isize) -> Vec<Op> {
    let mut ops = Vec::with_capacity((n + m) as usize);
    let (mut x, mut y) = (n, m);

    for (d, snapshot) in trace.iter().enumerate().rev() {
        let d = d as isize;
        // snapshot[0] corresponds to diagonal -d-1
        let at = |k: isize| snapshot[(k + d + 1) as usize];
        let k = x - y;
        let prev_k = if k == -d || (k != d && at(k - 1) < at(k + 1)) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = at(prev_k);
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            ops.push(Op::Equal);
            x -= 1;
            y -= 1;
        }
        if d > 0 {
            if x == prev_x {
                ops.push(Op::Insert);
            } else {
                ops.push(Op::Delete);
            }
        }
        x = prev_x;
        y = prev_y;
    }

    ops.reverse();
    ops
}
