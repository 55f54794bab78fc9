//! Unified diff parsing and application
//!
//! Hunks are applied bottom-up. Every context and removed line is checked
//! against the file before anything is spliced; a hunk whose lines are not
//! found at the stated position is searched for elsewhere in the file, and
//! rejected when it matches nowhere.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

impl DiffHunk {
    /// (added, removed)
    pub fn summary(&self) -> (usize, usize) {
        let adds = self.lines.iter().filter(|l| matches!(l, DiffLine::Add(_))).count();
        let removes = self.lines.iter().filter(|l| matches!(l, DiffLine::Remove(_))).count();
        (adds, removes)
    }

    /// Lines the hunk expects to find in the original
    fn expected(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                DiffLine::Context(s) | DiffLine::Remove(s) => Some(s.as_str()),
                DiffLine::Add(_) => None,
            })
            .collect()
    }

    fn replacement(&self) -> Vec<String> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                DiffLine::Context(s) | DiffLine::Add(s) => Some(s.clone()),
                DiffLine::Remove(_) => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedDiff {
    /// Paths from the `---`/`+++` headers, when present
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub hunks: Vec<DiffHunk>,
}

impl UnifiedDiff {
    pub fn stats(&self) -> (usize, usize) {
        self.hunks.iter().fold((0, 0), |acc, h| {
            let (a, r) = h.summary();
            (acc.0 + a, acc.1 + r)
        })
    }
}

fn header_path(rest: &str, prefix: &str) -> String {
    let path = rest.split('\t').next().unwrap_or(rest).trim();
    path.strip_prefix(prefix).unwrap_or(path).to_string()
}

/// Parse unified diff text. File headers are optional; at least one hunk is not.
pub fn parse_unified_diff(diff: &str) -> Result<UnifiedDiff, String> {
    let lines: Vec<&str> = diff.lines().collect();
    let mut old_path = None;
    let mut new_path = None;
    let mut hunks = Vec::new();

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if let Some(rest) = line.strip_prefix("--- ") {
            old_path = Some(header_path(rest, "a/"));
            i += 1;
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            new_path = Some(header_path(rest, "b/"));
            i += 1;
        } else if line.starts_with("@@ ") {
            hunks.push(parse_hunk(&lines, &mut i)?);
        } else {
            i += 1;
        }
    }

    if hunks.is_empty() {
        return Err("no hunks found in diff".to_string());
    }
    Ok(UnifiedDiff {
        old_path,
        new_path,
        hunks,
    })
}

fn parse_hunk(lines: &[&str], idx: &mut usize) -> Result<DiffHunk, String> {
    let header = lines[*idx];
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() < 4 || parts[0] != "@@" {
        return Err(format!("invalid hunk header: {header}"));
    }
    let (old_start, old_count) = parse_range(parts[1].trim_start_matches('-'))?;
    let (new_start, new_count) = parse_range(parts[2].trim_start_matches('+'))?;

    *idx += 1;
    let mut diff_lines = Vec::new();
    let (mut seen_old, mut seen_new) = (0, 0);

    while *idx < lines.len() && (seen_old < old_count || seen_new < new_count) {
        let line = lines[*idx];
        if line.starts_with("@@ ") {
            break;
        }
        if let Some(rest) = line.strip_prefix('+') {
            diff_lines.push(DiffLine::Add(rest.to_string()));
            seen_new += 1;
        } else if let Some(rest) = line.strip_prefix('-') {
            diff_lines.push(DiffLine::Remove(rest.to_string()));
            seen_old += 1;
        } else if line.starts_with('\\') {
            // "\ No newline at end of file"
        } else {
            let content = line.strip_prefix(' ').unwrap_or(line);
            diff_lines.push(DiffLine::Context(content.to_string()));
            seen_old += 1;
            seen_new += 1;
        }
        *idx += 1;
    }

    if seen_old != old_count || seen_new != new_count {
        return Err(format!(
            "hunk {header} declares -{old_count}/+{new_count} lines but has -{seen_old}/+{seen_new}"
        ));
    }

    Ok(DiffHunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: diff_lines,
    })
}

/// "10,5" or "10" (count 1)
fn parse_range(s: &str) -> Result<(usize, usize), String> {
    match s.split_once(',') {
        Some((start, count)) => {
            let start = start.parse().map_err(|_| format!("invalid start: {s}"))?;
            let count = count.parse().map_err(|_| format!("invalid count: {s}"))?;
            Ok((start, count))
        }
        None => {
            let start = s.parse().map_err(|_| format!("invalid line number: {s}"))?;
            Ok((start, 1))
        }
    }
}

/// Apply a parsed diff. A trailing newline on the original is preserved.
pub fn apply_diff(original: &str, diff: &UnifiedDiff) -> Result<String, String> {
    let mut lines: Vec<String> = original.lines().map(|s| s.to_string()).collect();

    let mut hunks: Vec<&DiffHunk> = diff.hunks.iter().collect();
    hunks.sort_by_key(|h| std::cmp::Reverse(h.old_start));
    for hunk in hunks {
        apply_hunk(&mut lines, hunk)?;
    }

    let mut out = lines.join("\n");
    if original.ends_with('\n') && !out.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

/// Parse then apply
pub fn apply_unified_diff(original: &str, diff: &str) -> Result<String, String> {
    apply_diff(original, &parse_unified_diff(diff)?)
}

fn apply_hunk(lines: &mut Vec<String>, hunk: &DiffHunk) -> Result<(), String> {
    let expected = hunk.expected();
    // `-0,0` inserts before the first line
    let stated = if hunk.old_count == 0 {
        hunk.old_start
    } else {
        hunk.old_start.saturating_sub(1)
    };

    let start = if matches_at(lines, &expected, stated) {
        stated
    } else {
        (0..=lines.len().saturating_sub(expected.len()))
            .find(|&pos| matches_at(lines, &expected, pos))
            .ok_or_else(|| format!("hunk at line {} does not match the target content", hunk.old_start))?
    };

    let end = start + expected.len();
    lines.splice(start..end, hunk.replacement());
    Ok(())
}

fn matches_at(lines: &[String], expected: &[&str], pos: usize) -> bool {
    if pos + expected.len() > lines.len() {
        return false;
    }
    lines[pos..pos + expected.len()]
        .iter()
        .zip(expected)
        .all(|(have, want)| have.trim_end_matches('\r') == want.trim_end_matches('\r'))
}
