//! Post-processing: deterministic cleanup of Nougat page predictions.
//!
//! Nougat emits Mathpix-flavoured Markdown. A handful of failure modes show
//! up often enough to fix mechanically:
//!
//! - section titles that swallowed a whole paragraph
//! - a heading hallucinated as the last line of the page
//! - the decoder looping on the same sentence until `max_length`
//! - reference lists repeated over and over
//! - PMC-style math (`_x_`) and misplaced `\thanks` footnotes
//! - list items run together on one line
//! - malformed or empty LaTeX tables
//! - empty or number-only headings, runs of blank lines
//!
//! [`markdown_compatible`] then rewrites LaTeX-isms that common Markdown
//! renderers do not understand. Rules run in a fixed order and are pure
//! `&str → String` functions, each tested on its own.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

/// Minimum length of a repeated tail before it is truncated.
const MIN_REPETITION_LEN: usize = 30;

/// Clean one page prediction; apply [`markdown_compatible`] when `markdown_fix` is set.
pub fn postprocess_page(generation: &str, markdown_fix: bool) -> String {
    let s = demote_long_titles(generation);
    let s = s.trim().replace("\n* [leftmargin=*]\n", "\n");
    let s = remove_numbered_empty_headings(&s);
    let s = drop_trailing_title(&s);
    let s = truncate_repetitions(&s, MIN_REPETITION_LEN);
    let s = remove_hallucinated_references(&s);
    let s = fix_reference_lists(&s);
    let s = remove_stray_single_chars(&s);
    let s = fix_pmc_math(&s);
    let s = fix_footnote_labels(&s);
    let s = remove_inline_footnotes(&s);
    let s = normalize_list_like_lines(&s);
    let s = fix_tables(&s);
    let s = remove_signature_repeats(&s);
    let s = remove_empty_headings(&s);
    let s = remove_lone_periods(&s);
    let s = collapse_blank_lines(&s);

    if markdown_fix {
        markdown_compatible(&s)
    } else {
        s
    }
}

// ── Section titles that swallowed a paragraph ────────────────────────────────

static RE_LONG_TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:\n|^)#+ \d*\W? ?(.{100,})").unwrap());

fn demote_long_titles(input: &str) -> String {
    RE_LONG_TITLE.replace_all(input, "\n${1}").to_string()
}

// ── Headings that hold only a section number ─────────────────────────────────

static RE_NUMBERED_EMPTY_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^#+ (?:\.?(?:\d|[ixv])+)*\s*(?:$|\n\s*)").unwrap());

fn remove_numbered_empty_headings(input: &str) -> String {
    RE_NUMBERED_EMPTY_HEADING.replace_all(input, "").to_string()
}

// ── Heading hallucinated at the end of the page ──────────────────────────────

fn drop_trailing_title(input: &str) -> String {
    let lines: Vec<&str> = input.split('\n').collect();
    match lines.split_last() {
        Some((last, rest))
            if !rest.is_empty()
                && last.starts_with('#')
                && last.trim_start_matches('#').starts_with(' ') =>
        {
            debug!("Dropping likely hallucinated title at end of page: {}", last);
            rest.join("\n")
        }
        _ => input.to_string(),
    }
}

// ── Repetition loops ─────────────────────────────────────────────────────────

/// Collapse a tail that repeats itself into a single copy.
///
/// Finds the shortest block of at least `min_len` characters such that the
/// text ends with two consecutive copies of it (compared case-insensitively),
/// strips every trailing copy and keeps exactly one.
pub fn truncate_repetitions(text: &str, min_len: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let lower: Vec<char> = chars.iter().map(|c| c.to_ascii_lowercase()).collect();
    let n = lower.len();
    if n < 2 * min_len {
        return text.to_string();
    }

    let period = (min_len..=n / 2).find(|&r| lower[n - r..] == lower[n - 2 * r..n - r]);
    let Some(r) = period else {
        return text.to_string();
    };

    let block = &lower[n - r..];
    let mut end = n;
    while end >= r && &lower[end - r..end] == block {
        end -= r;
    }

    debug!(
        "Truncating {} repeated copies of a {}-char tail",
        (n - end) / r,
        r
    );
    chars[..end + r].iter().collect()
}

// ── Hallucinated reference lists ─────────────────────────────────────────────

const REPEATED_REFERENCES: &str = "\n\n[REPEATED REFERENCES]\n\n";

static RE_NUMBERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:[\d_]|\*\*)").unwrap());

fn strip_numbers(line: &str) -> String {
    RE_NUMBERS.replace_all(line, "").trim().to_string()
}

/// Indel similarity in `[0, 1]`: `2 * LCS / (len(a) + len(b))`.
fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let mut row = vec![0usize; b.len() + 1];
    for ca in &a {
        let mut diag = 0;
        for (j, cb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = if ca == cb { diag + 1 } else { above.max(row[j]) };
            diag = above;
        }
    }
    2.0 * row[b.len()] as f64 / total as f64
}

/// Line ranges, `[start, end)`, covered by long runs of near-identical lines.
fn repeated_line_ranges(clean: &[String]) -> Vec<(usize, usize)> {
    let n = clean.len();
    let mut marked = vec![false; n];
    for i in 0..n.saturating_sub(1) {
        let mut j = i + 1;
        while clean[j].is_empty() && j < n - 1 {
            j += 1;
        }
        let (a, b) = (clean[i].as_str(), clean[j].as_str());
        let plausible = |s: &str| (4..200).contains(&s.chars().count());
        if plausible(a)
            && plausible(b)
            && !a.starts_with("[MISSING_PAGE")
            && (a == b || similarity(a, b) > 0.9)
        {
            marked[i..j].iter_mut().for_each(|m| *m = true);
        }
    }

    let ids: Vec<usize> = (0..n).filter(|&i| marked[i]).collect();
    let Some(&last) = ids.last() else {
        return Vec::new();
    };
    let mut ranges = Vec::new();
    let mut first = ids[0];
    for pair in ids.windows(2) {
        if pair[1] - pair[0] > 3 {
            ranges.push((first, pair[0] + 2));
            first = pair[1];
        }
    }
    ranges.push((first, last + 2));
    ranges.into_iter().filter(|(s, e)| e - s > 15).collect()
}

/// Text of a repeated block, widened to whole reference entries.
fn repeated_block(lines: &[&str], clean: &[String], range: (usize, usize)) -> String {
    let base = &clean[range.0];
    let (mut start, mut end) = range;
    let mut start_at_entry = false;

    // look back at most four lines for where the block really begins
    for i in (range.0.saturating_sub(5) + 1..=range.0.saturating_sub(1)).rev() {
        if lines[i].is_empty() {
            continue;
        }
        if lines[i] == "## References" {
            start = i;
            break;
        }
        if similarity(base, &strip_numbers(lines[i])) < 0.9 {
            start = i + 1;
            let previous = lines[i.saturating_sub(1)];
            let candidate = strip_numbers(previous.split_once("* [").map_or("", |(_, r)| r));
            if candidate.chars().count() as f64 >= 0.75 * base.chars().count() as f64
                && similarity(base, &candidate) < 0.9
            {
                start = i;
            }
            start_at_entry = true;
            break;
        }
    }

    for (i, line) in lines.iter().enumerate().take(range.1 + 5).skip(range.1) {
        if similarity(base, &strip_numbers(line)) < 0.9 {
            end = i;
            break;
        }
    }
    if end >= lines.len() {
        end = lines.len() - 1;
    }

    let mut block = lines[start..=end].join("\n");

    // the last line may run on into the next page; find where it diverges
    // from the line before it, ignoring digits
    let previous = lines[end.saturating_sub(1)];
    let current = lines[end];
    let mut diverged_at = None;
    let mut a_chars = previous.chars();
    let mut b_chars = current.chars().enumerate();
    'compare: loop {
        let a = loop {
            match a_chars.next() {
                Some(c) if c.is_numeric() => continue,
                Some(c) => break c,
                None => break 'compare,
            }
        };
        let b = loop {
            match b_chars.next() {
                Some((i, c)) => {
                    diverged_at = Some(i);
                    if !c.is_numeric() {
                        break c;
                    }
                }
                None => break 'compare,
            }
        };
        if a != b {
            break;
        }
    }

    if start_at_entry {
        if let Some((_, rest)) = block.split_once("* [") {
            block = format!("* [{rest}");
        }
    }
    if let Some(ib) = diverged_at {
        let overhang = current.chars().count().saturating_sub(ib + 1);
        if overhang > 0 {
            let keep = block.chars().count().saturating_sub(overhang);
            block = block.chars().take(keep).collect();
        }
    }
    block.trim().to_string()
}

/// Replace long runs of (near-)duplicate reference entries with a marker.
pub fn remove_hallucinated_references(text: &str) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    let clean: Vec<String> = lines.iter().map(|l| strip_numbers(l)).collect();
    let blocks: Vec<String> = repeated_line_ranges(&clean)
        .into_iter()
        .map(|range| repeated_block(&lines, &clean, range))
        .collect();

    let mut out = text.to_string();
    for block in blocks.iter().rev().filter(|b| !b.is_empty()) {
        debug!("Replacing {} chars of repeated references", block.len());
        out = out.replace(block.as_str(), REPEATED_REFERENCES);
    }
    out
}

// ── Reference list artefacts ─────────────────────────────────────────────────

static RE_REFERENCE_INITIALS_LOOP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\* \[\d+\](\s?[A-W]\.+\s?){10,}.*$").unwrap());
static RE_REFERENCE_EMPTY_BRACKETS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(\* \[\d+\])\[\](.*)$").unwrap());

fn fix_reference_lists(input: &str) -> String {
    let s = RE_REFERENCE_INITIALS_LOOP.replace_all(input, "");
    RE_REFERENCE_EMPTY_BRACKETS
        .replace_all(&s, "${1}${2}")
        .to_string()
}

// ── Lone characters at page boundaries ───────────────────────────────────────

static RE_STRAY_CHAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(^\w\n\n|\n\n\w$)").unwrap());

fn remove_stray_single_chars(input: &str) -> String {
    RE_STRAY_CHAR.replace_all(input, "").to_string()
}

// ── PMC math and footnote labels ─────────────────────────────────────────────

static RE_PMC_SUBSCRIPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([\s.,()])_([a-zA-Z0-9])__([a-zA-Z0-9]){1,3}_([\s.,:()])").unwrap()
});
static RE_PMC_SYMBOL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([\s.,\d])_([a-zA-Z0-9])_([\s.,\d;])").unwrap());
static RE_FOOTNOTE_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\nFootnote .*?:) (?:footnotetext|thanks):\W*(.*(?:\n\n|$))").unwrap()
});

/// `_a__b_` becomes `\(a_{b}\)` and `_a_` becomes `\(a\)`.
fn fix_pmc_math(input: &str) -> String {
    let s = RE_PMC_SUBSCRIPT.replace_all(input, r"${1}\(${2}_{${3}}\)${4}");
    RE_PMC_SYMBOL.replace_all(&s, r"${1}\(${2}\)${3}").to_string()
}

fn fix_footnote_labels(input: &str) -> String {
    RE_FOOTNOTE_LABEL.replace_all(input, "${1} ${2}").to_string()
}

// ── Inline footnote markers ──────────────────────────────────────────────────

static RE_FOOTNOTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[FOOTNOTE:.+?\](.*?)\[ENDFOOTNOTE\]").unwrap());

fn remove_inline_footnotes(input: &str) -> String {
    RE_FOOTNOTE.replace_all(input, "").to_string()
}

// ── List items run together on one line ──────────────────────────────────────

static RE_LIST_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^([-*]) ?((?:\d|[ixv])+ )?.+? ([-*]) (((?:\d|[ixv])+)\.(\d|[ixv]) )?.*$").unwrap()
});
static RE_LIST_NUMERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^[\dixv]+(?:\.[\dixv])*$").unwrap());

/// Split `- a - b - c` style lines into one item per line, indenting items
/// numbered like `2.1` by their depth.
pub fn normalize_list_like_lines(input: &str) -> String {
    let lines: Vec<&str> = input.split('\n').collect();
    let last = lines.len() - 1;
    let mut out = Vec::with_capacity(lines.len());
    for (n, line) in lines.iter().enumerate() {
        match split_list_line(line, n == 0) {
            Some(items) if n == last => out.push(format!("{items}\n")),
            Some(items) => out.push(items),
            None => out.push((*line).to_string()),
        }
    }
    out.join("\n")
}

fn split_list_line(line: &str, at_text_start: bool) -> Option<String> {
    let mut chars = line.chars();
    let marker = chars.next().filter(|c| matches!(c, '-' | '*'))?;
    if matches!(chars.next(), Some('-' | '*')) {
        return None;
    }
    let caps = RE_LIST_LINE.captures(line)?;
    let delim = format!("{} ", &caps[3]);
    let first_delim = format!("{marker} ");

    let mut replacement = String::new();
    for (i, item) in line.split(delim.as_str()).skip(1).enumerate() {
        let item = item.trim();
        let Some((numeral, _)) = item.split_once(' ') else {
            continue;
        };
        let level = if RE_LIST_NUMERAL.is_match(numeral) {
            numeral.matches('.').count()
        } else {
            0
        };
        if i > 0 {
            replacement.push('\n');
        }
        replacement.push_str(&"\t".repeat(level));
        replacement.push_str(if i > 0 || at_text_start { &delim } else { &first_delim });
        replacement.push_str(item);
    }
    Some(replacement)
}

// ── Tables ───────────────────────────────────────────────────────────────────

static RE_TABLE_AFTER_TEXT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)(^.+)\\begin\{tab").unwrap());
static RE_EMPTY_TABULAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\begin\{tabular\}\{([clr ]){2,}\}\s*[& ]*\s*(\\\\)? \\end\{tabular\}").unwrap()
});

/// Drop runaway tables and put table environments on their own lines.
pub fn fix_tables(input: &str) -> String {
    let mut s = input.to_string();
    let runaway: Vec<&str> = input
        .split('\n')
        .filter(|l| {
            l.matches(r"\begin{tabular}").count() > 15
                || l.matches(r"\multicolumn").count() > 60
                || l.matches('&').count() > 1000
        })
        .collect();
    for line in runaway {
        debug!("Dropping runaway table line of {} chars", line.len());
        s = s.replace(line, "");
    }

    let s = s
        .replace(r"\begin{table} \begin{tabular}", "\\begin{table}\n\\begin{tabular}")
        .replace(r"\end{tabular} \end{table}", "\\end{tabular}\n\\end{table}")
        .replace(r"\end{table} Tab", "\\end{table}\nTab");
    let s = RE_TABLE_AFTER_TEXT.replace_all(&s, "${1}\n\\begin{tab");
    let s = s
        .replace(r"\begin{tabular}{l l}  & \\ \end{tabular}", "")
        .replace(r"\begin{tabular}{}\n\n\end{tabular}", "")
        .replace(r"\begin{array}[]{", r"\begin{array}{");
    RE_EMPTY_TABULAR.replace_all(&s, "").to_string()
}

// ── Empty headings and blank-line runs ───────────────────────────────────────

static RE_SIGNATURE_REPEATS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\*\*S\. A\. B\.\*\*\n+){2,}").unwrap());
static RE_EMPTY_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#+( [\[\d\w])?$").unwrap());
static RE_LONE_PERIOD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\.\s*$").unwrap());
static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn remove_signature_repeats(input: &str) -> String {
    RE_SIGNATURE_REPEATS.replace_all(input, "").to_string()
}

fn remove_empty_headings(input: &str) -> String {
    RE_EMPTY_HEADING.replace_all(input, "").to_string()
}

fn remove_lone_periods(input: &str) -> String {
    RE_LONE_PERIOD.replace_all(input, "").to_string()
}

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").trim().to_string()
}

// ── Markdown compatibility ───────────────────────────────────────────────────

static RE_TAG_BEFORE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\(([\d.]+[a-zA-Z]?)\) \\\[(.+?)\\\]$").unwrap());
static RE_TAG_AFTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\\\[(.+?)\\\] \(([\d.]+[a-zA-Z]?)\)$").unwrap());
static RE_TAG_BETWEEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\\\[(.+?)\\\] \(([\d.]+[a-zA-Z]?)\) (\\\[.+?\\\])$").unwrap()
});
static RE_BOLDMATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\mbox\{ ?\\boldmath\$(.*?)\$\}").unwrap());
static RE_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"((?:http|ftp|https)://(?:[\w_-]+(?:(?:\.[\w_-]+)+))(?:[\w.,@?^=%&:/~+#-]*[\w@?^=%&/~+#-]))",
    )
    .unwrap()
});
static RE_CODE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```\s*(.+?)\s*```").unwrap());

/// Rewrite LaTeX constructs into forms Markdown renderers accept.
///
/// - `(1) \[x\]` and `\[x\] (1)` become `\[x \tag{1}\]`
/// - `\bm{` and `\boldmath` become `\mathbf{`
/// - bare URLs become `[url](url)` links
/// - code blocks get their fences on separate lines
pub fn markdown_compatible(input: &str) -> String {
    let s = RE_TAG_BEFORE.replace_all(input, r"\[${2} \tag{${1}}\]");
    let s = RE_TAG_AFTER.replace_all(&s, r"\[${1} \tag{${2}}\]");
    let s = RE_TAG_BETWEEN.replace_all(&s, r"\[${1} \tag{${2}}\] ${3}");
    let s = s
        .replace(r"\. ", ". ")
        .replace(r"\bm{", r"\mathbf{")
        .replace(r"{\\bm ", r"\mathbf{");
    let s = RE_BOLDMATH.replace_all(&s, r"\mathbf{${1}}");
    let s = RE_URL.replace_all(&s, "[${1}](${1})");
    RE_CODE_FENCE.replace_all(&s, "```\n${1}\n```").to_string()
}
