//! SQL placeholder translation.
//!
//! Rewrites `?` or `$n` placeholders into the template form used by the host
//! client: literal SQL fragments split at each bind point, plus the argument
//! index bound at every slot. Translation is rebuilt per call; nothing is cached.

use crate::models::Value;

/// SQL split at bind points.
///
/// Invariant: `fragments.len() == arg_order.len() + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderTemplate {
    pub fragments: Vec<String>,
    /// 0-based caller argument index bound at each slot, in slot order.
    pub arg_order: Vec<usize>,
}

impl PlaceholderTemplate {
    /// A template with no bind points.
    pub fn literal(sql: &str) -> Self {
        Self {
            fragments: vec![sql.to_string()],
            arg_order: Vec::new(),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.arg_order.len()
    }

    /// Arguments in slot order. Numbered templates may repeat or reorder them.
    pub fn bind(&self, args: &[Value]) -> Vec<Value> {
        self.arg_order
            .iter()
            .map(|&idx| args.get(idx).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Whether slot `i` binds caller argument `i` for every slot.
    pub fn is_in_caller_order(&self) -> bool {
        self.arg_order
            .iter()
            .enumerate()
            .all(|(slot, &idx)| slot == idx)
    }

    /// Render back to `$1..$n` SQL, one placeholder per slot.
    pub fn to_numbered_sql(&self) -> String {
        render_numbered(&self.fragments)
    }
}

/// Join template fragments with sequential `$n` placeholders.
pub fn render_numbered(fragments: &[String]) -> String {
    let mut sql = String::with_capacity(fragments.iter().map(|f| f.len() + 3).sum());
    for (i, fragment) in fragments.iter().enumerate() {
        if i > 0 {
            sql.push('$');
            sql.push_str(&i.to_string());
        }
        sql.push_str(fragment);
    }
    sql
}

/// Translate `sql` for `arg_count` positional arguments.
///
/// Returns `None` when the markers cannot be reconciled with `arg_count`; the
/// caller then passes the SQL through untouched with its arguments in order.
pub fn translate(sql: &str, arg_count: usize) -> Option<PlaceholderTemplate> {
    if arg_count == 0 {
        return Some(PlaceholderTemplate::literal(sql));
    }
    if has_numbered_marker(sql) {
        return translate_numbered(sql, arg_count);
    }
    if sql.contains('?') {
        return translate_sequential(sql, arg_count);
    }
    None
}

fn has_numbered_marker(sql: &str) -> bool {
    sql.as_bytes()
        .windows(2)
        .any(|w| w[0] == b'$' && w[1].is_ascii_digit())
}

/// `$n` mode: textual, with the longest digit run taken as the index so `$1`
/// never matches inside `$10`. Indexes outside `1..=arg_count` stay literal.
fn translate_numbered(sql: &str, arg_count: usize) -> Option<PlaceholderTemplate> {
    let bytes = sql.as_bytes();
    let mut fragments = Vec::new();
    let mut arg_order = Vec::new();
    let mut last = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i;
        let mut end = i + 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        if end == start + 1 {
            i += 1;
            continue;
        }
        match sql[start + 1..end].parse::<usize>() {
            Ok(n) if (1..=arg_count).contains(&n) => {
                fragments.push(sql[last..start].to_string());
                arg_order.push(n - 1);
                last = end;
            }
            _ => {}
        }
        i = end;
    }

    if arg_order.is_empty() {
        return None;
    }
    fragments.push(sql[last..].to_string());
    Some(PlaceholderTemplate {
        fragments,
        arg_order,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Code,
    SingleQuoted,
    DoubleQuoted,
    LineComment,
    BlockComment,
}

/// `?` mode: one left-to-right scan that skips quoted strings, quoted
/// identifiers, comments and dollar-quoted bodies.
fn translate_sequential(sql: &str, arg_count: usize) -> Option<PlaceholderTemplate> {
    let bytes = sql.as_bytes();
    let mut fragments = Vec::with_capacity(arg_count + 1);
    let mut last = 0;
    let mut region = Region::Code;
    let mut dollar_tag: Option<&str> = None;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let next = bytes.get(i + 1).copied();

        if let Some(tag) = dollar_tag {
            if bytes[i..].starts_with(tag.as_bytes()) {
                i += tag.len();
                dollar_tag = None;
            } else {
                i += 1;
            }
            continue;
        }

        match region {
            Region::LineComment => {
                if c == b'\n' {
                    region = Region::Code;
                }
                i += 1;
            }
            Region::BlockComment => {
                if c == b'*' && next == Some(b'/') {
                    region = Region::Code;
                    i += 2;
                } else {
                    i += 1;
                }
            }
            Region::SingleQuoted | Region::DoubleQuoted => {
                let quote = if region == Region::SingleQuoted { b'\'' } else { b'"' };
                if c == quote && next == Some(quote) {
                    i += 2;
                } else {
                    if c == quote {
                        region = Region::Code;
                    }
                    i += 1;
                }
            }
            Region::Code => match c {
                b'\'' => {
                    region = Region::SingleQuoted;
                    i += 1;
                }
                b'"' => {
                    region = Region::DoubleQuoted;
                    i += 1;
                }
                b'-' if next == Some(b'-') => {
                    region = Region::LineComment;
                    i += 2;
                }
                b'/' if next == Some(b'*') => {
                    region = Region::BlockComment;
                    i += 2;
                }
                b'$' => match dollar_tag_at(sql, i) {
                    Some(tag) => {
                        dollar_tag = Some(tag);
                        i += tag.len();
                    }
                    None => i += 1,
                },
                b'?' => {
                    fragments.push(sql[last..i].to_string());
                    i += 1;
                    last = i;
                }
                _ => i += 1,
            },
        }
    }

    if fragments.len() != arg_count {
        return None;
    }
    fragments.push(sql[last..].to_string());
    Some(PlaceholderTemplate {
        fragments,
        arg_order: (0..arg_count).collect(),
    })
}

/// Opening dollar-quote tag (`$$` or `$tag$`) starting at `start`.
fn dollar_tag_at(sql: &str, start: usize) -> Option<&str> {
    let bytes = sql.as_bytes();
    let mut end = start + 1;
    while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
        end += 1;
    }
    (bytes.get(end) == Some(&b'$')).then(|| &sql[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frags(t: &PlaceholderTemplate) -> Vec<&str> {
        t.fragments.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_sequential_markers() {
        let t = translate("SELECT * FROM t WHERE a = ? AND b = ?", 2).unwrap();
        assert_eq!(frags(&t), vec!["SELECT * FROM t WHERE a = ", " AND b = ", ""]);
        assert_eq!(t.arg_order, vec![0, 1]);
    }

    #[test]
    fn test_marker_inside_string_literal_ignored() {
        let t = translate("SELECT 'a?b', ?", 1).unwrap();
        assert_eq!(frags(&t), vec!["SELECT 'a?b', ", ""]);
    }

    #[test]
    fn test_doubled_quotes_stay_inside_literal() {
        let t = translate("SELECT 'it''s?', \"col\"\"?\" FROM t WHERE x = ?", 1).unwrap();
        assert_eq!(t.slot_count(), 1);
        assert!(t.fragments[0].ends_with("WHERE x = "));
    }

    #[test]
    fn test_comments_skipped() {
        let sql = "SELECT ? -- why?\n, /* what? */ ?";
        let t = translate(sql, 2).unwrap();
        assert_eq!(frags(&t), vec!["SELECT ", " -- why?\n, /* what? */ ", ""]);
    }

    #[test]
    fn test_dollar_quoted_body_skipped() {
        let sql = "SELECT $fn$ is it? $fn$, $$ ok? $$, ?";
        let t = translate(sql, 1).unwrap();
        assert_eq!(t.slot_count(), 1);
        assert!(t.fragments[0].ends_with("$$ ok? $$, "));
    }

    #[test]
    fn test_count_mismatch_falls_back() {
        assert!(translate("SELECT ?, ?", 1).is_none());
        assert!(translate("SELECT ?", 2).is_none());
        assert!(translate("SELECT 1", 1).is_none());
    }

    #[test]
    fn test_numbered_reordering() {
        let t = translate("SELECT $2, $1", 2).unwrap();
        assert_eq!(t.arg_order, vec![1, 0]);
        let bound = t.bind(&[Value::from("A"), Value::from("B")]);
        assert_eq!(bound, vec![Value::from("B"), Value::from("A")]);
    }

    #[test]
    fn test_numbered_repeat_and_multi_digit() {
        let args: Vec<Value> = (1..=10).map(Value::from).collect();
        let t = translate("SELECT $10, $1, $1", 10).unwrap();
        assert_eq!(t.arg_order, vec![9, 0, 0]);
        assert_eq!(frags(&t), vec!["SELECT ", ", ", ", ", ""]);
        assert_eq!(t.bind(&args)[0], Value::Int(10));
    }

    #[test]
    fn test_numbered_out_of_range_left_literal() {
        let t = translate("SELECT $1, $12", 1).unwrap();
        assert_eq!(frags(&t), vec!["SELECT ", ", $12"]);
    }

    #[test]
    fn test_zero_args_is_literal() {
        let t = translate("SELECT '?'", 0).unwrap();
        assert_eq!(t, PlaceholderTemplate::literal("SELECT '?'"));
    }

    #[test]
    fn test_render_numbered() {
        let t = translate("INSERT INTO t VALUES (?, ?)", 2).unwrap();
        assert_eq!(t.to_numbered_sql(), "INSERT INTO t VALUES ($1, $2)");

        let reordered = translate("SELECT $2 || $1", 2).unwrap();
        assert_eq!(reordered.to_numbered_sql(), "SELECT $1 || $2");
    }

    #[test]
    fn test_multibyte_text_preserved() {
        let t = translate("SELECT 'héllo?' , ? AS ü", 1).unwrap();
        assert_eq!(frags(&t), vec!["SELECT 'héllo?' , ", " AS ü"]);
    }
}
