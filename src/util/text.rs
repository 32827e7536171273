use std::borrow::Cow;

/// Ellipsis appended to truncated text
const ELLIPSIS: &str = "...";

/// Escapes text for inclusion in an HTML body or attribute.
///
/// Returns `Cow::Borrowed` when nothing needs escaping.
///
/// ```
/// use rss_email::util::escape_html;
///
/// assert_eq!(escape_html("plain"), "plain");
/// assert_eq!(escape_html("<b>\"Q&A\"</b>"), "&lt;b&gt;&quot;Q&amp;A&quot;&lt;/b&gt;");
/// ```
pub fn escape_html(s: &str) -> Cow<'_, str> {
    if !s.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len() + 16);
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

/// Truncates `s` to at most `max_chars` characters, ellipsis included.
///
/// Counts Unicode scalar values, never splitting a character. `max_chars == 0`
/// means no limit.
///
/// ```
/// use rss_email::util::truncate_chars;
///
/// assert_eq!(truncate_chars("Short", 10), "Short");
/// assert_eq!(truncate_chars("Hello World", 8), "Hello...");
/// assert_eq!(truncate_chars("Hello", 0), "Hello");
/// assert_eq!(truncate_chars("Hello", 2), "He");
/// ```
pub fn truncate_chars(s: &str, max_chars: usize) -> Cow<'_, str> {
    if max_chars == 0 {
        return Cow::Borrowed(s);
    }

    let Some((cut, _)) = s.char_indices().nth(max_chars) else {
        return Cow::Borrowed(s);
    };

    // Too narrow for text plus ellipsis
    if max_chars <= ELLIPSIS.len() {
        return Cow::Owned(s[..cut].to_string());
    }

    let keep = s
        .char_indices()
        .nth(max_chars - ELLIPSIS.len())
        .map(|(idx, _)| idx)
        .unwrap_or(cut);
    let mut out = s[..keep].trim_end().to_string();
    out.push_str(ELLIPSIS);
    Cow::Owned(out)
}
