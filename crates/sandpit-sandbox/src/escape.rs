//! Escaping for values embedded inside synthesized documents.
//!
//! [`escape_js_string`] makes arbitrary text safe to place between double
//! quotes (or backticks) inside an inline `<script>` element. The backslash is
//! always replaced first; every later rule introduces backslashes of its own,
//! which must not be escaped a second time.

/// Replacement rules for JS string literals, applied in this order.
const JS_ESCAPES: &[(&str, &str)] = &[
    ("\\", "\\\\"),
    ("'", "\\'"),
    ("\"", "\\\""),
    ("`", "\\`"),
    ("\n", "\\n"),
    ("\r", "\\r"),
    ("\u{2028}", "\\u2028"),
    ("\u{2029}", "\\u2029"),
    // Keeps `</script>` inside the literal from closing the element.
    ("</", "<\\/"),
];

/// Escapes `value` for embedding as the body of a JS string or template literal.
pub fn escape_js_string(value: &str) -> String {
    let mut escaped = value.to_string();
    for (from, to) in JS_ESCAPES {
        if escaped.contains(from) {
            escaped = escaped.replace(from, to);
        }
    }
    escaped
}

/// Wraps `value` in double quotes after escaping it.
pub fn js_string_literal(value: &str) -> String {
    format!("\"{}\"", escape_js_string(value))
}

/// Reverses [`escape_js_string`].
///
/// Unknown escape sequences are kept verbatim, so the function is total.
pub fn unescape_js_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('`') => out.push('`'),
            Some('/') => out.push('/'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('u') => {
                let digits: String = chars.clone().take(4).collect();
                match digits.as_str() {
                    "2028" => {
                        out.push('\u{2028}');
                        chars.nth(3);
                    }
                    "2029" => {
                        out.push('\u{2029}');
                        chars.nth(3);
                    }
                    _ => out.push_str("\\u"),
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }

    out
}

/// Escapes text for a double-quoted HTML attribute value (e.g. `srcdoc`).
pub fn escape_html_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Neutralises a closing tag for `element` inside raw element text.
///
/// `</script` becomes `<\/script`, which is equivalent inside JS strings,
/// regular expressions and comments.
pub(crate) fn guard_closing_tag(text: &str, element: &str) -> String {
    let lower = text.to_ascii_lowercase();
    let needle = format!("</{element}");
    if !lower.contains(&needle) {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len() + 8);
    let mut last = 0;
    for (idx, _) in lower.match_indices(&needle) {
        out.push_str(&text[last..idx]);
        out.push_str("<\\/");
        last = idx + 2;
    }
    out.push_str(&text[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_backslash_before_everything_else() {
        assert_eq!(escape_js_string(r"a\b"), r"a\\b");
        // A quote next to a backslash must not collapse into `\\"`.
        assert_eq!(escape_js_string("\\\""), "\\\\\\\"");
    }

    #[test]
    fn escapes_quotes_backticks_and_line_terminators() {
        assert_eq!(escape_js_string("it's"), r"it\'s");
        assert_eq!(escape_js_string("say \"hi\""), r#"say \"hi\""#);
        assert_eq!(escape_js_string("`${x}`"), r"\`${x}\`");
        assert_eq!(escape_js_string("a\nb\r\n"), r"a\nb\r\n");
        assert_eq!(escape_js_string("x\u{2028}y"), r"x\u2028y");
    }

    #[test]
    fn escapes_closing_script_tag() {
        let escaped = escape_js_string("console.log('</script>')");
        assert!(!escaped.contains("</script"));
        assert_eq!(unescape_js_string(&escaped), "console.log('</script>')");
    }

    #[test]
    fn round_trips_mixed_text() {
        let samples = [
            "",
            "plain",
            "line1\nline2",
            r#"const s = "a\"b" + 'c\'d' + `e${1}`;"#,
            "\\\\n is not a newline",
            "\\u2028 literally",
            "ends with backslash \\",
            "</div></script>",
        ];
        for sample in samples {
            assert_eq!(unescape_js_string(&escape_js_string(sample)), sample);
        }
    }

    #[test]
    fn unescape_keeps_unknown_sequences() {
        assert_eq!(unescape_js_string(r"\t\x41"), r"\t\x41");
        assert_eq!(unescape_js_string(r"\u0041"), r"\u0041");
    }

    #[test]
    fn literal_is_double_quoted() {
        assert_eq!(js_string_literal("a\"b"), r#""a\"b""#);
    }

    #[test]
    fn html_attribute_escaping_handles_ampersand_first() {
        assert_eq!(escape_html_attribute("&quot;"), "&amp;quot;");
        assert_eq!(
            escape_html_attribute(r#"<a href="x">"#),
            "&lt;a href=&quot;x&quot;&gt;"
        );
    }

    #[test]
    fn guard_closing_tag_is_case_insensitive() {
        assert_eq!(
            guard_closing_tag("a</SCRIPT>b</script >", "script"),
            "a<\\/SCRIPT>b<\\/script >"
        );
        assert_eq!(guard_closing_tag("no tags", "script"), "no tags");
        assert_eq!(guard_closing_tag("p { } </style>", "style"), "p { } <\\/style>");
    }
}
