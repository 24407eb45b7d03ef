//! Text cleaning for mail bodies and extracted documents.
//!
//! Order used by the mail connector: [`html_to_text`] → [`remove_quoted`] →
//! [`remove_signature`] → [`clean_text`]. The first three need line structure;
//! `clean_text` flattens everything onto one line.

use regex::Regex;
use scraper::Html;
use std::sync::LazyLock;

/// Strip markup, normalize typography to ASCII, and collapse whitespace.
pub fn clean_text(input: &str) -> String {
    static COMMENT_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid regex"));
    static TAG_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));
    static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

    if input.is_empty() {
        return String::new();
    }

    let text = COMMENT_RE.replace_all(input, " ");
    let text = TAG_RE.replace_all(&text, " ");
    let text = unescape_entities(&text);
    let text = WS_RE.replace_all(&text, " ");

    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\u{2018}' | '\u{2019}' | '\u{201a}' | '\u{2032}' => out.push('\''),
            '\u{201c}' | '\u{201d}' | '\u{201e}' | '\u{2033}' => out.push('"'),
            '\u{2013}' | '\u{2014}' | '\u{2212}' => out.push('-'),
            '\u{2026}' => out.push_str("..."),
            '\u{00a0}' | '\u{2007}' | '\u{202f}' => out.push(' '),
            '\u{200b}' | '\u{200c}' | '\u{200d}' | '\u{2060}' | '\u{feff}' | '\u{fffd}' => {}
            c if c.is_control() && !c.is_whitespace() => {}
            c => out.push(c),
        }
    }

    WS_RE.replace_all(&out, " ").trim().to_string()
}

/// Decode the HTML entities that show up in mail bodies: the common named
/// ones plus decimal and hex numeric references.
pub fn unescape_entities(input: &str) -> String {
    static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});").expect("valid regex")
    });

    ENTITY_RE
        .replace_all(input, |caps: &regex::Captures| {
            let name = &caps[1];
            let decoded = if let Some(hex) = name
                .strip_prefix("#x")
                .or_else(|| name.strip_prefix("#X"))
            {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = name.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                match name {
                    "amp" => Some('&'),
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    "nbsp" => Some('\u{00a0}'),
                    "ndash" => Some('\u{2013}'),
                    "mdash" => Some('\u{2014}'),
                    "hellip" => Some('\u{2026}'),
                    "lsquo" => Some('\u{2018}'),
                    "rsquo" => Some('\u{2019}'),
                    "ldquo" => Some('\u{201c}'),
                    "rdquo" => Some('\u{201d}'),
                    "copy" => Some('\u{00a9}'),
                    "reg" => Some('\u{00ae}'),
                    _ => None,
                }
            };
            match decoded {
                Some(c) => c.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Visible text of an HTML document, one block element per line.
pub fn html_to_text(html: &str) -> String {
    static SPACES_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[ \t\u{00a0}]+").expect("valid regex"));
    static BLANK_LINES_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n\s*\n+").expect("valid regex"));

    let doc = Html::parse_document(html);
    let mut out = String::new();

    for node in doc.root_element().descendants() {
        if let Some(text) = node.value().as_text() {
            let hidden = node.ancestors().any(|a| {
                a.value()
                    .as_element()
                    .map(|e| matches!(e.name(), "script" | "style" | "head" | "noscript"))
                    .unwrap_or(false)
            });
            if !hidden {
                out.push_str(text);
            }
        } else if let Some(el) = node.value().as_element() {
            if matches!(
                el.name(),
                "p" | "br"
                    | "div"
                    | "li"
                    | "tr"
                    | "table"
                    | "blockquote"
                    | "h1"
                    | "h2"
                    | "h3"
                    | "h4"
                    | "h5"
                    | "h6"
                    | "hr"
            ) {
                out.push('\n');
            }
        }
    }

    let out = SPACES_RE.replace_all(&out, " ");
    let lines: Vec<&str> = out.lines().map(str::trim).collect();
    BLANK_LINES_RE
        .replace_all(&lines.join("\n"), "\n\n")
        .trim()
        .to_string()
}

/// Cut a mail body at the first sign-off line.
///
/// Markers only count at the start of a line, so `--` inside a sentence or a
/// "thanks," mid-paragraph is left alone. If the cut would leave nothing, the
/// body is returned unchanged.
pub fn remove_signature(body: &str) -> String {
    static SIG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"(?im)^[ \t]*(--+[ \t]*$|best regards,|kind regards,|sent from my|sincerely,|cheers,|thanks,|thank you,)",
        )
        .expect("valid regex")
    });

    cut_at_first(body, &SIG_RE)
}

/// Cut a mail body at the first quoted reply (Outlook header block or
/// `On ... wrote:` line).
pub fn remove_quoted(body: &str) -> String {
    static OUTLOOK_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?im)^[ \t]*from:.*\n[ \t]*sent:.*\n[ \t]*to:.*\n(?:[ \t]*cc:.*\n)?[ \t]*subject:")
            .expect("valid regex")
    });
    static WROTE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^[ \t]*On .+ wrote:[ \t]*$").expect("valid regex"));

    let first = [OUTLOOK_RE.find(body), WROTE_RE.find(body)]
        .into_iter()
        .flatten()
        .map(|m| m.start())
        .min();

    match first {
        Some(idx) if !body[..idx].trim().is_empty() => body[..idx].trim_end().to_string(),
        _ => body.to_string(),
    }
}

fn cut_at_first(body: &str, re: &Regex) -> String {
    match re.find(body) {
        Some(m) if !body[..m.start()].trim().is_empty() => body[..m.start()].trim_end().to_string(),
        _ => body.to_string(),
    }
}

/// Split text into pieces of roughly `chunk_size` tokens with `overlap`
/// tokens shared between neighbours, estimating four characters per token.
pub fn split_by_tokens(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let char_size = (chunk_size * 4).max(1);
    let char_overlap = overlap * 4;
    let step = char_size.saturating_sub(char_overlap).max(1);

    let mut segments = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + char_size).min(chars.len());
        segments.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    segments
}

/// Keep at most `max` characters.
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_text_strips_markup_and_typography() {
        let input = "<!-- hidden --><p>Hello&nbsp;<b>world</b></p>\n\n\u{201c}quoted\u{201d} \u{2014} it\u{2019}s done\u{2026}\u{200b}";
        assert_eq!(clean_text(input), "Hello world \"quoted\" - it's done...");
    }

    #[test]
    fn clean_text_drops_replacement_and_control_chars() {
        assert_eq!(clean_text("a\u{fffd}b\u{0007}c"), "abc");
        assert_eq!(clean_text("   "), "");
        assert_eq!(clean_text("caf\u{e9}"), "caf\u{e9}");
    }

    #[test]
    fn unescape_numeric_and_named() {
        assert_eq!(unescape_entities("&lt;a&gt; &#65;&#x42; &amp;amp;"), "<a> AB &amp;");
        assert_eq!(unescape_entities("&bogus; stays"), "&bogus; stays");
    }

    #[test]
    fn html_to_text_skips_scripts_and_keeps_blocks() {
        let html = "<html><head><title>t</title><style>p{}</style></head><body>\
                    <p>First   para</p><script>var x=1;</script><div>Second</div></body></html>";
        assert_eq!(html_to_text(html), "First para\nSecond");
    }

    #[test]
    fn signature_is_removed_at_line_start_only() {
        let body = "Numbers for 2020--2021 attached.\nI said thanks, see below.\n\nBest regards,\nAlice";
        assert_eq!(
            remove_signature(body),
            "Numbers for 2020--2021 attached.\nI said thanks, see below."
        );
        assert_eq!(remove_signature("-- \nonly a sig"), "-- \nonly a sig");
    }

    #[test]
    fn quoted_outlook_reply_is_removed() {
        let body = "Sounds good.\n\nFrom: Bob\nSent: Monday\nTo: Alice\nSubject: Re: plan\n\nold text";
        assert_eq!(remove_quoted(body), "Sounds good.");
        let gmail = "Yes.\nOn Mon, 2 Jun 2025 at 10:00, Bob <b@x.com> wrote:\n> old";
        assert_eq!(remove_quoted(gmail), "Yes.");
    }

    #[test]
    fn split_by_tokens_uses_char_fallback() {
        let text = "a".repeat(100);
        let parts = split_by_tokens(&text, 10, 2);
        // 40-char windows advancing by 32; the third reaches the end
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 40);
        assert_eq!(parts[2].len(), 36);
        assert!(split_by_tokens("", 10, 2).is_empty());
        assert_eq!(split_by_tokens("abc", 1, 5), vec!["abc"]);
    }

    #[test]
    fn split_by_tokens_adds_no_tail_inside_last_window() {
        // 80 chars, 40-char windows stepping 20: the window at 40 ends the text
        let text: String = ('a'..='z').cycle().take(80).collect();
        let parts = split_by_tokens(&text, 10, 5);
        assert_eq!(parts.len(), 3);
        assert!(text.ends_with(parts.last().unwrap().as_str()));
        assert_eq!(parts.last().unwrap().len(), 40);
    }
}
