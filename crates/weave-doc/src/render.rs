//! HTML rendering helpers shared by cells and the report writer.

use pulldown_cmark::{html, Options, Parser};

/// Escape text for inclusion in HTML element content.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render CommonMark source to an HTML fragment.
pub fn markdown_to_html(source: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    let parser = Parser::new_ext(source, options);
    let mut out = String::with_capacity(source.len() * 2);
    html::push_html(&mut out, parser);
    out
}

/// Convert an ANSI-escaped kernel traceback into an HTML `<pre>` block.
///
/// Kernels color their tracebacks with SGR escape sequences; those are
/// stripped and the remaining text is HTML-escaped.
pub fn traceback_to_html(traceback: &[String]) -> String {
    let joined = traceback.join("\n");
    let stripped = strip_ansi_escapes::strip_str(&joined);
    format!("<pre class=\"traceback\">{}</pre>", escape_html(&stripped))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_html_escapes_metacharacters() {
        assert_eq!(
            escape_html("<b>\"x\" & y</b>"),
            "&lt;b&gt;&quot;x&quot; &amp; y&lt;/b&gt;"
        );
    }

    #[test]
    fn test_escape_html_passes_plain_text_through() {
        assert_eq!(escape_html("plain text"), "plain text");
    }

    #[test]
    fn test_markdown_to_html_renders_heading() {
        let html = markdown_to_html("# Title");
        assert!(html.contains("<h1>Title</h1>"));
    }

    #[test]
    fn test_markdown_to_html_renders_emphasis() {
        let html = markdown_to_html("some *emphasis* here");
        assert!(html.contains("<em>emphasis</em>"));
    }

    #[test]
    fn test_traceback_strips_ansi_and_escapes() {
        let traceback = vec![
            "\u{1b}[0;31mZeroDivisionError\u{1b}[0m".to_string(),
            "1 <lines> 0".to_string(),
        ];
        let html = traceback_to_html(&traceback);
        assert!(html.starts_with("<pre class=\"traceback\">"));
        assert!(html.contains("ZeroDivisionError"));
        assert!(html.contains("1 &lt;lines&gt; 0"));
        assert!(!html.contains('\u{1b}'));
    }
}
