/// Cooperative interruption check polled by the parsers once per line.
pub trait Interrupt: Sync {
    fn interrupted(&self) -> bool;
}

/// Never interrupts.
pub struct Uninterrupted;

impl Interrupt for Uninterrupted {
    fn interrupted(&self) -> bool {
        false
    }
}

/// One logical line of a text file.
#[derive(Clone, Debug)]
pub struct Line<'a> {
    /// 1-based.
    pub number: usize,
    pub path: &'a str,
    /// Trimmed, with any `//` comment removed.
    pub content: &'a str,
    pub first: Option<char>,
    pub raw: &'a str,
}

impl<'a> Line<'a> {
    pub fn is_blank(&self) -> bool {
        self.content.is_empty()
    }

    /// Whitespace separated tokens of the content with surrounding quotes removed.
    pub fn tokens(&self) -> impl Iterator<Item = &'a str> + 'a {
        tokenize(self.content)
    }

    pub fn line_ref(&self) -> crate::resource::LineRef {
        crate::resource::LineRef {
            path: self.path.to_string(),
            number: self.number,
        }
    }
}

/// Splits a text file into comment-stripped lines.
pub struct LineSource<'a> {
    path: &'a str,
    lines: std::iter::Enumerate<std::str::Lines<'a>>,
}

impl<'a> LineSource<'a> {
    pub fn new(path: &'a str, text: &'a str) -> Self {
        Self {
            path,
            lines: text.lines().enumerate(),
        }
    }
}

impl<'a> Iterator for LineSource<'a> {
    type Item = Line<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (index, raw) = self.lines.next()?;
        let content = strip_comment(raw).trim();
        Some(Line {
            number: index + 1,
            path: self.path,
            content,
            first: content.chars().next(),
            raw,
        })
    }
}

/// Decodes game text; these files are ASCII or Latin-1 in practice.
pub fn decode_text(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.strip_prefix('\u{feff}').unwrap_or(&text).to_string()
}

fn strip_comment(raw: &str) -> &str {
    let bytes = raw.as_bytes();
    let mut in_quotes = false;
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'"' => in_quotes = !in_quotes,
            b'/' if !in_quotes && bytes.get(index + 1) == Some(&b'/') => {
                return &raw[..index];
            }
            _ => {}
        }
        index += 1;
    }
    raw
}

pub(crate) fn tokenize(content: &str) -> impl Iterator<Item = &str> {
    let mut rest = content;
    std::iter::from_fn(move || {
        rest = rest.trim_start();
        if rest.is_empty() {
            return None;
        }
        if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted.find('"').unwrap_or(quoted.len());
            let token = &quoted[..end];
            rest = quoted.get(end + 1..).unwrap_or("");
            return Some(token);
        }
        let end = rest
            .find(|ch: char| ch.is_whitespace() || ch == '"')
            .unwrap_or(rest.len());
        let token = &rest[..end];
        rest = &rest[end..];
        Some(token)
    })
}

/// Parses a `"key" "value"` line.
pub(crate) fn key_value(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix('"')?;
    let (key, rest) = rest.split_once('"')?;
    let rest = rest.trim_start().strip_prefix('"')?;
    let value = rest.strip_suffix('"')?;
    Some((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_comments_and_trims() {
        let text = "  textures/a // trailing\n// only comment\n\n\t{\n";
        let lines: Vec<Line> = LineSource::new("scripts/a.shader", text).collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0].content, "textures/a");
        assert_eq!(lines[0].number, 1);
        assert!(lines[1].is_blank());
        assert!(lines[2].is_blank());
        assert_eq!(lines[3].first, Some('{'));
        assert_eq!(lines[3].raw, "\t{");
    }

    #[test]
    fn keeps_slashes_inside_quotes() {
        let text = "\"url\" \"http://example.com\" // gone";
        let line = LineSource::new("maps/a.map", text).next().unwrap();
        assert_eq!(line.content, "\"url\" \"http://example.com\"");
        assert_eq!(
            key_value(line.content),
            Some(("url", "http://example.com"))
        );
    }

    #[test]
    fn tokenizes_quoted_values() {
        let tokens: Vec<&str> = tokenize("animMap 10 \"a b.tga\" c.tga").collect();
        assert_eq!(tokens, vec!["animMap", "10", "a b.tga", "c.tga"]);
    }
}
