//! `dump.cfg` rules excluding uploads from dumping.
//!
//! One rule per line: `ignore x, y, w, h`, where each field is a number or `*`, optionally
//! followed by a `#` comment. Anything else is skipped.

use vram_model::Rect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RectMatch {
    pub x: Option<u32>,
    pub y: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl RectMatch {
    pub fn matches(&self, rect: &Rect) -> bool {
        let field = |pattern: Option<u32>, value: u32| pattern.is_none_or(|p| p == value);
        field(self.x, rect.x)
            && field(self.y, rect.y)
            && field(self.width, rect.width)
            && field(self.height, rect.height)
    }
}

pub fn parse_dump_config(text: &str) -> Vec<RectMatch> {
    text.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<RectMatch> {
    let body = line.split_once('#').map_or(line, |(body, _)| body).trim();
    let rest = body.strip_prefix("ignore")?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let mut fields = rest.split(',').map(parse_field);
    let rule = RectMatch {
        x: fields.next()??,
        y: fields.next()??,
        width: fields.next()??,
        height: fields.next()??,
    };
    if fields.next().is_some() {
        return None;
    }
    Some(rule)
}

/// `Some(None)` is the wildcard.
fn parse_field(field: &str) -> Option<Option<u32>> {
    let field = field.trim();
    if field == "*" {
        return Some(None);
    }
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok().map(Some)
}
