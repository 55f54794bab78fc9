//! Lightweight stylesheet and markup scanning for the reference detectors.
//!
//! Regex based on purpose: detectors only need rule blocks, declarations,
//! colours and start tags, and must tolerate malformed input.

use regex::Regex;

/// One `selector { declarations }` block
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CssRule {
    pub selector: String,
    pub declarations: Vec<(String, String)>,
    pub line: u32,
}

impl CssRule {
    /// Last value declared for a property (later declarations win)
    pub fn get(&self, property: &str) -> Option<&str> {
        self.declarations
            .iter()
            .rev()
            .find(|(p, _)| p == property)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_keyframe_step(&self) -> bool {
        let s = self.selector.trim();
        s == "from" || s == "to" || s.ends_with('%')
    }
}

/// Blank out `/* ... */` comments, keeping newlines so line numbers hold
pub(crate) fn strip_comments(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find("*/") {
            Some(end) => {
                let comment = &rest[start..start + 2 + end + 2];
                out.extend(comment.chars().filter(|c| *c == '\n'));
                rest = &rest[start + 2 + end + 2..];
            }
            None => {
                out.extend(rest[start..].chars().filter(|c| *c == '\n'));
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// 1-based line of a byte offset
pub(crate) fn line_of(content: &str, offset: usize) -> u32 {
    content[..offset.min(content.len())].matches('\n').count() as u32 + 1
}

/// Innermost rule blocks of a stylesheet; at-rule wrappers are skipped
pub(crate) fn parse_rules(content: &str) -> anyhow::Result<Vec<CssRule>> {
    let cleaned = strip_comments(content);
    let rule_re = Regex::new(r"([^{}]+)\{([^{}]*)\}")?;

    let mut rules = Vec::new();
    for caps in rule_re.captures_iter(&cleaned) {
        let (Some(sel), Some(body)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        let raw = sel.as_str();
        let leading = raw.len() - raw.trim_start().len();
        let selector = raw.trim();
        if selector.is_empty() || selector.starts_with('@') {
            continue;
        }
        rules.push(CssRule {
            selector: selector.to_string(),
            declarations: parse_declarations(body.as_str()),
            line: line_of(&cleaned, sel.start() + leading),
        });
    }
    Ok(rules)
}

fn parse_declarations(body: &str) -> Vec<(String, String)> {
    body.split(';')
        .filter_map(|decl| {
            let (prop, value) = decl.split_once(':')?;
            let prop = prop.trim().to_lowercase();
            let value = value.trim().trim_end_matches("!important").trim();
            if prop.is_empty() || value.is_empty() {
                None
            } else {
                Some((prop, value.to_string()))
            }
        })
        .collect()
}

// ============================================================================
// Colour
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub fn hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }

    /// WCAG relative luminance
    pub fn luminance(&self) -> f64 {
        fn channel(c: u8) -> f64 {
            let c = c as f64 / 255.0;
            if c <= 0.03928 {
                c / 12.92
            } else {
                ((c + 0.055) / 1.055).powf(2.4)
            }
        }
        0.2126 * channel(self.0) + 0.7152 * channel(self.1) + 0.0722 * channel(self.2)
    }
}

/// WCAG contrast ratio, always >= 1
pub(crate) fn contrast_ratio(a: Rgb, b: Rgb) -> f64 {
    let (la, lb) = (a.luminance(), b.luminance());
    let (hi, lo) = if la >= lb { (la, lb) } else { (lb, la) };
    (hi + 0.05) / (lo + 0.05)
}

/// First colour token in a declaration value (handles `background` shorthand)
pub(crate) fn find_color(value: &str) -> Option<Rgb> {
    let lower = value.to_lowercase();
    if let Some(start) = lower.find("rgb") {
        if let Some(rgb) = parse_rgb_fn(&lower[start..]) {
            return Some(rgb);
        }
    }
    lower
        .split(|c: char| c.is_whitespace() || c == ',')
        .find_map(parse_color_token)
}

fn parse_rgb_fn(s: &str) -> Option<Rgb> {
    let open = s.find('(')?;
    let close = s.find(')')?;
    let parts: Vec<u8> = s[open + 1..close]
        .split(|c: char| c == ',' || c == '/' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .take(3)
        .map(|p| p.parse::<f64>().map(|v| v.clamp(0.0, 255.0).round() as u8))
        .collect::<Result<_, _>>()
        .ok()?;
    match parts[..] {
        [r, g, b] => Some(Rgb(r, g, b)),
        _ => None,
    }
}

fn parse_color_token(token: &str) -> Option<Rgb> {
    if let Some(hex) = token.strip_prefix('#') {
        let digits: Vec<u8> = hex
            .chars()
            .map(|c| c.to_digit(16).map(|d| d as u8))
            .collect::<Option<_>>()?;
        return match digits.len() {
            3 | 4 => Some(Rgb(digits[0] * 17, digits[1] * 17, digits[2] * 17)),
            6 | 8 => Some(Rgb(
                digits[0] * 16 + digits[1],
                digits[2] * 16 + digits[3],
                digits[4] * 16 + digits[5],
            )),
            _ => None,
        };
    }
    let rgb = match token {
        "black" => Rgb(0, 0, 0),
        "white" => Rgb(255, 255, 255),
        "red" => Rgb(255, 0, 0),
        "green" => Rgb(0, 128, 0),
        "blue" => Rgb(0, 0, 255),
        "gray" | "grey" => Rgb(128, 128, 128),
        "silver" => Rgb(192, 192, 192),
        "lightgray" | "lightgrey" => Rgb(211, 211, 211),
        "yellow" => Rgb(255, 255, 0),
        "orange" => Rgb(255, 165, 0),
        "purple" => Rgb(128, 0, 128),
        "navy" => Rgb(0, 0, 128),
        "maroon" => Rgb(128, 0, 0),
        "teal" => Rgb(0, 128, 128),
        "lime" => Rgb(0, 255, 0),
        "aqua" | "cyan" => Rgb(0, 255, 255),
        "fuchsia" | "magenta" => Rgb(255, 0, 255),
        "olive" => Rgb(128, 128, 0),
        _ => return None,
    };
    Some(rgb)
}

/// Seconds from a CSS time token (`250ms`, `.3s`)
pub(crate) fn parse_time(token: &str) -> Option<f64> {
    let token = token.trim().to_lowercase();
    if let Some(ms) = token.strip_suffix("ms") {
        ms.parse::<f64>().ok().map(|v| v / 1000.0)
    } else if let Some(s) = token.strip_suffix('s') {
        s.parse::<f64>().ok()
    } else {
        None
    }
}

// ============================================================================
// Markup
// ============================================================================

/// A start tag with its attributes (names lowercased)
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StartTag {
    pub name: String,
    pub attrs: Vec<(String, Option<String>)>,
    pub line: u32,
}

impl StartTag {
    pub fn attr(&self, name: &str) -> Option<Option<&str>> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_deref())
    }

    /// Short selector like `img#logo`, `div.card` or `img[src="a.png"]`
    pub fn selector(&self) -> String {
        if let Some(Some(id)) = self.attr("id") {
            return format!("{}#{}", self.name, id);
        }
        if let Some(Some(class)) = self.attr("class") {
            if let Some(first) = class.split_whitespace().next() {
                return format!("{}.{}", self.name, first);
            }
        }
        if let Some(Some(src)) = self.attr("src") {
            return format!("{}[src=\"{}\"]", self.name, src);
        }
        self.name.clone()
    }
}

/// All start tags in a markup document, comments skipped
pub(crate) fn start_tags(content: &str) -> anyhow::Result<Vec<StartTag>> {
    let tag_re = Regex::new(r"(?s)<!--.*?-->|<([a-zA-Z][a-zA-Z0-9-]*)((?:[^>\x22']|\x22[^\x22]*\x22|'[^']*')*)/?>")?;
    let attr_re = Regex::new(r#"([a-zA-Z_:][-a-zA-Z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>/=`]+)))?"#)?;

    let mut tags = Vec::new();
    for caps in tag_re.captures_iter(content) {
        let Some(name) = caps.get(1) else {
            continue;
        };
        let attrs = caps
            .get(2)
            .map(|raw| {
                attr_re
                    .captures_iter(raw.as_str())
                    .filter_map(|a| {
                        let key = a.get(1)?.as_str().to_lowercase();
                        let value = a
                            .get(2)
                            .or_else(|| a.get(3))
                            .or_else(|| a.get(4))
                            .map(|m| m.as_str().to_string());
                        Some((key, value))
                    })
                    .collect()
            })
            .unwrap_or_default();
        tags.push(StartTag {
            name: name.as_str().to_lowercase(),
            attrs,
            line: line_of(content, name.start()),
        });
    }
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rules_with_comments_and_media() {
        let css = "/* header\n */\n.a { color: #fff; }\n@media (max-width: 10px) {\n  .b:hover { background: #000 url(x.png); }\n}\n";
        let rules = parse_rules(css).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].selector, ".a");
        assert_eq!(rules[0].line, 3);
        assert_eq!(rules[0].get("color"), Some("#fff"));
        assert_eq!(rules[1].selector, ".b:hover");
        assert_eq!(rules[1].line, 5);
    }

    #[test]
    fn test_colors() {
        assert_eq!(find_color("#fff"), Some(Rgb(255, 255, 255)));
        assert_eq!(find_color("#777777"), Some(Rgb(0x77, 0x77, 0x77)));
        assert_eq!(find_color("rgb(10, 20, 30)"), Some(Rgb(10, 20, 30)));
        assert_eq!(find_color("url(a.png) no-repeat White"), Some(Rgb(255, 255, 255)));
        assert_eq!(find_color("transparent"), None);
    }

    #[test]
    fn test_contrast_ratio_bounds() {
        let black_white = contrast_ratio(Rgb(0, 0, 0), Rgb(255, 255, 255));
        assert!((black_white - 21.0).abs() < 0.01);
        assert!((contrast_ratio(Rgb(9, 9, 9), Rgb(9, 9, 9)) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("250ms"), Some(0.25));
        assert_eq!(parse_time(".5s"), Some(0.5));
        assert_eq!(parse_time("infinite"), None);
    }

    #[test]
    fn test_start_tags() {
        let html = "<html>\n<!-- <img> -->\n<img src=\"logo.png\" class=\"brand big\">\n<div role='buton' hidden></div>";
        let tags = start_tags(html).unwrap();
        let names: Vec<&str> = tags.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["html", "img", "div"]);
        assert_eq!(tags[1].line, 3);
        assert_eq!(tags[1].selector(), "img.brand");
        assert_eq!(tags[2].attr("role"), Some(Some("buton")));
        assert_eq!(tags[2].attr("hidden"), Some(None));
        assert_eq!(tags[2].attr("alt"), None);
    }
}
