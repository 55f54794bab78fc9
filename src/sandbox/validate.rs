//! Post-application well-formedness checks
//!
//! Deliberately structural: balanced braces and closed comments for
//! stylesheets, balanced tags and quotes for markup. Anything a browser
//! would still parse but these checks reject is reported as a validation
//! failure rather than guessed at.

use super::PatchType;

/// Elements that never take a closing tag
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// Elements whose end tag may be omitted
const OPTIONAL_CLOSE: &[&str] = &[
    "body", "colgroup", "dd", "dt", "head", "html", "li", "optgroup", "option", "p", "rp", "rt",
    "tbody", "td", "tfoot", "th", "thead", "tr",
];

/// Elements whose content is raw text up to the matching end tag
const RAW_TEXT: &[&str] = &["script", "style", "textarea", "title"];

/// Check patched content for the given patch type
pub fn validate(patch_type: PatchType, content: &str) -> Result<(), String> {
    match patch_type {
        PatchType::CssUpdate => validate_stylesheet(content),
        PatchType::HtmlUpdate | PatchType::AttributeAdd | PatchType::AttributeRemove => validate_markup(content),
        PatchType::ContentUpdate => {
            if content.trim().is_empty() {
                Err("content update left the file empty".to_string())
            } else {
                Ok(())
            }
        }
    }
}

/// Balanced `{}` outside comments and strings; every comment and string closed
pub fn validate_stylesheet(content: &str) -> Result<(), String> {
    let bytes = content.as_bytes();
    let mut depth: i64 = 0;
    let mut line = 1;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\n' => line += 1,
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let start_line = line;
                i += 2;
                loop {
                    match bytes.get(i) {
                        None => return Err(format!("unterminated comment opened on line {start_line}")),
                        Some(b'*') if bytes.get(i + 1) == Some(&b'/') => {
                            i += 1;
                            break;
                        }
                        Some(b'\n') => line += 1,
                        Some(_) => {}
                    }
                    i += 1;
                }
            }
            quote @ (b'"' | b'\'') => {
                let start_line = line;
                i += 1;
                loop {
                    match bytes.get(i) {
                        None | Some(b'\n') => {
                            return Err(format!("unterminated string on line {start_line}"));
                        }
                        Some(b'\\') => i += 1,
                        Some(&c) if c == quote => break,
                        Some(_) => {}
                    }
                    i += 1;
                }
            }
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth < 0 {
                    return Err(format!("unexpected '}}' on line {line}"));
                }
            }
            _ => {}
        }
        i += 1;
    }

    if depth != 0 {
        return Err(format!("{depth} unclosed '{{' at end of stylesheet"));
    }
    Ok(())
}

/// Balanced start/end tags (void elements ignored, optional end tags
/// tolerated) and properly quoted attribute values
pub fn validate_markup(content: &str) -> Result<(), String> {
    let mut stack: Vec<String> = Vec::new();
    let mut rest = content;

    while let Some(lt) = rest.find('<') {
        rest = &rest[lt..];

        if let Some(after) = rest.strip_prefix("<!--") {
            let end = after.find("-->").ok_or("unterminated comment")?;
            rest = &after[end + 3..];
            continue;
        }
        if rest.starts_with("<!") || rest.starts_with("<?") {
            let end = rest.find('>').ok_or("unterminated declaration")?;
            rest = &rest[end + 1..];
            continue;
        }

        let closing = rest.starts_with("</");
        let body_start = if closing { 2 } else { 1 };
        let name: String = rest[body_start..]
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == ':')
            .collect();
        if name.is_empty() {
            // a bare '<' in text
            rest = &rest[1..];
            continue;
        }
        let name = name.to_ascii_lowercase();

        let tag_end = find_tag_end(&rest[body_start..]).ok_or_else(|| format!("unterminated <{name}> tag"))?;
        let tag = &rest[..body_start + tag_end + 1];
        rest = &rest[body_start + tag_end + 1..];

        if closing {
            close(&mut stack, &name)?;
            continue;
        }
        if VOID_ELEMENTS.contains(&name.as_str()) || tag.ends_with("/>") {
            continue;
        }
        if RAW_TEXT.contains(&name.as_str()) {
            let end_tag = format!("</{name}");
            let end = rest
                .to_ascii_lowercase()
                .find(&end_tag)
                .ok_or_else(|| format!("unclosed <{name}>"))?;
            rest = &rest[end..];
        }
        stack.push(name);
    }

    if let Some(open) = stack.iter().rev().find(|n| !OPTIONAL_CLOSE.contains(&n.as_str())) {
        return Err(format!("unclosed <{open}>"));
    }
    Ok(())
}

/// Offset of the `>` ending a tag, skipping quoted attribute values
fn find_tag_end(tag: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in tag.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '>') => return Some(i),
            (None, '<') => return None,
            _ => {}
        }
    }
    None
}

fn close(stack: &mut Vec<String>, name: &str) -> Result<(), String> {
    let Some(pos) = stack.iter().rposition(|open| open == name) else {
        return Err(format!("unexpected </{name}>"));
    };
    if let Some(blocking) = stack[pos + 1..].iter().find(|n| !OPTIONAL_CLOSE.contains(&n.as_str())) {
        return Err(format!("</{name}> closes while <{blocking}> is still open"));
    }
    stack.truncate(pos);
    Ok(())
}
