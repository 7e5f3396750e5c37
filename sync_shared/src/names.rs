//! Display-name sanitation.
//!
//! Names may carry bracketed formatting tokens such as `[scarlet]`,
//! `[#ff000080]` or the reset token `[]`. `[[` is an escaped literal
//! bracket. Sanitation removes tokens that would hide or break the name and
//! bounds the *visible* length, measured with formatting stripped.

/// Maximum visible name length in bytes.
pub const MAX_NAME_LENGTH: usize = 40;

/// Raw input beyond this many characters is ignored before sanitation.
const MAX_RAW_NAME_CHARS: usize = 512;

/// Alpha at or below which a colour token is considered invisible.
const MAX_HIDDEN_ALPHA: f32 = 0.8;

/// Named colours understood by clients, with their alpha.
const NAMED_COLORS: &[(&str, f32)] = &[
    ("clear", 0.0),
    ("black", 1.0),
    ("white", 1.0),
    ("lightgray", 1.0),
    ("gray", 1.0),
    ("darkgray", 1.0),
    ("blue", 1.0),
    ("navy", 1.0),
    ("royal", 1.0),
    ("slate", 1.0),
    ("sky", 1.0),
    ("cyan", 1.0),
    ("teal", 1.0),
    ("green", 1.0),
    ("acid", 1.0),
    ("lime", 1.0),
    ("forest", 1.0),
    ("olive", 1.0),
    ("yellow", 1.0),
    ("gold", 1.0),
    ("goldenrod", 1.0),
    ("orange", 1.0),
    ("brown", 1.0),
    ("tan", 1.0),
    ("brick", 1.0),
    ("red", 1.0),
    ("scarlet", 1.0),
    ("coral", 1.0),
    ("salmon", 1.0),
    ("pink", 1.0),
    ("magenta", 1.0),
    ("purple", 1.0),
    ("violet", 1.0),
    ("maroon", 1.0),
    ("accent", 1.0),
];

/// Returns the alpha of a colour token body, or `None` if it is not a colour.
fn color_alpha(body: &str) -> Option<f32> {
    if let Some((_, alpha)) = NAMED_COLORS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(body))
    {
        return Some(*alpha);
    }

    let hex = body.strip_prefix('#').unwrap_or(body);
    if !(hex.len() == 6 || hex.len() == 8) || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    if hex.len() == 6 {
        return Some(1.0);
    }
    u8::from_str_radix(&hex[6..8], 16)
        .ok()
        .map(|a| a as f32 / 255.0)
}

/// Removes formatting tokens, returning only visible text.
pub fn strip_formatting(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(i) = rest.find('[') {
        out.push_str(&rest[..i]);
        let tail = &rest[i..];
        if tail.starts_with("[[") {
            out.push('[');
            rest = &tail[2..];
            continue;
        }
        match tail[1..].find(']') {
            Some(end) => {
                let body = &tail[1..1 + end];
                if body.is_empty() || color_alpha(body).is_some() {
                    rest = &tail[end + 2..];
                } else {
                    out.push('[');
                    rest = &tail[1..];
                }
            }
            None => {
                out.push_str(tail);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Removes unterminated, nested and invisible-colour tokens.
fn strip_hostile_tokens(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(i) = rest.find('[') {
        out.push_str(&rest[..i]);
        let tail = &rest[i..];
        if tail.starts_with("[[") {
            out.push_str("[[");
            rest = &tail[2..];
            continue;
        }

        let close = tail.find(']');
        let nested = tail[1..].find('[').map(|n| n + 1);
        match (close, nested) {
            // Unterminated token: nothing after it can render sanely.
            (None, _) => {
                rest = "";
            }
            (Some(c), Some(n)) if n < c => {
                rest = &tail[1..];
            }
            (Some(c), _) => {
                let body = &tail[1..c];
                let hidden = color_alpha(body).is_some_and(|a| a <= MAX_HIDDEN_ALPHA);
                if !hidden {
                    out.push_str(&tail[..=c]);
                }
                rest = &tail[c + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Sanitizes a client-supplied display name.
pub fn sanitize_name(raw: &str) -> String {
    let bounded: String = raw.chars().take(MAX_RAW_NAME_CHARS).collect();
    let name = bounded.trim();
    if name == "[" || name == "]" {
        return String::new();
    }

    let cleaned = strip_hostile_tokens(name);
    let mut result = String::with_capacity(cleaned.len().min(MAX_NAME_LENGTH * 2));
    for c in cleaned.chars() {
        result.push(c);
        if strip_formatting(&result).len() > MAX_NAME_LENGTH {
            result.pop();
            break;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lone_brackets_become_empty() {
        assert_eq!(sanitize_name("["), "");
        assert_eq!(sanitize_name(" ] "), "");
    }

    #[test]
    fn unterminated_token_is_dropped() {
        assert_eq!(sanitize_name("[scarlet"), "");
        assert_eq!(sanitize_name("bob[red"), "bob");
    }

    #[test]
    fn nested_opener_is_dropped() {
        assert_eq!(sanitize_name("[[red]x"), "[[red]x");
        assert_eq!(sanitize_name("[a[red]bob"), "a[red]bob");
    }

    #[test]
    fn invisible_colors_are_stripped() {
        assert_eq!(sanitize_name("[clear]ghost"), "ghost");
        assert_eq!(sanitize_name("[#ff000010]ghost"), "ghost");
        assert_eq!(sanitize_name("[#ff0000ff]red"), "[#ff0000ff]red");
        assert_eq!(sanitize_name("[scarlet]bob"), "[scarlet]bob");
    }

    #[test]
    fn long_names_truncate_to_visible_limit() {
        let long = "a".repeat(100);
        assert_eq!(sanitize_name(&long).len(), MAX_NAME_LENGTH);

        let colored = format!("[scarlet]{}", "b".repeat(100));
        let out = sanitize_name(&colored);
        assert!(out.starts_with("[scarlet]"));
        assert_eq!(strip_formatting(&out).len(), MAX_NAME_LENGTH);
    }

    #[test]
    fn strip_formatting_keeps_unknown_tokens() {
        assert_eq!(strip_formatting("[red]a[]b"), "ab");
        assert_eq!(strip_formatting("[[x"), "[x");
        assert_eq!(strip_formatting("[notacolor]z"), "[notacolor]z");
    }
}
