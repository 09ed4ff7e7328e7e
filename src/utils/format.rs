/// Number of trailing token characters left visible by `mask_token`
const VISIBLE_TOKEN_CHARS: usize = 4;

/// Mask a bearer token for display, keeping only the last few characters
pub fn mask_token(token: &str) -> String {
    let count = token.chars().count();
    if count <= VISIBLE_TOKEN_CHARS {
        return "*".repeat(count);
    }
    let tail: String = token.chars().skip(count - VISIBLE_TOKEN_CHARS).collect();
    format!("{}{}", "*".repeat(count - VISIBLE_TOKEN_CHARS), tail)
}

/// Format an optional string, returning a default if None
pub fn format_optional(value: Option<&str>, default: &str) -> String {
    value.unwrap_or(default).to_string()
}
