/// Rewrite a raw user query into a string FTS5 `MATCH` will accept.
///
/// Tokens are split on whitespace. A token made only of alphanumerics is
/// passed through as-is; a token carrying anything else (`c++`, `3.12`,
/// `foo-bar`) is wrapped in double quotes so the FTS5 query parser treats it
/// as a phrase instead of syntax. Tokens with no alphanumeric content at all
/// are dropped. Returns `None` when nothing queryable remains — callers
/// answer with an empty result set rather than an error.
pub fn sanitize_match_query(raw: &str) -> Option<String> {
    let mut parts = Vec::new();

    for token in raw.split_whitespace() {
        if !token.chars().any(|c| c.is_alphanumeric()) {
            continue;
        }
        if token.chars().all(|c| c.is_alphanumeric()) {
            parts.push(token.to_string());
        } else {
            // Embedded quotes are doubled per SQL string rules.
            let escaped = token.replace('"', "\"\"");
            parts.push(format!("\"{escaped}\""));
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}
