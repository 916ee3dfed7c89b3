//! 从 `If` 与 `Lock-Token` 请求头中提取锁令牌。

use axum::http::HeaderMap;

const IF_HEADER: &str = "if";
const LOCK_TOKEN_HEADER: &str = "lock-token";
const SCHEME_TAG: &str = "locktoken:";

/// 收集请求提交的全部锁令牌（`If` 列表中的状态令牌与 `Lock-Token` 头）。
pub fn submitted_tokens(headers: &HeaderMap) -> Vec<String> {
    let mut tokens: Vec<String> = headers
        .get_all(IF_HEADER)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(parse_if_header)
        .collect();
    if let Some(token) = headers
        .get(LOCK_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_lock_token)
    {
        tokens.push(token);
    }
    tokens.dedup();
    tokens
}

/// Extracts the non-negated state tokens of an `If` header. Resource tags
/// (bracketed URLs outside a list) and entity tags are skipped.
pub fn parse_if_header(value: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut rest = value;
    let mut in_list = false;
    let mut negated = false;

    while let Some(ch) = rest.chars().next() {
        match ch {
            '(' => {
                in_list = true;
                negated = false;
            }
            ')' => in_list = false,
            '<' | '[' => {
                let close = if ch == '<' { '>' } else { ']' };
                let Some(end) = rest.find(close) else {
                    break;
                };
                if ch == '<'
                    && in_list
                    && !negated
                    && let Some(token) = rest.get(1..end).and_then(bare_token)
                {
                    tokens.push(token);
                }
                negated = false;
                rest = rest.get(end + 1..).unwrap_or_default();
                continue;
            }
            'N' | 'n' if in_list => {
                if rest.get(..3).is_some_and(|word| word.eq_ignore_ascii_case("not")) {
                    negated = true;
                    rest = rest.get(3..).unwrap_or_default();
                    continue;
                }
            }
            _ => {}
        }
        rest = rest.get(ch.len_utf8()..).unwrap_or_default();
    }

    tokens
}

/// 解析 `Lock-Token: <token>` 形式的请求头。
pub fn parse_lock_token(value: &str) -> Option<String> {
    let inner = value.trim().strip_prefix('<')?.strip_suffix('>')?;
    bare_token(inner)
}

fn bare_token(raw: &str) -> Option<String> {
    let token = raw.trim();
    let token = token.strip_prefix(SCHEME_TAG).unwrap_or(token).trim();
    (!token.is_empty()).then(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const TOKEN: &str = "urn:uuid:181d4fae-7d8c-11d0-a765-00a0c91e6bf2";

    #[test]
    fn untagged_list_yields_token() {
        let header = format!("(<{TOKEN}>)");
        assert_eq!(parse_if_header(&header), vec![TOKEN.to_string()]);
    }

    #[test]
    fn tagged_list_skips_resource_and_etag() {
        let header = format!(
            "<http://example.com/cal/event1.ics> (<{TOKEN}> [\"etag-1\"]) (Not <urn:uuid:other>)"
        );
        assert_eq!(parse_if_header(&header), vec![TOKEN.to_string()]);
    }

    #[test]
    fn two_tokens_and_scheme_prefix() {
        let header = format!("(<locktoken:{TOKEN}>) (<urn:uuid:second>)");
        assert_eq!(
            parse_if_header(&header),
            vec![TOKEN.to_string(), "urn:uuid:second".to_string()]
        );
    }

    #[test]
    fn malformed_header_yields_nothing() {
        assert!(parse_if_header("(<unterminated").is_empty());
        assert!(parse_if_header("garbage").is_empty());
        assert_eq!(parse_lock_token("no-brackets"), None);
        assert_eq!(parse_lock_token("<>"), None);
    }

    #[test]
    fn collects_if_and_lock_token_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            IF_HEADER,
            HeaderValue::from_str(&format!("(<{TOKEN}>)")).expect("header"),
        );
        headers.insert(
            LOCK_TOKEN_HEADER,
            HeaderValue::from_static("<urn:uuid:unlock-me>"),
        );
        assert_eq!(
            submitted_tokens(&headers),
            vec![TOKEN.to_string(), "urn:uuid:unlock-me".to_string()]
        );
    }
}
