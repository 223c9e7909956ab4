//! External `.http` parser collaborator (spec §1: "deliberately out of
//! scope"). `HttpSyntaxParser` is a minimal concrete implementation good
//! enough to drive the pipeline end to end; it is not where this crate's
//! engineering investment goes.

use std::collections::BTreeMap;

use crate::model::{ParsedRequest, Protocol};

#[async_trait::async_trait]
pub trait RequestParser: Send + Sync {
    async fn parse(&self, document: &str) -> anyhow::Result<Vec<ParsedRequest>>;
}

pub struct HttpSyntaxParser;

impl HttpSyntaxParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HttpSyntaxParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits a document on `###` separators, then parses each block as:
/// optional `# @name foo` comment, a `METHOD URL` line, header lines, a blank
/// line, then an optional body until the next separator.
#[async_trait::async_trait]
impl RequestParser for HttpSyntaxParser {
    async fn parse(&self, document: &str) -> anyhow::Result<Vec<ParsedRequest>> {
        let mut requests = Vec::new();
        for block in document.split("###") {
            if let Some(req) = parse_block(block)? {
                requests.push(req);
            }
        }
        Ok(requests)
    }
}

fn parse_block(block: &str) -> anyhow::Result<Option<ParsedRequest>> {
    let mut name = None;
    let mut lines = block.lines().peekable();

    while let Some(line) = lines.peek() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            lines.next();
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("# @name") {
            name = Some(rest.trim().to_string());
            lines.next();
            continue;
        }
        if trimmed.starts_with('#') || trimmed.starts_with("//") {
            lines.next();
            continue;
        }
        break;
    }

    let request_line = match lines.next() {
        Some(line) if !line.trim().is_empty() => line.trim(),
        _ => return Ok(None),
    };

    let mut parts = request_line.splitn(2, char::is_whitespace);
    let method = parts.next().unwrap_or("GET").to_string();
    let url = parts.next().unwrap_or("").trim().to_string();
    if url.is_empty() {
        anyhow::bail!("request line missing URL: {request_line:?}");
    }

    let mut headers = Vec::new();
    for line in lines.by_ref() {
        if line.trim().is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    let body_lines: Vec<&str> = lines.collect();
    let body_text = body_lines.join("\n");
    let body = if body_text.trim().is_empty() { None } else { Some(body_text) };

    Ok(Some(ParsedRequest {
        name,
        method,
        url,
        headers,
        body,
        body_file: None,
        form_data: None,
        protocol: Protocol::Http,
        protocol_options: None,
        meta: BTreeMap::new(),
        raw: block.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_single_request() {
        let parser = HttpSyntaxParser::new();
        let reqs = parser.parse("GET https://example.com/get\nX-A: 1\n\n").await.unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].method, "GET");
        assert_eq!(reqs[0].url, "https://example.com/get");
        assert_eq!(reqs[0].headers, vec![("X-A".to_string(), "1".to_string())]);
    }

    #[tokio::test]
    async fn parses_named_request_with_body() {
        let parser = HttpSyntaxParser::new();
        let doc = "# @name login\nPOST https://example.com/login\nContent-Type: application/json\n\n{\"a\":1}";
        let reqs = parser.parse(doc).await.unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].name.as_deref(), Some("login"));
        assert_eq!(reqs[0].body.as_deref(), Some("{\"a\":1}"));
    }

    #[tokio::test]
    async fn empty_document_yields_no_requests() {
        let parser = HttpSyntaxParser::new();
        let reqs = parser.parse("\n\n").await.unwrap();
        assert!(reqs.is_empty());
    }

    #[tokio::test]
    async fn multiple_requests_separated_by_hashes() {
        let parser = HttpSyntaxParser::new();
        let doc = "GET https://a.example/one\n\n###\n\nGET https://a.example/two\n";
        let reqs = parser.parse(doc).await.unwrap();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[1].url, "https://a.example/two");
    }
}
