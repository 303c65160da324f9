//! Raw message normalisation: plain-text body, sender root domain, source
//! class, and board listing-id extraction for the structured match path.

use anyhow::{Context, Result};
use regex::Regex;
use url::Url;

use quarry_store::{NewMessage, SenderClass};

/// Second-level public suffixes under which the registrable domain is three
/// labels long (jane@mail.woolworths.com.au → woolworths.com.au).
const MULTI_PART_TLDS: &[&str] = &[
    "com.au", "net.au", "org.au", "gov.au", "edu.au",
    "co.uk", "org.uk", "ac.uk",
    "co.nz", "org.nz",
    "com.br", "com.mx", "co.jp", "co.in", "com.sg",
];

/// Freemail providers tell us nothing about the hiring entity.
const FREEMAIL_DOMAINS: &[&str] = &[
    "gmail.com", "outlook.com", "hotmail.com", "yahoo.com", "icloud.com", "proton.me",
];

#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub external_id: String,
    pub received_at: chrono::DateTime<chrono::Utc>,
    pub sender: String,
    pub sender_domain: String,
    pub subject: String,
    pub body: String,
    pub source_class: SenderClass,
    /// External listing id lifted from a board URL in the body, when present.
    pub board_listing_id: Option<String>,
}

pub struct MessageParser {
    board_domains: Vec<String>,
    agency_keywords: Vec<String>,
    id_pattern: Regex,
    url_pattern: Regex,
}

impl MessageParser {
    pub fn new(board_domains: &[String], agency_keywords: &[String], id_pattern: &str) -> Result<Self> {
        Ok(Self {
            board_domains: board_domains.iter().map(|d| d.to_lowercase()).collect(),
            agency_keywords: agency_keywords.iter().map(|k| k.to_lowercase()).collect(),
            id_pattern: Regex::new(id_pattern).context("compiling board id pattern")?,
            url_pattern: Regex::new(r#"https?://[^\s<>"')\]]+"#).context("compiling url pattern")?,
        })
    }

    pub fn parse(&self, raw: &NewMessage) -> ParsedMessage {
        let body = if raw.body_plain.trim().is_empty() {
            html_to_text(&raw.body_html)
        } else {
            raw.body_plain.clone()
        };

        let sender_domain = root_domain(&raw.sender);
        let source_class = self.classify_sender(&raw.sender, &sender_domain);
        let board_listing_id = self.extract_board_listing_id(&body);

        ParsedMessage {
            external_id: raw.external_id.clone(),
            received_at: raw.received_at,
            sender: raw.sender.clone(),
            sender_domain,
            subject: raw.subject.clone(),
            body,
            source_class,
            board_listing_id,
        }
    }

    pub fn is_board_domain(&self, domain: &str) -> bool {
        let domain = domain.to_lowercase();
        self.board_domains
            .iter()
            .any(|board| domain == *board || domain.ends_with(&format!(".{board}")))
    }

    fn classify_sender(&self, sender: &str, root: &str) -> SenderClass {
        if self.is_board_domain(root) {
            return SenderClass::Structured;
        }
        let lowered = sender.to_lowercase();
        if self.agency_keywords.iter().any(|k| lowered.contains(k)) {
            return SenderClass::Agency;
        }
        if FREEMAIL_DOMAINS.contains(&root) {
            return SenderClass::Unknown;
        }
        SenderClass::Direct
    }

    /// Scan the body for board URLs and lift the listing id out of the first
    /// path that matches the configured pattern.
    pub fn extract_board_listing_id(&self, body: &str) -> Option<String> {
        for candidate in self.url_pattern.find_iter(body) {
            let Ok(url) = Url::parse(candidate.as_str()) else {
                continue;
            };
            let Some(host) = url.host_str() else {
                continue;
            };
            if !self.is_board_domain(&root_domain(host)) {
                continue;
            }
            if let Some(caps) = self.id_pattern.captures(url.path()) {
                if let Some(id) = caps.name("id") {
                    return Some(id.as_str().to_string());
                }
            }
        }
        None
    }
}

/// Registrable root domain of an email address or hostname:
/// `jane@mail.woolworths.com.au` → `woolworths.com.au`.
pub fn root_domain(address_or_host: &str) -> String {
    let host = address_or_host
        .rsplit('@')
        .next()
        .unwrap_or(address_or_host)
        .trim_end_matches('>')
        .to_lowercase();
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() <= 2 {
        return labels.join(".");
    }
    let last_two = labels[labels.len() - 2..].join(".");
    if MULTI_PART_TLDS.contains(&last_two.as_str()) {
        labels[labels.len() - 3..].join(".")
    } else {
        last_two
    }
}

/// Leftmost label of a root domain: `woolworths.com.au` → `woolworths`.
pub fn root_label(domain: &str) -> &str {
    domain.split('.').next().unwrap_or(domain)
}

/// Reduce an HTML body to readable text: tag structure is discarded and
/// text nodes are joined with single spaces.
pub fn html_to_text(html: &str) -> String {
    let document = scraper::Html::parse_document(html);
    let mut out = String::new();
    let root = document.root_element();
    for text in root.text() {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(trimmed);
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn parser() -> MessageParser {
        MessageParser::new(
            &["seek.com.au".to_string(), "linkedin.com".to_string()],
            &["recruit".to_string(), "talent".to_string()],
            r"/job/(?P<id>\d{6,})",
        )
        .expect("parser compiles")
    }

    fn raw(sender: &str, body_plain: &str, body_html: &str) -> NewMessage {
        NewMessage {
            external_id: "msg-1".to_string(),
            received_at: Utc::now(),
            sender: sender.to_string(),
            subject: "Re: your application".to_string(),
            body_plain: body_plain.to_string(),
            body_html: body_html.to_string(),
        }
    }

    #[test]
    fn root_domain_handles_multi_part_tlds() {
        assert_eq!(root_domain("jane@woolworths.com.au"), "woolworths.com.au");
        assert_eq!(root_domain("no-reply@mail.seek.com.au"), "seek.com.au");
        assert_eq!(root_domain("bob@example.com"), "example.com");
        assert_eq!(root_domain("bob@mail.example.com"), "example.com");
        assert_eq!(root_label("woolworths.com.au"), "woolworths");
    }

    #[test]
    fn board_sender_is_structured() {
        let parsed = parser().parse(&raw("noreply@seek.com.au", "hello", ""));
        assert_eq!(parsed.source_class, SenderClass::Structured);
    }

    #[test]
    fn agency_keyword_marks_agency() {
        let parsed = parser().parse(&raw("jobs@apextalent.com", "hello", ""));
        assert_eq!(parsed.source_class, SenderClass::Agency);
    }

    #[test]
    fn company_domain_is_direct_and_freemail_is_unknown() {
        let parsed = parser().parse(&raw("jane@woolworths.com.au", "hello", ""));
        assert_eq!(parsed.source_class, SenderClass::Direct);

        let parsed = parser().parse(&raw("someone@gmail.com", "hello", ""));
        assert_eq!(parsed.source_class, SenderClass::Unknown);
    }

    #[test]
    fn html_body_is_used_when_plain_is_empty() {
        let parsed = parser().parse(&raw(
            "jane@woolworths.com.au",
            "  ",
            "<html><body><p>We received your <b>application</b>.</p></body></html>",
        ));
        assert!(parsed.body.contains("received your application"));
    }

    #[test]
    fn board_listing_id_is_lifted_from_board_urls_only() {
        let parser = parser();
        let id = parser.extract_board_listing_id(
            "View the role at https://www.seek.com.au/job/12345678?ref=email today",
        );
        assert_eq!(id.as_deref(), Some("12345678"));

        // Same path shape on a non-board host is ignored.
        let id = parser.extract_board_listing_id("see https://evil.example.com/job/12345678");
        assert!(id.is_none());
    }
}
