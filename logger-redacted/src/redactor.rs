use base64::{engine::general_purpose, Engine as _};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use sha2::{Digest, Sha256};

// Literal patterns, exercised by the tests below
#[allow(clippy::expect_used)]
mod patterns {
    use lazy_static::lazy_static;
    use regex::Regex;

    lazy_static! {
        pub static ref EMAIL_REGEX: Regex =
            Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("email pattern");
        pub static ref PHONE_REGEX: Regex =
            Regex::new(r"(?:\+1[-.\s]?)?\(?\b[0-9]{3}\)?[-.\s]?[0-9]{3}[-.\s]?[0-9]{4}\b")
                .expect("phone pattern");
        pub static ref SSN_REGEX: Regex = Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn pattern");
        pub static ref CREDIT_CARD_REGEX: Regex =
            Regex::new(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b").expect("card pattern");
        pub static ref IP_REGEX: Regex =
            Regex::new(r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b").expect("ip pattern");
    }
}

use patterns::{CREDIT_CARD_REGEX, EMAIL_REGEX, IP_REGEX, PHONE_REGEX, SSN_REGEX};

lazy_static! {
    static ref DEFAULT_REDACTOR: PiiRedactor = PiiRedactor::new(RedactionConfig::default());
}

/// Which categories of PII get masked, and how.
#[derive(Debug, Clone)]
pub struct RedactionConfig {
    pub redact_emails: bool,
    pub redact_phones: bool,
    pub redact_ssn: bool,
    pub redact_credit_cards: bool,
    pub redact_ip_addresses: bool,
    /// Replace matches with a short hash so repeated values can still be correlated.
    pub hash_for_correlation: bool,
    /// Output is cut to this many characters (a trailing `…` marks the cut).
    pub max_len: Option<usize>,
    pub custom_patterns: Vec<(Regex, String)>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            redact_emails: true,
            redact_phones: true,
            redact_ssn: true,
            redact_credit_cards: true,
            redact_ip_addresses: true,
            hash_for_correlation: true,
            max_len: Some(512),
            custom_patterns: Vec::new(),
        }
    }
}

/// PII redactor for free-form text such as server error bodies.
pub struct PiiRedactor {
    config: RedactionConfig,
}

impl PiiRedactor {
    pub fn new(config: RedactionConfig) -> Self {
        Self { config }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut result = text.to_string();

        // Card numbers first: the phone pattern would otherwise eat their middle groups.
        if self.config.redact_credit_cards {
            result = self.replace(&CREDIT_CARD_REGEX, &result, "CC", |_| {
                "****-****-****-****".to_string()
            });
        }

        if self.config.redact_ssn {
            result = self.replace(&SSN_REGEX, &result, "SSN", |_| "***-**-****".to_string());
        }

        if self.config.redact_emails {
            result = self.replace(&EMAIL_REGEX, &result, "EMAIL", mask_email);
        }

        if self.config.redact_phones {
            result = self.replace(&PHONE_REGEX, &result, "PHONE", |_| "(***) ***-****".to_string());
        }

        if self.config.redact_ip_addresses {
            result = self.replace(&IP_REGEX, &result, "IP", mask_ip);
        }

        for (pattern, replacement) in &self.config.custom_patterns {
            result = pattern.replace_all(&result, replacement.as_str()).into_owned();
        }

        match self.config.max_len {
            Some(max) if result.chars().count() > max => {
                let mut cut: String = result.chars().take(max).collect();
                cut.push('…');
                cut
            }
            _ => result,
        }
    }

    fn replace(
        &self,
        pattern: &Regex,
        text: &str,
        label: &str,
        mask: impl Fn(&str) -> String,
    ) -> String {
        pattern
            .replace_all(text, |caps: &Captures| {
                let matched = caps.get(0).map_or("", |m| m.as_str());
                if self.config.hash_for_correlation {
                    format!("{}[{}]", label, hash_value(matched))
                } else {
                    mask(matched)
                }
            })
            .into_owned()
    }
}

/// Redacts `text` with the default configuration.
pub fn redact(text: &str) -> String {
    DEFAULT_REDACTOR.redact(text)
}

fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let l = local.chars().next().unwrap_or('*');
            let d = domain.chars().next().unwrap_or('*');
            format!("{l}***@{d}***")
        }
        None => "***@***".to_string(),
    }
}

fn mask_ip(ip: &str) -> String {
    let parts: Vec<&str> = ip.split('.').collect();
    match (parts.first(), parts.last()) {
        (Some(first), Some(last)) if parts.len() == 4 => format!("{first}.***.***.{last}"),
        _ => "***.***.***.***".to_string(),
    }
}

fn hash_value(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    // First 8 bytes keep the tag short while staying collision-resistant enough for correlation
    general_purpose::STANDARD_NO_PAD.encode(digest.get(..8).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masking() -> PiiRedactor {
        PiiRedactor::new(RedactionConfig {
            hash_for_correlation: false,
            ..Default::default()
        })
    }

    #[test]
    fn test_email_redaction() {
        let redacted = masking().redact("Caregiver jane.doe@example.com not in circle");
        assert!(redacted.contains("j***@e***"));
        assert!(!redacted.contains("jane.doe"));
    }

    #[test]
    fn test_phone_redaction() {
        let redacted = masking().redact("Emergency contact (555) 123-4567 is invalid");
        assert!(redacted.contains("(***) ***-****"));
    }

    #[test]
    fn test_ssn_and_card_redaction() {
        let redacted = masking().redact("ssn 123-45-6789 card 4111 1111 1111 1111");
        assert!(redacted.contains("***-**-****"));
        assert!(redacted.contains("****-****-****-****"));
        assert!(!redacted.contains("4111"));
    }

    #[test]
    fn test_hashing_is_stable() {
        let redactor = PiiRedactor::new(RedactionConfig::default());
        let a = redactor.redact("from 10.0.0.12");
        let b = redactor.redact("from 10.0.0.12");
        assert_eq!(a, b);
        assert!(a.starts_with("from IP["));
    }

    #[test]
    fn test_truncation() {
        let redactor = PiiRedactor::new(RedactionConfig {
            max_len: Some(5),
            ..Default::default()
        });
        assert_eq!(redactor.redact("dose missing"), "dose …");
        assert_eq!(redactor.redact("ok"), "ok");
    }

    #[test]
    fn test_plain_text_untouched() {
        assert_eq!(redact("dose_mg must be positive"), "dose_mg must be positive");
    }
}
