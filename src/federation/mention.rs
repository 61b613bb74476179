//! Mention extraction
//!
//! Finds `@user` and `@user@domain` tokens in plain text. Resolution to
//! actor URLs happens in [`super::addressing`].

use super::identity::CanonicalUrl;

/// A mention found in text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionToken {
    /// The token as written, including the leading `@`
    pub raw_text: String,
    pub resolved_actor_url: Option<CanonicalUrl>,
}

impl MentionToken {
    fn new(raw_text: String) -> Self {
        Self {
            raw_text,
            resolved_actor_url: None,
        }
    }

    /// Handle without the leading `@`
    pub fn handle(&self) -> &str {
        self.raw_text.trim_start_matches('@')
    }

    pub fn user(&self) -> &str {
        self.handle().split('@').next().unwrap_or_default()
    }

    /// Domain part, absent for bare `@user` mentions.
    pub fn domain(&self) -> Option<&str> {
        self.handle().split_once('@').map(|(_, domain)| domain)
    }
}

fn is_user_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

fn is_domain_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-')
}

/// Characters after which an `@` may start a mention.
fn opens_mention(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | '[' | '{' | '<' | '"' | '\'' | '“' | '‘' | '«')
}

fn trim_trailing(part: &str) -> &str {
    part.trim_end_matches(['.', '-'])
}

/// Extract mentions in order of appearance.
///
/// Total over any input; `user@example.com` inside a word is not a
/// mention because the `@` does not start a token.
pub fn extract(text: &str) -> Vec<MentionToken> {
    let chars: Vec<char> = text.chars().collect();
    let mut mentions = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let starts_token = chars[i] == '@' && (i == 0 || opens_mention(chars[i - 1]));
        if !starts_token {
            i += 1;
            continue;
        }

        let user_start = i + 1;
        let mut end = user_start;
        while end < chars.len() && is_user_char(chars[end]) {
            end += 1;
        }
        let user: String = chars[user_start..end].iter().collect();

        let mut domain = String::new();
        if end < chars.len() && chars[end] == '@' {
            let domain_start = end + 1;
            let mut domain_end = domain_start;
            while domain_end < chars.len() && is_domain_char(chars[domain_end]) {
                domain_end += 1;
            }
            // An explicit port, as development instances use
            if domain_end > domain_start && chars.get(domain_end) == Some(&':') {
                let port_start = domain_end + 1;
                let mut port_end = port_start;
                while port_end < chars.len() && chars[port_end].is_ascii_digit() {
                    port_end += 1;
                }
                if port_end > port_start {
                    domain_end = port_end;
                }
            }
            if domain_end > domain_start {
                domain = chars[domain_start..domain_end].iter().collect();
                end = domain_end;
            }
        }

        let domain = trim_trailing(&domain);
        let user = if domain.is_empty() {
            trim_trailing(&user)
        } else {
            user.as_str()
        };

        if !user.is_empty() {
            let raw = if domain.is_empty() {
                format!("@{}", user)
            } else {
                format!("@{}@{}", user, domain)
            };
            mentions.push(MentionToken::new(raw));
        }

        i = end.max(i + 1);
    }

    mentions
}
