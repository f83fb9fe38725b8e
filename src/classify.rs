//! Inbound mail classifier — bounce / out-of-office / genuine.
//!
//! Pure and deterministic: the same input always classifies the same way,
//! including byte-identical reprocessing after a crash. Control flow is
//! fixed; the patterns themselves are data (substring and sender-prefix
//! sets) so they can be extended without touching the evaluation order.
//!
//! Bounce is checked before auto-reply: it is the most specific and the
//! most consequential outcome, and a bounce swallowed as "just an
//! auto-reply" would never flip the request to a failure status.

use crate::model::{AutomationHeaders, Classification};

/// Input view over an inbound message. Borrowed — classification never
/// needs ownership.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyInput<'a> {
    pub from: &'a str,
    pub subject: &'a str,
    pub body: &'a str,
    pub headers: &'a AutomationHeaders,
}

/// Sender local parts used by bounce daemons.
const BOUNCE_SENDERS: &[&str] = &[
    "mailer-daemon",
    "mailer_daemon",
    "mailerdaemon",
    "postmaster",
    "mail-daemon",
    "bounce",
    "bounces",
];

/// Subject/body substrings that indicate a delivery failure.
const BOUNCE_PATTERNS: &[&str] = &[
    "undeliverable",
    "undelivered mail",
    "delivery status notification",
    "delivery has failed",
    "delivery failure",
    "failure notice",
    "returned mail",
    "mail delivery failed",
    "could not be delivered",
    "address not found",
    "mailbox not found",
    "mailbox unavailable",
    "user unknown",
    "recipient address rejected",
    "550 ",
    "554 ",
];

/// Sender local parts used by auto-responders.
const AUTO_RESPONDER_SENDERS: &[&str] = &["autoreply", "auto-reply", "auto_reply", "noreply", "no-reply", "donotreply"];

/// Subject/body substrings that indicate an automated reply.
const AUTO_REPLY_PATTERNS: &[&str] = &[
    "out of office",
    "out of the office",
    "automatic reply",
    "auto-reply",
    "autoreply",
    "auto reply",
    "away from my email",
    "on vacation",
    "on annual leave",
    "on parental leave",
    "currently unavailable",
    "will respond when i return",
    "i am currently out",
    "i'm currently out",
    "limited access to email",
];

/// `Precedence` header values that signal automation.
const AUTOMATED_PRECEDENCE: &[&str] = &["bulk", "junk", "auto_reply"];

/// Classify an inbound email. First match wins, in order:
/// bounce, out-of-office/auto-reply, genuine.
pub fn classify(input: &ClassifyInput<'_>) -> Classification {
    if is_bounce(input) {
        return Classification::Bounce;
    }
    if is_auto_reply(input) {
        return Classification::OutOfOffice;
    }
    Classification::Genuine
}

/// Bounce when the sender is a known bounce daemon and either field
/// matches, or when subject and body both match independently of the
/// sender (forwarded DSNs keep the daemon out of the From header).
fn is_bounce(input: &ClassifyInput<'_>) -> bool {
    let subject_hit = matches_any(input.subject, BOUNCE_PATTERNS);
    let body_hit = matches_any(input.body, BOUNCE_PATTERNS);

    if sender_local_part_in(input.from, BOUNCE_SENDERS) && (subject_hit || body_hit) {
        return true;
    }
    subject_hit && body_hit
}

fn is_auto_reply(input: &ClassifyInput<'_>) -> bool {
    if sender_local_part_in(input.from, AUTO_RESPONDER_SENDERS) {
        return true;
    }
    if matches_any(input.subject, AUTO_REPLY_PATTERNS) || matches_any(input.body, AUTO_REPLY_PATTERNS) {
        return true;
    }
    headers_signal_automation(input.headers)
}

/// Transport headers signal automation when `Auto-Submitted` is present
/// and not "no", `X-Auto-Response-Suppress` is present at all, or
/// `Precedence` carries a bulk/junk/auto_reply value.
fn headers_signal_automation(headers: &AutomationHeaders) -> bool {
    if let Some(auto_submitted) = &headers.auto_submitted
        && !auto_submitted.trim().eq_ignore_ascii_case("no")
    {
        return true;
    }
    if headers.x_auto_response_suppress.is_some() {
        return true;
    }
    if let Some(precedence) = &headers.precedence {
        let p = precedence.trim().to_lowercase();
        return AUTOMATED_PRECEDENCE.contains(&p.as_str());
    }
    false
}

/// Case-insensitive substring match against a pattern set.
fn matches_any(field: &str, patterns: &[&str]) -> bool {
    if field.is_empty() {
        return false;
    }
    let lower = field.to_lowercase();
    patterns.iter().any(|p| lower.contains(p))
}

/// Whether the sender's local part starts with any entry in the set.
fn sender_local_part_in(from: &str, senders: &[&str]) -> bool {
    let local = from.split('@').next().unwrap_or("").to_lowercase();
    if local.is_empty() {
        return false;
    }
    senders.iter().any(|s| local.starts_with(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AutomationHeaders;

    fn input<'a>(
        from: &'a str,
        subject: &'a str,
        body: &'a str,
        headers: &'a AutomationHeaders,
    ) -> ClassifyInput<'a> {
        ClassifyInput {
            from,
            subject,
            body,
            headers,
        }
    }

    const NO_HEADERS: AutomationHeaders = AutomationHeaders {
        auto_submitted: None,
        x_auto_response_suppress: None,
        precedence: None,
    };

    #[test]
    fn daemon_bounce_with_failure_body() {
        let h = NO_HEADERS;
        let result = classify(&input(
            "mailer-daemon@example.com",
            "Undeliverable: Q3 Invoice",
            "550 mailbox not found",
            &h,
        ));
        assert_eq!(result, Classification::Bounce);
    }

    #[test]
    fn bounce_without_daemon_sender_needs_both_fields() {
        let h = NO_HEADERS;
        // Subject alone is not enough from an ordinary sender
        let result = classify(&input(
            "it-alerts@example.com",
            "Undeliverable message",
            "See attached report.",
            &h,
        ));
        assert_ne!(result, Classification::Bounce);

        // Subject and body both matching is a bounce regardless of sender
        let result = classify(&input(
            "it-alerts@example.com",
            "Mail delivery failed",
            "recipient address rejected: user unknown",
            &h,
        ));
        assert_eq!(result, Classification::Bounce);
    }

    #[test]
    fn daemon_sender_alone_is_not_a_bounce() {
        let h = NO_HEADERS;
        let result = classify(&input(
            "postmaster@example.com",
            "Mailbox storage warning",
            "Your mailbox is almost full.",
            &h,
        ));
        assert_ne!(result, Classification::Bounce);
    }

    #[test]
    fn bounce_wins_over_auto_reply_signals() {
        // A DSN that also carries Auto-Submitted must classify as bounce,
        // not get swallowed by the broader auto-reply tier.
        let h = AutomationHeaders {
            auto_submitted: Some("auto-replied".into()),
            x_auto_response_suppress: None,
            precedence: None,
        };
        let result = classify(&input(
            "mailer-daemon@googlemail.com",
            "Delivery Status Notification (Failure)",
            "The email account that you tried to reach does not exist.",
            &h,
        ));
        assert_eq!(result, Classification::Bounce);
    }

    #[test]
    fn out_of_office_body() {
        let h = NO_HEADERS;
        let result = classify(&input(
            "carol@example.com",
            "Re: Please send your W-9",
            "I'm currently out of the office until Monday.",
            &h,
        ));
        assert_eq!(result, Classification::OutOfOffice);
    }

    #[test]
    fn auto_responder_sender() {
        let h = NO_HEADERS;
        let result = classify(&input(
            "noreply@example.com",
            "We got your message",
            "Thanks, we'll be in touch.",
            &h,
        ));
        assert_eq!(result, Classification::OutOfOffice);
    }

    #[test]
    fn auto_submitted_header() {
        let h = AutomationHeaders {
            auto_submitted: Some("auto-generated".into()),
            x_auto_response_suppress: None,
            precedence: None,
        };
        let result = classify(&input("bob@example.com", "Re: request", "Thanks.", &h));
        assert_eq!(result, Classification::OutOfOffice);
    }

    #[test]
    fn auto_submitted_no_is_not_automation() {
        let h = AutomationHeaders {
            auto_submitted: Some("no".into()),
            x_auto_response_suppress: None,
            precedence: None,
        };
        let result = classify(&input("bob@example.com", "Re: request", "Here you go.", &h));
        assert_eq!(result, Classification::Genuine);
    }

    #[test]
    fn suppress_header_is_automation() {
        let h = AutomationHeaders {
            auto_submitted: None,
            x_auto_response_suppress: Some("All".into()),
            precedence: None,
        };
        let result = classify(&input("bob@example.com", "Re: request", "Auto note.", &h));
        assert_eq!(result, Classification::OutOfOffice);
    }

    #[test]
    fn precedence_values() {
        for value in ["bulk", "junk", "auto_reply"] {
            let h = AutomationHeaders {
                auto_submitted: None,
                x_auto_response_suppress: None,
                precedence: Some(value.into()),
            };
            let result = classify(&input("bob@example.com", "Re: request", "hi", &h));
            assert_eq!(result, Classification::OutOfOffice, "precedence={value}");
        }

        let h = AutomationHeaders {
            auto_submitted: None,
            x_auto_response_suppress: None,
            precedence: Some("first-class".into()),
        };
        let result = classify(&input("bob@example.com", "Re: request", "hi", &h));
        assert_eq!(result, Classification::Genuine);
    }

    #[test]
    fn genuine_reply() {
        let h = NO_HEADERS;
        let result = classify(&input(
            "vendor@example.com",
            "Re: Please send your W-9",
            "Attached is the signed W-9 you asked for.",
            &h,
        ));
        assert_eq!(result, Classification::Genuine);
    }

    #[test]
    fn classification_is_deterministic() {
        let h = NO_HEADERS;
        let i = input(
            "carol@example.com",
            "Automatic reply: Q3 numbers",
            "I am on vacation.",
            &h,
        );
        let first = classify(&i);
        for _ in 0..10 {
            assert_eq!(classify(&i), first);
        }
    }

    #[test]
    fn empty_fields_are_genuine() {
        let h = NO_HEADERS;
        assert_eq!(classify(&input("", "", "", &h)), Classification::Genuine);
    }
}
