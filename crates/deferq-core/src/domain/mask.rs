//! PII masking for anything that leaves the process as text
//! (logs, alert lines, DLQ entries).

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;

/// Returned for absent or malformed addresses.
pub const INVALID_EMAIL: &str = "[invalid-email]";

const MASK: &str = "*******";
const MAX_MESSAGE_CHARS: usize = 500;

static EMBEDDED_EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)+")
        .expect("embedded email pattern is valid")
});

/// Masks an email address for logging.
///
/// `john.doe@example.com` becomes `j*******@example.com`. A one-character
/// local part is left as is. Never fails.
pub fn mask_email(address: Option<&str>) -> String {
    let Some((local, domain)) = address.map(str::trim).and_then(split_address) else {
        return INVALID_EMAIL.to_string();
    };

    let mut chars = local.chars();
    match (chars.next(), chars.next()) {
        (Some(first), Some(_)) => format!("{first}{MASK}@{domain}"),
        _ => format!("{local}@{domain}"),
    }
}

fn split_address(address: &str) -> Option<(&str, &str)> {
    let (local, domain) = address.split_once('@')?;
    let well_formed = !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.split('.').any(str::is_empty)
        && !address.chars().any(char::is_whitespace);
    well_formed.then_some((local, domain))
}

/// Masks every email address embedded in free text and bounds its length.
pub fn sanitize_message(message: &str) -> String {
    let masked = EMBEDDED_EMAIL.replace_all(message, |caps: &Captures<'_>| {
        mask_email(caps.get(0).map(|m| m.as_str()))
    });

    if masked.chars().count() <= MAX_MESSAGE_CHARS {
        return masked.into_owned();
    }
    let mut truncated: String = masked.chars().take(MAX_MESSAGE_CHARS).collect();
    truncated.push_str("...");
    truncated
}

/// Like [`sanitize_message`], but also masks a known recipient wherever it
/// appears verbatim. Malformed addresses (`john@localhost`) slip past the
/// embedded-address pattern and would otherwise be kept as is.
pub fn sanitize_message_for(message: &str, recipient: Option<&str>) -> String {
    match recipient.map(str::trim).filter(|r| !r.is_empty()) {
        Some(recipient) if message.contains(recipient) => {
            let replaced = message.replace(recipient, &mask_email(Some(recipient)));
            sanitize_message(&replaced)
        }
        _ => sanitize_message(message),
    }
}

/// The `recipient` field of a JSON job payload, if it has one.
pub fn payload_recipient(payload: &Value) -> Option<&str> {
    payload.get("recipient").and_then(Value::as_str)
}

/// Copy of a JSON job payload safe to show outside the process: the
/// `recipient` field is replaced by its masked form.
pub fn mask_payload(payload: &Value) -> Value {
    let mut masked = payload.clone();
    if let Some(recipient) = masked.get_mut("recipient") {
        *recipient = Value::String(mask_email(recipient.as_str()));
    }
    masked
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case::typical(Some("john.doe@example.com"), "j*******@example.com")]
    #[case::single_char_local(Some("a@b.co"), "a@b.co")]
    #[case::two_char_local(Some("ab@b.co"), "a*******@b.co")]
    #[case::trimmed(Some("  jane@example.org "), "j*******@example.org")]
    #[case::missing(None, INVALID_EMAIL)]
    #[case::empty(Some(""), INVALID_EMAIL)]
    #[case::no_at(Some("not-an-address"), INVALID_EMAIL)]
    #[case::no_local(Some("@example.com"), INVALID_EMAIL)]
    #[case::no_tld(Some("john@localhost"), INVALID_EMAIL)]
    #[case::two_ats(Some("a@b@example.com"), INVALID_EMAIL)]
    #[case::inner_space(Some("john doe@example.com"), INVALID_EMAIL)]
    fn masks_addresses(#[case] input: Option<&str>, #[case] expected: &str) {
        assert_eq!(mask_email(input), expected);
    }

    #[test]
    fn sanitize_masks_embedded_addresses() {
        let out = sanitize_message("Invalid recipient john.doe@example.com (cc mary@corp.io)");
        assert_eq!(
            out,
            "Invalid recipient j*******@example.com (cc m*******@corp.io)"
        );
    }

    #[test]
    fn sanitize_truncates_long_messages() {
        let out = sanitize_message(&"x".repeat(2_000));
        assert_eq!(out.chars().count(), MAX_MESSAGE_CHARS + 3);
        assert!(out.ends_with("..."));
    }

    #[rstest]
    #[case::malformed("Invalid `to` field: john.doe@mailhost", Some("john.doe@mailhost"))]
    #[case::padded("rejected: bob@intranet", Some(" bob@intranet "))]
    fn known_malformed_recipient_is_masked(#[case] message: &str, #[case] recipient: Option<&str>) {
        let out = sanitize_message_for(message, recipient);
        assert!(out.contains(INVALID_EMAIL), "{out}");
        assert!(!out.contains(recipient.unwrap().trim()), "{out}");
    }

    #[test]
    fn known_recipient_still_gets_general_masking() {
        let out = sanitize_message_for("to john@example.com, cc mary@corp.io", Some("john@example.com"));
        assert_eq!(out, "to j*******@example.com, cc m*******@corp.io");
        assert_eq!(sanitize_message_for("boom", None), "boom");
    }

    #[test]
    fn payload_recipient_is_masked_and_other_fields_kept() {
        let payload = serde_json::json!({
            "kind": "email_delivery",
            "recipient": "john.doe@mailhost",
            "source": "scheduled",
        });

        assert_eq!(payload_recipient(&payload), Some("john.doe@mailhost"));
        let masked = mask_payload(&payload);
        assert_eq!(masked["recipient"], INVALID_EMAIL);
        assert_eq!(masked["source"], "scheduled");
        let capture = serde_json::json!({ "order_id": "o1" });
        assert_eq!(mask_payload(&capture), capture);
    }

    proptest! {
        #[test]
        fn masked_address_never_contains_local_tail(
            local in "[a-z0-9._+-]{2,20}",
            domain in "[a-z0-9]{1,10}\\.[a-z]{2,6}",
        ) {
            let address = format!("{local}@{domain}");
            let masked = mask_email(Some(&address));
            let first = local.chars().next().unwrap();

            prop_assert_eq!(masked, format!("{first}{MASK}@{domain}"));
        }

        #[test]
        fn strings_without_at_sign_are_invalid(input in "[^@]{0,40}") {
            prop_assert_eq!(mask_email(Some(&input)), INVALID_EMAIL);
        }

        #[test]
        fn sanitized_text_keeps_no_full_address(
            local in "[a-z]{3,12}",
            domain in "[a-z]{3,10}\\.com",
            prefix in "[A-Za-z ]{0,30}",
        ) {
            let address = format!("{local}@{domain}");
            let out = sanitize_message(&format!("{prefix} {address} failed"));
            prop_assert!(!out.contains(&address));
        }
    }
}
