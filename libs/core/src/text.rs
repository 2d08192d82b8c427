//! Small text helpers shared by the inbound normalizer and the outbound sender.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

/// Wide enough that rendered paragraphs are never wrapped.
const PLAIN_WIDTH: usize = 4096;

static SIGNATURE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*.*\*").expect("valid regex"));

/// Reduces stored HTML bodies to the plain text the provider accepts.
///
/// ```
/// use gwb_core::text::html_to_plain;
///
/// assert_eq!(html_to_plain("<p>Hola &amp; adiós</p>"), "Hola & adiós");
/// ```
pub fn html_to_plain(html: &str) -> String {
    match html2text::from_read(html.as_bytes(), PLAIN_WIDTH) {
        Ok(text) => text.trim().to_string(),
        Err(err) => {
            warn!(error = %err, "body is not renderable html, sending it unchanged");
            html.trim().to_string()
        }
    }
}

/// Prefixes a body with the sender's display name in provider bold.
pub fn sign_body(sender_name: &str, body: &str) -> String {
    format!("*[{sender_name}]* {body}")
}

/// Removes the `*...*` sender signature so signed and unsigned bodies compare equal.
pub fn strip_signature(body: &str) -> String {
    SIGNATURE.replace_all(body, "").trim().to_string()
}

/// Normalizes a phone number to `+digits`; returns `None` when it holds no digits.
///
/// ```
/// use gwb_core::text::sanitize_phone;
///
/// assert_eq!(sanitize_phone("34 600-11-22-33").as_deref(), Some("+34600112233"));
/// assert_eq!(sanitize_phone("n/a"), None);
/// ```
pub fn sanitize_phone(number: &str) -> Option<String> {
    let digits: String = number.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        None
    } else {
        Some(format!("+{digits}"))
    }
}

/// Anchor pointing at a map search for the shared coordinates.
pub fn location_link(latitude: f64, longitude: f64) -> String {
    format!(
        "<a target=\"_blank\" href=\"https://www.google.com/maps/search/?api=1&query={latitude},{longitude}\">Location</a>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_to_plain_keeps_line_structure() {
        let html = "<p>Hello<br/>there</p><p>second</p>";
        let plain = html_to_plain(html);
        let lines: Vec<&str> = plain.lines().filter(|line| !line.trim().is_empty()).collect();
        assert_eq!(lines, vec!["Hello", "there", "second"]);
    }

    #[test]
    fn html_to_plain_decodes_numeric_and_named_entities() {
        let plain = html_to_plain("<p>Caf&#233; &#8217;abierto&#8217; &euro;5 &lt;hoy&gt;</p>");
        assert_eq!(plain, "Café ’abierto’ €5 <hoy>");
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(html_to_plain("  just text  "), "just text");
    }

    #[test]
    fn signature_roundtrip_compares_equal() {
        let signed = sign_body("Bob", "See you tomorrow");
        assert_eq!(signed, "*[Bob]* See you tomorrow");
        assert_eq!(strip_signature(&signed), "See you tomorrow");
        assert_eq!(strip_signature("plain"), "plain");
    }

    #[test]
    fn location_link_embeds_coordinates() {
        let link = location_link(40.4, -3.7);
        assert!(link.contains("query=40.4,-3.7"));
        assert!(link.ends_with(">Location</a>"));
    }
}
