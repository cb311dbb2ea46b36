//! Text normalization, fingerprinting, and the urgent-keyword predicate.
//!
//! Messages arrive in Arabic, Hebrew, and occasionally English, frequently
//! reposted with cosmetic edits (added diacritics, changed casualty counts,
//! appended channel links). Normalization here is what makes the cheap
//! fingerprint collide for those reposts.

use sha1::{Digest, Sha1};
use unicode_normalization::UnicodeNormalization;

/// Urgent markers checked against the lowercased text. Arabic first, Hebrew after.
pub const URGENT_KEYWORDS: &[&str] = &[
    // Arabic
    "عاجل",
    "انفجار",
    "انفجارات",
    "اشتباك",
    "هجوم",
    "غارة",
    "قتلى",
    "مقتل",
    "إصابة",
    "ازدحام",
    "قطع طرق",
    "أزمة سير",
    "احتجاج",
    "إغلاق",
    "زحمة",
    "طوارئ",
    "حرائق",
    "حريق",
    "صاروخ",
    "درون",
    // Hebrew
    "דחוף",
    "פיגוע",
    "ירי",
    "רקטה",
    "רקטות",
    "חיסול",
    "פיצוץ",
    "אירוע ביטחוני",
    "חדירה",
    "עימות",
    "הרוגים",
    "פצועים",
    "התקפה",
];

const URGENT_EMOJI: &[char] = &['🚨', '🔴'];

/// Arabic tashkeel (diacritic) ranges: U+0610–U+061A, U+064B–U+065F, U+0670.
fn is_tashkeel(c: char) -> bool {
    matches!(c, '\u{0610}'..='\u{061A}' | '\u{064B}'..='\u{065F}' | '\u{0670}')
}

fn is_transport_url(token: &str) -> bool {
    let t = token.trim_matches(|c: char| c.is_ascii_punctuation() && c != '/' && c != ':');
    t.starts_with("http://")
        || t.starts_with("https://")
        || t.starts_with("www.")
        || t.contains("t.me/")
        || t.contains("telegram.me/")
}

/// Canonicalize raw message text: NFC composition, tashkeel stripped,
/// transport URLs removed, internal whitespace collapsed to single spaces.
pub fn normalize_text(raw: &str) -> String {
    let composed: String = raw.nfc().filter(|c| !is_tashkeel(*c)).collect();
    let mut out = String::with_capacity(composed.len());
    for token in composed.split_whitespace() {
        if is_transport_url(token) {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(token);
    }
    out
}

/// SHA-1 hex over the raw text — the exact-repeat dedup key.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Cheap event fingerprint: SHA-1 over the first 120 chars of the normalized
/// text after lowercasing and digit stripping.
///
/// Invariant under tashkeel insertion/removal, digit edits, and ASCII case,
/// so reposts that only bump a casualty count or add diacritics collide.
pub fn event_fingerprint(text: &str) -> String {
    let cleaned: String = text
        .nfc()
        .filter(|c| !is_tashkeel(*c))
        .flat_map(|c| c.to_lowercase())
        .filter(|c| !c.is_ascii_digit())
        .collect();
    let clipped: String = cleaned.chars().take(120).collect();
    let mut hasher = Sha1::new();
    hasher.update(clipped.as_bytes());
    hex::encode(hasher.finalize())
}

/// Text-level urgency predicate: any configured Arabic/Hebrew urgent keyword,
/// or one of the siren emoji markers.
pub fn looks_urgent(text: &str) -> bool {
    let low = text.to_lowercase();
    URGENT_KEYWORDS.iter().any(|k| low.contains(k))
        || URGENT_EMOJI.iter().any(|e| text.contains(*e))
}

/// Clip to at most `max` characters on a char boundary.
pub fn clip(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_urls() {
        let out = normalize_text("check https://t.me/channel/123 this");
        assert!(!out.contains("t.me"));
        assert_eq!(out, "check this");
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize_text("hello    world\n\nnewline"), "hello world newline");
    }

    #[test]
    fn normalize_strips_tashkeel() {
        // Same root with and without diacritics.
        assert_eq!(normalize_text("كُتِبَ"), normalize_text("كتب"));
    }

    #[test]
    fn fingerprint_ignores_tashkeel() {
        assert_eq!(event_fingerprint("كُتِبَ"), event_fingerprint("كتب"));
    }

    #[test]
    fn fingerprint_ignores_digits() {
        assert_eq!(
            event_fingerprint("explosion in area 5"),
            event_fingerprint("explosion in area 12")
        );
    }

    #[test]
    fn fingerprint_ignores_ascii_case() {
        assert_eq!(event_fingerprint("Explosion In Gaza"), event_fingerprint("explosion in gaza"));
    }

    #[test]
    fn fingerprint_differs_for_different_text() {
        assert_ne!(event_fingerprint("strike on gaza"), event_fingerprint("protest in beirut"));
    }

    #[test]
    fn urgent_arabic() {
        assert!(looks_urgent("عاجل: انفجار في بيروت"));
        assert!(!looks_urgent("طقس جميل اليوم"));
    }

    #[test]
    fn urgent_hebrew() {
        assert!(looks_urgent("דחוף: ירי רקטות לעבר הצפון"));
        assert!(!looks_urgent("מזג אוויר נעים"));
    }

    #[test]
    fn urgent_emoji() {
        assert!(looks_urgent("🚨 breaking news"));
        assert!(looks_urgent("🔴 alert"));
    }

    #[test]
    fn clip_respects_char_boundaries() {
        let s = "אבגדה";
        assert_eq!(clip(s, 3), "אבג");
        assert_eq!(clip(s, 10), s);
    }

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
    }
}
