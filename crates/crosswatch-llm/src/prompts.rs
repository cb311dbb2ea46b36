//! Fixed prompt texts. The literal wording is part of the service contract —
//! edit with care, downstream parsing assumes these shapes.

pub const EXTRACT_PROMPT: &str = r#"Extract the key intelligence elements from the following message.
The message may be in Arabic, Hebrew, or English — handle all three.
Normalize location names to their most common English or Arabic form.
Return ONLY valid JSON (no markdown fences, no extra text):
{
  "location": "specific place name or null",
  "region": "broader area (e.g. south lebanon, gaza, west bank, iran) or null",
  "event_type": "one of: strike, rocket, clash, arrest, movement, statement, casualty, other, irrelevant",
  "entities": ["named groups, people, or armed forces mentioned"],
  "keywords": ["2-3 key descriptive terms"],
  "is_urgent": true or false,
  "credibility_indicators": {
    "has_media_reference": true or false,
    "cites_named_source": true or false,
    "uses_vague_language": true or false,
    "is_forwarded_claim": true or false
  }
}
If the message is not about a security/military/political event, return: {"event_type":"irrelevant"}

Message:
"#;

const SUMMARY_PROMPT: &str = "\
סכם בקצרה בעברית את הנקודות העיקריות מההודעות הבאות.
כתוב 2-3 שורות תמציתיות, בלי סגנון כתב חדשות.
אם מספר מקורות מדווחים על אותו אירוע, ציין זאת.
{authority_context}

ההודעות:
{messages}";

const TREND_PROMPT: &str = "\
סכם במדויק בשורה אחת בעברית את המידע העיקרי שדווח במספר ערוצים.
המטרה – דיווח תמציתי וברור, בלי סגנון כתב חדשות.
לאחר מכן החזר שורה שנייה שמתחילה ב-\"> \" ומכילה תרגום לעברית של ציטוט מייצג מתוך ההודעה.
אל תכתוב שום דבר מעבר לשתי השורות.

{authority_context}

הטקסט המקורי:
{text}";

pub fn extract_prompt(text: &str) -> String {
    format!("{EXTRACT_PROMPT}{text}")
}

pub fn summary_prompt(messages: &str, authority_context: &str) -> String {
    SUMMARY_PROMPT
        .replace("{authority_context}", authority_context)
        .replace("{messages}", messages)
}

pub fn trend_prompt(text: &str, authority_context: &str) -> String {
    TREND_PROMPT
        .replace("{authority_context}", authority_context)
        .replace("{text}", text)
}
