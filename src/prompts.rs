//! Prompt text and response parsing.
//!
//! Prompt engineering lives here so the call sites in the generator and the
//! extraction worker stay about control flow. Parsers treat the model as an
//! untrusted source: they tolerate code fences and both the bare-array and
//! wrapped-object shapes, and return nothing rather than raising on garbage.

use crate::types::{ContextEntry, EntryKind, Locale, PdfKind};
use serde_json::Value;

// ── Sticker generation ───────────────────────────────────────────────────

const TUTOR_PERSONA_EN: &str = "You are a patient university tutor. Explain the \
material on the given page in short, self-contained notes a student can pin \
next to the text. Each note anchors to a phrase that actually appears on the \
page. Respond with a JSON array of objects with keys \"anchorText\" and \
\"explanation\". Keep explanations under 120 words, in Markdown.";

const TUTOR_PERSONA_ZH_HANS: &str = "你是一位耐心的大学辅导老师。请针对给定页面\
的内容生成简短、独立的讲解便签，学生可以把它们固定在原文旁边。每条便签的锚点\
必须是页面上实际出现的短语。请以 JSON 数组作答，每个对象包含 \"anchorText\" 和 \
\"explanation\" 两个键。讲解使用 Markdown，不超过 120 字。";

pub fn tutor_persona(locale: Locale) -> &'static str {
    match locale {
        Locale::En => TUTOR_PERSONA_EN,
        Locale::ZhHans => TUTOR_PERSONA_ZH_HANS,
    }
}

/// Compact context hint appended to the system message: at most five
/// definitions or formulas, title plus a 150-char body prefix each.
pub fn context_hint(entries: &[ContextEntry]) -> Option<String> {
    let picked: Vec<&ContextEntry> = entries
        .iter()
        .filter(|e| matches!(e.kind, EntryKind::Definition | EntryKind::Formula))
        .take(5)
        .collect();
    if picked.is_empty() {
        return None;
    }
    let mut hint = String::from("\n\nCourse context the student has already covered:\n");
    for entry in picked {
        let prefix: String = entry.body.chars().take(150).collect();
        hint.push_str(&format!("- {}: {}\n", entry.title, prefix));
    }
    Some(hint)
}

pub fn page_user_prompt(
    page_text: &str,
    page: u32,
    total_pages: u32,
    kind: PdfKind,
    question: Option<&str>,
) -> String {
    let style = match kind {
        PdfKind::Ppt => "This is a slide deck; treat the page as one slide and explain it as a whole.",
        PdfKind::Text => "This is running text; anchor each note to the paragraph it explains.",
    };
    let mut prompt = format!(
        "Page {} of {}. {}\n\nPage text:\n{}",
        page, total_pages, style, page_text
    );
    if let Some(q) = question {
        prompt.push_str(&format!("\n\nThe student asked: {}", q));
    }
    prompt
}

/// User prompt for selected-image generations. The crops ride along as
/// image parts in region order; the text names them so the model can refer
/// back.
pub fn selected_images_prompt(page_text: &str, page: u32, regions: usize) -> String {
    format!(
        "Page {}. The student selected {} region(s) of this page, attached as \
images in order. Explain what each selected region shows, using the page text \
for context.\n\nPage text:\n{}",
        page, regions, page_text
    )
}

/// One `{ anchorText, explanation }` pair from the model.
#[derive(Debug, Clone, PartialEq)]
pub struct StickerPair {
    pub anchor_text: String,
    pub explanation: String,
}

/// Accepts `[{...}]` or `{"stickers": [{...}]}`; drops malformed elements.
pub fn parse_sticker_pairs(raw: &str) -> Vec<StickerPair> {
    let Some(value) = parse_json_lenient(raw) else {
        return Vec::new();
    };
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("stickers") {
            Some(Value::Array(items)) => items,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let anchor = obj.get("anchorText")?.as_str()?.trim().to_string();
            let explanation = obj.get("explanation")?.as_str()?.trim().to_string();
            if anchor.is_empty() || explanation.is_empty() {
                return None;
            }
            Some(StickerPair { anchor_text: anchor, explanation })
        })
        .collect()
}

// ── Context extraction ───────────────────────────────────────────────────

pub const EXTRACTION_SYSTEM_EN: &str = "You mine course documents for reusable \
knowledge. From the given pages, extract definitions, formulas, theorems, \
concepts, and principles worth remembering. Respond with a JSON array of \
objects with keys \"type\" (definition|formula|theorem|concept|principle), \
\"title\" (max 200 chars), \"body\" (max 500 words), \"sourcePage\", \
\"keywords\" (max 10), and \"qualityScore\" (0 to 1, how canonical and \
self-contained the entry is). Skip filler, examples, and exercises.";

pub const EXTRACTION_SYSTEM_TRANSLATE: &str = "You mine non-English course \
documents for reusable knowledge. Translate each extracted item into English \
while keeping standard terminology. Respond with a JSON array of objects with \
keys \"type\" (definition|formula|theorem|concept|principle), \"title\" (max \
200 chars), \"body\" (max 500 words), \"sourcePage\", \"keywords\" (max 10), \
and \"qualityScore\" (0 to 1). Skip filler, examples, and exercises.";

pub fn extraction_user_prompt(batch_text: &str, first_page: u32, last_page: u32) -> String {
    format!(
        "Pages {}..{} of the document:\n\n{}",
        first_page, last_page, batch_text
    )
}

/// Candidate entry as parsed from the model, before quality filtering.
#[derive(Debug, Clone)]
pub struct CandidateEntry {
    pub kind: EntryKind,
    pub title: String,
    pub body: String,
    pub source_page: Option<u32>,
    pub keywords: Vec<String>,
    pub quality_score: f64,
}

/// Accepts `[{...}]` or `{"entries": [{...}]}`; enforces the field bounds
/// and drops anything that misses them.
pub fn parse_candidate_entries(raw: &str) -> Vec<CandidateEntry> {
    let Some(value) = parse_json_lenient(raw) else {
        return Vec::new();
    };
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("entries") {
            Some(Value::Array(items)) => items,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let kind = EntryKind::parse(obj.get("type")?.as_str()?)?;
            let title = obj.get("title")?.as_str()?.trim().to_string();
            let body = obj.get("body")?.as_str()?.trim().to_string();
            if title.is_empty() || title.chars().count() > 200 || body.is_empty() {
                return None;
            }
            let quality_score = obj.get("qualityScore")?.as_f64()?.clamp(0.0, 1.0);
            let source_page = obj
                .get("sourcePage")
                .and_then(|v| v.as_u64())
                .map(|p| p as u32);
            let keywords = obj
                .get("keywords")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|k| k.as_str())
                        .map(|k| k.trim().to_lowercase())
                        .filter(|k| !k.is_empty())
                        .take(10)
                        .collect()
                })
                .unwrap_or_default();
            Some(CandidateEntry {
                kind,
                title,
                body,
                source_page,
                keywords,
                quality_score,
            })
        })
        .collect()
}

// ── Keyword extraction ───────────────────────────────────────────────────

pub const KEYWORD_SYSTEM: &str = "Extract 3 to 8 academic keywords that capture \
what this text is about. Lowercase, no duplicates. Respond with a JSON object \
{\"keywords\": [\"...\"]}.";

pub fn keyword_user_prompt(page_text: Option<&str>, question: Option<&str>) -> String {
    let mut prompt = String::new();
    if let Some(text) = page_text {
        // A prefix is plenty for topical keywords
        let clipped: String = text.chars().take(2000).collect();
        prompt.push_str(&clipped);
    }
    if let Some(q) = question {
        if !prompt.is_empty() {
            prompt.push_str("\n\n");
        }
        prompt.push_str("Question: ");
        prompt.push_str(q);
    }
    prompt
}

/// Accepts `["kw", ...]` or `{"keywords": [...]}`. Returns `None` on any
/// deviation so the caller can fall back to the heuristic extractor.
pub fn parse_keywords(raw: &str) -> Option<Vec<String>> {
    let value = parse_json_lenient(raw)?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("keywords") {
            Some(Value::Array(items)) => items,
            _ => return None,
        },
        _ => return None,
    };
    let mut keywords = Vec::new();
    for item in items {
        let keyword = item.as_str()?.trim().to_lowercase();
        let len = keyword.chars().count();
        if !(3..=100).contains(&len) {
            continue;
        }
        if !keywords.contains(&keyword) {
            keywords.push(keyword);
        }
    }
    if keywords.is_empty() {
        None
    } else {
        keywords.truncate(8);
        Some(keywords)
    }
}

// ── Shared helpers ───────────────────────────────────────────────────────

/// Parses model output that may be wrapped in a ```json fence.
fn parse_json_lenient(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))?
        .strip_suffix("```")?
        .trim();
    serde_json::from_str(unfenced).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_ms;

    #[test]
    fn sticker_pairs_accept_both_shapes() {
        let bare = r#"[{"anchorText": "chain rule", "explanation": "Compose derivatives."}]"#;
        let wrapped = r#"{"stickers": [{"anchorText": "chain rule", "explanation": "Compose derivatives."}]}"#;
        assert_eq!(parse_sticker_pairs(bare), parse_sticker_pairs(wrapped));
        assert_eq!(parse_sticker_pairs(bare).len(), 1);
    }

    #[test]
    fn sticker_pairs_drop_malformed_elements() {
        let raw = r#"[
            {"anchorText": "ok", "explanation": "fine"},
            {"anchorText": "", "explanation": "empty anchor"},
            {"explanation": "no anchor"},
            "not an object"
        ]"#;
        let pairs = parse_sticker_pairs(raw);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].anchor_text, "ok");
    }

    #[test]
    fn sticker_pairs_tolerate_code_fences() {
        let fenced = "```json\n[{\"anchorText\": \"a\", \"explanation\": \"b\"}]\n```";
        assert_eq!(parse_sticker_pairs(fenced).len(), 1);
    }

    #[test]
    fn keywords_reject_out_of_range_lengths() {
        let raw = r#"{"keywords": ["ok-keyword", "ab", "derivative"]}"#;
        let parsed = parse_keywords(raw).unwrap();
        assert_eq!(parsed, vec!["ok-keyword".to_string(), "derivative".to_string()]);
    }

    #[test]
    fn keywords_none_on_garbage() {
        assert!(parse_keywords("the model rambled instead").is_none());
        assert!(parse_keywords(r#"{"notKeywords": []}"#).is_none());
    }

    #[test]
    fn candidate_entries_validate_fields() {
        let raw = r#"[
            {"type": "definition", "title": "Derivative", "body": "Rate of change.",
             "sourcePage": 3, "keywords": ["Derivative", "calculus"], "qualityScore": 0.9},
            {"type": "joke", "title": "nope", "body": "x", "qualityScore": 0.9},
            {"type": "formula", "title": "", "body": "x", "qualityScore": 0.9}
        ]"#;
        let parsed = parse_candidate_entries(raw);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].kind, EntryKind::Definition);
        assert_eq!(parsed[0].keywords, vec!["derivative".to_string(), "calculus".to_string()]);
    }

    #[test]
    fn context_hint_caps_at_five_definitions_and_formulas() {
        let entry = |kind: EntryKind, title: &str| ContextEntry {
            id: title.to_string(),
            pdf_hash: "h".to_string(),
            kind,
            title: title.to_string(),
            body: "b".repeat(300),
            source_page: 1,
            keywords: vec![],
            quality_score: 0.9,
            language: "en".to_string(),
            extraction_version: 1,
            created_at_ms: now_ms(),
        };
        let entries: Vec<ContextEntry> = (0..6)
            .map(|i| entry(EntryKind::Definition, &format!("def {}", i)))
            .chain(std::iter::once(entry(EntryKind::Concept, "concept")))
            .collect();
        let hint = context_hint(&entries).unwrap();
        assert_eq!(hint.matches("- def").count(), 5);
        assert!(!hint.contains("concept"));
    }
}
