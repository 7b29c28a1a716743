//! Selection hashing and text measurement primitives

use crate::types::{EffectiveMode, Locale, Rect, SelectedRegion};
use sha2::{Digest, Sha256};

/// Tolerance for rect bounds checks; rects arrive rounded to 4 decimals.
pub const RECT_EPSILON: f64 = 1e-4;

/// A rect is valid when it sits inside the unit square (within tolerance)
/// and has positive area.
pub fn valid_rect(r: &Rect) -> bool {
    r.x >= 0.0
        && r.y >= 0.0
        && r.w > 0.0
        && r.h > 0.0
        && r.x + r.w <= 1.0 + RECT_EPSILON
        && r.y + r.h <= 1.0 + RECT_EPSILON
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Rect with all coordinates rounded to 4 decimals.
pub fn round_rect(r: &Rect) -> Rect {
    Rect {
        x: round4(r.x),
        y: round4(r.y),
        w: round4(r.w),
        h: round4(r.h),
    }
}

/// Stable anchor id for an image region: `"page-x-y-w-h"` with 4-decimal
/// rounding. Cache hits use it to rebuild the multi-anchor layout.
pub fn region_anchor_id(region: &SelectedRegion) -> String {
    let r = round_rect(&region.rect);
    format!("{}-{}-{}-{}-{}", region.page, r.x, r.y, r.w, r.h)
}

/// Canonical SHA-256 over a selection: rects rounded to 4 decimals, regions
/// sorted by (page, x, y, w, h), hashed as a deterministic text form.
/// Region order as submitted never changes the result.
pub fn canonical_selection_hash(
    root_page: u32,
    mode: EffectiveMode,
    locale: Locale,
    regions: &[SelectedRegion],
) -> String {
    debug_assert!(!regions.is_empty(), "selection hash needs at least one region");

    let mut rounded: Vec<SelectedRegion> = regions
        .iter()
        .map(|reg| SelectedRegion {
            page: reg.page,
            rect: round_rect(&reg.rect),
        })
        .collect();
    rounded.sort_by(|a, b| {
        (a.page, format_rect(&a.rect)).cmp(&(b.page, format_rect(&b.rect)))
    });

    let mut canonical = format!("{}|{}|{}", root_page, mode.as_str(), locale.as_str());
    for reg in &rounded {
        canonical.push('|');
        canonical.push_str(&format!("{}:{}", reg.page, format_rect(&reg.rect)));
    }

    let digest = Sha256::digest(canonical.as_bytes());
    format!("{:x}", digest)
}

/// Fixed-width textual form so lexicographic order equals numeric order.
fn format_rect(r: &Rect) -> String {
    format!("{:.4},{:.4},{:.4},{:.4}", r.x, r.y, r.w, r.h)
}

/// CJK codepoints counted one word each; covers the unified ideograph
/// blocks, kana, and hangul.
pub fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF     // CJK Unified Ideographs
        | 0x3400..=0x4DBF   // Extension A
        | 0xF900..=0xFAFF   // Compatibility Ideographs
        | 0x3040..=0x30FF   // Hiragana + Katakana
        | 0xAC00..=0xD7AF   // Hangul Syllables
    )
}

fn cjk_count(text: &str) -> usize {
    text.chars().filter(|c| is_cjk(*c)).count()
}

/// Whitespace-delimited tokens after stripping CJK, plus one per CJK
/// codepoint.
pub fn estimate_word_count(text: &str) -> usize {
    let stripped: String = text.chars().map(|c| if is_cjk(c) { ' ' } else { c }).collect();
    stripped.split_whitespace().count() + cjk_count(text)
}

/// 1.3 tokens per non-CJK word plus 1.5 per CJK codepoint, each ceil'd.
pub fn estimate_token_count(text: &str) -> usize {
    let cjk = cjk_count(text);
    let non_cjk_words = estimate_word_count(text) - cjk;
    (non_cjk_words as f64 * 1.3).ceil() as usize + (cjk as f64 * 1.5).ceil() as usize
}

/// `"en"` unless more than 30% of non-whitespace characters are CJK.
pub fn detect_language(text: &str) -> &'static str {
    let non_ws: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if non_ws.is_empty() {
        return "en";
    }
    let cjk = non_ws.iter().filter(|c| is_cjk(**c)).count();
    if cjk as f64 / non_ws.len() as f64 > 0.3 {
        "non-en"
    } else {
        "en"
    }
}

/// Lowercase, trim, collapse whitespace runs. Dedup key for entry titles.
pub fn normalize_title(s: &str) -> String {
    s.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// SHA-256 hex digest of arbitrary bytes; used for PDF content hashes and
/// keyword cache keys.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: f64, y: f64, w: f64, h: f64) -> Rect {
        Rect { x, y, w, h }
    }

    fn region(page: u32, x: f64, y: f64, w: f64, h: f64) -> SelectedRegion {
        SelectedRegion { page, rect: rect(x, y, w, h) }
    }

    #[test]
    fn rect_validation() {
        assert!(valid_rect(&rect(0.0, 0.0, 1.0, 1.0)));
        assert!(valid_rect(&rect(0.1, 0.5, 0.2, 0.2)));
        // Tolerance admits a hair over the unit square
        assert!(valid_rect(&rect(0.5, 0.5, 0.50005, 0.4)));
        assert!(!valid_rect(&rect(-0.1, 0.0, 0.5, 0.5)));
        assert!(!valid_rect(&rect(0.0, 0.0, 0.0, 0.5)));
        assert!(!valid_rect(&rect(0.6, 0.0, 0.5, 0.5)));
    }

    #[test]
    fn selection_hash_is_order_independent() {
        let regions = vec![
            region(7, 0.1, 0.1, 0.2, 0.2),
            region(7, 0.5, 0.1, 0.2, 0.2),
            region(7, 0.1, 0.5, 0.2, 0.2),
        ];
        let mut reversed = regions.clone();
        reversed.reverse();

        let a = canonical_selection_hash(7, EffectiveMode::WithSelectedImages, Locale::ZhHans, &regions);
        let b = canonical_selection_hash(7, EffectiveMode::WithSelectedImages, Locale::ZhHans, &reversed);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn selection_hash_rounds_before_hashing() {
        let coarse = vec![region(3, 0.1234, 0.5, 0.2, 0.2)];
        let fine = vec![region(3, 0.12341, 0.50004, 0.19996, 0.2)];
        assert_eq!(
            canonical_selection_hash(3, EffectiveMode::WithSelectedImages, Locale::En, &coarse),
            canonical_selection_hash(3, EffectiveMode::WithSelectedImages, Locale::En, &fine),
        );
    }

    #[test]
    fn selection_hash_depends_on_locale_and_page() {
        let regions = vec![region(3, 0.1, 0.1, 0.2, 0.2)];
        let en = canonical_selection_hash(3, EffectiveMode::WithSelectedImages, Locale::En, &regions);
        let zh = canonical_selection_hash(3, EffectiveMode::WithSelectedImages, Locale::ZhHans, &regions);
        let other_page = canonical_selection_hash(4, EffectiveMode::WithSelectedImages, Locale::En, &regions);
        assert_ne!(en, zh);
        assert_ne!(en, other_page);
    }

    #[test]
    fn region_anchor_id_format() {
        let id = region_anchor_id(&region(7, 0.12345, 0.1, 0.2, 0.2));
        assert_eq!(id, "7-0.1235-0.1-0.2-0.2");
    }

    #[test]
    fn word_count_mixed_text() {
        assert_eq!(estimate_word_count("hello world"), 2);
        assert_eq!(estimate_word_count("导数 derivative"), 3);
        assert_eq!(estimate_word_count("微积分"), 3);
        assert_eq!(estimate_word_count(""), 0);
    }

    #[test]
    fn token_count_ceils_each_side() {
        // 2 words -> ceil(2.6) = 3
        assert_eq!(estimate_token_count("hello world"), 3);
        // 3 CJK -> ceil(4.5) = 5
        assert_eq!(estimate_token_count("微积分"), 5);
        // 1 word + 2 CJK -> ceil(1.3) + ceil(3.0) = 2 + 3
        assert_eq!(estimate_token_count("导数 dx"), 5);
    }

    #[test]
    fn language_detection_threshold() {
        assert_eq!(detect_language("plain english text"), "en");
        assert_eq!(detect_language("这是中文内容的页面"), "non-en");
        // 2 CJK out of 12 non-whitespace chars stays english
        assert_eq!(detect_language("derivative 导数"), "en");
        assert_eq!(detect_language(""), "en");
    }

    #[test]
    fn title_normalization() {
        assert_eq!(normalize_title("  The   Chain\tRule "), "the chain rule");
        assert_eq!(normalize_title("Derivative"), normalize_title("derivative"));
    }
}
