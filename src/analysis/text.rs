//! OCR text normalization and search-seed extraction
//!
//! Cleans raw OCR lines, throws away nutrition-label boilerplate and OCR
//! "salad", and ranks what is left as candidate search phrases (seeds).

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::vision::OcrLine;

/// Line score weights
const WEIGHT_CONFIDENCE: f32 = 0.55;
const WEIGHT_LETTER_DENSITY: f32 = 0.25;
const WEIGHT_LENGTH: f32 = 0.2;

/// Characters at which the length bonus saturates
const LENGTH_BONUS_CAP: usize = 20;

/// Default number of seeds handed to product search
pub const DEFAULT_MAX_SEEDS: usize = 6;

/// Ingredient / energy / storage vocabulary printed on every package
static NOISE_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // Norwegian
        "ingredienser", "naeringsinnhold", "naeringsverdi", "energi", "fett", "hvorav",
        "mettede", "mettet", "fettsyrer", "karbohydrat", "karbohydrater", "sukkerarter",
        "kostfiber", "protein", "salt", "oppbevares", "oppbevaring", "kjolig", "tort",
        "holdbarhet", "best for", "minst holdbar til", "netto", "nettovekt", "inneholder",
        "allergener", "av dette", "per", "pr", "vann", "sukker", "surhetsregulerende",
        "konserveringsmiddel", "aroma", "farge", "produsert", "importor", "pant",
        // English
        "ingredients", "nutrition", "nutritional", "energy", "fat", "saturates", "saturated",
        "carbohydrate", "carbohydrates", "sugars", "fibre", "fiber", "store", "storage",
        "keep", "refrigerated", "best before", "contains", "allergens", "of which",
        "water", "acidity", "regulator", "preservative", "flavouring", "colour", "net",
        "weight", "typical", "values",
        // Units
        "kcal", "kj", "ml", "cl", "mg", "g", "kg", "l",
    ]
    .into_iter()
    .collect()
});

/// A ranked search phrase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedCandidate {
    /// Normalized phrase (keeps Norwegian letters for display)
    pub text: String,
    /// Ranking score (0.0 - 1.0)
    pub score: f32,
}

/// Lowercase, drop everything except letters, digits, spaces and hyphens,
/// collapse whitespace
pub fn normalize_text(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' {
                c
            } else {
                ' '
            }
        })
        .collect();

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Map Norwegian and common accented letters to ASCII for fuzzy comparisons
pub fn transliterate(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            'æ' => out.push_str("ae"),
            'Æ' => out.push_str("AE"),
            'ø' | 'ö' | 'ó' | 'ò' | 'ô' => out.push('o'),
            'Ø' | 'Ö' | 'Ó' | 'Ò' | 'Ô' => out.push('O'),
            'å' | 'ä' | 'á' | 'à' | 'â' => out.push('a'),
            'Å' | 'Ä' | 'Á' | 'À' | 'Â' => out.push('A'),
            'é' | 'è' | 'ê' | 'ë' => out.push('e'),
            'É' | 'È' | 'Ê' | 'Ë' => out.push('E'),
            'í' | 'ì' | 'î' | 'ï' => out.push('i'),
            'ú' | 'ù' | 'û' | 'ü' => out.push('u'),
            'Ü' | 'Ú' => out.push('U'),
            'ß' => out.push_str("ss"),
            'ç' => out.push('c'),
            'ñ' => out.push('n'),
            _ => out.push(c),
        }
    }
    out
}

/// Normalized and transliterated; the form used for all comparisons
pub fn fold_text(text: &str) -> String {
    transliterate(&normalize_text(text))
}

/// Folded text with everything but ASCII letters and digits removed
pub fn compact_text(text: &str) -> String {
    fold_text(text)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Whether a normalized string is useless as a search seed
pub fn is_noise_seed(normalized: &str) -> bool {
    let folded = transliterate(normalized.trim());
    if folded.is_empty() {
        return true;
    }

    if folded.chars().filter(|c| c.is_alphabetic()).count() < 3 {
        return true;
    }

    if NOISE_WORDS.contains(folded.as_str()) {
        return true;
    }

    let tokens: Vec<&str> = folded.split_whitespace().collect();
    if tokens
        .iter()
        .all(|t| NOISE_WORDS.contains(t) || t.chars().all(|c| c.is_ascii_digit() || c == '-'))
    {
        return true;
    }

    is_ocr_salad(&tokens)
}

/// Shapes typical of misread texture: many tiny tokens and nothing word-sized,
/// or single characters alternating with other tokens
fn is_ocr_salad(tokens: &[&str]) -> bool {
    let short = tokens.iter().filter(|t| char_len(t) <= 2).count();
    let long = tokens.iter().filter(|t| char_len(t) >= 4).count();
    if short >= 2 && long == 0 {
        return true;
    }

    tokens
        .windows(3)
        .any(|w| char_len(w[0]) == 1 && char_len(w[2]) == 1)
}

fn char_len(token: &str) -> usize {
    token.chars().count()
}

/// Blend of engine confidence, letter density and a capped length bonus
pub fn line_score(text: &str, confidence: f32) -> f32 {
    let visible: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if visible.is_empty() {
        return 0.0;
    }

    let letters = visible.iter().filter(|c| c.is_alphabetic()).count();
    let density = letters as f32 / visible.len() as f32;
    let length_bonus = visible.len().min(LENGTH_BONUS_CAP) as f32 / LENGTH_BONUS_CAP as f32;

    (WEIGHT_CONFIDENCE * confidence.clamp(0.0, 1.0)
        + WEIGHT_LETTER_DENSITY * density
        + WEIGHT_LENGTH * length_bonus)
        .clamp(0.0, 1.0)
}

/// Score every usable OCR line as a seed and rank them
pub fn extract_seeds(lines: &[OcrLine], max_seeds: usize) -> Vec<SeedCandidate> {
    let candidates = lines
        .iter()
        .filter_map(|line| {
            let normalized = normalize_text(&line.text);
            if is_noise_seed(&normalized) {
                return None;
            }
            Some(SeedCandidate {
                score: line_score(&normalized, line.confidence),
                text: normalized,
            })
        })
        .collect();

    rank_seeds(candidates, max_seeds)
}

/// Deduplicate case-insensitively keeping the best score, sort by score,
/// truncate to `max_seeds`
pub fn rank_seeds(candidates: Vec<SeedCandidate>, max_seeds: usize) -> Vec<SeedCandidate> {
    let mut best: HashMap<String, usize> = HashMap::new();
    let mut ranked: Vec<SeedCandidate> = Vec::new();

    for candidate in candidates {
        let key = candidate.text.trim().to_lowercase();
        if key.is_empty() {
            continue;
        }
        match best.get(&key) {
            Some(&idx) => {
                if candidate.score > ranked[idx].score {
                    ranked[idx] = candidate;
                }
            }
            None => {
                best.insert(key, ranked.len());
                ranked.push(candidate);
            }
        }
    }

    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked.truncate(max_seeds);
    ranked
}

/// Tokens longer than one character plus each whole normalized line
pub fn extract_text_tokens(lines: &[OcrLine]) -> HashSet<String> {
    let mut tokens = HashSet::new();
    for line in lines {
        let folded = fold_text(&line.text);
        if folded.is_empty() {
            continue;
        }
        for token in folded.split(' ') {
            if token.chars().count() > 1 {
                tokens.insert(token.to_string());
            }
        }
        tokens.insert(folded);
    }
    tokens
}
