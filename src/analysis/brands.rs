//! Brand rescue matching
//!
//! Maps garbled OCR fragments to canonical brand names using a static rule
//! table, then expands identified brands into flavor / variant seeds.
//!
//! Matching runs in two tiers. The direct tier counts misread-tolerant
//! pattern hits on the folded text. The rescue tier only runs for weak
//! samples and looks for known brand fragments in the compacted text, or a
//! single-edit misspelling of a short brand name.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

use super::text::{compact_text, fold_text};

/// Weak samples: line score below this ...
pub const WEAK_LINE_SCORE: f32 = 0.62;
/// ... and text shorter than this many characters
pub const WEAK_TEXT_CHARS: usize = 20;

const DIRECT_SCORE_ONE: f32 = 0.55;
const DIRECT_SCORE_TWO: f32 = 0.75;
const DIRECT_SCORE_MANY: f32 = 0.9;
const DIRECT_SCORE_CAP: f32 = 0.95;
const CONTEXT_BOOST: f32 = 0.05;

const RESCUE_EDIT_SCORE: f32 = 0.48;
const RESCUE_PREFIX_SCORE: f32 = 0.52;
const RESCUE_SCORE_CAP: f32 = 0.58;

/// One row of the brand table
#[derive(Debug)]
pub struct BrandRule {
    /// Display name
    pub canonical: &'static str,
    /// Regex sources for likely misreads, matched against folded text
    pub patterns: &'static [&'static str],
    /// Fragments accepted by the rescue tier (compacted form)
    pub rescue_prefixes: &'static [&'static str],
    /// Exact short names accepted at edit distance 1
    pub exact_names: &'static [&'static str],
    /// Flavor / variant seeds offered once the brand is identified
    pub seeds: &'static [&'static str],
    /// Seed used when the text hints at a sugar-free variant
    pub zero_seed: Option<&'static str>,
    /// Prefix shared with unrelated words; enables the context guard
    pub guard_prefix: Option<&'static str>,
    /// Tokens that identify the brand even in a suspicious context
    pub strong_tokens: &'static [&'static str],
}

/// Brand table
pub static BRAND_RULES: &[BrandRule] = &[
    BrandRule {
        canonical: "Coca-Cola",
        patterns: &[r"\bc[o0]ca\b", r"\bc[o0][l1i]a\b", r"c[o0]ca\s*-?\s*c[o0][l1i]a", r"\bcoke\b"],
        rescue_prefixes: &["coca", "acol"],
        exact_names: &["coke"],
        seeds: &["coca-cola", "coca-cola original", "coca-cola zero"],
        zero_seed: Some("coca-cola zero sugar"),
        guard_prefix: None,
        strong_tokens: &[],
    },
    BrandRule {
        canonical: "Pepsi",
        patterns: &[r"\bp[e3]ps[i1l]\b", r"\bp[e3]p[s5]", r"\bpepsi\s*max\b"],
        rescue_prefixes: &["peps", "epsi"],
        exact_names: &["pepsi"],
        seeds: &["pepsi", "pepsi max", "pepsi max lime"],
        zero_seed: Some("pepsi max"),
        guard_prefix: None,
        strong_tokens: &[],
    },
    BrandRule {
        canonical: "Fanta",
        patterns: &[r"\bf[a4]nt[a4]\b", r"\bf[a4]nt", r"\bfanta\s*(orange|exotic|lemon)\b"],
        rescue_prefixes: &["fant", "anta"],
        exact_names: &["fanta"],
        seeds: &["fanta orange", "fanta exotic", "fanta"],
        zero_seed: Some("fanta zero"),
        guard_prefix: None,
        strong_tokens: &[],
    },
    BrandRule {
        canonical: "Sprite",
        patterns: &[r"\bspr[i1l]te\b", r"\bspr[i1l]"],
        rescue_prefixes: &["spri", "rite"],
        exact_names: &["sprite"],
        seeds: &["sprite", "sprite zero"],
        zero_seed: Some("sprite zero"),
        guard_prefix: None,
        strong_tokens: &[],
    },
    BrandRule {
        canonical: "Solo",
        patterns: &[r"\bs[o0][l1][o0]\b", r"\bsolo\s*(super|original|rod)\b", r"\bsololett\b"],
        rescue_prefixes: &["solo"],
        exact_names: &["solo"],
        seeds: &["solo", "solo super", "solo rød"],
        zero_seed: Some("solo super"),
        guard_prefix: Some("sol"),
        strong_tokens: &["solo super", "solo original", "solo rod", "sololett"],
    },
    BrandRule {
        canonical: "Urge",
        patterns: &[r"\bur[gq]e\b", r"\burg[e3]\s*(intense|sukkerfri)\b"],
        rescue_prefixes: &["urge"],
        exact_names: &["urge"],
        seeds: &["urge", "urge intense"],
        zero_seed: Some("urge sukkerfri"),
        guard_prefix: None,
        strong_tokens: &[],
    },
    BrandRule {
        canonical: "Monster",
        patterns: &[r"\bm[o0]nst[e3]r\b", r"\bm[o0]nst", r"\bultra\s*(white|paradise|fiesta)\b"],
        rescue_prefixes: &["mons", "nster"],
        exact_names: &[],
        seeds: &["monster energy", "monster ultra white", "monster"],
        zero_seed: Some("monster ultra"),
        guard_prefix: None,
        strong_tokens: &[],
    },
    BrandRule {
        canonical: "Red Bull",
        patterns: &[r"\bred\s*bu[l1i][l1i]\b", r"\bbu[l1i][l1i]\b", r"\bredbull\b"],
        rescue_prefixes: &["redb", "dbul"],
        exact_names: &[],
        seeds: &["red bull", "red bull sugarfree"],
        zero_seed: Some("red bull sugarfree"),
        guard_prefix: None,
        strong_tokens: &[],
    },
    BrandRule {
        canonical: "Battery",
        patterns: &[r"\bb[a4]tt[e3]ry\b", r"\bb[a4]tt[e3]r"],
        rescue_prefixes: &["batt", "tery"],
        exact_names: &[],
        seeds: &["battery energy drink", "battery"],
        zero_seed: Some("battery no calories"),
        guard_prefix: None,
        strong_tokens: &[],
    },
    BrandRule {
        canonical: "Burn",
        patterns: &[r"\bbu[r][nm]\b", r"\bburn\s*energy\b"],
        rescue_prefixes: &[],
        exact_names: &["burn"],
        seeds: &["burn energy", "burn"],
        zero_seed: Some("burn zero"),
        guard_prefix: None,
        strong_tokens: &[],
    },
    BrandRule {
        canonical: "Farris",
        patterns: &[r"\bf[a4]rr[i1l]s\b", r"\bf[a4]rr[i1l]"],
        rescue_prefixes: &["farr", "rris"],
        exact_names: &["farris"],
        seeds: &["farris naturell", "farris lime", "farris"],
        zero_seed: None,
        guard_prefix: None,
        strong_tokens: &[],
    },
    BrandRule {
        canonical: "Imsdal",
        patterns: &[r"\b[i1l]msd[a4][l1]\b", r"\b[i1l]msd"],
        rescue_prefixes: &["imsd", "sdal"],
        exact_names: &["imsdal"],
        seeds: &["imsdal", "imsdal naturell"],
        zero_seed: None,
        guard_prefix: None,
        strong_tokens: &[],
    },
    BrandRule {
        canonical: "Freia",
        patterns: &[r"\bfr[e3][i1l]a\b", r"\bfreia\s*melkesjokolade\b"],
        rescue_prefixes: &["frei", "reia"],
        exact_names: &["freia"],
        seeds: &["freia melkesjokolade", "freia"],
        zero_seed: None,
        guard_prefix: None,
        strong_tokens: &[],
    },
    BrandRule {
        canonical: "Mozell",
        patterns: &[r"\bm[o0]z[e3][l1][l1]\b", r"\bm[o0]z[e3]"],
        rescue_prefixes: &["moze", "zell"],
        exact_names: &["mozell"],
        seeds: &["mozell"],
        zero_seed: None,
        guard_prefix: None,
        strong_tokens: &[],
    },
];

/// Volume units, sugar / zero / max wording and energy units
static DRINK_CONTEXT: Lazy<Option<Regex>> = Lazy::new(|| {
    compile(r"(\d+([.,]\d+)?\s*(ml|cl|l|liter|litre)\b)|\b(sugar|sukker|sukkerfri|zero|max|kcal|kj)\b")
});

/// Sugar-free variant wording
static VARIANT_HINT: Lazy<Option<Regex>> = Lazy::new(|| {
    compile(r"\b(zero|sukkerfri|uten sukker|sugar\s*free|sugarfree|no sugar|0\s*sukker|light|lett)\b")
});

/// URLs and domain suffixes
static URL_CONTEXT: Lazy<Option<Regex>> =
    Lazy::new(|| compile(r"www|https?:|\.(no|com|se|dk|net|org)\b"));

struct CompiledRule {
    rule: &'static BrandRule,
    patterns: Vec<Regex>,
}

static COMPILED_RULES: Lazy<Vec<CompiledRule>> = Lazy::new(|| {
    BRAND_RULES
        .iter()
        .map(|rule| CompiledRule {
            rule,
            patterns: rule.patterns.iter().filter_map(|p| compile(p)).collect(),
        })
        .collect()
});

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(e) => {
            warn!("Skipping invalid brand pattern {:?}: {}", pattern, e);
            None
        }
    }
}

fn matches(regex: &Lazy<Option<Regex>>, text: &str) -> bool {
    Lazy::force(regex).as_ref().is_some_and(|r| r.is_match(text))
}

/// Evidence for one brand in one text sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrandBoostHit {
    /// Canonical brand name
    pub canonical: String,
    /// Match score (0.0 - 1.0)
    pub score: f32,
    /// Fragments that matched
    pub matched: Vec<String>,
    /// Whether the hit came from the rescue tier
    pub rescued: bool,
}

/// Brand hits plus the ordered seeds derived from them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrandResolution {
    /// Hits ordered by descending score
    pub hits: Vec<BrandBoostHit>,
    /// Deduplicated search seeds
    pub boosted_seeds: Vec<String>,
}

impl BrandResolution {
    /// Best hit, if any
    pub fn best(&self) -> Option<&BrandBoostHit> {
        self.hits.first()
    }
}

/// Whether a sample is too weak to trust at face value
pub fn is_weak_sample(line_score: f32, text: &str) -> bool {
    line_score < WEAK_LINE_SCORE && text.chars().count() < WEAK_TEXT_CHARS
}

/// Whether `text` carries beverage wording (volumes, sugar, energy units)
pub fn has_drink_context(text: &str) -> bool {
    matches(&DRINK_CONTEXT, &text.to_lowercase())
}

/// Match `text` against the brand table and expand the hits into seeds
pub fn resolve_brands(text: &str, line_score: f32) -> BrandResolution {
    resolve_brands_in_context(text, line_score, false)
}

/// Like [`resolve_brands`], with beverage context already established
/// elsewhere on the package (e.g. a separate volume line)
pub fn resolve_brands_in_context(text: &str, line_score: f32, context: bool) -> BrandResolution {
    let raw = text.to_lowercase();
    let folded = fold_text(text);
    if folded.is_empty() {
        return BrandResolution::default();
    }

    let drink_context = context || matches(&DRINK_CONTEXT, &raw);
    let weak = is_weak_sample(line_score, text);

    let mut hits: Vec<(BrandBoostHit, &'static BrandRule)> = Vec::new();
    for compiled in COMPILED_RULES.iter() {
        let rule = compiled.rule;
        if is_disqualified(rule, &raw, &folded) {
            debug!("Brand {} suppressed by context in {:?}", rule.canonical, text);
            continue;
        }

        if let Some(hit) = direct_hit(compiled, &folded, drink_context) {
            hits.push((hit, rule));
        } else if weak {
            if let Some(hit) = rescue_hit(rule, &folded, drink_context) {
                hits.push((hit, rule));
            }
        }
    }

    hits.sort_by(|a, b| b.0.score.total_cmp(&a.0.score));

    let variant = matches(&VARIANT_HINT, &raw);
    let boosted_seeds = expand_seeds(&hits, variant);

    if !hits.is_empty() {
        debug!(
            "Brand hits for {:?}: {:?}",
            text,
            hits.iter().map(|(h, _)| (&h.canonical, h.score)).collect::<Vec<_>>()
        );
    }

    BrandResolution {
        hits: hits.into_iter().map(|(hit, _)| hit).collect(),
        boosted_seeds,
    }
}

/// Resolve each line separately and merge: every brand keeps its best hit,
/// seeds follow the lines in order of their best hit. Beverage context on
/// any line counts for all of them.
pub fn resolve_brands_in_lines<'a, I>(lines: I) -> BrandResolution
where
    I: IntoIterator<Item = (&'a str, f32)>,
{
    let lines: Vec<(&str, f32)> = lines.into_iter().collect();
    let context = lines.iter().any(|(text, _)| has_drink_context(text));

    let mut per_line: Vec<BrandResolution> = lines
        .into_iter()
        .map(|(text, score)| resolve_brands_in_context(text, score, context))
        .filter(|r| !r.hits.is_empty())
        .collect();
    per_line.sort_by(|a, b| {
        let a = a.best().map_or(0.0, |h| h.score);
        let b = b.best().map_or(0.0, |h| h.score);
        b.total_cmp(&a)
    });

    let mut hits: Vec<BrandBoostHit> = Vec::new();
    let mut boosted_seeds: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for resolution in per_line {
        for hit in resolution.hits {
            match hits.iter_mut().find(|h| h.canonical == hit.canonical) {
                Some(existing) if existing.score >= hit.score => {}
                Some(existing) => *existing = hit,
                None => hits.push(hit),
            }
        }
        for seed in resolution.boosted_seeds {
            if seen.insert(seed.to_lowercase()) {
                boosted_seeds.push(seed);
            }
        }
    }
    hits.sort_by(|a, b| b.score.total_cmp(&a.score));

    BrandResolution { hits, boosted_seeds }
}

fn direct_hit(compiled: &CompiledRule, folded: &str, drink_context: bool) -> Option<BrandBoostHit> {
    let matched: Vec<String> = compiled
        .patterns
        .iter()
        .filter_map(|p| p.find(folded).map(|m| m.as_str().to_string()))
        .collect();

    let mut score = match matched.len() {
        0 => return None,
        1 => DIRECT_SCORE_ONE,
        2 => DIRECT_SCORE_TWO,
        _ => DIRECT_SCORE_MANY,
    };
    if drink_context {
        score += CONTEXT_BOOST;
    }

    Some(BrandBoostHit {
        canonical: compiled.rule.canonical.to_string(),
        score: score.min(DIRECT_SCORE_CAP),
        matched,
        rescued: false,
    })
}

fn rescue_hit(rule: &BrandRule, folded: &str, drink_context: bool) -> Option<BrandBoostHit> {
    let compact = compact_text(folded);
    let windows = substring_windows(&compact);

    let mut matched: Vec<String> = rule
        .rescue_prefixes
        .iter()
        .filter(|p| compact.contains(*p) || windows.contains(*p))
        .map(|p| p.to_string())
        .collect();

    let mut score: f32 = 0.0;
    if !matched.is_empty() {
        score = RESCUE_PREFIX_SCORE + 0.03 * (matched.len() - 1) as f32;
    }

    let near_miss = folded
        .split_whitespace()
        .filter(|t| t.is_ascii() && (3..=5).contains(&t.len()))
        .find(|t| rule.exact_names.iter().any(|name| strsim::levenshtein(t, name) == 1));
    if let Some(token) = near_miss {
        score = if score > 0.0 {
            score + 0.02
        } else {
            RESCUE_EDIT_SCORE
        };
        matched.push(token.to_string());
    }

    if matched.is_empty() {
        return None;
    }
    if drink_context {
        score += CONTEXT_BOOST;
    }

    Some(BrandBoostHit {
        canonical: rule.canonical.to_string(),
        score: score.min(RESCUE_SCORE_CAP),
        matched,
        rescued: true,
    })
}

/// All contiguous substrings of length 2-4
fn substring_windows(compact: &str) -> HashSet<&str> {
    let mut windows = HashSet::new();
    let len = compact.len();
    for size in 2..=4 {
        if size > len {
            break;
        }
        for start in 0..=(len - size) {
            windows.insert(&compact[start..start + size]);
        }
    }
    windows
}

/// The guard for brands whose name is a prefix of everyday words: URLs,
/// domains or other words on the same prefix mean the text is probably not
/// about the brand, unless a strong brand token is present as well
fn is_disqualified(rule: &BrandRule, raw: &str, folded: &str) -> bool {
    let Some(prefix) = rule.guard_prefix else {
        return false;
    };

    let exact = rule.canonical.to_lowercase();
    let shares_prefix = folded
        .split_whitespace()
        .any(|t| t.starts_with(prefix) && t != exact && t.len() > exact.len());

    if !(matches(&URL_CONTEXT, raw) || shares_prefix) {
        return false;
    }

    !rule.strong_tokens.iter().any(|token| folded.contains(token))
}

/// Variant seeds first, then canonical names by score, then static seeds
fn expand_seeds(hits: &[(BrandBoostHit, &'static BrandRule)], variant: bool) -> Vec<String> {
    let mut seeds: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut push = |seed: &str| {
        if seen.insert(seed.to_lowercase()) {
            seeds.push(seed.to_string());
        }
    };

    if variant {
        for (_, rule) in hits {
            if let Some(zero) = rule.zero_seed {
                push(zero);
            }
        }
    }

    for (hit, _) in hits {
        push(&hit.canonical);
    }

    for (_, rule) in hits {
        for seed in rule.seeds {
            push(seed);
        }
    }

    seeds
}
