//! Scores catalog search results against the product reference parsed from a
//! folder name. Folder names are typed by photographers, so they are short and
//! loose ("sigma 24-70 #624") while catalog titles are long
//! ("Sigma 24-70mm f/2.8 DG DN Art #624").

use crate::catalog::{Catalog, CatalogError, CatalogProduct};
use crate::folder_name::parse_folder_name;
use crate::models::MatchConfidence;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_THRESHOLD: f64 = 0.6;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductMatch {
    pub product_id: String,
    pub title: String,
    pub confidence: MatchConfidence,
    pub score: f64,
}

pub struct ProductMatcher<C> {
    catalog: Arc<C>,
    threshold: f64,
}

impl<C> Clone for ProductMatcher<C> {
    fn clone(&self) -> Self {
        Self {
            catalog: Arc::clone(&self.catalog),
            threshold: self.threshold,
        }
    }
}

impl<C: Catalog> ProductMatcher<C> {
    pub fn new(catalog: Arc<C>, threshold: f64) -> Self {
        Self { catalog, threshold }
    }

    /// Best catalog product for the reference, or `None` when nothing clears
    /// the threshold. Only transport failures are errors.
    pub async fn find_match(
        &self,
        product_name: &str,
        serial_suffix: Option<&str>,
    ) -> Result<Option<ProductMatch>, CatalogError> {
        if tokenize(product_name).is_empty() {
            return Ok(None);
        }
        let candidates = self.catalog.search_products(product_name).await?;
        let best = best_match(product_name, serial_suffix, &candidates, self.threshold);
        debug!(
            target = "ingest.matcher",
            product_name,
            serial = serial_suffix.unwrap_or("-"),
            candidates = candidates.len(),
            matched = best.as_ref().map(|m| m.title.as_str()).unwrap_or("-"),
            "match evaluated"
        );
        Ok(best)
    }
}

pub fn best_match(
    product_name: &str,
    serial_suffix: Option<&str>,
    candidates: &[CatalogProduct],
    threshold: f64,
) -> Option<ProductMatch> {
    let query = tokenize(product_name);
    let mut best: Option<ProductMatch> = None;
    for candidate in candidates {
        let Some((confidence, score)) = score_title(&query, serial_suffix, &candidate.title)
        else {
            continue;
        };
        if confidence != MatchConfidence::Exact && score < threshold {
            continue;
        }
        let better = match &best {
            None => true,
            Some(current) => rank(confidence, score) > rank(current.confidence, current.score),
        };
        if better {
            best = Some(ProductMatch {
                product_id: candidate.id.clone(),
                title: candidate.title.clone(),
                confidence,
                score,
            });
        }
    }
    best
}

fn rank(confidence: MatchConfidence, score: f64) -> (u8, f64) {
    let tier = if confidence == MatchConfidence::Exact { 1 } else { 0 };
    (tier, score)
}

/// `None` when the title is ruled out outright: a different serial, or a
/// model number from the folder name that the title lacks.
fn score_title(
    query: &[String],
    serial_suffix: Option<&str>,
    title: &str,
) -> Option<(MatchConfidence, f64)> {
    let parsed_title = parse_folder_name(title);
    let title_serial = parsed_title.serial_suffix.as_deref();
    if let (Some(wanted), Some(found)) = (serial_suffix, title_serial)
        && wanted.trim_start_matches('0') != found.trim_start_matches('0')
    {
        return None;
    }

    let title_tokens = tokenize(&parsed_title.product_name);
    if title_tokens.is_empty() {
        return None;
    }

    let model_tokens_present = query
        .iter()
        .filter(|token| token.chars().any(|c| c.is_ascii_digit()))
        .all(|token| title_tokens.iter().any(|t| tokens_match(token, t)));
    if !model_tokens_present {
        return None;
    }

    if query == title_tokens.as_slice() && serial_suffix == title_serial {
        return Some((MatchConfidence::Exact, 1.0));
    }

    let overlap = query
        .iter()
        .filter(|token| title_tokens.iter().any(|t| tokens_match(token, t)))
        .count() as f64;
    let coverage = overlap / query.len() as f64;
    let dice = 2.0 * overlap / (query.len() + title_tokens.len()) as f64;
    let mut score = 0.75 * coverage + 0.25 * dice;
    if serial_suffix.is_some() && serial_suffix == title_serial {
        score = (score + 0.1).min(1.0);
    }
    Some((MatchConfidence::Fuzzy, score))
}

/// A folder token matches a title token exactly or as a prefix followed only
/// by a unit, so `24-70` matches `24-70mm`.
fn tokens_match(query: &str, title: &str) -> bool {
    if query == title {
        return true;
    }
    query.ends_with(|c: char| c.is_ascii_digit())
        && title
            .strip_prefix(query)
            .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_alphabetic()))
}

/// Lowercased alphanumeric runs. `-` and `.` stay inside a token when they
/// join two alphanumerics, keeping `24-70` and `2.8` whole.
pub fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in input.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            current.push(c);
        } else if (c == '-' || c == '.') && !current.is_empty() {
            current.push(c);
        } else if !current.is_empty() {
            push_token(&mut tokens, &mut current);
        }
    }
    if !current.is_empty() {
        push_token(&mut tokens, &mut current);
    }
    tokens
}

fn push_token(tokens: &mut Vec<String>, current: &mut String) {
    let token = current.trim_end_matches(['-', '.']).to_string();
    current.clear();
    if !token.is_empty() {
        tokens.push(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fake::FakeCatalog;

    fn products(titles: &[(&str, &str)]) -> Vec<CatalogProduct> {
        titles
            .iter()
            .map(|(id, title)| CatalogProduct {
                id: id.to_string(),
                title: title.to_string(),
                image_urls: Vec::new(),
            })
            .collect()
    }

    #[test]
    fn tokenizer_keeps_model_ranges() {
        assert_eq!(
            tokenize("Sigma 24-70mm f/2.8 DG-"),
            vec!["sigma", "24-70mm", "f", "2.8", "dg"]
        );
        assert_eq!(tokenize("  "), Vec::<String>::new());
    }

    #[test]
    fn identical_title_with_serial_is_exact() {
        let catalog = products(&[("1", "Sigma 24-70 #624"), ("2", "Sigma 24-70 #625")]);
        let found = best_match("sigma 24-70", Some("624"), &catalog, DEFAULT_THRESHOLD)
            .expect("match");
        assert_eq!(found.product_id, "1");
        assert_eq!(found.confidence, MatchConfidence::Exact);
    }

    #[test]
    fn abbreviated_folder_name_matches_fuzzily() {
        let catalog = products(&[
            ("10", "Nikon Z 70-200mm f/2.8 VR S #12"),
            ("11", "Nikon Z 180-600mm f/5.6-6.3 VR #12"),
        ]);
        let found = best_match("nikon z 180-600", Some("12"), &catalog, DEFAULT_THRESHOLD)
            .expect("match");
        assert_eq!(found.product_id, "11");
        assert_eq!(found.confidence, MatchConfidence::Fuzzy);
        assert!(found.score >= DEFAULT_THRESHOLD);
    }

    #[test]
    fn different_serial_or_model_is_rejected() {
        let catalog = products(&[
            ("1", "Sigma 24-70mm f/2.8 Art #700"),
            ("2", "Hasselblad X1D II 50C"),
        ]);
        assert!(best_match("sigma 24-70", Some("624"), &catalog, DEFAULT_THRESHOLD).is_none());
        assert!(best_match("hasselblad x2d", None, &catalog, DEFAULT_THRESHOLD).is_none());
    }

    #[test]
    fn weak_overlap_stays_below_threshold() {
        let catalog = products(&[("1", "Canon EOS R5 Mirrorless Body")]);
        assert!(best_match("canon battery grip", None, &catalog, DEFAULT_THRESHOLD).is_none());
    }

    #[tokio::test]
    async fn no_match_is_not_an_error() {
        let catalog = FakeCatalog::with_products(&[("5", "Leica Q3")]);
        let matcher = ProductMatcher::new(Arc::new(catalog), DEFAULT_THRESHOLD);
        let outcome = matcher
            .find_match("hasselblad x2d", None)
            .await
            .expect("search ok");
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn catalog_failure_surfaces_as_error() {
        let catalog = FakeCatalog::with_products(&[("5", "Leica Q3")]);
        *catalog.search_fails.lock().expect("lock") = true;
        let matcher = ProductMatcher::new(Arc::new(catalog), DEFAULT_THRESHOLD);
        assert!(matcher.find_match("leica q3", None).await.is_err());
    }
}
