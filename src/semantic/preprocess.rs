//! Text and vector preprocessing for embedding input.
//!
//! Documents and queries go through the same ingredient normalization so that
//! a query made of a recipe's own ingredients embeds to exactly the same text:
//! 1. Trim whitespace
//! 2. Lowercase
//! 3. Drop blank entries
//! 4. Join with a single space

use crate::recipes::RecipeDoc;

/// Added to the norm before dividing, so zero vectors stay zero.
const NORM_EPSILON: f32 = 1e-10;

/// Normalize a list of ingredients: trim, lowercase, drop blanks.
pub fn normalize_ingredients<S: AsRef<str>>(ingredients: &[S]) -> Vec<String> {
    ingredients
        .iter()
        .map(|ing| ing.as_ref().trim().to_lowercase())
        .filter(|ing| !ing.is_empty())
        .collect()
}

/// Build the query text for a list of ingredients.
///
/// Returns `None` if nothing is left after normalization.
pub fn query_text<S: AsRef<str>>(ingredients: &[S]) -> Option<String> {
    let normalized = normalize_ingredients(ingredients);
    if normalized.is_empty() {
        return None;
    }
    Some(normalized.join(" "))
}

/// Build the embedding input for a recipe.
///
/// Falls back to the recipe name when the ingredient list is empty.
pub fn document_text(doc: &RecipeDoc) -> String {
    query_text(&doc.ingredients).unwrap_or_else(|| doc.name.trim().to_string())
}

/// Compute L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale a vector to unit length in place.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = l2_norm(v) + NORM_EPSILON;
    for x in v.iter_mut() {
        *x /= norm;
    }
}

/// Inner product of two vectors of equal length.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
