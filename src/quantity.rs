//! Rough quantity descriptions for a list of ingredients.
//!
//! Output is a pure function of the ingredients and the seed.

use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};

const UNITS: &[&str] = &["cup", "cups", "tbsp", "tsp", "pieces", "g", "ml"];

/// Describe a quantity for each ingredient, e.g. `"2 tbsp egg, 1 cup milk"`.
pub fn generate_quantities<S: AsRef<str>>(ingredients: &[S], seed: u64) -> String {
    let mut rng = StdRng::seed_from_u64(seed);

    ingredients
        .iter()
        .map(|ing| {
            let num: u32 = rng.random_range(1..=4);
            let unit = UNITS.choose(&mut rng).copied().unwrap_or("pieces");
            format!("{num} {unit} {}", ing.as_ref())
        })
        .collect::<Vec<_>>()
        .join(", ")
}
