use std::collections::HashSet;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::semantic::normalize_ingredients;

/// Separators seen in ingredient strings of raw recipe dumps.
static INGREDIENT_SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",|\n|;|\|").expect("ingredient separator regex is valid"));

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeDoc {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub ingredients: Vec<String>,
    #[serde(default)]
    pub text: String,
}

/// A corpus line as it appears on disk. Everything except the ingredients
/// may be missing upstream.
#[derive(Debug, Deserialize)]
struct CorpusRecord {
    id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    ingredients: Vec<String>,
    #[serde(default)]
    text: String,
}

impl CorpusRecord {
    fn into_doc(self, position: usize) -> RecipeDoc {
        let id = self
            .id
            .filter(|id| !id.trim().is_empty())
            .or_else(|| self.name.clone().filter(|n| !n.trim().is_empty()))
            .unwrap_or_else(|| synthetic_id(position));
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| id.clone());

        RecipeDoc {
            id,
            name,
            ingredients: self.ingredients,
            text: self.text,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CorpusError {
    #[error("corpus not found at {0}")]
    Missing(PathBuf),

    #[error("corpus unreadable: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed corpus record on line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("raw recipe file is not a json array")]
    NotAnArray,

    #[error("corpus json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corpus is empty")]
    Empty,
}

fn synthetic_id(position: usize) -> String {
    format!("recipe_{position}")
}

/// Load the clean corpus: one json object per line, blank lines skipped.
pub fn load_corpus(path: &Path) -> Result<Vec<RecipeDoc>, CorpusError> {
    let file = std::fs::File::open(path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => CorpusError::Missing(path.to_path_buf()),
        _ => CorpusError::Io(err),
    })?;

    let mut docs = Vec::new();
    let mut seen = HashSet::new();

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let record: CorpusRecord = serde_json::from_str(&line)
            .map_err(|source| CorpusError::Malformed { line: idx + 1, source })?;
        let doc = record.into_doc(docs.len());

        if !seen.insert(doc.id.clone()) {
            log::warn!("duplicate recipe id '{}' on line {}", doc.id, idx + 1);
        }
        docs.push(doc);
    }

    if docs.is_empty() {
        return Err(CorpusError::Empty);
    }

    log::info!("loaded {} recipes from {}", docs.len(), path.display());
    Ok(docs)
}

/// Write a corpus in the one-record-per-line format `load_corpus` reads.
pub fn write_corpus(path: &Path, docs: &[RecipeDoc]) -> Result<(), CorpusError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = BufWriter::new(std::fs::File::create(path)?);
    for doc in docs {
        serde_json::to_writer(&mut writer, doc)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Turn raw recipe records (a json array) into clean corpus documents.
///
/// Field names vary between recipe dumps, so each field is looked up under
/// several aliases. Ingredients may be a list or one delimited string.
pub fn prepare(raw: &str) -> Result<Vec<RecipeDoc>, CorpusError> {
    let value: Value = serde_json::from_str(raw)?;
    let Value::Array(records) = value else {
        return Err(CorpusError::NotAnArray);
    };

    let mut seen = HashSet::new();

    let docs = records
        .iter()
        .enumerate()
        .map(|(idx, record)| {
            let name = first_str(record, &["recipe_name", "name"])
                .unwrap_or_else(|| synthetic_id(idx));

            let ingredients = match first_field(record, &["ingredients", "ingredient"]) {
                Some(Value::Array(items)) => {
                    let items: Vec<String> = items.iter().map(value_to_string).collect();
                    normalize_ingredients(&items)
                }
                Some(other) => {
                    let joined = value_to_string(other);
                    let items: Vec<&str> = INGREDIENT_SEPARATORS.split(&joined).collect();
                    normalize_ingredients(&items)
                }
                None => vec![],
            };

            let text = match first_field(record, &["step_by_step", "instructions", "steps"]) {
                Some(Value::Array(steps)) => steps
                    .iter()
                    .map(value_to_string)
                    .collect::<Vec<_>>()
                    .join("\n"),
                Some(other) => value_to_string(other),
                None => String::new(),
            };

            let id = if seen.insert(name.clone()) {
                name.clone()
            } else {
                format!("{name}#{idx}")
            };

            RecipeDoc {
                id,
                name,
                ingredients,
                text,
            }
        })
        .collect();

    Ok(docs)
}

/// Read a raw recipe dump and write the clean corpus next to it.
pub fn prepare_file(input: &Path, output: &Path) -> Result<usize, CorpusError> {
    let raw = std::fs::read_to_string(input).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => CorpusError::Missing(input.to_path_buf()),
        _ => CorpusError::Io(err),
    })?;

    let docs = prepare(&raw)?;
    write_corpus(output, &docs)?;

    log::info!("prepared {} recipes into {}", docs.len(), output.display());
    Ok(docs.len())
}

/// First present, non-null, non-empty field among `keys`.
fn first_field<'a>(record: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| record.get(*key))
        .find(|value| match value {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            Value::Array(items) => !items.is_empty(),
            _ => true,
        })
}

fn first_str(record: &Value, keys: &[&str]) -> Option<String> {
    first_field(record, keys).map(value_to_string)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
