//! End-to-end tests for building artifacts and querying them.
//!
//! All tests use the hashing embedder from `support`, so no model download
//! is needed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::support::{build, embedder, recipe, sample_corpus, strings, HashingEmbedder, DIMS};
use crate::config::{ArtifactPaths, IndexBackend};
use crate::recipes::{load_corpus, write_corpus, CorpusError, RecipeDoc};
use crate::semantic::{
    BuildError, EncodedMetadata, IndexBuilder, IndexKind, MetadataStorage, QueryService,
    RecipeSearchError,
};

fn auto_kind() -> IndexKind {
    if cfg!(feature = "accelerated") {
        IndexKind::Accelerated
    } else {
        IndexKind::Flat
    }
}

fn backends() -> Vec<IndexBackend> {
    vec![IndexBackend::Auto, IndexBackend::Flat]
}

fn load(dir: &std::path::Path, embedder: Arc<HashingEmbedder>) -> QueryService {
    QueryService::load(embedder, ArtifactPaths::in_dir(dir)).unwrap()
}

fn save_metadata(paths: &ArtifactPaths, docs: &[RecipeDoc]) {
    MetadataStorage::new(paths.metadata.clone())
        .save(&EncodedMetadata::encode(docs).unwrap())
        .unwrap();
}

fn reversed_corpus() -> Vec<RecipeDoc> {
    let mut docs = sample_corpus();
    docs.reverse();
    docs
}

#[test]
fn test_build_report_and_artifacts() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = ArtifactPaths::in_dir(tmp.path());

    let report = build(tmp.path(), embedder(), &sample_corpus(), IndexBackend::Auto);
    assert_eq!(report.documents, 6);
    assert_eq!(report.dimensions, DIMS);
    assert_eq!(report.kind, auto_kind());

    assert!(paths.metadata.exists());
    assert_eq!(paths.index.exists(), report.kind == IndexKind::Accelerated);
    assert_eq!(paths.embeddings.exists(), report.kind == IndexKind::Flat);

    let metadata = MetadataStorage::new(paths.metadata).load().unwrap();
    assert_eq!(metadata.docs, sample_corpus());
}

#[test]
fn test_self_similarity_round_trip() {
    for backend in backends() {
        let tmp = tempfile::tempdir().unwrap();
        build(tmp.path(), embedder(), &sample_corpus(), backend);
        let service = load(tmp.path(), embedder());

        for doc in sample_corpus() {
            let response = service.query(&doc.ingredients, 1).unwrap();
            assert_eq!(response.results.len(), 1);
            assert_eq!(response.results[0].recipe.id, doc.id, "{backend:?}");
            assert!(response.results[0].score >= 1.0 - 1e-5, "{backend:?}");
        }
    }
}

#[test]
fn test_egg_milk_scenario() {
    for backend in backends() {
        let tmp = tempfile::tempdir().unwrap();
        let corpus = vec![
            recipe("a", "a", &["egg", "milk"], ""),
            recipe("b", "b", &["rice", "beans"], ""),
        ];
        build(tmp.path(), embedder(), &corpus, backend);
        let service = load(tmp.path(), embedder());

        let response = service.query(&strings(&["egg", "milk"]), 1).unwrap();
        assert_eq!(response.query, strings(&["egg", "milk"]));
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].recipe.id, "a");
        assert!((response.results[0].score - 1.0).abs() < 1e-5);
    }
}

#[test]
fn test_query_normalizes_ingredients() {
    let tmp = tempfile::tempdir().unwrap();
    build(tmp.path(), embedder(), &sample_corpus(), IndexBackend::Flat);
    let service = load(tmp.path(), embedder());

    let response = service
        .query(&strings(&["  OATS", "", "Milk ", "honey"]), 1)
        .unwrap();
    assert_eq!(response.results[0].recipe.id, "porridge");
    assert!(response.results[0].score >= 1.0 - 1e-5);
}

#[test]
fn test_results_are_deterministic_and_sorted() {
    for backend in backends() {
        let tmp = tempfile::tempdir().unwrap();
        build(tmp.path(), embedder(), &sample_corpus(), backend);
        let service = load(tmp.path(), embedder());

        let query = strings(&["egg", "onion", "olive oil"]);
        let first = service.query(&query, 4).unwrap();
        for _ in 0..5 {
            assert_eq!(service.query(&query, 4).unwrap(), first);
        }

        for pair in first.results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }
}

#[test]
fn test_top_k_is_clamped() {
    for backend in backends() {
        let tmp = tempfile::tempdir().unwrap();
        build(tmp.path(), embedder(), &sample_corpus(), backend);
        let service = load(tmp.path(), embedder());

        let response = service.query(&strings(&["egg"]), 100).unwrap();
        assert_eq!(response.results.len(), sample_corpus().len());
    }
}

#[test]
fn test_identical_documents_rank_by_position() {
    let corpus = vec![
        recipe("other", "Other", &["rice"], ""),
        recipe("first", "First", &["egg", "milk"], ""),
        recipe("filler", "Filler", &["beans"], ""),
        recipe("second", "Second", &["egg", "milk"], ""),
        recipe("third", "Third", &["egg", "milk"], ""),
    ];

    for backend in backends() {
        let tmp = tempfile::tempdir().unwrap();
        build(tmp.path(), embedder(), &corpus, backend);
        let service = load(tmp.path(), embedder());

        for _ in 0..3 {
            let response = service.query(&strings(&["egg", "milk"]), 2).unwrap();
            let ids: Vec<&str> = response
                .results
                .iter()
                .map(|hit| hit.recipe.id.as_str())
                .collect();
            assert_eq!(ids, vec!["first", "second"], "{backend:?}");
        }
    }
}

#[cfg(feature = "accelerated")]
#[test]
fn test_accelerated_and_flat_agree() {
    let accelerated_dir = tempfile::tempdir().unwrap();
    let flat_dir = tempfile::tempdir().unwrap();
    build(accelerated_dir.path(), embedder(), &sample_corpus(), IndexBackend::Auto);
    build(flat_dir.path(), embedder(), &sample_corpus(), IndexBackend::Flat);

    let accelerated = load(accelerated_dir.path(), embedder());
    let flat = load(flat_dir.path(), embedder());
    assert_eq!(accelerated.snapshot().unwrap().kind(), IndexKind::Accelerated);
    assert_eq!(flat.snapshot().unwrap().kind(), IndexKind::Flat);

    let queries = [
        strings(&["egg"]),
        strings(&["milk", "honey"]),
        strings(&["garlic", "tomato", "olive oil"]),
        strings(&["beans", "flour"]),
    ];
    for query in queries {
        let a = accelerated.query(&query, 6).unwrap();
        let f = flat.query(&query, 6).unwrap();

        assert_eq!(a.results[0].recipe.id, f.results[0].recipe.id);
        assert_eq!(a.results.len(), f.results.len());
        for (a, f) in a.results.iter().zip(f.results.iter()) {
            assert!((a.score - f.score).abs() < 1e-4);
        }
    }
}

#[test]
fn test_invalid_query_does_not_touch_embedder() {
    let tmp = tempfile::tempdir().unwrap();
    build(tmp.path(), embedder(), &sample_corpus(), IndexBackend::Flat);

    let query_embedder = embedder();
    let service = load(tmp.path(), query_embedder.clone());

    for ingredients in [strings(&[]), strings(&["", "   ", "\n"])] {
        let result = service.query(&ingredients, 3);
        assert!(matches!(result, Err(RecipeSearchError::InvalidQuery(_))));
    }
    let result = service.query(&strings(&["egg"]), 0);
    assert!(matches!(result, Err(RecipeSearchError::InvalidQuery(_))));

    assert_eq!(query_embedder.calls(), 0);
}

#[test]
fn test_empty_corpus_writes_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = ArtifactPaths::in_dir(tmp.path());

    let result = IndexBuilder::new(embedder(), paths.clone()).build(&[]);
    assert!(matches!(result, Err(BuildError::Corpus(CorpusError::Empty))));

    assert!(!paths.index.exists());
    assert!(!paths.embeddings.exists());
    assert!(!paths.metadata.exists());
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
}

#[test]
fn test_build_from_jsonl_corpus() {
    let tmp = tempfile::tempdir().unwrap();
    let corpus_path = tmp.path().join("recipes_clean.jsonl");
    write_corpus(&corpus_path, &sample_corpus()).unwrap();

    let docs = load_corpus(&corpus_path).unwrap();
    let report = build(tmp.path(), embedder(), &docs, IndexBackend::Flat);
    assert_eq!(report.documents, sample_corpus().len());

    let service = load(tmp.path(), embedder());
    let response = service.query(&strings(&["pasta", "garlic", "olive oil"]), 1).unwrap();
    assert_eq!(response.results[0].recipe.id, "pasta");
}

#[test]
fn test_load_without_artifacts_is_unavailable() {
    let tmp = tempfile::tempdir().unwrap();
    let result = QueryService::load(embedder(), ArtifactPaths::in_dir(tmp.path()));
    assert!(matches!(result, Err(RecipeSearchError::IndexUnavailable(_))));
}

#[test]
fn test_load_metadata_without_index_is_unavailable() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = ArtifactPaths::in_dir(tmp.path());
    save_metadata(&paths, &sample_corpus());

    let result = QueryService::load(embedder(), paths);
    assert!(matches!(result, Err(RecipeSearchError::IndexUnavailable(_))));
}

#[test]
fn test_dimension_mismatch_fails_at_load() {
    for backend in backends() {
        let tmp = tempfile::tempdir().unwrap();
        build(tmp.path(), embedder(), &sample_corpus(), backend);

        let result = QueryService::load(
            Arc::new(HashingEmbedder::new(DIMS * 2)),
            ArtifactPaths::in_dir(tmp.path()),
        );
        assert!(
            matches!(
                result,
                Err(RecipeSearchError::DimensionMismatch { expected, got })
                    if expected == DIMS * 2 && got == DIMS
            ),
            "{backend:?}"
        );
    }
}

#[test]
fn test_metadata_row_count_mismatch() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = ArtifactPaths::in_dir(tmp.path());
    build(tmp.path(), embedder(), &sample_corpus(), IndexBackend::Auto);

    save_metadata(&paths, &sample_corpus()[..2]);

    let result = QueryService::load(embedder(), paths);
    assert!(matches!(
        result,
        Err(RecipeSearchError::ArtifactMismatch { rows: 6, records: 2 })
    ));
}

#[test]
fn test_unreadable_index_falls_back_to_matrix() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = ArtifactPaths::in_dir(tmp.path());
    build(tmp.path(), embedder(), &sample_corpus(), IndexBackend::Flat);

    std::fs::write(&paths.index, b"definitely not an index").unwrap();

    let service = load(tmp.path(), embedder());
    assert_eq!(service.snapshot().unwrap().kind(), IndexKind::Flat);
    let response = service.query(&strings(&["oats", "milk", "honey"]), 1).unwrap();
    assert_eq!(response.results[0].recipe.id, "porridge");
}

#[test]
fn test_rebuild_keeps_a_single_variant() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = ArtifactPaths::in_dir(tmp.path());

    build(tmp.path(), embedder(), &sample_corpus(), IndexBackend::Auto);
    build(tmp.path(), embedder(), &sample_corpus(), IndexBackend::Flat);
    assert!(!paths.index.exists());
    assert!(paths.embeddings.exists());

    let report = build(tmp.path(), embedder(), &sample_corpus(), IndexBackend::Auto);
    assert_eq!(paths.index.exists(), report.kind == IndexKind::Accelerated);
    assert_eq!(paths.embeddings.exists(), report.kind == IndexKind::Flat);
}

#[test]
fn test_reload_publishes_new_generation() {
    let tmp = tempfile::tempdir().unwrap();
    let corpus = sample_corpus();
    build(tmp.path(), embedder(), &corpus[..3], IndexBackend::Auto);

    let service = load(tmp.path(), embedder());
    let old = service.snapshot().unwrap();
    assert_eq!(old.len(), 3);

    build(tmp.path(), embedder(), &corpus, IndexBackend::Flat);
    let report = service.reload().unwrap();
    assert_eq!(report.documents, corpus.len());
    assert_eq!(report.kind, IndexKind::Flat);

    // Readers holding the old generation keep it.
    assert_eq!(old.len(), 3);
    assert_eq!(service.snapshot().unwrap().len(), corpus.len());

    let response = service.query(&strings(&["oats", "milk", "honey"]), 1).unwrap();
    assert_eq!(response.results[0].recipe.id, "porridge");
}

#[test]
fn test_concurrent_queries_during_reload() {
    let tmp = tempfile::tempdir().unwrap();
    build(tmp.path(), embedder(), &sample_corpus(), IndexBackend::Flat);
    let service = Arc::new(load(tmp.path(), embedder()));

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let service = Arc::clone(&service);
            scope.spawn(move || {
                for _ in 0..20 {
                    let response = service.query(&strings(&["rice", "beans", "onion"]), 1).unwrap();
                    assert_eq!(response.results[0].recipe.id, "rice-beans");
                }
            });
        }

        for _ in 0..5 {
            service.reload().unwrap();
        }
    });
}

#[test]
fn test_metadata_from_another_build_is_rejected() {
    for backend in backends() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::in_dir(tmp.path());
        build(tmp.path(), embedder(), &sample_corpus(), backend);

        // Same length, different order: only the checksum tells them apart.
        save_metadata(&paths, &reversed_corpus());

        let result = QueryService::load(embedder(), paths);
        assert!(
            matches!(result, Err(RecipeSearchError::GenerationMismatch { .. })),
            "{backend:?}"
        );
    }
}

#[test]
fn test_reload_of_mixed_pair_keeps_current_generation() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = ArtifactPaths::in_dir(tmp.path());
    build(tmp.path(), embedder(), &sample_corpus(), IndexBackend::Auto);

    let service = load(tmp.path(), embedder());
    let before = service.snapshot().unwrap();

    save_metadata(&paths, &reversed_corpus());
    let result = service.reload();
    assert!(matches!(result, Err(RecipeSearchError::GenerationMismatch { .. })));
    assert!(Arc::ptr_eq(&before, &service.snapshot().unwrap()));

    for doc in sample_corpus() {
        let response = service.query(&doc.ingredients, 1).unwrap();
        assert_eq!(response.results[0].recipe.id, doc.id);
    }
}

#[test]
fn test_reload_while_rebuilding_never_mixes_generations() {
    for backend in backends() {
        let tmp = tempfile::tempdir().unwrap();
        build(tmp.path(), embedder(), &sample_corpus(), backend);
        let service = load(tmp.path(), embedder());
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..60 {
                    let docs = if i % 2 == 0 { reversed_corpus() } else { sample_corpus() };
                    build(tmp.path(), embedder(), &docs, backend);
                }
                done.store(true, Ordering::SeqCst);
            });

            let query = strings(&["oats", "milk", "honey"]);
            while !done.load(Ordering::SeqCst) {
                match service.reload() {
                    Ok(_) | Err(RecipeSearchError::GenerationMismatch { .. }) => {}
                    Err(err) => panic!("unexpected reload error with {backend:?}: {err}"),
                }

                let response = service.query(&query, 1).unwrap();
                assert_eq!(response.results[0].recipe.id, "porridge", "{backend:?}");
                assert!(response.results[0].score >= 1.0 - 1e-5, "{backend:?}");
            }
        });

        // Once the builds settle the last pair loads cleanly.
        service.reload().unwrap();
        let response = service.query(&strings(&["oats", "milk", "honey"]), 1).unwrap();
        assert_eq!(response.results[0].recipe.id, "porridge");
    }
}

#[test]
fn test_failed_accelerated_save_degrades_to_flat() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = ArtifactPaths::in_dir(tmp.path());

    // Nothing can be renamed onto a directory, and it cannot be removed as a file.
    std::fs::create_dir(&paths.index).unwrap();

    let report = build(tmp.path(), embedder(), &sample_corpus(), IndexBackend::Auto);
    assert_eq!(report.kind, IndexKind::Flat);
    assert!(paths.embeddings.exists());
    assert!(paths.metadata.exists());

    let service = load(tmp.path(), embedder());
    assert_eq!(service.snapshot().unwrap().kind(), IndexKind::Flat);
    let response = service.query(&strings(&["pasta", "garlic", "olive oil"]), 1).unwrap();
    assert_eq!(response.results[0].recipe.id, "pasta");
}

#[cfg(feature = "accelerated")]
#[test]
fn test_stale_accelerated_index_is_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let paths = ArtifactPaths::in_dir(tmp.path());

    build(tmp.path(), embedder(), &reversed_corpus(), IndexBackend::Auto);
    let stale = std::fs::read(&paths.index).unwrap();

    build(tmp.path(), embedder(), &sample_corpus(), IndexBackend::Flat);
    std::fs::write(&paths.index, stale).unwrap();

    let service = load(tmp.path(), embedder());
    assert_eq!(service.snapshot().unwrap().kind(), IndexKind::Flat);
    for doc in sample_corpus() {
        let response = service.query(&doc.ingredients, 1).unwrap();
        assert_eq!(response.results[0].recipe.id, doc.id);
    }
}
