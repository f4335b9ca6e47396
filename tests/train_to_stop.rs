use std::{fs, io::Write, path::Path};

use burn::backend::{Autodiff, NdArray, ndarray::NdArrayDevice};
use gensen_train::{
    GenSenConfig,
    checkpoint::{BEST_MODEL_FILE, load_model},
    distributed::sync::flatten_parameters,
    train::{launch, prepare},
};

type TestBackend = Autodiff<NdArray<f32>>;

const WORDS: [&str; 12] = [
    "the", "cat", "dog", "sat", "ran", "on", "a", "mat", "home", "fast", "le", "chat",
];

fn sentence(i: usize, len: usize) -> String {
    (0..len)
        .map(|j| WORDS[(i * 7 + j * 3) % WORDS.len()])
        .collect::<Vec<_>>()
        .join(" ")
}

fn write_lines(path: &Path, lines: impl IntoIterator<Item = String>) {
    let mut file = fs::File::create(path).unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
}

/// Lays out a translation task, a skip-thought pair and NLI splits under
/// `root` and returns the configuration JSON.
fn write_fixture(root: &Path, n_gpus: usize, lrate: f64) -> String {
    fs::create_dir_all(root.join("corpora")).unwrap();

    for name in ["en_fr", "skipthought_next", "skipthought_previous"] {
        for (suffix, count) in [("src", 30), ("trg", 30), ("val.src", 6), ("val.trg", 6)] {
            let offset = if suffix.starts_with("val") { 100 } else { 0 };
            write_lines(
                &root.join(format!("corpora/{name}.{suffix}")),
                (0..count).map(|i| sentence(i + offset, 3 + i % 4)),
            );
        }
    }

    let labels = ["entailment", "neutral", "contradiction"];
    for (split, count) in [("train", 20), ("dev", 6), ("test", 5)] {
        write_lines(
            &root.join(format!("corpora/nli.{split}")),
            (0..count).map(|i| format!("{}\t{}\t{}", sentence(i, 4), sentence(i + 3, 3), labels[i % 3])),
        );
    }

    let paths = ["en_fr", "skipthought_next", "skipthought_previous"]
        .iter()
        .map(|name| {
            format!(
                r#"{{"taskname": "{name}", "train_src": "corpora/{name}.src", "train_trg": "corpora/{name}.trg",
                    "val_src": "corpora/{name}.val.src", "val_trg": "corpora/{name}.val.trg"}}"#
            )
        })
        .collect::<Vec<_>>()
        .join(",");

    format!(
        r#"{{
            "data": {{
                "save_dir": "models", "task": "tiny", "max_src_length": 8, "max_trg_length": 8,
                "paths": [{paths}],
                "nli_train": "corpora/nli.train", "nli_dev": "corpora/nli.dev", "nli_test": "corpora/nli.test",
                "buffer_size": 7
            }},
            "model": {{
                "n_words_src": 40, "n_words_trg": 40, "dim_word_src": 6, "dim_word_trg": 6,
                "dim_src": 8, "dim_trg": 8, "bidirectional": true, "n_layers_src": 1, "dropout": 0.0,
                "nli_hidden": 8
            }},
            "training": {{
                "batch_size": 2, "n_gpus": {n_gpus}, "optimizer": "adam", "lrate": {lrate},
                "stop_patience": 1, "seed": 17
            }},
            "management": {{"monitor_loss": 8}}
        }}"#
    )
}

fn load_config(root: &Path, json: &str) -> GenSenConfig {
    let path = root.join("config.json");
    fs::write(&path, json).unwrap();
    GenSenConfig::from_file(&path).unwrap()
}

#[test]
fn frozen_parameters_stop_after_patience() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let config = load_config(root, &write_fixture(root, 2, 0.0));

    let ctx = prepare(config, root, None).unwrap();
    let outcome = launch::<TestBackend>(&ctx, vec![NdArrayDevice::Cpu; 2]).unwrap();

    // A zero learning rate keeps the validation loss constant: the first
    // round sets the best loss, the third exceeds a patience of one.
    assert_eq!(outcome.counters.monitor_epoch, 3);
    assert_eq!(outcome.min_val_loss_epoch, 1);
    assert_eq!(outcome.counters.updates, 24);
    assert!(outcome.min_val_loss.is_finite());
    assert_eq!(
        flatten_parameters(&outcome.best_model),
        flatten_parameters(&outcome.final_model)
    );

    let save_dir = root.join("models");
    let checkpoint = outcome.checkpoint.unwrap();
    assert_eq!(checkpoint, save_dir.join(BEST_MODEL_FILE));
    assert!(save_dir.join("config.json").exists());
    assert!(save_dir.join("src_vocab.json").exists());
    assert!(save_dir.join("trg_vocab.json").exists());

    let metrics = fs::read_to_string(save_dir.join("metrics.jsonl")).unwrap();
    assert!(metrics.lines().any(|line| line.contains("en_fr_val_loss")));
    assert!(metrics.lines().any(|line| line.contains("nli_dev_accuracy")));

    let device = NdArrayDevice::Cpu;
    let fresh = ctx.config.model.init::<TestBackend>(
        ctx.src_vocab.len(),
        ctx.trg_vocab.len(),
        3,
        &device,
    );
    let restored = load_model(fresh, &checkpoint, &device).unwrap();
    assert_eq!(
        flatten_parameters(&restored),
        flatten_parameters(&outcome.best_model)
    );
}

#[test]
fn single_worker_training_reaches_stop() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let mut config = load_config(root, &write_fixture(root, 1, 0.0));
    config.training.stop_patience = 0;

    let ctx = prepare(config, root, Some(0.0)).unwrap();
    let outcome = launch::<TestBackend>(&ctx, vec![NdArrayDevice::Cpu]).unwrap();

    assert_eq!(outcome.counters.monitor_epoch, 2);
    assert_eq!(outcome.counters.updates, 16);
    assert!(outcome.counters.nli_ctr >= 8);
    assert!(root.join("models").join(BEST_MODEL_FILE).exists());
}
