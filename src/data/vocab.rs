use std::{
    collections::HashMap,
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};

use log::{debug, info};
use tokenizers::{Model, models::wordlevel::WordLevel};

use super::DataError;

pub const BOS: &str = "<s>";
pub const PAD: &str = "<pad>";
pub const EOS: &str = "</s>";
pub const UNK: &str = "<unk>";

pub const BOS_ID: u32 = 0;
pub const PAD_ID: u32 = 1;
pub const EOS_ID: u32 = 2;
pub const UNK_ID: u32 = 3;

const SPECIALS: [&str; 4] = [BOS, PAD, EOS, UNK];

/// Word-level vocabulary shared by every task reading the same side of the corpus.
#[derive(Clone)]
pub struct Vocabulary {
    model: WordLevel,
    size: usize,
    lowercase: bool,
}

impl Vocabulary {
    /// Counts whitespace tokens over `corpus`, keeps the `max_words - 4` most
    /// frequent ones after the special tokens and writes the result to `path`.
    pub fn build<P: AsRef<Path>>(
        path: &Path,
        corpus: &[P],
        max_words: usize,
        lowercase: bool,
    ) -> Result<Self, DataError> {
        let mut counts: HashMap<String, usize> = HashMap::new();

        for source in corpus {
            let source = source.as_ref();
            let file = File::open(source).map_err(|e| DataError::io(source, e))?;

            for line in BufReader::new(file).lines() {
                let line = line.map_err(|e| DataError::io(source, e))?;
                let line = normalize(&line, lowercase);

                for word in line.split_whitespace() {
                    *counts.entry(word.to_string()).or_default() += 1;
                }
            }
        }

        let mut ranked: Vec<(String, usize)> = counts
            .into_iter()
            .filter(|(word, _)| !SPECIALS.contains(&word.as_str()))
            .collect();
        ranked.sort_by(|(wa, ca), (wb, cb)| cb.cmp(ca).then_with(|| wa.cmp(wb)));

        let mut vocab: HashMap<String, u32> = SPECIALS
            .iter()
            .enumerate()
            .map(|(id, tok)| (tok.to_string(), id as u32))
            .collect();

        for (word, _) in ranked
            .into_iter()
            .take(max_words.saturating_sub(SPECIALS.len()))
        {
            let id = vocab.len() as u32;
            vocab.insert(word, id);
        }

        debug!("Built vocabulary of {} words", vocab.len());

        let file = File::create(path).map_err(|e| DataError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &vocab)
            .map_err(|e| DataError::Vocabulary(format!("{}: {e}", path.display())))?;
        writer.flush().map_err(|e| DataError::io(path, e))?;

        Self::from_file(path, lowercase)
    }

    /// Reads a JSON `{token: id}` map written by [`Vocabulary::build`].
    pub fn from_file(path: &Path, lowercase: bool) -> Result<Self, DataError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| DataError::Vocabulary(format!("non UTF-8 path {}", path.display())))?;
        let model = WordLevel::from_file(path_str, UNK.to_string())
            .map_err(|e| DataError::Vocabulary(format!("{}: {e}", path.display())))?;

        for (id, tok) in SPECIALS.iter().enumerate() {
            if model.token_to_id(tok) != Some(id as u32) {
                return Err(DataError::Vocabulary(format!(
                    "{}: special token {tok} must have id {id}",
                    path.display()
                )));
            }
        }

        let size = model.get_vocab_size();

        Ok(Self {
            model,
            size,
            lowercase,
        })
    }

    /// Loads the vocabulary at `path` if it exists, otherwise builds it from
    /// `corpus` and persists it there.
    pub fn load_or_build<P: AsRef<Path>>(
        path: &Path,
        corpus: &[P],
        max_words: usize,
        lowercase: bool,
    ) -> Result<Self, DataError> {
        if path.exists() {
            info!("Loading vocabulary from {}", path.display());
            return Self::from_file(path, lowercase);
        }

        let vocab = Self::build(path, corpus, max_words, lowercase)?;
        info!("Saved vocabulary to {}", path.display());

        Ok(vocab)
    }

    pub fn encode(&self, line: &str) -> Vec<u32> {
        normalize(line, self.lowercase)
            .split_whitespace()
            .map(|word| self.model.token_to_id(word).unwrap_or(UNK_ID))
            .collect()
    }

    pub fn id_to_token(&self, id: u32) -> Option<String> {
        self.model.id_to_token(id)
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

fn normalize(line: &str, lowercase: bool) -> String {
    if lowercase {
        line.to_lowercase()
    } else {
        line.to_string()
    }
}

/// Wraps `ids` as `<s> ids </s>`, truncating so the result fits in `max_len`.
pub fn frame(ids: &[u32], max_len: usize) -> Vec<u32> {
    let keep = ids.len().min(max_len.saturating_sub(2));
    let mut framed = Vec::with_capacity(keep + 2);
    framed.push(BOS_ID);
    framed.extend_from_slice(&ids[..keep]);
    framed.push(EOS_ID);
    framed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn corpus(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("train.src");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "The cat sat").unwrap();
        writeln!(file, "the dog sat").unwrap();
        writeln!(file, "a cat").unwrap();
        path
    }

    #[test]
    fn build_ranks_by_frequency_after_specials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");
        let vocab = Vocabulary::build(&path, &[corpus(dir.path())], 7, true).unwrap();

        assert_eq!(vocab.len(), 7);
        assert_eq!(vocab.encode("cat"), vec![4]);
        assert_eq!(vocab.encode("sat"), vec![5]);
        assert_eq!(vocab.encode("the"), vec![6]);
        assert_eq!(vocab.encode("dog zebra"), vec![UNK_ID, UNK_ID]);
    }

    #[test]
    fn saved_vocabulary_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src_vocab.json");
        let built = Vocabulary::load_or_build(&path, &[corpus(dir.path())], 100, true).unwrap();
        let reloaded = Vocabulary::load_or_build(&path, &[dir.path().join("missing")], 100, true);
        let loaded = reloaded.unwrap();

        assert_eq!(built.len(), loaded.len());
        assert_eq!(built.encode("The dog"), loaded.encode("the dog"));
        assert_eq!(loaded.id_to_token(PAD_ID).as_deref(), Some(PAD));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_vocabulary_write_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Vocabulary::build(Path::new("/dev/full"), &[corpus(dir.path())], 10, true);
        assert!(matches!(result, Err(DataError::Io { .. })));
    }

    #[test]
    fn frame_truncates_inside_markers() {
        assert_eq!(frame(&[7, 8, 9, 10], 4), vec![BOS_ID, 7, 8, EOS_ID]);
        assert_eq!(frame(&[], 5), vec![BOS_ID, EOS_ID]);
    }
}
