use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Esperanto portion of the OSCAR corpus, one sentence-ish line per row.
pub const CORPUS_URL: &str = "https://cdn-datasets.huggingface.co/EsperBERTo/data/oscar.eo.txt";

/// Extension of the plain-text corpus files picked up from a data directory.
const CORPUS_EXTENSION: &str = "txt";

/// List the corpus files to train on.
///
/// A directory yields every `*.txt` file it directly contains, sorted by path so that
/// training is reproducible. A file path yields that single file.
pub fn corpus_files(path: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let path = path.as_ref();

    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    if !path.is_dir() {
        return Err(Error::EmptyCorpus(path.to_path_buf()));
    }

    let mut files = fs::read_dir(path)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == CORPUS_EXTENSION))
        .collect::<Vec<_>>();
    files.sort();

    if files.is_empty() {
        return Err(Error::EmptyCorpus(path.to_path_buf()));
    }

    Ok(files)
}

/// Read every non-blank line of the corpus files, trimmed.
pub fn read_lines(files: &[PathBuf]) -> Result<Vec<String>> {
    let mut lines = Vec::new();

    for file in files {
        let content = fs::read_to_string(file)?;
        lines.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from),
        );
    }

    tracing::debug!("Read {} lines from {} corpus file(s)", lines.len(), files.len());

    Ok(lines)
}

#[cfg(feature = "download")]
mod downloader {
    use super::*;
    use burn::data::network::downloader;
    use std::io::Write;

    /// Default location of downloaded corpora.
    pub fn cache_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(".cache").join("esperberto-burn"))
            .ok_or_else(|| Error::Download("Could not resolve the home directory".to_string()))
    }

    /// Download the corpus at `url` into `dest_dir`.
    ///
    /// The file keeps the last segment of the URL as its name. Nothing is downloaded when the
    /// file already exists.
    pub fn download_corpus(url: &str, dest_dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dest_dir = dest_dir.as_ref();
        fs::create_dir_all(dest_dir)?;

        let file_base_name = url
            .rsplit_once('/')
            .map(|(_, name)| name)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::Download(format!("Cannot infer a file name from {url}")))?;

        let file_name = dest_dir.join(file_base_name);
        if file_name.exists() {
            tracing::info!("Corpus already present at {}", file_name.display());
            return Ok(file_name);
        }

        tracing::info!("Downloading {url}");
        let bytes = downloader::download_file_as_bytes(url, file_base_name);

        let mut output_file = fs::File::create(&file_name)?;
        output_file.write_all(&bytes)?;

        tracing::info!("Saved {} bytes to {}", bytes.len(), file_name.display());

        Ok(file_name)
    }
}

#[cfg(feature = "download")]
pub use downloader::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::scratch_dir;

    #[test]
    fn corpus_files_lists_sorted_text_files_only() {
        let dir = scratch_dir("corpus-files");
        fs::write(dir.join("b.txt"), "du\n").unwrap();
        fs::write(dir.join("a.txt"), "unu\n").unwrap();
        fs::write(dir.join("notes.md"), "ignored\n").unwrap();

        let files = corpus_files(&dir).unwrap();

        assert_eq!(files, vec![dir.join("a.txt"), dir.join("b.txt")]);
    }

    #[test]
    fn corpus_files_accepts_a_single_file() {
        let dir = scratch_dir("corpus-single");
        let file = dir.join("oscar.eo.txt");
        fs::write(&file, "Saluton\n").unwrap();

        assert_eq!(corpus_files(&file).unwrap(), vec![file]);
    }

    #[test]
    fn corpus_files_rejects_empty_directory() {
        let dir = scratch_dir("corpus-empty");

        assert!(matches!(corpus_files(&dir), Err(Error::EmptyCorpus(_))));
    }

    #[test]
    fn read_lines_skips_blank_lines_and_trims() {
        let dir = scratch_dir("corpus-lines");
        let file = dir.join("a.txt");
        fs::write(&file, "  Saluton mondo  \n\n   \nLa suno brilas.\n").unwrap();

        let lines = read_lines(&[file]).unwrap();

        assert_eq!(lines, vec!["Saluton mondo", "La suno brilas."]);
    }

    #[cfg(feature = "download")]
    #[test]
    fn download_keeps_existing_corpus() {
        let dir = scratch_dir("corpus-download-existing");
        let file = dir.join("oscar.eo.txt");
        fs::write(&file, "Jam elŝutita\n").unwrap();

        let path = download_corpus(CORPUS_URL, &dir).unwrap();

        assert_eq!(path, file);
        assert_eq!(fs::read_to_string(path).unwrap(), "Jam elŝutita\n");
    }

    #[cfg(feature = "download")]
    #[test]
    fn download_needs_a_file_name_in_the_url() {
        let dir = scratch_dir("corpus-download-no-name");

        assert!(matches!(
            download_corpus("https://x/", &dir),
            Err(Error::Download(_))
        ));
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[cfg(feature = "download")]
    #[test]
    fn cache_dir_is_under_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                cache_dir().unwrap(),
                home.join(".cache").join("esperberto-burn")
            );
        }
    }
}
