//! Token source list parsing.

use std::collections::HashSet;
use std::path::Path;

use tracing::warn;

use super::error::CredentialError;

/// Parse a newline-delimited token list.
///
/// Lines are trimmed; blank lines and `#` comments are skipped. Duplicates
/// keep their first position.
pub fn parse_token_list(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| seen.insert(*line))
        .map(str::to_string)
        .collect()
}

/// Read a token list file. A missing file yields an empty list.
pub async fn read_token_file(path: &Path) -> Result<Vec<String>, CredentialError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(parse_token_list(&text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Token file not found");
            Ok(Vec::new())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token_list() {
        let text = "\n# primary tokens\n  tok-a  \ntok-b\n\n#tok-c\ntok-a\ntok-d\r\n";
        assert_eq!(parse_token_list(text), vec!["tok-a", "tok-b", "tok-d"]);
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse_token_list("").is_empty());
        assert!(parse_token_list("# only comments\n\n").is_empty());
    }

    #[tokio::test]
    async fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = read_token_file(&dir.path().join("key.txt")).await.unwrap();
        assert!(tokens.is_empty());
    }

    #[tokio::test]
    async fn test_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.txt");
        tokio::fs::write(&path, "one\ntwo\n").await.unwrap();
        assert_eq!(read_token_file(&path).await.unwrap(), vec!["one", "two"]);
    }
}
