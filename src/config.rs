//! `etc/isptar.conf` parser.
//!
//! The only directive recognized is `--exclude-compression SUFFIX`, which
//! seeds the sender's no-compress blacklist. Blank lines and `#` comments
//! are ignored; a missing file is not an error (yields an empty list).

use std::fs;
use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct ExcludeCompression {
    pub suffixes: Vec<String>,
}

impl ExcludeCompression {
    /// Load and parse `path`; a missing file is treated as an empty config.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        Ok(Self::parse(&text))
    }

    fn parse(text: &str) -> Self {
        let mut suffixes = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("--exclude-compression ") {
                let suffix = rest.trim();
                if !suffix.is_empty() {
                    suffixes.push(suffix.to_string());
                }
            }
        }
        Self { suffixes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_directive_lines_and_skips_comments() {
        let cfg = ExcludeCompression::parse(
            "# a comment\n\n--exclude-compression .gz\n--exclude-compression .zip\n",
        );
        assert_eq!(cfg.suffixes, vec![".gz".to_string(), ".zip".to_string()]);
    }

    #[test]
    fn missing_file_yields_empty_config() {
        let cfg = ExcludeCompression::load("/nonexistent/isptar.conf").unwrap();
        assert!(cfg.suffixes.is_empty());
    }
}
