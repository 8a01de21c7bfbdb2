use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

use crate::command::Command;

/// Errors that can occur when reading a command script
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to read script: {0}")]
    Io(#[from] io::Error),

    #[error("line {line}: failed to parse command: {source}")]
    Parse {
        line: usize,
        source: serde_json::Error,
    },
}

/// Open a JSON-lines command script.
pub fn read_commands(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Command, ScriptError>>, ScriptError> {
    let file = File::open(path)?;
    Ok(parse_commands(BufReader::new(file)))
}

/// Parse one command per line. Blank lines and `#` comments are skipped.
pub fn parse_commands(
    reader: impl BufRead,
) -> impl Iterator<Item = Result<Command, ScriptError>> {
    reader
        .lines()
        .enumerate()
        .filter_map(|(idx, result)| {
            let line = idx + 1;
            let text = match result {
                Ok(text) => text,
                Err(e) => return Some(Err(ScriptError::Io(e))),
            };
            let text = text.trim();
            if text.is_empty() || text.starts_with('#') {
                return None;
            }
            Some(
                serde_json::from_str(text)
                    .map_err(|source| ScriptError::Parse { line, source }),
            )
        })
}
