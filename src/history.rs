//! REPL command history, persisted as one command per line under the home
//! directory.
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;

const HISTORY_FILE: &str = ".minisql_history";

/// Location of the history file, falling back to the working directory when
/// the home directory cannot be resolved.
pub fn history_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(HISTORY_FILE)
}

/// Loads saved commands, newest last. A missing or unreadable file is just
/// an empty history.
pub fn load_history(path: &PathBuf) -> Vec<String> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };
    BufReader::new(file)
        .lines()
        .filter_map(Result::ok)
        .filter(|line| !line.trim().is_empty())
        .collect()
}

/// Appends one command to the history file, creating it if needed.
pub fn append_history(command: &str, path: &PathBuf) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).create(true).open(path)?;
    writeln!(file, "{}", command)?;
    Ok(())
}
