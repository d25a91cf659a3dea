use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::backend::crypto::{KeyPair, PairRecord};
use crate::error::{ChatError, Result};

/// What a session file remembers about the signed-in user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub alias: String,
    pub pair: PairRecord,
}

pub fn load_session(path: &Path) -> Result<Option<(String, KeyPair)>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    let record: SessionRecord = serde_json::from_slice(&bytes)?;
    let pair = KeyPair::from_record(&record.pair)?;
    Ok(Some((record.alias, pair)))
}

pub fn save_session(path: &Path, alias: &str, pair: &KeyPair) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let record = SessionRecord {
        alias: alias.to_string(),
        pair: pair.to_record(),
    };
    fs::write(path, serde_json::to_vec_pretty(&record)?)?;
    Ok(())
}

pub fn clear_session(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ChatError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load_session() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("nested").join("session.json");

        let original = KeyPair::generate();
        save_session(&file_path, "alice", &original).expect("Failed to save session");

        let (alias, loaded) = load_session(&file_path)
            .expect("Failed to load session")
            .expect("Session should exist");

        assert_eq!(alias, "alice");
        assert_eq!(
            original.pub_key(),
            loaded.pub_key(),
            "Loaded public key should match original"
        );
        assert_eq!(original.epub(), loaded.epub());
    }

    #[test]
    fn test_missing_and_cleared_session() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("session.json");
        assert!(load_session(&file_path).unwrap().is_none());

        save_session(&file_path, "bob", &KeyPair::generate()).unwrap();
        clear_session(&file_path).unwrap();
        clear_session(&file_path).unwrap();
        assert!(load_session(&file_path).unwrap().is_none());
    }

    #[test]
    fn test_tampered_session_is_rejected() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("session.json");
        let pair = KeyPair::generate();
        let mut record = SessionRecord {
            alias: "carol".into(),
            pair: pair.to_record(),
        };
        record.pair.pub_key = KeyPair::generate().pub_key();
        fs::write(&file_path, serde_json::to_vec(&record).unwrap()).unwrap();

        assert!(matches!(load_session(&file_path), Err(ChatError::InvalidKey(_))));
    }
}
