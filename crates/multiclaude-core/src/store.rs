//! Atomic persistence of the accounts document.
//!
//! Load never fails: a missing or unparsable file yields a fresh empty
//! document so a clean install starts without ceremony. Save writes a
//! sibling temp file, fsyncs, restricts permissions, and renames over the
//! target.

use multiclaude_types::{AccountError, ConfigDocument};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Load the document from `path`. Missing or corrupt files return an empty
/// document; `is_invalid` flags are cleared and legacy fields normalized.
pub fn load(path: &Path) -> ConfigDocument {
    let mut doc = match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<ConfigDocument>(&content) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(
                    "Account store at {} is unparsable ({}), starting fresh",
                    path.display(),
                    e
                );
                ConfigDocument::default()
            }
        },
        Err(_) => ConfigDocument::default(),
    };
    doc.normalize_on_load();
    doc
}

/// Atomically persist the document to `path`. Credentials are reduced to
/// the fields matching each account's source before serialization.
pub fn save(path: &Path, doc: &ConfigDocument) -> Result<(), AccountError> {
    let mut disk_doc = doc.clone();
    for account in &mut disk_doc.accounts {
        *account = account.to_disk_form();
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(&disk_doc)?;
    let temp_path = path.with_extension("json.tmp");

    let result = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&temp_path, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&temp_path, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(AccountError::Io(e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use multiclaude_types::{Account, AccountSource, Provider};

    #[test]
    fn load_missing_file_returns_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let doc = load(&dir.path().join("accounts.json"));
        assert!(doc.accounts.is_empty());
    }

    #[test]
    fn load_corrupt_file_returns_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        fs::write(&path, "{not json").unwrap();
        let doc = load(&path);
        assert!(doc.accounts.is_empty());
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");

        let mut doc = ConfigDocument::default();
        let mut account = Account::new("a@b.c", Provider::Antigravity, AccountSource::Oauth);
        account.refresh_token = Some("rt-secret".into());
        doc.accounts.push(account);

        save(&path, &doc).unwrap();
        let loaded = load(&path);
        assert_eq!(loaded.accounts.len(), 1);
        assert_eq!(loaded.accounts[0].refresh_token.as_deref(), Some("rt-secret"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn save_strips_credentials_for_wrong_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");

        let mut doc = ConfigDocument::default();
        let mut account = Account::new("m@b.c", Provider::Zai, AccountSource::Manual);
        account.api_key = Some("zk".into());
        account.refresh_token = Some("should-not-persist".into());
        doc.accounts.push(account);

        save(&path, &doc).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("zk"));
        assert!(!raw.contains("should-not-persist"));
    }

    #[test]
    fn load_clears_invalid_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");

        let mut doc = ConfigDocument::default();
        let mut account = Account::new("a@b.c", Provider::Antigravity, AccountSource::Oauth);
        account.mark_invalid("revoked");
        doc.accounts.push(account);
        save(&path, &doc).unwrap();

        let loaded = load(&path);
        assert!(!loaded.accounts[0].is_invalid);
    }
}
