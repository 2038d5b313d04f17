use log::{ info, warn };
use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::path::Path;

pub const REQUIRED_KEYS: [&str; 3] = ["HUGGINGFACE_API_KEY", "OPENAI_API_KEY", "TAVILY_API_KEY"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStatus {
    pub key: String,
    pub present: bool,
}

/// Presence report for the required environment keys, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvReport {
    keys: Vec<KeyStatus>,
}

impl EnvReport {
    pub fn from_lookup<F>(required: &[&str], lookup: F) -> Self where F: Fn(&str) -> Option<String> {
        let keys = required
            .iter()
            .map(|key| KeyStatus {
                key: key.to_string(),
                present: lookup(key).is_some(),
            })
            .collect();
        Self { keys }
    }

    pub fn keys(&self) -> &[KeyStatus] {
        &self.keys
    }

    pub fn missing(&self) -> Vec<&str> {
        self.keys
            .iter()
            .filter(|status| !status.present)
            .map(|status| status.key.as_str())
            .collect()
    }

    pub fn present(&self) -> Vec<&str> {
        self.keys
            .iter()
            .filter(|status| status.present)
            .map(|status| status.key.as_str())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.keys.iter().all(|status| status.present)
    }

    pub fn log(&self) {
        if self.is_complete() {
            info!("All required environment variables were loaded");
        } else {
            warn!("Missing required environment variables: {}", self.missing().join(", "));
        }
    }
}

pub fn read_env_file<P: AsRef<Path>>(
    path: P
) -> Result<HashMap<String, String>, Box<dyn Error + Send + Sync>> {
    // Reads without exporting; the other loaders write into the environment.
    #[allow(deprecated)]
    let iter = dotenv::from_path_iter(path.as_ref())?;
    let mut values = HashMap::new();
    for item in iter {
        let (key, value) = item?;
        values.insert(key, value);
    }
    Ok(values)
}

/// Reports the required keys using only what the file itself defines.
pub fn check_env_file<P: AsRef<Path>>(
    path: P
) -> Result<EnvReport, Box<dyn Error + Send + Sync>> {
    let values = read_env_file(path)?;
    Ok(EnvReport::from_lookup(&REQUIRED_KEYS, |key| values.get(key).cloned()))
}

/// Exports the file's pairs into the process environment and reports the
/// required keys. Variables already set are left untouched. A missing or
/// unreadable file is logged and never halts the pipeline.
pub fn load_env_file<P: AsRef<Path>>(path: P) -> EnvReport {
    let path = path.as_ref();
    match read_env_file(path) {
        Ok(values) => {
            let mut exported = 0;
            for (key, value) in values {
                if env::var_os(&key).is_none() {
                    env::set_var(&key, value);
                    exported += 1;
                }
            }
            info!("Loaded {} variable(s) from {}", exported, path.display());
        }
        Err(e) => {
            warn!("Could not read environment file {}: {}", path.display(), e);
        }
    }

    EnvReport::from_lookup(&REQUIRED_KEYS, |key| env::var(key).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_report_flags_exactly_the_missing_key() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "HUGGINGFACE_API_KEY=hf_123").unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "TAVILY_API_KEY=tvly_456").unwrap();

        let report = check_env_file(file.path()).unwrap();
        assert_eq!(report.missing(), vec!["OPENAI_API_KEY"]);
        assert_eq!(report.present(), vec!["HUGGINGFACE_API_KEY", "TAVILY_API_KEY"]);
        assert!(!report.is_complete());
    }

    #[test]
    fn test_report_complete_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "HUGGINGFACE_API_KEY=a\nOPENAI_API_KEY=b\nTAVILY_API_KEY=c").unwrap();
        let report = check_env_file(file.path()).unwrap();
        assert!(report.is_complete());
        assert!(report.missing().is_empty());
    }

    #[test]
    fn test_read_env_file_parses_pairs() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "FOO=bar\nQUOTED=\"with spaces\"").unwrap();
        let values = read_env_file(file.path()).unwrap();
        assert_eq!(values.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(values.get("QUOTED").map(String::as_str), Some("with spaces"));
    }

    #[test]
    fn test_read_env_file_reports_missing_file_and_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_env_file(dir.path().join("absent.env")).unwrap_err();
        assert!(matches!(err.downcast_ref::<dotenv::Error>(), Some(dotenv::Error::Io(_))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment\nOK=1\nnot a pair").unwrap();
        assert!(read_env_file(file.path()).is_err());
    }

    #[test]
    fn test_from_lookup_keeps_declaration_order() {
        let report = EnvReport::from_lookup(&["B", "A"], |key| (key == "A").then(|| "1".into()));
        let keys: Vec<&str> = report.keys().iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["B", "A"]);
        assert_eq!(report.missing(), vec!["B"]);
    }

    #[test]
    fn test_load_missing_file_does_not_fail() {
        let dir = tempfile::tempdir().unwrap();
        let report = load_env_file(dir.path().join("absent.env"));
        assert_eq!(report.keys().len(), REQUIRED_KEYS.len());
    }

    #[test]
    fn test_load_exports_without_overriding() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "PIPELINE_CHATBOT_TEST_NEW=from_file").unwrap();
        writeln!(file, "PIPELINE_CHATBOT_TEST_SET=from_file").unwrap();
        env::set_var("PIPELINE_CHATBOT_TEST_SET", "from_env");

        load_env_file(file.path());

        assert_eq!(env::var("PIPELINE_CHATBOT_TEST_NEW").unwrap(), "from_file");
        assert_eq!(env::var("PIPELINE_CHATBOT_TEST_SET").unwrap(), "from_env");
    }
}
