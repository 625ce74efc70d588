//! Engine configuration.
//!
//! Loaded from a JSON file; every field has a default so a partial file
//! (or none at all) is valid.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path or name of the external `one_gadget` executable.
    pub one_gadget_path: String,
    /// Substring of the image name whose instructions get observed.
    pub target_image: String,
    /// First kernel-space address; instructions at or above it are ignored.
    pub kernel_start: u64,
    /// Function whose address is searched for as the ret2csu call target.
    pub csu_fallback_function: String,
    /// Techniques composed by the strategy, in order.
    pub techniques: Vec<String>,
    /// Maximum instructions per gadget when indexing a binary.
    pub gadget_max_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            one_gadget_path: "one_gadget".into(),
            target_image: String::new(),
            kernel_start: 0xffff_8000_0000_0000,
            csu_fallback_function: "_fini".into(),
            techniques: vec!["Ret2csu".into()],
            gadget_max_depth: 5,
        }
    }
}

impl Config {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = Config::from_json(r#"{ "target_image": "readme" }"#).unwrap();
        assert_eq!(config.target_image, "readme");
        assert_eq!(config.one_gadget_path, "one_gadget");
        assert_eq!(config.csu_fallback_function, "_fini");
        assert_eq!(config.gadget_max_depth, 5);
    }

    #[test]
    fn load_from_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        write!(tmp, r#"{{ "techniques": ["OneGadget"], "kernel_start": 4096 }}"#).unwrap();
        tmp.flush().unwrap();

        let config = Config::load(tmp.path()).unwrap();
        assert_eq!(config.techniques, vec!["OneGadget".to_string()]);
        assert_eq!(config.kernel_start, 4096);
    }

    #[test]
    fn malformed_json_is_config_error() {
        let err = Config::from_json("{ not json").unwrap_err();
        assert!(matches!(err, crate::error::Error::Config(_)));
    }
}
