use std::path::PathBuf;

use directories::BaseDirs;

use cyberchat_shared::constants::DEFAULT_PORT;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// First port to try; the listener probes upward when it is busy.
    pub port: u16,
    pub data_dir: PathBuf,
    /// Display name override from the command line.
    pub name: Option<String>,
    pub debug: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            data_dir: default_data_dir(),
            name: None,
            debug: false,
        }
    }
}

/// `~/.cyberchat`, falling back to the working directory when the home
/// directory cannot be determined.
pub fn default_data_dir() -> PathBuf {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".cyberchat"))
        .unwrap_or_else(|| PathBuf::from(".cyberchat"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.port, 7331);
        assert!(config.data_dir.ends_with(".cyberchat"));
        assert!(!config.debug);
    }
}
