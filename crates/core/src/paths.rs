use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".pagewatch"))
            .unwrap_or_else(|| PathBuf::from(".pagewatch"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    /// Parent directory for per-session throwaway browser profiles.
    pub fn profiles_dir(&self) -> PathBuf {
        self.base.join("profiles")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.profiles_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_layout() {
        let paths = Paths::with_base(PathBuf::from("/tmp/pw"));
        assert_eq!(paths.config_file(), PathBuf::from("/tmp/pw/config.json"));
        assert_eq!(paths.profiles_dir(), PathBuf::from("/tmp/pw/profiles"));
    }

    #[test]
    fn test_ensure_dirs_creates_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().join("base"));
        paths.ensure_dirs().unwrap();
        assert!(paths.profiles_dir().is_dir());
    }
}
