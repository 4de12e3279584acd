use directories::ProjectDirs;
use eyre::{Context as _, ContextCompat as _};
use fs2::FileExt as _;
use std::{fs::OpenOptions, path::PathBuf};

#[derive(Debug, Clone)]
pub struct SwapperPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_file: PathBuf,
}

impl SwapperPaths {
    pub fn discover() -> eyre::Result<Self> {
        // Test/CI override knobs.
        if let (Ok(data_dir), Ok(config_dir)) = (
            std::env::var("PERMIT2_SWAPPER_DATA_DIR"),
            std::env::var("PERMIT2_SWAPPER_CONFIG_DIR"),
        ) {
            let data_dir = PathBuf::from(data_dir);
            let log_file = data_dir.join("permit2-swapper.log.jsonl");
            return Ok(Self {
                config_dir: PathBuf::from(config_dir),
                data_dir,
                log_file,
            });
        }

        // Linux: ~/.config/permit2-swapper, macOS: ~/Library/Application Support/permit2-swapper
        let proj = ProjectDirs::from("", "", "permit2-swapper")
            .context("failed to resolve project dirs")?;
        let data_dir = proj.data_dir().to_path_buf();
        let log_file = data_dir.join("permit2-swapper.log.jsonl");
        Ok(Self {
            config_dir: proj.config_dir().to_path_buf(),
            data_dir,
            log_file,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn run_lock_file(&self) -> PathBuf {
        self.data_dir.join("run.lock")
    }

    /// Take the exclusive run lock. Two runs against the same wallet would race on
    /// nonces, so a second process fails fast instead of waiting.
    pub fn acquire_run_lock(&self) -> eyre::Result<std::fs::File> {
        std::fs::create_dir_all(&self.data_dir).context("create data dir")?;
        let p = self.run_lock_file();
        let f = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&p)
            .with_context(|| format!("open {}", p.display()))?;
        f.try_lock_exclusive()
            .with_context(|| format!("another run holds {}", p.display()))?;
        Ok(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_run_lock_is_refused() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let paths = SwapperPaths {
            config_dir: dir.path().join("cfg"),
            data_dir: dir.path().join("data"),
            log_file: dir.path().join("data").join("log.jsonl"),
        };
        let first = paths.acquire_run_lock()?;
        assert!(paths.acquire_run_lock().is_err(), "lock acquired twice");
        drop(first);
        let again = paths.acquire_run_lock();
        assert!(again.is_ok(), "lock not released: {again:?}");
        Ok(())
    }
}
