//! Driver configuration.
//!
//! The pipeline takes an optimization level, a debug switch (per-pass IR
//! dumps plus per-pass validation), the optional address-table rewrite and a
//! target triple. Projects can keep these in an `opal.toml`; the CLI also
//! sets them from flags.

use serde::Deserialize;

use crate::target::Target;

#[derive(Debug, Clone)]
pub struct Config {
    /// 0, 1 or 2; gates which passes run.
    pub opt_level: u8,
    /// Dump IR after every pass and validate it; abort on the first invalid
    /// module, reporting the pass index.
    pub debug: bool,
    /// Replace direct external symbol references with loads through a
    /// per-module address table.
    pub generate_addr_table: bool,
    pub target: Target,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            opt_level: 1,
            debug: false,
            generate_addr_table: false,
            target: Target::host_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    build: BuildSection,
}

#[derive(Debug, Deserialize, Default)]
struct BuildSection {
    opt_level: Option<u8>,
    debug: Option<bool>,
    addr_table: Option<bool>,
    target: Option<String>,
}

impl Config {
    /// Parses an `opal.toml` project file, filling unspecified fields with
    /// defaults.
    pub fn from_toml(text: &str) -> Result<Config, String> {
        let file: ConfigFile =
            toml::from_str(text).map_err(|e| format!("failed to parse config: {}", e))?;

        let mut config = Config::default();

        if let Some(opt_level) = file.build.opt_level {
            if opt_level > 2 {
                return Err(format!("opt_level must be 0, 1 or 2, got {}", opt_level));
            }
            config.opt_level = opt_level;
        }
        if let Some(debug) = file.build.debug {
            config.debug = debug;
        }
        if let Some(addr_table) = file.build.addr_table {
            config.generate_addr_table = addr_table;
        }
        if let Some(triple) = file.build.target {
            config.target = Target::parse(&triple).map_err(|e| e.to_string())?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_build_section() {
        let config = Config::from_toml(
            "[build]\n\
             opt_level = 2\n\
             debug = true\n\
             target = \"x86_64-windows-msvc\"\n",
        )
        .unwrap();

        assert_eq!(config.opt_level, 2);
        assert!(config.debug);
        assert!(config.target.is_windows());
        assert!(!config.generate_addr_table);
    }

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.opt_level, 1);
        assert!(!config.debug);
    }

    #[test]
    fn rejects_bad_opt_level() {
        assert!(Config::from_toml("[build]\nopt_level = 9\n").is_err());
    }
}
