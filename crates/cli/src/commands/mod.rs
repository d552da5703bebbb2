//! CLI subcommands

pub mod plan;
pub mod run;

use anyhow::{Context, Result};
use clap::Args;
use kwrun_common::{RunConfig, SuiteSpec, TemplateLibrary};
use std::path::PathBuf;
use tracing::debug;

/// Suite selection shared by `run` and `plan`
#[derive(Args, Debug, Clone)]
pub struct SuiteArgs {
    /// Suite files or directories of suites
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Run configuration (TOML)
    #[arg(short, long, default_value = "kwrun.toml")]
    pub config: PathBuf,

    /// Environment overlay from the configuration's [environments] table
    #[arg(short, long, env = "KWRUN_ENV")]
    pub env: Option<String>,

    /// Directory of shared templates and datasets
    #[arg(long)]
    pub templates: Option<PathBuf>,

    /// Only run cases carrying one of these tags (repeatable)
    #[arg(short, long = "tag")]
    pub tags: Vec<String>,

    /// Only run suites of these modules (repeatable)
    #[arg(short, long = "module")]
    pub modules: Vec<String>,
}

impl SuiteArgs {
    /// Load the configuration and apply the selection flags
    pub fn load_config(&self) -> Result<RunConfig> {
        let mut config = RunConfig::load(&self.config, self.env.as_deref())
            .with_context(|| format!("loading {}", self.config.display()))?;
        config.case_tags.extend(self.tags.iter().cloned());
        config.case_modules.extend(self.modules.iter().cloned());
        Ok(config)
    }

    pub fn load_library(&self) -> Result<TemplateLibrary> {
        match &self.templates {
            Some(dir) => TemplateLibrary::load_dir(dir)
                .with_context(|| format!("loading templates from {}", dir.display())),
            None => Ok(TemplateLibrary::default()),
        }
    }

    pub fn load_suites(&self) -> Result<Vec<SuiteSpec>> {
        let mut suites = Vec::new();
        for path in &self.paths {
            let loaded = SuiteSpec::load_all(path)
                .with_context(|| format!("loading suites from {}", path.display()))?;
            debug!("{} suite(s) in {}", loaded.len(), path.display());
            suites.extend(loaded);
        }
        Ok(suites)
    }
}
