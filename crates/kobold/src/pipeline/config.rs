use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::config::Config;
use crate::organizer::PathTemplate;

/// The slice of [`Config`] the pipeline stages read.
pub struct PipelineConfig {
    pub convert_epub: bool,
    pub delete_original: bool,
    pub embed_metadata: bool,
    pub fetch_external: bool,
    pub organize: bool,
    pub library_root: PathBuf,
    pub template: PathTemplate,
    pub provider_timeout: Duration,
    pub convert_timeout: Duration,
    pub kepubify_path: PathBuf,
    pub amazon_domain: String,
    pub amazon_cookie: Option<SecretString>,
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            convert_epub: config.convert_epub,
            delete_original: config.delete_original_after_conversion,
            embed_metadata: config.embed_metadata,
            fetch_external: config.fetch_external_metadata,
            organize: config.organize_library,
            library_root: config.library_root().to_path_buf(),
            template: config.organize_template.clone(),
            provider_timeout: config.provider_timeout,
            convert_timeout: config.convert_timeout,
            kepubify_path: config.kepubify_path.clone(),
            amazon_domain: config.amazon_domain.clone(),
            amazon_cookie: config.amazon_cookie.clone(),
        }
    }
}
